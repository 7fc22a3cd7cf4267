// Copyright 2020 The Exonum Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{sync::Arc, time::Duration};

use crate::{
    config::{ConnConfig, Role},
    errors::NoiseError,
    modifiers::{
        obfs::AesObfuscator,
        padding::{PaddingModifier, MAX_PADDING, MAX_PADDING_RATIO},
        siphash::SipLengthModifier,
        Modifier,
    },
};

// NTCP2 runs Noise XK: the initiator learns the responder's static key from
// the netDb before dialing.
const NTCP2_PATTERN: &str = "XK";

const DEFAULT_PADDING_MIN: usize = 0;
const DEFAULT_PADDING_MAX: usize = 64;

/// Validated NTCP2 transport parameters.
///
/// Converts into a [`ConnConfig`] carrying the NTCP2 modifier family in wire
/// order: AES ephemeral-key obfuscation, cleartext handshake padding, AEAD
/// frame padding, and SipHash length masking. Every connection gets fresh
/// modifier instances, so rolling state is never shared between connections.
#[derive(Debug, Clone)]
pub struct Ntcp2Config {
    role: Role,
    router_hash: Vec<u8>,
    aes_iv: Vec<u8>,
    siphash_k1: u64,
    siphash_k2: u64,
    siphash_iv: u64,
    padding_min: usize,
    padding_max: usize,
    padding_ratio: f32,
    local_static: Option<Vec<u8>>,
    remote_static: Option<Vec<u8>>,
    handshake_timeout: Option<Duration>,
    retries: i32,
    retry_backoff: Option<Duration>,
}

impl Ntcp2Config {
    /// Creates a configuration from the peer router's hash and published IV,
    /// with default padding limits and no length-mask keys yet.
    pub fn new(role: Role, router_hash: &[u8], aes_iv: &[u8]) -> Self {
        Self {
            role,
            router_hash: router_hash.to_vec(),
            aes_iv: aes_iv.to_vec(),
            siphash_k1: 0,
            siphash_k2: 0,
            siphash_iv: 0,
            padding_min: DEFAULT_PADDING_MIN,
            padding_max: DEFAULT_PADDING_MAX,
            padding_ratio: 0.0,
            local_static: None,
            remote_static: None,
            handshake_timeout: None,
            retries: 0,
            retry_backoff: None,
        }
    }

    /// Sets the SipHash keys and initial IV for frame-length masking. Both
    /// sides derive these from the handshake in real NTCP2; here they are
    /// supplied up front.
    pub fn with_siphash_keys(mut self, k1: u64, k2: u64, iv: u64) -> Self {
        self.siphash_k1 = k1;
        self.siphash_k2 = k2;
        self.siphash_iv = iv;
        self
    }

    /// Sets the padding size window, `0 <= min <= max <= 65516`.
    pub fn with_padding(mut self, min: usize, max: usize) -> Self {
        self.padding_min = min;
        self.padding_max = max;
        self
    }

    /// Sets the padding-to-data ratio, `0` to `15.9375` in I2P 4.4 fixed
    /// point.
    pub fn with_padding_ratio(mut self, ratio: f32) -> Self {
        self.padding_ratio = ratio;
        self
    }

    /// Sets the local static private key.
    pub fn with_local_static(mut self, key: &[u8]) -> Self {
        self.local_static = Some(key.to_vec());
        self
    }

    /// Sets the remote static public key (required for the initiator).
    pub fn with_remote_static(mut self, key: &[u8]) -> Self {
        self.remote_static = Some(key.to_vec());
        self
    }

    /// Sets the per-attempt handshake deadline.
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = Some(timeout);
        self
    }

    /// Sets the handshake retry count and base backoff.
    pub fn with_retries(mut self, retries: i32, backoff: Duration) -> Self {
        self.retries = retries;
        self.retry_backoff = Some(backoff);
        self
    }

    /// Builds the modifier list in NTCP2 wire order.
    pub fn modifiers(&self) -> Result<Vec<Arc<dyn Modifier>>, NoiseError> {
        self.validate_padding()?;
        let obfs = AesObfuscator::new(&self.router_hash, &self.aes_iv)?;
        let handshake_padding =
            PaddingModifier::cleartext(self.padding_min, self.padding_max)?
                .with_ratio(self.padding_ratio)?;
        let frame_padding = PaddingModifier::aead(self.padding_min, self.padding_max)?
            .with_ratio(self.padding_ratio)?;
        let length = SipLengthModifier::new(self.siphash_k1, self.siphash_k2, self.siphash_iv);
        Ok(vec![
            Arc::new(obfs),
            Arc::new(handshake_padding),
            Arc::new(frame_padding),
            Arc::new(length),
        ])
    }

    /// Converts into a validated connection configuration with fresh modifier
    /// instances.
    pub fn conn_config(&self) -> Result<ConnConfig, NoiseError> {
        let mut config = ConnConfig::new(NTCP2_PATTERN, self.role)
            .with_retries(self.retries)
            .with_length_masking(self.siphash_k1, self.siphash_k2, self.siphash_iv);
        for modifier in self.modifiers()? {
            config = config.with_modifier(modifier);
        }
        if let Some(ref key) = self.local_static {
            config = config.with_local_static(key);
        }
        if let Some(ref key) = self.remote_static {
            config = config.with_remote_static(key);
        }
        if let Some(timeout) = self.handshake_timeout {
            config = config.with_handshake_timeout(timeout);
        }
        if let Some(backoff) = self.retry_backoff {
            config = config.with_retry_backoff(backoff);
        }
        config.validate()?;
        Ok(config)
    }

    fn validate_padding(&self) -> Result<(), NoiseError> {
        if self.padding_max < self.padding_min || self.padding_max > MAX_PADDING {
            return Err(NoiseError::Config(format!(
                "padding window [{}, {}] violates 0 <= min <= max <= {}",
                self.padding_min, self.padding_max, MAX_PADDING
            )));
        }
        if !(0.0..=MAX_PADDING_RATIO).contains(&self.padding_ratio) {
            return Err(NoiseError::Config(format!(
                "padding ratio {} is outside [0, {}]",
                self.padding_ratio, MAX_PADDING_RATIO
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::Ntcp2Config;
    use crate::config::Role;

    #[test]
    fn produces_the_modifier_family_in_wire_order() {
        let config = Ntcp2Config::new(Role::Initiator, &[0x11; 32], &[0x22; 16])
            .with_siphash_keys(1, 2, 3)
            .with_remote_static(&[0x33; 32]);
        let conn_config = config.conn_config().unwrap();
        let names: Vec<_> = conn_config
            .modifiers
            .iter()
            .map(|modifier| modifier.name().to_owned())
            .collect();
        assert_eq!(
            names,
            vec![
                "aes-obfs",
                "padding-cleartext",
                "padding-aead",
                "siphash-length"
            ]
        );
        assert_eq!(conn_config.pattern(), "XK");
    }

    #[test]
    fn rejects_bad_router_hash() {
        let config = Ntcp2Config::new(Role::Responder, &[0x11; 16], &[0x22; 16]);
        assert!(config.conn_config().is_err());
    }

    #[test]
    fn rejects_bad_padding_window() {
        let config =
            Ntcp2Config::new(Role::Responder, &[0x11; 32], &[0x22; 16]).with_padding(10, 4);
        assert!(config.modifiers().is_err());
    }

    #[test]
    fn rejects_excessive_ratio() {
        let config = Ntcp2Config::new(Role::Responder, &[0x11; 32], &[0x22; 16])
            .with_padding_ratio(16.0);
        assert!(config.modifiers().is_err());
    }
}

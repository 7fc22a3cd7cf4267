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

use std::{fmt, sync::Arc, time::Duration};

use crate::{errors::NoiseError, modifiers::Modifier};

/// Length of Curve25519 static keys.
pub const STATIC_KEY_LENGTH: usize = 32;

/// Ciphersuite filled in when a short pattern name such as `"XX"` is given.
const DEFAULT_SUITE: (&str, &str, &str) = ("25519", "ChaChaPoly", "SHA256");

const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(500);

/// Side of the Noise handshake, fixed when a connection is constructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Sends handshake message 1.
    Initiator,
    /// Receives handshake message 1.
    Responder,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initiator => f.write_str("initiator"),
            Self::Responder => f.write_str("responder"),
        }
    }
}

/// SipHash key material for data-phase length masking, one schedule shared by
/// both directions of a connection.
#[derive(Debug, Clone, Copy)]
pub(crate) struct LengthMaskKeys {
    pub k1: u64,
    pub k2: u64,
    pub iv: u64,
}

/// Validated parameters of a single [`NoiseConn`](crate::NoiseConn).
///
/// Built with setter-style methods; [`validate`](Self::validate) is total and
/// runs once, inside `NoiseConn::new`, so per-operation code never re-checks
/// the configuration.
#[derive(Debug, Clone)]
pub struct ConnConfig {
    pub(crate) pattern: String,
    pub(crate) role: Role,
    pub(crate) local_static: Option<Vec<u8>>,
    pub(crate) remote_static: Option<Vec<u8>>,
    pub(crate) prologue: Option<Vec<u8>>,
    pub(crate) handshake_timeout: Duration,
    pub(crate) read_timeout: Option<Duration>,
    pub(crate) write_timeout: Option<Duration>,
    pub(crate) retries: i32,
    pub(crate) retry_backoff: Duration,
    pub(crate) modifiers: Vec<Arc<dyn Modifier>>,
    pub(crate) length_masking: Option<LengthMaskKeys>,
}

impl ConnConfig {
    /// Creates a configuration for the given pattern and role with no static
    /// keys, no modifiers, a 30-second handshake deadline and no retries.
    ///
    /// `pattern` is either a short name (`"XX"`) or a full protocol name
    /// (`"Noise_XX_25519_AESGCM_SHA256"`).
    pub fn new(pattern: impl Into<String>, role: Role) -> Self {
        Self {
            pattern: pattern.into(),
            role,
            local_static: None,
            remote_static: None,
            prologue: None,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            read_timeout: None,
            write_timeout: None,
            retries: 0,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
            modifiers: Vec::new(),
            length_masking: None,
        }
    }

    /// Sets the local static private key (exactly 32 bytes).
    pub fn with_local_static(mut self, key: &[u8]) -> Self {
        self.local_static = Some(key.to_vec());
        self
    }

    /// Sets the expected remote static public key (exactly 32 bytes).
    pub fn with_remote_static(mut self, key: &[u8]) -> Self {
        self.remote_static = Some(key.to_vec());
        self
    }

    /// Sets the prologue both sides bind into the handshake hash.
    pub fn with_prologue(mut self, prologue: &[u8]) -> Self {
        self.prologue = Some(prologue.to_vec());
        self
    }

    /// Sets the per-attempt handshake deadline. Must be positive.
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Sets the post-handshake read deadline; `None` waits indefinitely.
    pub fn with_read_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Sets the post-handshake write deadline; `None` waits indefinitely.
    pub fn with_write_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Sets the handshake retry count: `-1` retries forever, `0` never
    /// retries, `n` allows `n` extra attempts.
    pub fn with_retries(mut self, retries: i32) -> Self {
        self.retries = retries;
        self
    }

    /// Sets the base retry backoff; the wait doubles per attempt up to the
    /// 30-second ceiling.
    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    /// Appends a modifier to the chain. Modifiers apply to outbound messages
    /// in the order they were added.
    pub fn with_modifier(mut self, modifier: Arc<dyn Modifier>) -> Self {
        self.modifiers.push(modifier);
        self
    }

    /// Enables SipHash masking of data-phase frame lengths.
    ///
    /// The connection derives one masking schedule per direction from this key
    /// set, keeping sender and receiver in lockstep under full-duplex traffic.
    pub fn with_length_masking(mut self, k1: u64, k2: u64, iv: u64) -> Self {
        self.length_masking = Some(LengthMaskKeys { k1, k2, iv });
        self
    }

    /// The configured pattern, as given.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// The configured handshake role.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Checks every parameter; an error here is fatal and never retried.
    pub fn validate(&self) -> Result<(), NoiseError> {
        self.canonical_pattern()?;
        for (name, key) in [
            ("local static key", &self.local_static),
            ("remote static key", &self.remote_static),
        ] {
            if let Some(key) = key {
                if key.len() != STATIC_KEY_LENGTH {
                    return Err(NoiseError::Config(format!(
                        "{} must be {} bytes, got {}",
                        name,
                        STATIC_KEY_LENGTH,
                        key.len()
                    )));
                }
            }
        }
        if self.handshake_timeout.is_zero() {
            return Err(NoiseError::Config(
                "handshake timeout must be positive".to_owned(),
            ));
        }
        if self.retries < -1 {
            return Err(NoiseError::Config(format!(
                "retry count {} is below -1",
                self.retries
            )));
        }
        Ok(())
    }

    /// Expands the configured pattern into a full Noise protocol name.
    pub(crate) fn canonical_pattern(&self) -> Result<String, NoiseError> {
        let raw = self.pattern.trim();
        if raw.is_empty() {
            return Err(NoiseError::Config("pattern name is empty".to_owned()));
        }
        if raw.starts_with("Noise_") {
            if raw.split('_').count() != 5 {
                return Err(NoiseError::Config(format!(
                    "malformed protocol name `{}`",
                    raw
                )));
            }
            return Ok(raw.to_owned());
        }
        if !raw.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(NoiseError::Config(format!(
                "malformed pattern name `{}`",
                raw
            )));
        }
        let (dh, cipher, hash) = DEFAULT_SUITE;
        Ok(format!("Noise_{}_{}_{}_{}", raw, dh, cipher, hash))
    }

    /// The bare pattern token (`"XX"`) of the canonical name.
    pub(crate) fn base_pattern(&self) -> Result<String, NoiseError> {
        let canonical = self.canonical_pattern()?;
        Ok(canonical.split('_').nth(1).unwrap_or_default().to_owned())
    }
}

/// Parameters of a [`NoiseListener`](crate::NoiseListener).
///
/// A listener is always the handshake responder; each accepted stream gets its
/// own responder-shaped [`ConnConfig`] synthesized from this value.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    base: ConnConfig,
}

impl ListenerConfig {
    /// Creates a listener configuration for the given pattern.
    pub fn new(pattern: impl Into<String>) -> Self {
        Self {
            base: ConnConfig::new(pattern, Role::Responder),
        }
    }

    /// Sets the local static private key (exactly 32 bytes).
    pub fn with_local_static(mut self, key: &[u8]) -> Self {
        self.base = self.base.with_local_static(key);
        self
    }

    /// Sets the prologue bound into every accepted handshake.
    pub fn with_prologue(mut self, prologue: &[u8]) -> Self {
        self.base = self.base.with_prologue(prologue);
        self
    }

    /// Sets the per-connection handshake deadline.
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.base = self.base.with_handshake_timeout(timeout);
        self
    }

    /// Sets the per-connection read deadline.
    pub fn with_read_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.base = self.base.with_read_timeout(timeout);
        self
    }

    /// Sets the per-connection write deadline.
    pub fn with_write_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.base = self.base.with_write_timeout(timeout);
        self
    }

    /// Appends a modifier shared by every accepted connection.
    ///
    /// Stateful modifiers keep their state across connections when shared this
    /// way; hand out per-connection configurations (as [`Ntcp2Config`] does)
    /// if that is not what the protocol needs.
    ///
    /// [`Ntcp2Config`]: crate::Ntcp2Config
    pub fn with_modifier(mut self, modifier: Arc<dyn Modifier>) -> Self {
        self.base = self.base.with_modifier(modifier);
        self
    }

    /// Enables SipHash masking of data-phase frame lengths.
    pub fn with_length_masking(mut self, k1: u64, k2: u64, iv: u64) -> Self {
        self.base = self.base.with_length_masking(k1, k2, iv);
        self
    }

    /// The configured pattern, as given.
    pub fn pattern(&self) -> &str {
        self.base.pattern()
    }

    /// Checks every parameter.
    pub fn validate(&self) -> Result<(), NoiseError> {
        self.base.validate()
    }

    /// Synthesizes the responder configuration for one accepted stream.
    pub(crate) fn conn_config(&self) -> ConnConfig {
        let mut config = self.base.clone();
        config.role = Role::Responder;
        config
    }
}

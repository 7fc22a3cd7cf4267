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

use snow::{Builder, HandshakeState, TransportState};

use std::fmt::{self, Formatter};

use crate::{
    config::{ConnConfig, Role},
    errors::NoiseError,
};

// Maximum allowed Noise message length is 65535, which also bounds every
// handshake record and data frame.
pub const MAX_MESSAGE_LENGTH: usize = 65_535;
pub const MIN_HANDSHAKE_MESSAGE_LENGTH: usize = 32;
pub const TAG_LENGTH: usize = 16;

/// Wrapper around the Noise handshake state to provide the latter a convenient
/// interface.
pub struct NoiseWrapper {
    state: HandshakeState,
}

impl NoiseWrapper {
    /// Builds a handshake state for the configured pattern, role, keys and
    /// prologue. Builder failures are configuration errors: the pattern and
    /// key material are known before any byte hits the wire.
    pub fn new(config: &ConnConfig) -> Result<Self, NoiseError> {
        let pattern = config.canonical_pattern()?;
        let params = pattern
            .parse()
            .map_err(|_| NoiseError::Config(format!("unsupported protocol name `{}`", pattern)))?;

        let mut builder: Builder<'_> = Builder::new(params);
        if let Some(ref key) = config.local_static {
            builder = builder.local_private_key(key);
        }
        if let Some(ref key) = config.remote_static {
            builder = builder.remote_public_key(key);
        }
        if let Some(ref prologue) = config.prologue {
            builder = builder.prologue(prologue);
        }

        let state = match config.role {
            Role::Initiator => builder.build_initiator(),
            Role::Responder => builder.build_responder(),
        }
        .map_err(|err| {
            NoiseError::Config(format!(
                "cannot build {} for `{}`: {}",
                config.role, pattern, err
            ))
        })?;

        Ok(Self { state })
    }

    /// Whether the local side produces the next handshake message.
    pub fn is_my_turn(&self) -> bool {
        self.state.is_my_turn()
    }

    /// Whether all handshake messages have been exchanged.
    pub fn is_handshake_finished(&self) -> bool {
        self.state.is_handshake_finished()
    }

    /// Consumes the peer's next handshake message, yielding its payload.
    pub fn read_handshake_msg(&mut self, input: &[u8]) -> Result<Vec<u8>, NoiseError> {
        if input.len() < MIN_HANDSHAKE_MESSAGE_LENGTH || input.len() > MAX_MESSAGE_LENGTH {
            return Err(NoiseError::WrongMessageLength(input.len()));
        }

        let mut buf = vec![0_u8; MAX_MESSAGE_LENGTH];
        let len = self.state.read_message(input, &mut buf)?;
        buf.truncate(len);
        Ok(buf)
    }

    /// Produces the next handshake message carrying `msg` as its payload.
    pub fn write_handshake_msg(&mut self, msg: &[u8]) -> Result<Vec<u8>, NoiseError> {
        let mut buf = vec![0_u8; MAX_MESSAGE_LENGTH];
        let len = self.state.write_message(msg, &mut buf)?;
        buf.truncate(len);
        Ok(buf)
    }

    /// Transitions into transport mode after the handshake is finished,
    /// yielding the two post-handshake cipher states.
    pub fn into_transport_wrapper(self) -> Result<TransportWrapper, NoiseError> {
        let state = self.state.into_transport_mode()?;
        Ok(TransportWrapper { state })
    }
}

impl fmt::Debug for NoiseWrapper {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "NoiseWrapper {{ handshake finished: {} }}",
            self.state.is_handshake_finished()
        )
    }
}

/// Carrier of the post-handshake cipher states.
///
/// The send and receive directions use independent AEAD streams with strictly
/// increasing nonces; no API path resets them, so nonce reuse is impossible
/// for the lifetime of the connection.
pub struct TransportWrapper {
    state: TransportState,
}

impl TransportWrapper {
    /// Encrypts one frame's plaintext, appending the AEAD tag.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, NoiseError> {
        debug_assert!(plaintext.len() + TAG_LENGTH <= MAX_MESSAGE_LENGTH);
        let mut buf = vec![0_u8; plaintext.len() + TAG_LENGTH];
        let len = self.state.write_message(plaintext, &mut buf)?;
        buf.truncate(len);
        Ok(buf)
    }

    /// Decrypts one frame's ciphertext, verifying the AEAD tag.
    pub fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, NoiseError> {
        if ciphertext.len() < TAG_LENGTH || ciphertext.len() > MAX_MESSAGE_LENGTH {
            return Err(NoiseError::Protocol(format!(
                "ciphertext length {} is out of bounds",
                ciphertext.len()
            )));
        }
        let mut buf = vec![0_u8; ciphertext.len()];
        let len = self.state.read_message(ciphertext, &mut buf)?;
        buf.truncate(len);
        Ok(buf)
    }
}

impl fmt::Debug for TransportWrapper {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TransportWrapper {{ is initiator: {} }}",
            self.state.is_initiator()
        )
    }
}

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

use thiserror::Error;

use std::{io, time::Duration};

use crate::{conn::ConnState, modifiers::Phase};

/// Errors produced by a single modifier while transforming a byte buffer.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ModifierError {
    /// The transform could not be applied to the given input.
    #[error("transform failed: {0}")]
    Transform(String),

    /// A decrypted frame carried more than one padding block.
    #[error("frame contains multiple padding blocks")]
    MultiplePadding,
}

/// Errors produced by connections, listeners and their configuration.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum NoiseError {
    /// The supplied configuration is invalid. Never retried.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// An operation was attempted from a state that forbids it.
    #[error("`{op}` is not permitted in the {state:?} state")]
    WrongState {
        /// Name of the rejected operation.
        op: &'static str,
        /// Connection state at the time of the call.
        state: ConnState,
    },

    /// The underlying byte channel failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The peer violated the protocol: a Noise decode failure, a failed AEAD
    /// tag check, a malformed length or an unknown block type.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A handshake message length fell outside the permitted bounds.
    #[error("wrong handshake message length {0}")]
    WrongMessageLength(usize),

    /// The operation exceeded its deadline.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The operation was cancelled through its cancellation token.
    #[error("operation cancelled")]
    Cancelled,

    /// A modifier failed, annotated with its position in the chain.
    #[error(
        "modifier `{modifier}` (#{index} in chain `{chain}`, {phase:?} phase) failed: {source}"
    )]
    ModifierChain {
        /// Name of the owning chain.
        chain: String,
        /// Name of the failing modifier.
        modifier: String,
        /// Zero-based position of the modifier within the chain.
        index: usize,
        /// Handshake phase during which the failure occurred.
        phase: Phase,
        /// The underlying modifier error.
        source: ModifierError,
    },

    /// The retry budget was exhausted without a successful handshake.
    #[error(
        "handshake failed after {attempts} attempt(s) (configured retries: {max}) \
         for pattern `{pattern}`: {source}"
    )]
    HandshakeFailed {
        /// Number of attempts actually performed.
        attempts: usize,
        /// Configured retry count (`-1` meaning unbounded).
        max: i32,
        /// Canonical Noise pattern name.
        pattern: String,
        /// The error produced by the final attempt.
        source: Box<NoiseError>,
    },
}

impl NoiseError {
    /// Whether the handshake retry controller may try again after this error.
    ///
    /// Configuration, state and cancellation errors are final; network,
    /// protocol and timeout errors are worth another attempt while the retry
    /// budget lasts.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::Io(_)
                | Self::Protocol(_)
                | Self::WrongMessageLength(_)
                | Self::Timeout(_)
                | Self::ModifierChain { .. }
        )
    }
}

impl From<snow::Error> for NoiseError {
    fn from(err: snow::Error) -> Self {
        Self::Protocol(err.to_string())
    }
}

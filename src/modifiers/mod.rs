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

//! Phase-aware byte transforms applied to handshake messages and data frames.

pub mod obfs;
pub mod padding;
pub mod siphash;

#[cfg(test)]
mod tests;

use std::{fmt, sync::Arc};

use crate::errors::{ModifierError, NoiseError};

/// Position of a message within the handshake sequence.
///
/// The data phase shares the [`Final`](Self::Final) tag with handshake
/// message 3: from the third message on, the cipher keys are fully mixed and
/// the wire discipline no longer changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Handshake message 1.
    Initial,
    /// Handshake message 2.
    Exchange,
    /// Handshake message 3 and every data-phase frame after it.
    Final,
}

impl Phase {
    /// Phase tag for the zero-based handshake message index.
    pub(crate) fn from_message_index(index: usize) -> Self {
        match index {
            0 => Self::Initial,
            1 => Self::Exchange,
            _ => Self::Final,
        }
    }
}

/// A reversible, phase-aware transform over owned byte buffers.
///
/// Implementations must be thread-safe and reentrant: any internal state (such
/// as a rolling IV) is guarded by the modifier itself. Outputs are always
/// freshly owned; a modifier never retains references to its inputs.
pub trait Modifier: Send + Sync + fmt::Debug {
    /// Stable name of the modifier, used in error context and logs.
    fn name(&self) -> &str;

    /// Transforms bytes on their way to the wire.
    fn modify_out(&self, phase: Phase, data: &[u8]) -> Result<Vec<u8>, ModifierError>;

    /// Reverses [`modify_out`](Self::modify_out) on bytes read from the wire.
    fn modify_in(&self, phase: Phase, data: &[u8]) -> Result<Vec<u8>, ModifierError>;
}

/// An ordered pipeline of modifiers.
///
/// Outbound data passes through the links left to right; inbound data peels
/// them off right to left, so that `chain.modify_in(p, chain.modify_out(p, b))`
/// restores `b` whenever every link is invertible on phase `p`. An empty chain
/// is the identity.
#[derive(Debug, Clone)]
pub struct ModifierChain {
    name: String,
    links: Vec<Arc<dyn Modifier>>,
}

impl ModifierChain {
    /// Creates a chain owning the given modifiers in application order.
    pub fn new(name: impl Into<String>, links: Vec<Arc<dyn Modifier>>) -> Self {
        Self {
            name: name.into(),
            links,
        }
    }

    /// Name of the chain, used in error context.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of modifiers in the chain.
    pub fn len(&self) -> usize {
        self.links.len()
    }

    /// Whether the chain has no modifiers.
    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Names of all modifiers in application order, for logging.
    pub fn names(&self) -> Vec<&str> {
        self.links.iter().map(|link| link.name()).collect()
    }

    /// Applies all modifiers in declaration order.
    pub fn modify_out(&self, phase: Phase, data: &[u8]) -> Result<Vec<u8>, NoiseError> {
        let mut current = data.to_vec();
        for (index, link) in self.links.iter().enumerate() {
            current = link
                .modify_out(phase, &current)
                .map_err(|source| self.link_error(index, link.as_ref(), phase, source))?;
        }
        Ok(current)
    }

    /// Applies all modifiers in reverse order.
    pub fn modify_in(&self, phase: Phase, data: &[u8]) -> Result<Vec<u8>, NoiseError> {
        let mut current = data.to_vec();
        for (index, link) in self.links.iter().enumerate().rev() {
            current = link
                .modify_in(phase, &current)
                .map_err(|source| self.link_error(index, link.as_ref(), phase, source))?;
        }
        Ok(current)
    }

    fn link_error(
        &self,
        index: usize,
        link: &dyn Modifier,
        phase: Phase,
        source: ModifierError,
    ) -> NoiseError {
        NoiseError::ModifierChain {
            chain: self.name.clone(),
            modifier: link.name().to_owned(),
            index,
            phase,
            source,
        }
    }
}

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

use byteorder::{BigEndian, ByteOrder};
use siphasher::sip::SipHasher24;

use std::hash::Hasher;
use std::sync::Mutex;

use crate::{
    errors::ModifierError,
    modifiers::{Modifier, Phase},
};

const LENGTH_FIELD_SIZE: usize = 2;

/// Masks the 2-byte length prefix of data-phase frames with a SipHash-2-4
/// keystream.
///
/// Each masking call hashes the current 64-bit IV under `(k1, k2)`, XORs the
/// low 16 bits of the digest into the length and rolls the IV forward to the
/// full digest. Sender and receiver stay in lockstep as long as they mask the
/// same frame sequence, so a connection keeps one instance per direction,
/// both built from the same key set.
///
/// Inputs that are not exactly 2 bytes long, and all `Initial`/`Exchange`
/// traffic, pass through untouched.
#[derive(Debug)]
pub struct SipLengthModifier {
    k1: u64,
    k2: u64,
    iv: Mutex<u64>,
}

impl SipLengthModifier {
    /// Creates a masker from the two SipHash keys and the initial IV.
    pub fn new(k1: u64, k2: u64, iv: u64) -> Self {
        Self {
            k1,
            k2,
            iv: Mutex::new(iv),
        }
    }

    /// XORs the next keystream word into a 2-byte length field.
    ///
    /// Masking and unmasking are the same operation; what matters is that both
    /// ends consume the keystream in the same frame order.
    pub(crate) fn apply(&self, data: &[u8]) -> Vec<u8> {
        debug_assert_eq!(data.len(), LENGTH_FIELD_SIZE);
        let masked = BigEndian::read_u16(data) ^ self.next_mask();
        masked.to_be_bytes().to_vec()
    }

    fn next_mask(&self) -> u16 {
        let mut iv = self.iv.lock().expect("SipHash IV lock is poisoned");
        let mut hasher = SipHasher24::new_with_keys(self.k1, self.k2);
        hasher.write(&iv.to_le_bytes());
        let digest = hasher.finish();
        *iv = digest;
        (digest & 0xFFFF) as u16
    }
}

impl Modifier for SipLengthModifier {
    fn name(&self) -> &str {
        "siphash-length"
    }

    fn modify_out(&self, phase: Phase, data: &[u8]) -> Result<Vec<u8>, ModifierError> {
        if phase == Phase::Final && data.len() == LENGTH_FIELD_SIZE {
            Ok(self.apply(data))
        } else {
            Ok(data.to_vec())
        }
    }

    fn modify_in(&self, phase: Phase, data: &[u8]) -> Result<Vec<u8>, ModifierError> {
        self.modify_out(phase, data)
    }
}

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

use aes::cipher::{block_padding::NoPadding, BlockDecryptMut, BlockEncryptMut, KeyIvInit};

use crate::{
    errors::{ModifierError, NoiseError},
    modifiers::{Modifier, Phase},
};

/// Length of the router hash acting as the obfuscation key.
pub const ROUTER_HASH_LENGTH: usize = 32;
/// Length of the CBC initialization vector.
pub const OBFS_IV_LENGTH: usize = 16;

// NTCP2 obfuscates only the ephemeral key transmissions, which are exactly one
// Curve25519 point long.
const EPHEMERAL_KEY_LENGTH: usize = 32;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Disguises the 32-byte ephemeral keys of handshake messages 1 and 2 as
/// random-looking bytes, NTCP2-style.
///
/// The AES-256 key is the peer router's 32-byte hash and the IV comes from its
/// published address entry; both sides derive the same schedule without any
/// extra round trips. Only the leading 32 bytes of a message are transformed:
/// that is where the Noise wire format puts the ephemeral key, and whatever
/// follows it (an AEAD tag, an encrypted payload) is already uniformly random.
/// Messages shorter than a key, and all `Final`-phase traffic, pass through
/// untouched.
pub struct AesObfuscator {
    key: [u8; ROUTER_HASH_LENGTH],
    iv: [u8; OBFS_IV_LENGTH],
}

impl AesObfuscator {
    /// Creates an obfuscator from a 32-byte router hash and a 16-byte IV.
    pub fn new(router_hash: &[u8], iv: &[u8]) -> Result<Self, NoiseError> {
        if router_hash.len() != ROUTER_HASH_LENGTH {
            return Err(NoiseError::Config(format!(
                "router hash must be {} bytes, got {}",
                ROUTER_HASH_LENGTH,
                router_hash.len()
            )));
        }
        if iv.len() != OBFS_IV_LENGTH {
            return Err(NoiseError::Config(format!(
                "obfuscation IV must be {} bytes, got {}",
                OBFS_IV_LENGTH,
                iv.len()
            )));
        }

        let mut key = [0_u8; ROUTER_HASH_LENGTH];
        key.copy_from_slice(router_hash);
        let mut iv_arr = [0_u8; OBFS_IV_LENGTH];
        iv_arr.copy_from_slice(iv);
        Ok(Self { key, iv: iv_arr })
    }

    fn encrypt(&self, data: &[u8]) -> Vec<u8> {
        Aes256CbcEnc::new(&self.key.into(), &self.iv.into())
            .encrypt_padded_vec_mut::<NoPadding>(data)
    }

    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, ModifierError> {
        Aes256CbcDec::new(&self.key.into(), &self.iv.into())
            .decrypt_padded_vec_mut::<NoPadding>(data)
            .map_err(|err| ModifierError::Transform(format!("AES-CBC decryption failed: {}", err)))
    }

    fn applies(phase: Phase, data: &[u8]) -> bool {
        matches!(phase, Phase::Initial | Phase::Exchange) && data.len() >= EPHEMERAL_KEY_LENGTH
    }
}

impl Modifier for AesObfuscator {
    fn name(&self) -> &str {
        "aes-obfs"
    }

    fn modify_out(&self, phase: Phase, data: &[u8]) -> Result<Vec<u8>, ModifierError> {
        if !Self::applies(phase, data) {
            return Ok(data.to_vec());
        }
        let mut out = self.encrypt(&data[..EPHEMERAL_KEY_LENGTH]);
        out.extend_from_slice(&data[EPHEMERAL_KEY_LENGTH..]);
        Ok(out)
    }

    fn modify_in(&self, phase: Phase, data: &[u8]) -> Result<Vec<u8>, ModifierError> {
        if !Self::applies(phase, data) {
            return Ok(data.to_vec());
        }
        let mut out = self.decrypt(&data[..EPHEMERAL_KEY_LENGTH])?;
        out.extend_from_slice(&data[EPHEMERAL_KEY_LENGTH..]);
        Ok(out)
    }
}

impl std::fmt::Debug for AesObfuscator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Key material is deliberately not printed.
        f.debug_struct("AesObfuscator").finish()
    }
}

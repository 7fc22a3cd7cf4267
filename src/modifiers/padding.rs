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
use rand::{rngs::StdRng, Rng, RngCore, SeedableRng};

use std::sync::Mutex;

use crate::{
    errors::{ModifierError, NoiseError},
    modifiers::{Modifier, Phase},
};

/// Block type tag of an NTCP2 padding block.
pub const PADDING_BLOCK_TYPE: u8 = 0xFE;
/// Largest permitted padding size (the I2P specification cap).
pub const MAX_PADDING: usize = 65_516;
/// Largest permitted padding-to-data ratio (I2P 4.4 fixed point).
pub const MAX_PADDING_RATIO: f32 = 15.9375;

const BLOCK_HEADER_LENGTH: usize = 3;
// Spread of the uniform jitter applied around a ratio-derived target size.
const RATIO_JITTER: usize = 2;

/// Inflates messages with random padding to defeat length-based traffic
/// analysis.
///
/// The modifier operates in one of two modes:
///
/// - *Cleartext* mode appends raw random bytes to `Initial` and `Exchange`
///   messages, outside any AEAD. Receiving is a pass-through: the outer
///   protocol knows the true message length and discards the tail itself.
/// - *AEAD* mode appends an NTCP2 padding block
///   `{0xFE, u16-BE size, size random bytes}` to `Final`-phase plaintext, so
///   the padding is authenticated together with the payload. Receiving strips
///   exactly one trailing padding block; a frame carrying two is rejected, and
///   a tail that does not parse as a padding block is returned unchanged.
///
/// Padding sizes are uniform in `[min, max]`, or biased towards
/// `ceil(ratio * data_len)` when a ratio is set. The production constructor
/// draws from an OS-seeded CSPRNG; [`deterministic`](Self::deterministic)
/// yields repeatable sizes for byte-exact tests.
pub struct PaddingModifier {
    min: usize,
    max: usize,
    ratio: f32,
    aead: bool,
    source: Mutex<SizeSource>,
}

enum SizeSource {
    Random(StdRng),
    Deterministic(StdRng),
}

impl PaddingModifier {
    /// Creates a cleartext-mode modifier padding handshake messages 1 and 2.
    pub fn cleartext(min: usize, max: usize) -> Result<Self, NoiseError> {
        Self::with_mode(min, max, false, SizeSource::Random(StdRng::from_entropy()))
    }

    /// Creates an AEAD-mode modifier padding message 3 and data-phase frames.
    pub fn aead(min: usize, max: usize) -> Result<Self, NoiseError> {
        Self::with_mode(min, max, true, SizeSource::Random(StdRng::from_entropy()))
    }

    /// Creates a modifier with repeatable padding decisions.
    ///
    /// Sizes depend only on `(min, max, data_len)` and the random filler is
    /// drawn from the seeded generator, so round-trips are byte-exact across
    /// runs. Only suitable for tests; the production constructors never
    /// produce a deterministic instance.
    pub fn deterministic(min: usize, max: usize, aead: bool, seed: u64) -> Result<Self, NoiseError> {
        Self::with_mode(
            min,
            max,
            aead,
            SizeSource::Deterministic(StdRng::seed_from_u64(seed)),
        )
    }

    /// Biases padding sizes towards `ceil(ratio * data_len)`, clamped into
    /// `[min, max]`.
    pub fn with_ratio(mut self, ratio: f32) -> Result<Self, NoiseError> {
        if !(0.0..=MAX_PADDING_RATIO).contains(&ratio) {
            return Err(NoiseError::Config(format!(
                "padding ratio {} is outside [0, {}]",
                ratio, MAX_PADDING_RATIO
            )));
        }
        self.ratio = ratio;
        Ok(self)
    }

    fn with_mode(
        min: usize,
        max: usize,
        aead: bool,
        source: SizeSource,
    ) -> Result<Self, NoiseError> {
        if max < min {
            return Err(NoiseError::Config(format!(
                "padding max {} is below min {}",
                max, min
            )));
        }
        if max > MAX_PADDING {
            return Err(NoiseError::Config(format!(
                "padding max {} exceeds the protocol cap {}",
                max, MAX_PADDING
            )));
        }

        Ok(Self {
            min,
            max,
            ratio: 0.0,
            aead,
            source: Mutex::new(source),
        })
    }

    fn pick(&self, data_len: usize) -> (usize, Vec<u8>) {
        let mut source = self.source.lock().expect("padding RNG lock is poisoned");
        let size = match &mut *source {
            SizeSource::Random(rng) => {
                let (lo, hi) = self.size_window(data_len);
                rng.gen_range(lo..=hi)
            }
            SizeSource::Deterministic(_) => {
                if self.ratio > 0.0 {
                    self.ratio_target(data_len)
                } else {
                    self.min + data_len % (self.max - self.min + 1)
                }
            }
        };

        let mut filler = vec![0_u8; size];
        match &mut *source {
            SizeSource::Random(rng) | SizeSource::Deterministic(rng) => {
                rng.fill_bytes(&mut filler);
            }
        }
        (size, filler)
    }

    fn size_window(&self, data_len: usize) -> (usize, usize) {
        if self.ratio > 0.0 {
            let target = self.ratio_target(data_len);
            let lo = self.min.max(target.saturating_sub(RATIO_JITTER));
            let hi = self.max.min(target + RATIO_JITTER).max(lo);
            (lo, hi)
        } else {
            (self.min, self.max)
        }
    }

    fn ratio_target(&self, data_len: usize) -> usize {
        let target = (data_len as f32 * self.ratio).ceil() as usize;
        target.clamp(self.min, self.max)
    }

    fn pad_cleartext(&self, data: &[u8]) -> Vec<u8> {
        let (_, filler) = self.pick(data.len());
        let mut padded = data.to_vec();
        padded.extend_from_slice(&filler);
        padded
    }

    fn pad_block(&self, data: &[u8]) -> Vec<u8> {
        let (size, filler) = self.pick(data.len());
        let mut padded = Vec::with_capacity(data.len() + BLOCK_HEADER_LENGTH + size);
        padded.extend_from_slice(data);
        padded.push(PADDING_BLOCK_TYPE);
        let mut header = [0_u8; 2];
        BigEndian::write_u16(&mut header, size as u16);
        padded.extend_from_slice(&header);
        padded.extend_from_slice(&filler);
        padded
    }

    fn strip_block(data: &[u8]) -> Result<Vec<u8>, ModifierError> {
        match trailing_padding_start(data) {
            None => Ok(data.to_vec()),
            Some(start) => {
                let inner = &data[..start];
                if trailing_padding_start(inner).is_some() {
                    Err(ModifierError::MultiplePadding)
                } else {
                    Ok(inner.to_vec())
                }
            }
        }
    }
}

/// Locates a well-formed trailing padding block by scanning candidate sizes
/// from the tail; returns the offset of its type byte.
fn trailing_padding_start(data: &[u8]) -> Option<usize> {
    if data.len() < BLOCK_HEADER_LENGTH {
        return None;
    }
    for size in 0..=(data.len() - BLOCK_HEADER_LENGTH) {
        let start = data.len() - BLOCK_HEADER_LENGTH - size;
        if data[start] == PADDING_BLOCK_TYPE
            && BigEndian::read_u16(&data[start + 1..start + BLOCK_HEADER_LENGTH]) as usize == size
        {
            return Some(start);
        }
    }
    None
}

impl Modifier for PaddingModifier {
    fn name(&self) -> &str {
        if self.aead {
            "padding-aead"
        } else {
            "padding-cleartext"
        }
    }

    fn modify_out(&self, phase: Phase, data: &[u8]) -> Result<Vec<u8>, ModifierError> {
        match (self.aead, phase) {
            (false, Phase::Initial) | (false, Phase::Exchange) => Ok(self.pad_cleartext(data)),
            (true, Phase::Final) => Ok(self.pad_block(data)),
            _ => Ok(data.to_vec()),
        }
    }

    fn modify_in(&self, phase: Phase, data: &[u8]) -> Result<Vec<u8>, ModifierError> {
        // Cleartext padding is never stripped here: the outer protocol owns
        // the true message length.
        if self.aead && phase == Phase::Final {
            Self::strip_block(data)
        } else {
            Ok(data.to_vec())
        }
    }
}

impl std::fmt::Debug for PaddingModifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PaddingModifier")
            .field("min", &self.min)
            .field("max", &self.max)
            .field("ratio", &self.ratio)
            .field("aead", &self.aead)
            .finish()
    }
}

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
use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use std::sync::Arc;

use crate::{
    errors::NoiseError,
    modifiers::{padding::PADDING_BLOCK_TYPE, siphash::SipLengthModifier, ModifierChain, Phase},
    wrapper::{TransportWrapper, MAX_MESSAGE_LENGTH, TAG_LENGTH},
};

/// Length prefix preceding every data-phase frame.
pub const LENGTH_HEADER_LENGTH: usize = 2;
/// Block type carrying connection payload.
pub const DATA_BLOCK_TYPE: u8 = 3;

const BLOCK_HEADER_LENGTH: usize = 3;

/// Largest payload a single frame can carry: the u16 frame length minus the
/// AEAD tag and the payload block header. Padding, when configured, must fit
/// in what remains.
pub const MAX_PAYLOAD_LENGTH: usize = MAX_MESSAGE_LENGTH - TAG_LENGTH - BLOCK_HEADER_LENGTH;

/// Codec turning payload chunks into `{masked u16-BE length, AEAD ciphertext}`
/// frames and back.
///
/// Frame plaintext is a block stream: one type-3 payload block, optionally
/// followed by a padding block appended by the connection's modifier chain.
/// The chain runs over the plaintext (outbound before encryption, inbound
/// after decryption); the length prefix is masked by the codec's per-direction
/// SipHash instances when length masking is configured.
pub struct NoiseCodec {
    session: TransportWrapper,
    chain: Arc<ModifierChain>,
    send_masker: Option<SipLengthModifier>,
    recv_masker: Option<SipLengthModifier>,
    // Length of the frame currently being assembled, kept across `decode`
    // calls so the rolling mask advances exactly once per frame.
    next_len: Option<usize>,
}

impl NoiseCodec {
    pub fn new(
        session: TransportWrapper,
        chain: Arc<ModifierChain>,
        maskers: Option<(SipLengthModifier, SipLengthModifier)>,
    ) -> Self {
        let (send_masker, recv_masker) = match maskers {
            Some((send, recv)) => (Some(send), Some(recv)),
            None => (None, None),
        };
        Self {
            session,
            chain,
            send_masker,
            recv_masker,
            next_len: None,
        }
    }
}

impl std::fmt::Debug for NoiseCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NoiseCodec")
            .field("chain", &self.chain.names())
            .field("masked", &self.send_masker.is_some())
            .finish()
    }
}

impl Decoder for NoiseCodec {
    type Item = Vec<u8>;
    type Error = NoiseError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let len = match self.next_len {
            Some(len) => len,
            None => {
                if buf.len() < LENGTH_HEADER_LENGTH {
                    return Ok(None);
                }
                let header = buf.split_to(LENGTH_HEADER_LENGTH);
                let header = match &self.recv_masker {
                    Some(masker) => masker.apply(&header),
                    None => header.to_vec(),
                };
                let len = BigEndian::read_u16(&header) as usize;
                if len < TAG_LENGTH {
                    return Err(NoiseError::Protocol(format!(
                        "frame length {} is shorter than the AEAD tag",
                        len
                    )));
                }
                self.next_len = Some(len);
                len
            }
        };

        if buf.len() < len {
            return Ok(None);
        }
        self.next_len = None;

        let ciphertext = buf.split_to(len);
        let plaintext = self.session.decrypt(&ciphertext)?;
        let plaintext = self.chain.modify_in(Phase::Final, &plaintext)?;

        // A frame whose only content was padding decodes to an empty payload;
        // the reader skips it and waits for the next frame.
        if plaintext.is_empty() {
            return Ok(Some(Vec::new()));
        }

        if plaintext.len() < BLOCK_HEADER_LENGTH {
            return Err(NoiseError::Protocol(format!(
                "truncated block header ({} bytes)",
                plaintext.len()
            )));
        }
        let block_type = plaintext[0];
        if block_type != DATA_BLOCK_TYPE && block_type != PADDING_BLOCK_TYPE {
            return Err(NoiseError::Protocol(format!(
                "unknown block type {:#04x}",
                block_type
            )));
        }
        let size = BigEndian::read_u16(&plaintext[1..BLOCK_HEADER_LENGTH]) as usize;
        if BLOCK_HEADER_LENGTH + size > plaintext.len() {
            return Err(NoiseError::Protocol(format!(
                "block length {} overruns the frame ({} bytes left)",
                size,
                plaintext.len() - BLOCK_HEADER_LENGTH
            )));
        }
        if block_type == PADDING_BLOCK_TYPE {
            // Standalone padding block the chain had no reason to strip.
            return Ok(Some(Vec::new()));
        }
        Ok(Some(
            plaintext[BLOCK_HEADER_LENGTH..BLOCK_HEADER_LENGTH + size].to_vec(),
        ))
    }
}

impl Encoder<Bytes> for NoiseCodec {
    type Error = NoiseError;

    fn encode(&mut self, payload: Bytes, buf: &mut BytesMut) -> Result<(), Self::Error> {
        if payload.len() > MAX_PAYLOAD_LENGTH {
            return Err(NoiseError::Protocol(format!(
                "payload of {} bytes exceeds the frame capacity {}",
                payload.len(),
                MAX_PAYLOAD_LENGTH
            )));
        }

        let mut plaintext = Vec::with_capacity(BLOCK_HEADER_LENGTH + payload.len());
        plaintext.push(DATA_BLOCK_TYPE);
        let mut header = [0_u8; 2];
        BigEndian::write_u16(&mut header, payload.len() as u16);
        plaintext.extend_from_slice(&header);
        plaintext.extend_from_slice(&payload);

        let plaintext = self.chain.modify_out(Phase::Final, &plaintext)?;
        if plaintext.len() + TAG_LENGTH > MAX_MESSAGE_LENGTH {
            return Err(NoiseError::Protocol(format!(
                "padded frame of {} bytes exceeds the frame capacity",
                plaintext.len() + TAG_LENGTH
            )));
        }

        let ciphertext = self.session.encrypt(&plaintext)?;
        let mut length = [0_u8; LENGTH_HEADER_LENGTH];
        BigEndian::write_u16(&mut length, ciphertext.len() as u16);
        let length = match &self.send_masker {
            Some(masker) => masker.apply(&length),
            None => length.to_vec(),
        };

        buf.extend_from_slice(&length);
        buf.extend_from_slice(&ciphertext);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use bytes::{Bytes, BytesMut};
    use pretty_assertions::assert_eq;
    use tokio_util::codec::{Decoder, Encoder};

    use std::sync::Arc;

    use super::NoiseCodec;
    use crate::{
        config::{ConnConfig, Role},
        modifiers::{padding::PaddingModifier, siphash::SipLengthModifier, ModifierChain},
        wrapper::NoiseWrapper,
    };

    fn create_codec_pair(chain: ModifierChain, masked: bool) -> (NoiseCodec, NoiseCodec) {
        let mut initiator =
            NoiseWrapper::new(&ConnConfig::new("NN", Role::Initiator)).unwrap();
        let mut responder =
            NoiseWrapper::new(&ConnConfig::new("NN", Role::Responder)).unwrap();

        let msg = initiator.write_handshake_msg(&[]).unwrap();
        responder.read_handshake_msg(&msg).unwrap();
        let msg = responder.write_handshake_msg(&[]).unwrap();
        initiator.read_handshake_msg(&msg).unwrap();

        let chain = Arc::new(chain);
        // Initiator-to-responder traffic uses the (1, 2, 3) schedule, the
        // reverse direction (4, 5, 6); each side's send masker mirrors the
        // peer's receive masker.
        let initiator_maskers = masked.then(|| {
            (
                SipLengthModifier::new(1, 2, 3),
                SipLengthModifier::new(4, 5, 6),
            )
        });
        let responder_maskers = masked.then(|| {
            (
                SipLengthModifier::new(4, 5, 6),
                SipLengthModifier::new(1, 2, 3),
            )
        });

        let initiator_codec = NoiseCodec::new(
            initiator.into_transport_wrapper().unwrap(),
            Arc::clone(&chain),
            initiator_maskers,
        );
        let responder_codec = NoiseCodec::new(
            responder.into_transport_wrapper().unwrap(),
            chain,
            responder_maskers,
        );
        (initiator_codec, responder_codec)
    }

    #[test]
    fn frame_round_trip_plain() {
        let (mut sender, mut receiver) = create_codec_pair(ModifierChain::new("test", vec![]), false);
        let mut wire = BytesMut::new();
        sender
            .encode(Bytes::from_static(b"data phase payload"), &mut wire)
            .unwrap();
        let decoded = receiver.decode(&mut wire).unwrap().unwrap();
        assert_eq!(decoded, b"data phase payload");
        assert!(wire.is_empty());
    }

    #[test]
    fn frame_round_trip_with_padding_and_masking() {
        let chain = ModifierChain::new(
            "test",
            vec![Arc::new(
                PaddingModifier::deterministic(4, 16, true, 7).unwrap(),
            )],
        );
        let (mut sender, mut receiver) = create_codec_pair(chain, true);

        let mut wire = BytesMut::new();
        for message in &[&b"first"[..], &b"second frame"[..]] {
            sender.encode(Bytes::copy_from_slice(message), &mut wire).unwrap();
        }
        for message in &[&b"first"[..], &b"second frame"[..]] {
            let decoded = receiver.decode(&mut wire).unwrap().unwrap();
            assert_eq!(&decoded, message);
        }
        assert!(wire.is_empty());
    }

    #[test]
    fn partial_frames_wait_for_more_bytes() {
        let (mut sender, mut receiver) = create_codec_pair(ModifierChain::new("test", vec![]), true);
        let mut wire = BytesMut::new();
        sender.encode(Bytes::from_static(b"split me"), &mut wire).unwrap();

        let full = wire.clone();
        let mut partial = BytesMut::from(&full[..1]);
        assert!(receiver.decode(&mut partial).unwrap().is_none());
        partial.extend_from_slice(&full[1..5]);
        assert!(receiver.decode(&mut partial).unwrap().is_none());
        partial.extend_from_slice(&full[5..]);
        let decoded = receiver.decode(&mut partial).unwrap().unwrap();
        assert_eq!(decoded, b"split me");
    }

    #[test]
    fn corrupted_frame_fails_authentication() {
        let (mut sender, mut receiver) = create_codec_pair(ModifierChain::new("test", vec![]), false);
        let mut wire = BytesMut::new();
        sender.encode(Bytes::from_static(b"payload"), &mut wire).unwrap();
        let last = wire.len() - 1;
        wire[last] ^= 0x01;
        assert!(receiver.decode(&mut wire).is_err());
    }
}

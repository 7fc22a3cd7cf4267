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

use byteorder::{ByteOrder, LittleEndian};
use log::trace;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use std::sync::Arc;

use crate::{
    config::ConnConfig,
    errors::NoiseError,
    modifiers::{ModifierChain, Phase},
    wrapper::{NoiseWrapper, TransportWrapper, MAX_MESSAGE_LENGTH, TAG_LENGTH},
};

// First `HANDSHAKE_HEADER_LENGTH` bytes of a handshake record is the payload
// length in little-endian; maximum allowed message length is 65535, therefore
// the header cannot exceed 2 bytes.
pub const HANDSHAKE_HEADER_LENGTH: usize = 2;

const DH_LENGTH: usize = 32;

/// One handshake message as it travels the wire, before the modifier chain
/// has been peeled off.
pub struct HandshakeRawMessage(pub Vec<u8>);

impl HandshakeRawMessage {
    pub async fn read<S>(sock: &mut S) -> Result<Self, NoiseError>
    where
        S: AsyncRead + Unpin,
    {
        let mut header = [0_u8; HANDSHAKE_HEADER_LENGTH];
        sock.read_exact(&mut header).await?;
        let len = LittleEndian::read_u16(&header) as usize;
        let mut message = vec![0_u8; len];
        sock.read_exact(&mut message).await?;
        Ok(Self(message))
    }

    pub async fn write<S>(&self, sock: &mut S) -> Result<(), NoiseError>
    where
        S: AsyncWrite + Unpin,
    {
        let len = self.0.len();
        if len > MAX_MESSAGE_LENGTH {
            return Err(NoiseError::WrongMessageLength(len));
        }

        let mut message = vec![0_u8; HANDSHAKE_HEADER_LENGTH];
        LittleEndian::write_u16(&mut message, len as u16);
        message.extend_from_slice(&self.0);
        sock.write_all(&message).await?;
        Ok(())
    }
}

impl std::fmt::Debug for HandshakeRawMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "HandshakeRawMessage({} bytes)", self.0.len())
    }
}

/// Drives the Noise handshake over an arbitrary duplex channel, routing every
/// message through the modifier chain.
///
/// Outbound: `engine -> chain.modify_out(phase) -> wire`. Inbound:
/// `wire -> trim trailing padding -> chain.modify_in(phase) -> engine`.
/// The phase advances Initial → Exchange → Final with the message index.
#[derive(Debug)]
pub struct HandshakeDriver {
    wrapper: NoiseWrapper,
    chain: Arc<ModifierChain>,
    base_pattern: String,
    message_index: usize,
}

impl HandshakeDriver {
    pub fn new(config: &ConnConfig, chain: Arc<ModifierChain>) -> Result<Self, NoiseError> {
        Ok(Self {
            wrapper: NoiseWrapper::new(config)?,
            chain,
            base_pattern: config.base_pattern()?,
            message_index: 0,
        })
    }

    /// Runs the handshake to completion and yields the cipher-state carrier.
    ///
    /// The driver imposes no deadline of its own; the caller wraps this future
    /// in its timeout and cancellation guards.
    pub async fn run<S>(mut self, stream: &mut S) -> Result<TransportWrapper, NoiseError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        while !self.wrapper.is_handshake_finished() {
            if self.wrapper.is_my_turn() {
                self.send_message(stream).await?;
            } else {
                self.recv_message(stream).await?;
            }
        }
        self.wrapper.into_transport_wrapper()
    }

    async fn send_message<S>(&mut self, stream: &mut S) -> Result<(), NoiseError>
    where
        S: AsyncWrite + Unpin,
    {
        let phase = Phase::from_message_index(self.message_index);
        let msg = self.wrapper.write_handshake_msg(&[])?;
        let msg = self.chain.modify_out(phase, &msg)?;
        HandshakeRawMessage(msg).write(stream).await?;
        trace!(
            "sent handshake message {} ({:?} phase)",
            self.message_index + 1,
            phase
        );
        self.message_index += 1;
        Ok(())
    }

    async fn recv_message<S>(&mut self, stream: &mut S) -> Result<(), NoiseError>
    where
        S: AsyncRead + Unpin,
    {
        let phase = Phase::from_message_index(self.message_index);
        let mut msg = HandshakeRawMessage::read(stream).await?.0;

        // Cleartext padding rides after the Noise message proper; the expected
        // size for this step tells where it starts. Final-phase messages keep
        // their padding inside the AEAD and are never trimmed.
        if phase != Phase::Final {
            if let Some(expected) = expected_message_len(&self.base_pattern, self.message_index) {
                if msg.len() > expected {
                    msg.truncate(expected);
                }
            }
        }

        let msg = self.chain.modify_in(phase, &msg)?;
        self.wrapper.read_handshake_msg(&msg)?;
        trace!(
            "received handshake message {} ({:?} phase)",
            self.message_index + 1,
            phase
        );
        self.message_index += 1;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Token {
    E,
    S,
    Dh,
}

/// Message token sequences of the fundamental interactive patterns,
/// pre-message tokens omitted (they carry no wire bytes). All DH tokens
/// collapse into one variant: only "a key is now mixed" matters for sizing.
fn pattern_messages(base: &str) -> Option<&'static [&'static [Token]]> {
    use self::Token::{Dh, E, S};

    Some(match base {
        "NN" => &[&[E], &[E, Dh]],
        "NK" => &[&[E, Dh], &[E, Dh]],
        "NX" => &[&[E], &[E, Dh, S, Dh]],
        "XN" => &[&[E], &[E, Dh], &[S, Dh]],
        "XK" => &[&[E, Dh], &[E, Dh], &[S, Dh]],
        "XX" => &[&[E], &[E, Dh, S, Dh], &[S, Dh]],
        "KN" => &[&[E], &[E, Dh, Dh]],
        "KK" => &[&[E, Dh, Dh], &[E, Dh, Dh]],
        "KX" => &[&[E], &[E, Dh, Dh, S, Dh]],
        "IN" => &[&[E, S], &[E, Dh, Dh]],
        "IK" => &[&[E, Dh, S, Dh], &[E, Dh, Dh]],
        "IX" => &[&[E, S], &[E, Dh, Dh, S, Dh]],
        _ => return None,
    })
}

/// Exact wire size of handshake message `index` (zero-based) under an empty
/// payload, or `None` for patterns outside the table.
///
/// An `e` token always contributes the raw DH length; an `s` token and the
/// payload gain an AEAD tag once any DH has been mixed.
fn expected_message_len(base: &str, index: usize) -> Option<usize> {
    let messages = pattern_messages(base)?;
    let target = messages.get(index)?;

    let mut has_key = messages[..index]
        .iter()
        .any(|tokens| tokens.contains(&Token::Dh));
    let mut len = 0;
    for token in *target {
        match token {
            Token::E => len += DH_LENGTH,
            Token::S => {
                len += DH_LENGTH;
                if has_key {
                    len += TAG_LENGTH;
                }
            }
            Token::Dh => has_key = true,
        }
    }
    if has_key {
        len += TAG_LENGTH;
    }
    Some(len)
}

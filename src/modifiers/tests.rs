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
use pretty_assertions::assert_eq;

use std::sync::Arc;

use super::{
    obfs::AesObfuscator,
    padding::{PaddingModifier, PADDING_BLOCK_TYPE},
    siphash::SipLengthModifier,
    Modifier, ModifierChain, Phase,
};
use crate::{
    config::{ConnConfig, Role},
    errors::{ModifierError, NoiseError},
    wrapper::NoiseWrapper,
};

const SIPHASH_K1: u64 = 0x0123_4567_89AB_CDEF;
const SIPHASH_K2: u64 = 0xFEDC_BA98_7654_3210;
const SIPHASH_IV: u64 = 0x1122_3344_5566_7788;

fn sample_obfuscator() -> AesObfuscator {
    let router_hash: Vec<u8> = (0..32).collect();
    let iv: Vec<u8> = (32..48).collect();
    AesObfuscator::new(&router_hash, &iv).unwrap()
}

fn len_be(len: u16) -> Vec<u8> {
    let mut buf = [0_u8; 2];
    BigEndian::write_u16(&mut buf, len);
    buf.to_vec()
}

#[test]
fn aes_round_trip() {
    let obfs = sample_obfuscator();
    let data: Vec<u8> = (64..96).collect();

    let obfuscated = obfs.modify_out(Phase::Initial, &data).unwrap();
    assert_ne!(obfuscated, data);
    assert_eq!(obfuscated.len(), 32);
    assert_eq!(obfs.modify_in(Phase::Initial, &obfuscated).unwrap(), data);

    let obfuscated = obfs.modify_out(Phase::Exchange, &data).unwrap();
    assert_eq!(obfs.modify_in(Phase::Exchange, &obfuscated).unwrap(), data);
}

#[test]
fn aes_passes_through_final_phase() {
    let obfs = sample_obfuscator();
    let data: Vec<u8> = (64..96).collect();
    assert_eq!(obfs.modify_out(Phase::Final, &data).unwrap(), data);
    assert_eq!(obfs.modify_in(Phase::Final, &data).unwrap(), data);
}

#[test]
fn aes_passes_through_short_inputs() {
    let obfs = sample_obfuscator();
    for size in &[0_usize, 16, 31] {
        let data = vec![0x5A_u8; *size];
        assert_eq!(obfs.modify_out(Phase::Initial, &data).unwrap(), data);
        assert_eq!(obfs.modify_in(Phase::Exchange, &data).unwrap(), data);
    }
}

#[test]
fn aes_obfuscates_only_the_ephemeral_prefix() {
    let obfs = sample_obfuscator();
    for size in &[33_usize, 48, 64] {
        let data: Vec<u8> = (0..*size).map(|i| (i % 251) as u8).collect();
        let wire = obfs.modify_out(Phase::Initial, &data).unwrap();
        assert_eq!(wire.len(), data.len());
        assert_ne!(wire[..32], data[..32]);
        assert_eq!(wire[32..], data[32..]);
        assert_eq!(obfs.modify_in(Phase::Initial, &wire).unwrap(), data);
    }
}

#[test]
fn aes_transforms_real_xk_handshake_messages() {
    let params: snow::params::NoiseParams =
        "Noise_XK_25519_ChaChaPoly_SHA256".parse().unwrap();
    let initiator_keys = snow::Builder::new(params.clone()).generate_keypair().unwrap();
    let responder_keys = snow::Builder::new(params).generate_keypair().unwrap();

    let initiator_config = ConnConfig::new("XK", Role::Initiator)
        .with_local_static(&initiator_keys.private)
        .with_remote_static(&responder_keys.public);
    let responder_config =
        ConnConfig::new("XK", Role::Responder).with_local_static(&responder_keys.private);
    let mut initiator = NoiseWrapper::new(&initiator_config).unwrap();
    let mut responder = NoiseWrapper::new(&responder_config).unwrap();
    let obfs = sample_obfuscator();

    // XK message 1 is 48 bytes: the 32-byte ephemeral plus the AEAD tag of
    // the empty payload. Only the ephemeral may change on the wire.
    let msg1 = initiator.write_handshake_msg(&[]).unwrap();
    assert_eq!(msg1.len(), 48);
    let wire1 = obfs.modify_out(Phase::Initial, &msg1).unwrap();
    assert_ne!(wire1[..32], msg1[..32]);
    assert_eq!(wire1[32..], msg1[32..]);
    assert_eq!(obfs.modify_in(Phase::Initial, &wire1).unwrap(), msg1);

    responder.read_handshake_msg(&msg1).unwrap();
    let msg2 = responder.write_handshake_msg(&[]).unwrap();
    assert_eq!(msg2.len(), 48);
    let wire2 = obfs.modify_out(Phase::Exchange, &msg2).unwrap();
    assert_ne!(wire2[..32], msg2[..32]);
    assert_eq!(wire2[32..], msg2[32..]);
    assert_eq!(obfs.modify_in(Phase::Exchange, &wire2).unwrap(), msg2);
}

#[test]
fn aes_rejects_bad_parameters() {
    assert!(AesObfuscator::new(&[0_u8; 31], &[0_u8; 16]).is_err());
    assert!(AesObfuscator::new(&[0_u8; 32], &[0_u8; 15]).is_err());
}

#[test]
fn siphash_length_round_trip() {
    let sender = SipLengthModifier::new(SIPHASH_K1, SIPHASH_K2, SIPHASH_IV);
    let receiver = SipLengthModifier::new(SIPHASH_K1, SIPHASH_K2, SIPHASH_IV);

    for len in &[1024_u16, 16, 65_535] {
        let input = len_be(*len);
        let masked = sender.modify_out(Phase::Final, &input).unwrap();
        assert_ne!(masked, input, "mask collapsed for length {}", len);
        assert_eq!(receiver.modify_in(Phase::Final, &masked).unwrap(), input);
    }
}

#[test]
fn siphash_schedules_stay_in_lockstep() {
    // Two parallel sender/receiver pairs built from the same keys must produce
    // the same mask sequence frame-for-frame.
    let first = SipLengthModifier::new(SIPHASH_K1, SIPHASH_K2, SIPHASH_IV);
    let second = SipLengthModifier::new(SIPHASH_K1, SIPHASH_K2, SIPHASH_IV);

    for frame in 0..16_u16 {
        let input = len_be(frame * 191 + 7);
        assert_eq!(
            first.modify_out(Phase::Final, &input).unwrap(),
            second.modify_out(Phase::Final, &input).unwrap(),
            "schedules diverged on frame {}",
            frame
        );
    }
}

#[test]
fn siphash_passes_through_handshake_phases() {
    let masker = SipLengthModifier::new(SIPHASH_K1, SIPHASH_K2, SIPHASH_IV);
    let input = len_be(1024);
    assert_eq!(masker.modify_out(Phase::Initial, &input).unwrap(), input);
    assert_eq!(masker.modify_in(Phase::Exchange, &input).unwrap(), input);
    // Non-length-sized buffers are untouched even in the data phase.
    let frame = vec![0xCC_u8; 7];
    assert_eq!(masker.modify_out(Phase::Final, &frame).unwrap(), frame);
}

#[test]
fn aead_padding_round_trip() {
    let padding = PaddingModifier::deterministic(4, 16, true, 1).unwrap();
    let data = b"test data phase message";

    let padded = padding.modify_out(Phase::Final, data).unwrap();
    let size = padded.len() - data.len() - 3;
    assert!((4..=16).contains(&size), "padding size {} out of range", size);
    assert_eq!(padded[data.len()], PADDING_BLOCK_TYPE);
    assert_eq!(
        BigEndian::read_u16(&padded[data.len() + 1..data.len() + 3]) as usize,
        size
    );
    assert_eq!(padding.modify_in(Phase::Final, &padded).unwrap(), data);
}

#[test]
fn aead_padding_sizes_span_the_window() {
    let padding = PaddingModifier::aead(4, 16).unwrap();
    for data_len in 0..64_usize {
        let data = vec![0x42_u8; data_len];
        let padded = padding.modify_out(Phase::Final, &data).unwrap();
        let size = padded.len() - data_len - 3;
        assert!((4..=16).contains(&size), "padding size {} out of range", size);
        assert_eq!(padding.modify_in(Phase::Final, &padded).unwrap(), data);
    }
}

#[test]
fn ratio_padding_tracks_data_length() {
    let padding = PaddingModifier::deterministic(0, 100, true, 0)
        .unwrap()
        .with_ratio(1.0)
        .unwrap();
    let data = b"hello world";

    let padded = padding.modify_out(Phase::Final, data).unwrap();
    let size = padded.len() - data.len() - 3;
    assert_eq!(size, data.len());
    assert_eq!(padding.modify_in(Phase::Final, &padded).unwrap(), data);
}

#[test]
fn cleartext_padding_inflates_handshake_messages_only() {
    let padding = PaddingModifier::deterministic(8, 8, false, 2).unwrap();
    let data = vec![0x17_u8; 32];

    let padded = padding.modify_out(Phase::Initial, &data).unwrap();
    assert_eq!(padded.len(), data.len() + 8);
    assert_eq!(&padded[..data.len()], &data[..]);

    // Receiving never strips: the outer protocol owns the true length.
    assert_eq!(padding.modify_in(Phase::Initial, &padded).unwrap(), padded);
    // The data phase is outside this mode entirely.
    assert_eq!(padding.modify_out(Phase::Final, &data).unwrap(), data);
}

#[test]
fn aead_padding_is_inert_during_the_handshake() {
    let padding = PaddingModifier::deterministic(4, 16, true, 3).unwrap();
    let data = vec![0x17_u8; 32];
    assert_eq!(padding.modify_out(Phase::Initial, &data).unwrap(), data);
    assert_eq!(padding.modify_out(Phase::Exchange, &data).unwrap(), data);
}

#[test]
fn malformed_padding_tail_is_returned_unchanged() {
    let padding = PaddingModifier::aead(0, 16).unwrap();
    // Declared size 100 with only 3 bytes available.
    let frame = vec![0xFE, 0x00, 0x64, 0x01, 0x02, 0x03];
    assert_eq!(padding.modify_in(Phase::Final, &frame).unwrap(), frame);
}

#[test]
fn double_padding_is_rejected() {
    let padding = PaddingModifier::aead(0, 16).unwrap();
    let mut frame = b"payload".to_vec();
    frame.extend_from_slice(&[PADDING_BLOCK_TYPE, 0x00, 0x02, 0xAA, 0xBB]);
    frame.extend_from_slice(&[PADDING_BLOCK_TYPE, 0x00, 0x03, 0xCC, 0xDD, 0xEE]);

    let err = padding.modify_in(Phase::Final, &frame).unwrap_err();
    assert!(matches!(err, ModifierError::MultiplePadding));
}

#[test]
fn production_padding_sizes_vary() {
    let padding = PaddingModifier::aead(0, 1024).unwrap();
    let data = vec![0_u8; 100];
    let sizes: Vec<_> = (0..16)
        .map(|_| padding.modify_out(Phase::Final, &data).unwrap().len())
        .collect();
    assert!(
        sizes.windows(2).any(|pair| pair[0] != pair[1]),
        "production padding produced 16 identical sizes"
    );
}

#[test]
fn empty_chain_is_the_identity() {
    let chain = ModifierChain::new("empty", vec![]);
    let data = b"untouched".to_vec();
    assert_eq!(chain.modify_out(Phase::Final, &data).unwrap(), data);
    assert_eq!(chain.modify_in(Phase::Initial, &data).unwrap(), data);
    assert!(chain.is_empty());
    assert_eq!(chain.len(), 0);
}

#[test]
fn chain_round_trip_reverses_link_order() {
    let chain = ModifierChain::new(
        "ntcp2",
        vec![
            Arc::new(sample_obfuscator()) as Arc<dyn Modifier>,
            Arc::new(PaddingModifier::deterministic(4, 16, true, 4).unwrap()),
        ],
    );
    let data: Vec<u8> = (0..32).collect();

    let wire = chain.modify_out(Phase::Final, &data).unwrap();
    assert_eq!(chain.modify_in(Phase::Final, &wire).unwrap(), data);

    // On Initial the obfuscator transforms and the AEAD padding stays inert.
    let wire = chain.modify_out(Phase::Initial, &data).unwrap();
    assert_ne!(wire, data);
    assert_eq!(wire.len(), 32);
    assert_eq!(chain.modify_in(Phase::Initial, &wire).unwrap(), data);
}

#[test]
fn chain_applies_cleartext_padding_after_obfuscation() {
    let chain = ModifierChain::new(
        "ntcp2",
        vec![
            Arc::new(sample_obfuscator()) as Arc<dyn Modifier>,
            Arc::new(PaddingModifier::deterministic(8, 8, false, 5).unwrap()),
        ],
    );
    let ephemeral: Vec<u8> = (100..132).collect();

    let wire = chain.modify_out(Phase::Initial, &ephemeral).unwrap();
    assert_eq!(wire.len(), 40);
    let expected = sample_obfuscator()
        .modify_out(Phase::Initial, &ephemeral)
        .unwrap();
    assert_eq!(&wire[..32], &expected[..]);

    // The receiving driver trims the padding back to the expected message
    // size before the inbound chain runs.
    assert_eq!(chain.modify_in(Phase::Initial, &wire[..32]).unwrap(), ephemeral);
}

#[test]
fn chain_errors_carry_link_context() {
    let chain = ModifierChain::new(
        "ntcp2",
        vec![
            Arc::new(sample_obfuscator()) as Arc<dyn Modifier>,
            Arc::new(PaddingModifier::aead(0, 16).unwrap()),
        ],
    );
    let mut frame = b"x".to_vec();
    frame.extend_from_slice(&[PADDING_BLOCK_TYPE, 0x00, 0x00]);
    frame.extend_from_slice(&[PADDING_BLOCK_TYPE, 0x00, 0x00]);

    match chain.modify_in(Phase::Final, &frame) {
        Err(NoiseError::ModifierChain {
            chain,
            modifier,
            index,
            phase,
            ..
        }) => {
            assert_eq!(chain, "ntcp2");
            assert_eq!(modifier, "padding-aead");
            assert_eq!(index, 1);
            assert_eq!(phase, Phase::Final);
        }
        other => panic!("expected a chain error, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn chain_names_follow_declaration_order() {
    let chain = ModifierChain::new(
        "ntcp2",
        vec![
            Arc::new(sample_obfuscator()) as Arc<dyn Modifier>,
            Arc::new(SipLengthModifier::new(1, 2, 3)),
        ],
    );
    assert_eq!(chain.names(), vec!["aes-obfs", "siphash-length"]);
}

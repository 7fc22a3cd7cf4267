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

//! Connection-oriented wrapper around the Noise Protocol Framework with a pluggable
//! pipeline of wire-level transforms, suitable for obfuscated transports such as
//! I2P's NTCP2.
//!
//! # Overview
//!
//! This crate contains the following APIs:
//!
//! - [`NoiseConn`] wraps an already-established duplex byte channel into a
//!   Noise-secured connection with an explicit handshake step
//! - [`NoiseListener`] accepts TCP streams and wraps each of them into a
//!   responder-side `NoiseConn`
//! - [`Modifier`] and [`ModifierChain`] describe reversible, phase-aware byte
//!   transforms applied to every handshake message and data frame
//! - The NTCP2 modifier family ([`AesObfuscator`], [`SipLengthModifier`],
//!   [`PaddingModifier`]) and [`Ntcp2Config`], which assembles them into a
//!   ready-to-use connection configuration
//!
//! The Noise cryptography itself is provided by the [`snow`] crate; this crate
//! drives its handshake state machine, owns the post-handshake cipher states and
//! frames the data phase.
//!
//! # Examples
//!
//! ```no_run
//! use noise_transport::{ConnConfig, NoiseConn, Role};
//! use tokio::net::TcpStream;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), noise_transport::NoiseError> {
//! let stream = TcpStream::connect("127.0.0.1:9000").await?;
//! let config = ConnConfig::new("XX", Role::Initiator);
//! let mut conn = NoiseConn::from_tcp(stream, config)?;
//! conn.handshake(&CancellationToken::new()).await?;
//! conn.write(b"ping").await?;
//! # Ok(())
//! # }
//! ```
//!
//! [`NoiseConn`]: struct.NoiseConn.html
//! [`NoiseListener`]: struct.NoiseListener.html
//! [`Modifier`]: trait.Modifier.html
//! [`ModifierChain`]: struct.ModifierChain.html
//! [`AesObfuscator`]: struct.AesObfuscator.html
//! [`SipLengthModifier`]: struct.SipLengthModifier.html
//! [`PaddingModifier`]: struct.PaddingModifier.html
//! [`Ntcp2Config`]: struct.Ntcp2Config.html
//! [`snow`]: https://docs.rs/snow

#![warn(
    missing_debug_implementations,
    missing_docs,
    unsafe_code,
    bare_trait_objects
)]
#![warn(clippy::pedantic, clippy::nursery)]
#![allow(
    // Next `cast_*` lints don't give alternatives.
    clippy::cast_possible_wrap, clippy::cast_possible_truncation, clippy::cast_sign_loss,
    // Next lints produce too much noise/false positives.
    clippy::module_name_repetitions, clippy::similar_names, clippy::must_use_candidate,
    // '... may panic' lints.
    clippy::indexing_slicing,
    // Too much work to fix.
    clippy::missing_errors_doc, clippy::missing_const_for_fn
)]

pub use crate::{
    addr::NoiseAddr,
    config::{ConnConfig, ListenerConfig, Role},
    conn::{ConnState, NoiseConn, NoiseReadHalf, NoiseWriteHalf},
    errors::{ModifierError, NoiseError},
    listener::NoiseListener,
    metrics::MetricsSnapshot,
    modifiers::{
        obfs::AesObfuscator, padding::PaddingModifier, siphash::SipLengthModifier, Modifier,
        ModifierChain, Phase,
    },
    ntcp2::Ntcp2Config,
};

mod addr;
mod codec;
mod config;
mod conn;
mod errors;
mod handshake;
mod listener;
mod metrics;
mod modifiers;
mod ntcp2;
mod retry;
mod wrapper;

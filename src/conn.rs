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

use bytes::{Buf, Bytes, BytesMut};
use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use log::{debug, info, trace};
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
    time,
};
use tokio_util::{codec::Framed, sync::CancellationToken};

use std::{future::Future, mem, net::SocketAddr, sync::Arc, time::Duration};

use crate::{
    addr::NoiseAddr,
    codec::{NoiseCodec, MAX_PAYLOAD_LENGTH},
    config::ConnConfig,
    errors::NoiseError,
    handshake::HandshakeDriver,
    metrics::{ConnMetrics, MetricsSnapshot},
    modifiers::{siphash::SipLengthModifier, ModifierChain},
    retry::Backoff,
};

// Payload chunk carried by a single data frame. Kept well below the frame
// capacity so that padding always fits.
const CHUNK_LENGTH: usize = 16_384;

/// Lifecycle state of a [`NoiseConn`].
///
/// The progression is linear: `Init` → `Handshaking` → `Established` →
/// `Closed`. A failed or cancelled handshake drops back to `Init` so the
/// connection may retry; `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Constructed; no handshake has succeeded yet.
    Init,
    /// A handshake is in flight.
    Handshaking,
    /// The handshake completed; reads and writes are permitted.
    Established,
    /// Closed by the user or by a fatal protocol error. Terminal.
    Closed,
}

enum Io<S> {
    Idle(S),
    Framed(Framed<S, NoiseCodec>),
    Empty,
}

/// A Noise-secured duplex connection over an arbitrary byte channel.
///
/// Constructed in the `Init` state without performing any I/O; the caller
/// drives [`handshake`](Self::handshake) (or the retrying variant) and then
/// exchanges bytes with [`read`](Self::read) and [`write`](Self::write).
/// Exclusive access (`&mut self`) serializes operations on one handle, which
/// is what the single-flight handshake guarantee requires. To read and write
/// concurrently from different tasks, [`split`](Self::split) the established
/// connection into halves that lock the shared transport independently.
pub struct NoiseConn<S> {
    config: ConnConfig,
    chain: Arc<ModifierChain>,
    io: Io<S>,
    state: ConnState,
    leftover: BytesMut,
    metrics: Arc<ConnMetrics>,
    local: Option<SocketAddr>,
    peer: Option<SocketAddr>,
}

impl<S> NoiseConn<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wraps an already-established byte channel. Validates the configuration
    /// and performs no I/O.
    pub fn new(stream: S, config: ConnConfig) -> Result<Self, NoiseError> {
        config.validate()?;
        let chain = Arc::new(ModifierChain::new("conn", config.modifiers.clone()));
        Ok(Self {
            config,
            chain,
            io: Io::Idle(stream),
            state: ConnState::Init,
            leftover: BytesMut::new(),
            metrics: Arc::new(ConnMetrics::new()),
            local: None,
            peer: None,
        })
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnState {
        self.state
    }

    /// The validated configuration this connection was built with.
    pub fn config(&self) -> &ConnConfig {
        &self.config
    }

    /// Point-in-time copy of the connection counters.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Local endpoint, decorated with pattern and role.
    pub fn local_addr(&self) -> NoiseAddr {
        NoiseAddr::new(self.config.pattern.clone(), self.config.role, self.local)
    }

    /// Remote endpoint, decorated with pattern and role.
    pub fn peer_addr(&self) -> NoiseAddr {
        NoiseAddr::new(self.config.pattern.clone(), self.config.role, self.peer)
    }

    /// Runs the Noise handshake once.
    ///
    /// Permitted only in the `Init` state. On success the connection becomes
    /// `Established`; on failure (including timeout) it returns to `Init` with
    /// the underlying channel intact, so the caller may retry or salvage the
    /// raw channel. Cancellation through `cancel` likewise returns to `Init`.
    pub async fn handshake(&mut self, cancel: &CancellationToken) -> Result<(), NoiseError> {
        if self.state != ConnState::Init {
            return Err(NoiseError::WrongState {
                op: "handshake",
                state: self.state,
            });
        }
        let mut stream = match mem::replace(&mut self.io, Io::Empty) {
            Io::Idle(stream) => stream,
            _ => unreachable!("`Init` connections always hold an idle stream"),
        };

        self.state = ConnState::Handshaking;
        self.metrics.record_handshake_start();
        trace!(
            "starting {} handshake for `{}`",
            self.config.role,
            self.config.pattern
        );

        let result = match HandshakeDriver::new(&self.config, Arc::clone(&self.chain)) {
            Ok(driver) => {
                let deadline = self.config.handshake_timeout;
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(NoiseError::Cancelled),
                    finished = time::timeout(deadline, driver.run(&mut stream)) => {
                        match finished {
                            Ok(inner) => inner,
                            Err(_) => Err(NoiseError::Timeout(deadline)),
                        }
                    }
                }
            }
            Err(err) => Err(err),
        };

        match result {
            Ok(transport) => {
                let maskers = self.config.length_masking.map(|keys| {
                    (
                        SipLengthModifier::new(keys.k1, keys.k2, keys.iv),
                        SipLengthModifier::new(keys.k1, keys.k2, keys.iv),
                    )
                });
                let codec = NoiseCodec::new(transport, Arc::clone(&self.chain), maskers);
                self.io = Io::Framed(Framed::new(stream, codec));
                self.state = ConnState::Established;
                self.metrics.record_handshake_end();
                info!(
                    "{} handshake for `{}` complete",
                    self.config.role, self.config.pattern
                );
                Ok(())
            }
            Err(err) => {
                self.io = Io::Idle(stream);
                self.state = ConnState::Init;
                debug!(
                    "{} handshake for `{}` failed: {}",
                    self.config.role, self.config.pattern, err
                );
                Err(err)
            }
        }
    }

    /// Runs the handshake under the configured retry budget.
    ///
    /// Performs at most `retries + 1` attempts (unbounded for `-1`), waiting
    /// `min(backoff * 2^(k-1), 30s)` between attempts. Only retry-eligible
    /// failures (I/O, protocol, timeout) consume the budget; configuration
    /// errors and cancellation surface immediately. Once the budget is spent,
    /// the last cause is wrapped together with the attempt count.
    pub async fn handshake_with_retry(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<(), NoiseError> {
        let max = self.config.retries;
        let mut backoff = Backoff::new(self.config.retry_backoff);
        let mut attempts = 0_usize;

        loop {
            attempts += 1;
            let err = match self.handshake(cancel).await {
                Ok(()) => return Ok(()),
                Err(err) => err,
            };

            // Retrying makes sense only for transient failures, and only while
            // the connection dropped back to `Init`.
            if !err.is_retriable() || self.state != ConnState::Init {
                return Err(err);
            }
            if max >= 0 && attempts > max as usize {
                return Err(NoiseError::HandshakeFailed {
                    attempts,
                    max,
                    pattern: self.config.pattern.clone(),
                    source: Box::new(err),
                });
            }

            let delay = backoff.next().expect("backoff iterator is endless");
            debug!(
                "handshake attempt {} failed ({}), retrying in {:?}",
                attempts, err, delay
            );
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(NoiseError::Cancelled),
                _ = time::sleep(delay) => {}
            }
        }
    }

    /// Reads decrypted payload bytes into `buf`, returning the count.
    ///
    /// Pulls one frame at a time; when `buf` is smaller than a frame's
    /// payload, the remainder is buffered for the next call. Returns `Ok(0)`
    /// on a clean end of stream. Permitted only in the `Established` state.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, NoiseError> {
        self.check_established("read")?;
        if buf.is_empty() {
            return Ok(0);
        }

        while self.leftover.is_empty() {
            let timeout = self.config.read_timeout;
            let framed = match &mut self.io {
                Io::Framed(framed) => framed,
                _ => unreachable!("`Established` connections always hold a framed stream"),
            };

            let frame = match with_deadline(timeout, framed.next()).await? {
                None => return Ok(0),
                Some(frame) => frame,
            };
            match frame {
                Ok(payload) => {
                    self.metrics.add_bytes_in(payload.len());
                    // Padding-only frames decode to nothing; keep waiting.
                    self.leftover.extend_from_slice(&payload);
                }
                Err(err @ NoiseError::Io(_)) => return Err(err),
                Err(err) => {
                    // A protocol failure after the handshake is unrecoverable:
                    // the cipher streams are out of step.
                    self.shutdown().await;
                    return Err(err);
                }
            }
        }

        let count = buf.len().min(self.leftover.len());
        buf[..count].copy_from_slice(&self.leftover[..count]);
        self.leftover.advance(count);
        Ok(count)
    }

    /// Encrypts and writes all of `buf`, returning its length.
    ///
    /// The payload is split into frames of at most 16 KiB; every frame is
    /// fully delivered (flush included) before this method returns. Permitted
    /// only in the `Established` state.
    pub async fn write(&mut self, buf: &[u8]) -> Result<usize, NoiseError> {
        self.check_established("write")?;
        let timeout = self.config.write_timeout;

        for chunk in buf.chunks(CHUNK_LENGTH.min(MAX_PAYLOAD_LENGTH)) {
            let framed = match &mut self.io {
                Io::Framed(framed) => framed,
                _ => unreachable!("`Established` connections always hold a framed stream"),
            };
            let result =
                with_deadline(timeout, framed.send(Bytes::copy_from_slice(chunk))).await;
            match result.and_then(|inner| inner) {
                Ok(()) => self.metrics.add_bytes_out(chunk.len()),
                Err(err @ NoiseError::Io(_)) | Err(err @ NoiseError::Timeout(_)) => {
                    return Err(err)
                }
                Err(err) => {
                    self.shutdown().await;
                    return Err(err);
                }
            }
        }
        Ok(buf.len())
    }

    /// Splits an established connection into independently usable read and
    /// write halves, so that reads and writes proceed concurrently from
    /// different tasks.
    ///
    /// The halves share the underlying transport behind an internal I/O lock;
    /// each direction still owns its cipher state exclusively, so frames never
    /// interleave. Permitted only in the `Established` state; a failed split
    /// consumes the connection.
    pub fn split(mut self) -> Result<(NoiseReadHalf<S>, NoiseWriteHalf<S>), NoiseError> {
        if self.state != ConnState::Established {
            return Err(NoiseError::WrongState {
                op: "split",
                state: self.state,
            });
        }
        let framed = match mem::replace(&mut self.io, Io::Empty) {
            Io::Framed(framed) => framed,
            _ => unreachable!("`Established` connections always hold a framed stream"),
        };
        let (sink, stream) = framed.split();
        Ok((
            NoiseReadHalf {
                stream,
                leftover: mem::take(&mut self.leftover),
                timeout: self.config.read_timeout,
                metrics: Arc::clone(&self.metrics),
            },
            NoiseWriteHalf {
                sink,
                timeout: self.config.write_timeout,
                metrics: Arc::clone(&self.metrics),
            },
        ))
    }

    /// Closes the connection and the underlying channel. Idempotent; after
    /// the first call the state is `Closed` and every other operation is
    /// rejected.
    pub async fn close(&mut self) -> Result<(), NoiseError> {
        if self.state == ConnState::Closed {
            return Ok(());
        }
        self.shutdown().await;
        info!("connection for `{}` closed", self.config.pattern);
        Ok(())
    }

    fn check_established(&self, op: &'static str) -> Result<(), NoiseError> {
        if self.state == ConnState::Established {
            Ok(())
        } else {
            Err(NoiseError::WrongState {
                op,
                state: self.state,
            })
        }
    }

    async fn shutdown(&mut self) {
        match mem::replace(&mut self.io, Io::Empty) {
            Io::Idle(mut stream) => {
                stream.shutdown().await.ok();
            }
            Io::Framed(mut framed) => {
                // Drain whatever the sink still buffers before tearing down.
                framed.flush().await.ok();
                framed.get_mut().shutdown().await.ok();
            }
            Io::Empty => {}
        }
        self.state = ConnState::Closed;
    }
}

/// Read side of a split connection.
///
/// Carries the frame-remainder buffer, so short-read semantics are identical
/// to [`NoiseConn::read`]. A protocol failure poisons the transport; drop both
/// halves when one surfaces.
pub struct NoiseReadHalf<S> {
    stream: SplitStream<Framed<S, NoiseCodec>>,
    leftover: BytesMut,
    timeout: Option<Duration>,
    metrics: Arc<ConnMetrics>,
}

impl<S> NoiseReadHalf<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Reads decrypted payload bytes into `buf`, returning the count.
    /// Semantics match [`NoiseConn::read`].
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, NoiseError> {
        if buf.is_empty() {
            return Ok(0);
        }

        while self.leftover.is_empty() {
            let frame = match with_deadline(self.timeout, self.stream.next()).await? {
                None => return Ok(0),
                Some(frame) => frame?,
            };
            self.metrics.add_bytes_in(frame.len());
            // Padding-only frames decode to nothing; keep waiting.
            self.leftover.extend_from_slice(&frame);
        }

        let count = buf.len().min(self.leftover.len());
        buf[..count].copy_from_slice(&self.leftover[..count]);
        self.leftover.advance(count);
        Ok(count)
    }

    /// Point-in-time copy of the connection counters.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }
}

/// Write side of a split connection.
pub struct NoiseWriteHalf<S> {
    sink: SplitSink<Framed<S, NoiseCodec>, Bytes>,
    timeout: Option<Duration>,
    metrics: Arc<ConnMetrics>,
}

impl<S> NoiseWriteHalf<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Encrypts and writes all of `buf`, returning its length.
    /// Semantics match [`NoiseConn::write`].
    pub async fn write(&mut self, buf: &[u8]) -> Result<usize, NoiseError> {
        for chunk in buf.chunks(CHUNK_LENGTH.min(MAX_PAYLOAD_LENGTH)) {
            let result =
                with_deadline(self.timeout, self.sink.send(Bytes::copy_from_slice(chunk))).await;
            result.and_then(|inner| inner)?;
            self.metrics.add_bytes_out(chunk.len());
        }
        Ok(buf.len())
    }

    /// Flushes pending frames and shuts the underlying channel down.
    pub async fn close(&mut self) -> Result<(), NoiseError> {
        self.sink.close().await
    }

    /// Point-in-time copy of the connection counters.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }
}

impl<S> std::fmt::Debug for NoiseReadHalf<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NoiseReadHalf")
            .field("buffered", &self.leftover.len())
            .finish()
    }
}

impl<S> std::fmt::Debug for NoiseWriteHalf<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NoiseWriteHalf").finish()
    }
}

impl NoiseConn<TcpStream> {
    /// Wraps a TCP stream, capturing its endpoint addresses for
    /// [`local_addr`](Self::local_addr) and [`peer_addr`](Self::peer_addr).
    pub fn from_tcp(stream: TcpStream, config: ConnConfig) -> Result<Self, NoiseError> {
        let local = stream.local_addr().ok();
        let peer = stream.peer_addr().ok();
        let mut conn = Self::new(stream, config)?;
        conn.local = local;
        conn.peer = peer;
        Ok(conn)
    }
}

/// Applies an optional deadline to a read/write future.
async fn with_deadline<F: Future>(
    timeout: Option<Duration>,
    future: F,
) -> Result<F::Output, NoiseError> {
    match timeout {
        Some(deadline) => time::timeout(deadline, future)
            .await
            .map_err(|_| NoiseError::Timeout(deadline)),
        None => Ok(future.await),
    }
}

impl<S> std::fmt::Debug for NoiseConn<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NoiseConn")
            .field("pattern", &self.config.pattern)
            .field("role", &self.config.role)
            .field("state", &self.state)
            .finish()
    }
}

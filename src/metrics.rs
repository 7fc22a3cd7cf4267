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

use std::{
    sync::atomic::{AtomicU64, Ordering},
    sync::Mutex,
    time::{Duration, Instant},
};

/// In-memory counters of a single connection.
///
/// Byte counters track plaintext payload, not wire bytes. The handshake
/// timestamps are overwritten on every attempt, so after a successful
/// handshake they describe the attempt that succeeded.
#[derive(Debug)]
pub struct ConnMetrics {
    created: Instant,
    handshake: Mutex<HandshakeTimes>,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
}

#[derive(Debug, Default, Clone, Copy)]
struct HandshakeTimes {
    started: Option<Instant>,
    finished: Option<Instant>,
}

/// Point-in-time copy of a connection's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Plaintext bytes delivered to the reader.
    pub bytes_in: u64,
    /// Plaintext bytes accepted from the writer.
    pub bytes_out: u64,
    /// Duration of the successful handshake, if one completed.
    pub handshake_duration: Option<Duration>,
    /// Time elapsed since the connection was constructed.
    pub age: Duration,
}

impl ConnMetrics {
    pub(crate) fn new() -> Self {
        Self {
            created: Instant::now(),
            handshake: Mutex::new(HandshakeTimes::default()),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
        }
    }

    pub(crate) fn record_handshake_start(&self) {
        let mut times = self.handshake.lock().expect("metrics lock is poisoned");
        times.started = Some(Instant::now());
        times.finished = None;
    }

    pub(crate) fn record_handshake_end(&self) {
        let mut times = self.handshake.lock().expect("metrics lock is poisoned");
        times.finished = Some(Instant::now());
    }

    pub(crate) fn add_bytes_in(&self, count: usize) {
        self.bytes_in.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub(crate) fn add_bytes_out(&self, count: usize) {
        self.bytes_out.fetch_add(count as u64, Ordering::Relaxed);
    }

    /// Copies the current counter values.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let times = *self.handshake.lock().expect("metrics lock is poisoned");
        let handshake_duration = match (times.started, times.finished) {
            (Some(started), Some(finished)) => Some(finished.duration_since(started)),
            _ => None,
        };
        MetricsSnapshot {
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            handshake_duration,
            age: self.created.elapsed(),
        }
    }
}

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

use std::time::Duration;

/// Ceiling on a single retry wait, regardless of how far the doubling got.
pub const BACKOFF_CEILING: Duration = Duration::from_secs(30);

/// Exponential backoff delay strategy: `min(base * 2^(k-1), 30s)` before
/// attempt `k + 1`. The iterator is endless; a bounded retry budget simply
/// stops consuming it.
#[derive(Debug, Clone)]
pub struct Backoff {
    next: Duration,
}

impl Backoff {
    pub fn new(base: Duration) -> Self {
        Self { next: base }
    }
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next.min(BACKOFF_CEILING);
        self.next = self
            .next
            .checked_mul(2)
            .unwrap_or(BACKOFF_CEILING)
            .min(BACKOFF_CEILING);
        Some(current)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use std::time::Duration;

    use super::{Backoff, BACKOFF_CEILING};

    #[test]
    fn doubles_up_to_the_ceiling() {
        let delays: Vec<_> = Backoff::new(Duration::from_secs(5)).take(5).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_secs(5),
                Duration::from_secs(10),
                Duration::from_secs(20),
                BACKOFF_CEILING,
                BACKOFF_CEILING,
            ]
        );
    }

    #[test]
    fn zero_base_stays_zero() {
        let delays: Vec<_> = Backoff::new(Duration::ZERO).take(3).collect();
        assert_eq!(delays, vec![Duration::ZERO; 3]);
    }
}

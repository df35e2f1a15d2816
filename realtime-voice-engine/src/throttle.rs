//! Log throttling for repeated control-path failures
// Copyright 2025 Francisco F. Pinochet
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.


use std::sync::atomic::{AtomicU64, Ordering};

/// Decides whether a repeating event should be logged.
///
/// Under pathological packet loss a decode failure can repeat per frame;
/// logging every occurrence would swamp the output. The first `first_n`
/// occurrences pass, after that only every `every_nth`.
pub struct LogThrottle {
    count: AtomicU64,
    first_n: u64,
    every_nth: u64,
}

impl LogThrottle {
    pub const fn new(first_n: u64, every_nth: u64) -> Self {
        LogThrottle {
            count: AtomicU64::new(0),
            first_n,
            every_nth,
        }
    }

    /// Register one occurrence; returns true if this one should be logged.
    pub fn should_log(&self) -> bool {
        let n = self.count.fetch_add(1, Ordering::Relaxed);
        n < self.first_n || (n - self.first_n) % self.every_nth == 0
    }

    /// Total occurrences registered so far.
    pub fn occurrences(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

impl Default for LogThrottle {
    fn default() -> Self {
        // First 5, then every 50th
        Self::new(5, 50)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_n_always_logged() {
        let throttle = LogThrottle::new(3, 50);
        assert!(throttle.should_log());
        assert!(throttle.should_log());
        assert!(throttle.should_log());
        assert!(!throttle.should_log());
    }

    #[test]
    fn test_every_nth_after_first_n() {
        let throttle = LogThrottle::new(2, 10);
        let logged: Vec<bool> = (0..32).map(|_| throttle.should_log()).collect();
        // Occurrences 0 and 1 pass, then 2, 12, 22 (every 10th past the burst)
        let expected: Vec<usize> = vec![0, 1, 2, 12, 22];
        let actual: Vec<usize> = logged
            .iter()
            .enumerate()
            .filter(|(_, &l)| l)
            .map(|(i, _)| i)
            .collect();
        assert_eq!(actual, expected);
        assert_eq!(throttle.occurrences(), 32);
    }
}

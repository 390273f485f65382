//! Turn-duration sample buffer.
//!
//! Bounded two ways: a maximum entry count and a retention window, both from
//! config. Samples past either limit are dropped at record/report time, so
//! the buffer can never grow without bound.

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use hydrochat_core::config::TimingConfig;

/// Compute time beyond which a turn counts as slow (network excluded).
const SLOW_TURN_MS: u64 = 2000;

struct TurnSample {
    at: DateTime<Utc>,
    elapsed_ms: u64,
    compute_ms: u64,
}

pub struct TurnTimings {
    samples: Mutex<VecDeque<TurnSample>>,
    max_samples: usize,
    retention: Duration,
}

#[derive(Debug, Clone, Serialize)]
pub struct TimingStats {
    pub turns_recorded: usize,
    pub avg_turn_ms: u64,
    pub slow_turns: usize,
}

impl TurnTimings {
    pub fn new(config: &TimingConfig) -> Self {
        Self {
            samples: Mutex::new(VecDeque::new()),
            max_samples: config.max_samples.max(1),
            retention: Duration::seconds(config.retention_seconds as i64),
        }
    }

    pub fn record(&self, elapsed_ms: u64, compute_ms: u64) {
        let mut samples = self.samples.lock().unwrap();
        let now = Utc::now();
        samples.push_back(TurnSample {
            at: now,
            elapsed_ms,
            compute_ms,
        });
        Self::prune(&mut samples, now - self.retention, self.max_samples);
    }

    pub fn stats(&self) -> TimingStats {
        let mut samples = self.samples.lock().unwrap();
        Self::prune(&mut samples, Utc::now() - self.retention, self.max_samples);

        let turns_recorded = samples.len();
        let avg_turn_ms = if turns_recorded == 0 {
            0
        } else {
            samples.iter().map(|s| s.elapsed_ms).sum::<u64>() / turns_recorded as u64
        };
        let slow_turns = samples.iter().filter(|s| s.compute_ms > SLOW_TURN_MS).count();

        TimingStats {
            turns_recorded,
            avg_turn_ms,
            slow_turns,
        }
    }

    fn prune(samples: &mut VecDeque<TurnSample>, cutoff: DateTime<Utc>, max: usize) {
        while samples.front().is_some_and(|s| s.at < cutoff) {
            samples.pop_front();
        }
        while samples.len() > max {
            samples.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timings(max_samples: usize, retention_seconds: u64) -> TurnTimings {
        TurnTimings::new(&TimingConfig {
            max_samples,
            retention_seconds,
        })
    }

    #[test]
    fn records_and_averages() {
        let t = timings(100, 3600);
        t.record(10, 5);
        t.record(30, 25);
        let stats = t.stats();
        assert_eq!(stats.turns_recorded, 2);
        assert_eq!(stats.avg_turn_ms, 20);
        assert_eq!(stats.slow_turns, 0);
    }

    #[test]
    fn counts_slow_turns_by_compute_time() {
        let t = timings(100, 3600);
        t.record(5000, 100); // slow wall clock, fast compute
        t.record(5000, 4000); // genuinely slow
        assert_eq!(t.stats().slow_turns, 1);
    }

    #[test]
    fn entry_cap_drops_oldest() {
        let t = timings(2, 3600);
        t.record(1, 1);
        t.record(2, 2);
        t.record(3, 3);
        let stats = t.stats();
        assert_eq!(stats.turns_recorded, 2);
        assert_eq!(stats.avg_turn_ms, 2); // (2 + 3) / 2
    }

    #[test]
    fn retention_window_expires_samples() {
        let t = timings(100, 0);
        t.record(10, 10);
        assert_eq!(t.stats().turns_recorded, 0);
    }
}

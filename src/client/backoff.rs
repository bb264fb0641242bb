//! Exponential backoff for control-channel reconnects.

use rand::Rng;
use std::time::Duration;

const INITIAL_DELAY: Duration = Duration::from_millis(1000);
const MAX_DELAY: Duration = Duration::from_millis(30_000);
const JITTER_MS: u64 = 500;

/// Reconnect delay schedule: 1s doubling up to 30s, plus up to 500ms of
/// jitter so a relay restart does not get a synchronized reconnect storm.
#[derive(Debug, Clone)]
pub struct Backoff {
    attempt: u32,
    current: Duration,
}

impl Backoff {
    pub fn new() -> Self {
        Self {
            attempt: 0,
            current: INITIAL_DELAY,
        }
    }

    /// Delay to wait before the next attempt, advancing the schedule.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.current.min(MAX_DELAY);
        self.attempt = self.attempt.saturating_add(1);
        self.current = (self.current * 2).min(MAX_DELAY);

        let jitter = rand::thread_rng().gen_range(0..JITTER_MS);
        base + Duration::from_millis(jitter)
    }

    /// Reset after a successful registration.
    pub fn reset(&mut self) {
        self.attempt = 0;
        self.current = INITIAL_DELAY;
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

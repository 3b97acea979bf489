//! Capped exponential backoff for CAS retry loops.

use std::time::Duration;

/// Doubling delay between an initial and a maximum, with a retry cap.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    pub initial: Duration,
    pub max: Duration,
    pub max_retries: u32,
    attempt: u32,
}

impl ExponentialBackoff {
    pub fn new(initial: Duration, max: Duration, max_retries: u32) -> Self {
        ExponentialBackoff {
            initial,
            max,
            max_retries,
            attempt: 0,
        }
    }

    /// The next delay to sleep, or `None` once the retry cap is hit.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.max_retries {
            return None;
        }
        let delay = self
            .initial
            .checked_mul(1u32 << self.attempt.min(20))
            .unwrap_or(self.max)
            .min(self.max);
        self.attempt += 1;
        Some(delay)
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        ExponentialBackoff::new(Duration::from_millis(5), Duration::from_secs(1), 10)
    }
}

//! Exponential reconnection backoff

use shared::ReconnectConfig;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    max_attempts: u32,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: &ReconnectConfig) -> Self {
        Self {
            base: Duration::from_millis(config.base_delay_ms),
            max: Duration::from_millis(config.max_delay_ms),
            max_attempts: config.max_attempts,
            attempt: 0,
        }
    }

    /// Delay before the next attempt, or `None` once attempts are exhausted
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.max_attempts {
            return None;
        }
        let factor = 2u32.saturating_pow(self.attempt);
        self.attempt += 1;
        Some(self.base.saturating_mul(factor).min(self.max))
    }

    /// Attempts made so far
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

//! Exponential backoff for reconnection attempts

use crate::config::RetryConfig;
use std::time::Duration;

/// Stateful backoff: each `next_delay` call advances one attempt
#[derive(Debug, Clone)]
pub struct Backoff {
    config: RetryConfig,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: RetryConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Attempts made so far
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    /// True once `max_retries` delays have been handed out
    pub fn is_exhausted(&self) -> bool {
        self.attempt >= self.config.max_retries
    }

    /// Delay before the next attempt, or `None` when retries are exhausted
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.is_exhausted() {
            return None;
        }
        let delay = self.delay_for(self.attempt);
        self.attempt += 1;
        Some(delay)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let base_ms = self.config.initial_delay.as_millis() as f64
            * self.config.multiplier.powi(attempt.min(62) as i32);
        let max_ms = self.config.max_delay.as_millis() as f64;
        let base_ms = base_ms.min(max_ms);

        // Up to 25% extra so reconnecting clients spread out
        let delay_ms = if self.config.jitter {
            (base_ms + base_ms * 0.25 * rand::random::<f64>()).min(max_ms)
        } else {
            base_ms
        };

        Duration::from_millis(delay_ms as u64)
    }
}

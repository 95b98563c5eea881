use std::time::Duration;

use rand::Rng;

use crate::config::RetryConfig;

/// Exponential backoff with jitter for failed task retries.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn max_retries(&self) -> u32 {
        self.config.max_retries
    }

    /// Delay before the next attempt, given how many attempts have failed.
    /// Jittered by up to 20% to keep retries from synchronizing.
    pub fn next_delay(&self, attempts: u32) -> Duration {
        let exp = attempts.saturating_sub(1).min(16);
        let base = self.config.base_delay_ms as f64 * self.config.multiplier.powi(exp as i32);
        let capped = base.min(self.config.max_delay_ms as f64);
        let jitter = rand::thread_rng().gen_range(0.0..0.2) * capped;
        Duration::from_millis((capped + jitter) as u64)
    }
}

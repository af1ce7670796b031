//! Exponential backoff with jitter.

use std::time::Duration;

use rand::Rng;

/// Exponential backoff configuration.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub base: Duration,
    /// Upper bound on any delay, jitter included.
    pub max: Duration,
    /// Jitter factor (0.0 to 1.0).
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(200),
            max: Duration::from_secs(30),
            jitter: 0.25,
        }
    }
}

impl BackoffPolicy {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            ..Default::default()
        }
    }

    /// Delay before retry number `retry` (0-based).
    pub fn delay(&self, retry: u32) -> Duration {
        let max = self.max.as_nanos() as f64;
        let delay = (self.base.as_nanos() as f64 * 2.0_f64.powi(retry.min(30) as i32)).min(max);

        let jitter = self.jitter.clamp(0.0, 1.0);
        let spread = if jitter > 0.0 {
            delay * jitter * rand::rng().random_range(-1.0..=1.0)
        } else {
            0.0
        };

        Duration::from_nanos((delay + spread).clamp(0.0, max) as u64)
    }
}

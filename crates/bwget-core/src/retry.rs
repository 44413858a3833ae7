//! Exponential backoff policy for failed attempts

use bwget_types::RetryConfig;
use std::time::Duration;

/// Decides whether a retryable failure gets another attempt, and how long
/// to wait before it.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_retries: u32,
    base_backoff: Duration,
}

impl RetryPolicy {
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_backoff: config.base_backoff,
        }
    }

    /// Delay before retry number `attempt_index` (1-based), or `None` once
    /// the attempt budget is exhausted.
    ///
    /// The delay doubles on every retry: base, 2x base, 4x base, ...
    pub fn next_delay(&self, attempt_index: u32) -> Option<Duration> {
        if attempt_index == 0 || attempt_index > self.max_retries {
            return None;
        }
        let factor = 2u32.saturating_pow(attempt_index - 1);
        Some(self.base_backoff.saturating_mul(factor))
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_retries: u32, base_ms: u64) -> RetryPolicy {
        RetryPolicy::new(&RetryConfig {
            max_retries,
            base_backoff: Duration::from_millis(base_ms),
        })
    }

    #[test]
    fn delays_double_per_attempt() {
        let p = policy(4, 1000);
        assert_eq!(p.next_delay(1), Some(Duration::from_millis(1000)));
        assert_eq!(p.next_delay(2), Some(Duration::from_millis(2000)));
        assert_eq!(p.next_delay(3), Some(Duration::from_millis(4000)));
        assert_eq!(p.next_delay(4), Some(Duration::from_millis(8000)));
    }

    #[test]
    fn exhausted_past_max_retries() {
        let p = policy(3, 500);
        assert!(p.next_delay(3).is_some());
        assert_eq!(p.next_delay(4), None);
        assert_eq!(p.next_delay(100), None);
    }

    #[test]
    fn zero_retries_always_exhausted() {
        let p = policy(0, 1000);
        assert_eq!(p.next_delay(1), None);
    }

    #[test]
    fn attempt_zero_is_invalid() {
        let p = policy(3, 1000);
        assert_eq!(p.next_delay(0), None);
    }
}

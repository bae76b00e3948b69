//! Exponential backoff with full jitter.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Bounded retry schedule. Attempt `n` (1-based) waits a uniformly random
/// delay in `[0, min(max_delay, base_delay * 2^(n-1))]` before attempt `n+1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one. Zero is treated as one.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay_ms: 200,
            max_delay_ms: 10_000,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay_ms: base_delay.as_millis() as u64,
            max_delay_ms: max_delay.as_millis() as u64,
        }
    }

    /// A policy that gives up after the first failure.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            base_delay_ms: 0,
            max_delay_ms: 0,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Whether another attempt is allowed after `attempt` failed.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.attempts()
    }

    /// Upper bound of the delay after failed attempt `attempt`.
    pub fn backoff_ceiling(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        let ceiling = self.base_delay_ms.saturating_mul(1u64 << exponent);
        Duration::from_millis(ceiling.min(self.max_delay_ms))
    }

    /// Jittered delay to wait after failed attempt `attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let ceiling = self.backoff_ceiling(attempt).as_millis() as u64;
        if ceiling == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=ceiling))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_ceiling_doubles_and_caps() {
        let policy = RetryPolicy::new(5, Duration::from_millis(100), Duration::from_millis(1000));
        assert_eq!(policy.backoff_ceiling(1), Duration::from_millis(100));
        assert_eq!(policy.backoff_ceiling(2), Duration::from_millis(200));
        assert_eq!(policy.backoff_ceiling(3), Duration::from_millis(400));
        assert_eq!(policy.backoff_ceiling(5), Duration::from_millis(1000));
        assert_eq!(policy.backoff_ceiling(60), Duration::from_millis(1000));
    }

    #[test]
    fn test_jitter_stays_within_ceiling() {
        let policy = RetryPolicy::new(5, Duration::from_millis(50), Duration::from_millis(300));
        for attempt in 1..6 {
            let ceiling = policy.backoff_ceiling(attempt);
            for _ in 0..200 {
                assert!(policy.delay_for(attempt) <= ceiling);
            }
        }
    }

    #[test]
    fn test_should_retry_counts_first_attempt() {
        let policy = RetryPolicy::new(3, Duration::ZERO, Duration::ZERO);
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));

        let once = RetryPolicy::no_retry();
        assert!(!once.should_retry(1));
        assert_eq!(once.delay_for(1), Duration::ZERO);
    }

    #[test]
    fn test_zero_attempts_means_one() {
        let policy = RetryPolicy {
            max_attempts: 0,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.attempts(), 1);
        assert!(!policy.should_retry(1));
    }
}

//! Retry policy: decides backoff delays.

use std::time::Duration;

use crate::config::RetryConfig;

/// Exponential backoff for transient generation failures.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub base_delay: Duration,

    /// Backoff multiplier.
    pub multiplier: f64,

    /// Upper bound for any single delay.
    pub max_delay: Duration,

    /// Attempts allowed before a task is marked failed.
    pub max_attempts: u32,
}

impl RetryPolicy {
    /// 2s base, doubling, capped at 60s, 5 attempts.
    pub fn default_v1() -> Self {
        Self {
            base_delay: Duration::from_secs(2),
            multiplier: 2.0,
            max_delay: Duration::from_secs(60),
            max_attempts: 5,
        }
    }

    pub fn from_config(retry: &RetryConfig, max_attempts: u32) -> Self {
        Self {
            base_delay: Duration::from_millis(retry.base_delay_ms),
            multiplier: retry.multiplier,
            max_delay: Duration::from_millis(retry.max_delay_ms),
            max_attempts,
        }
    }

    /// Delay after the `attempts`-th failure (1-indexed):
    /// `base_delay * multiplier^(attempts - 1)`, capped at `max_delay`.
    ///
    /// With base=2s, multiplier=2.0: 2s, 4s, 8s, 16s, 32s, 60s, 60s...
    pub fn next_delay(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(i32::MAX as u32) as i32;
        let delay_secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        if !delay_secs.is_finite() || delay_secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(delay_secs)
    }

    pub fn is_exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::default_v1()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn default_policy_has_reasonable_values() {
        let policy = RetryPolicy::default_v1();
        assert_eq!(policy.base_delay, Duration::from_secs(2));
        assert_eq!(policy.multiplier, 2.0);
        assert_eq!(policy.max_attempts, 5);
    }

    #[rstest]
    #[case(0, 2)]
    #[case(1, 2)]
    #[case(2, 4)]
    #[case(3, 8)]
    #[case(5, 32)]
    #[case(6, 60)]
    #[case(40, 60)]
    fn exponential_backoff_is_capped(#[case] attempts: u32, #[case] secs: u64) {
        let policy = RetryPolicy::default_v1();
        assert_eq!(policy.next_delay(attempts), Duration::from_secs(secs));
    }

    #[test]
    fn huge_attempt_counts_do_not_overflow() {
        let policy = RetryPolicy::default_v1();
        assert_eq!(policy.next_delay(u32::MAX), policy.max_delay);
    }

    #[test]
    fn exhausted_at_cap() {
        let policy = RetryPolicy::default_v1();
        assert!(!policy.is_exhausted(4));
        assert!(policy.is_exhausted(5));
    }
}

//! Decision model: what to do after a failed generation attempt.

use std::time::Duration;

use crate::ports::GenerationError;
use crate::queue::RetryPolicy;

/// The next action for a task whose attempt just failed.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Re-enqueue after `delay`; the task shows `Retrying { attempt }`.
    Retry { attempt: u32, delay: Duration },

    /// Give up; the page is marked failed and the user may retry manually.
    MarkFailed { reason: String },
}

/// Decides the next action from the attempt count and the error.
///
/// Deciders are pure: they never touch the store or the queue. The executor
/// applies the decision.
pub trait Decider: Send + Sync {
    /// `attempts` already includes the attempt that just failed.
    fn decide(&self, attempts: u32, error: &GenerationError) -> Decision;
}

/// Retries transient failures with exponential backoff until the attempt cap;
/// permanent failures are never retried.
#[derive(Debug, Clone, Default)]
pub struct DefaultDecider {
    retry_policy: RetryPolicy,
}

impl DefaultDecider {
    pub fn new(retry_policy: RetryPolicy) -> Self {
        Self { retry_policy }
    }
}

impl Decider for DefaultDecider {
    fn decide(&self, attempts: u32, error: &GenerationError) -> Decision {
        if !error.is_retryable() {
            return Decision::MarkFailed {
                reason: error.to_string(),
            };
        }
        if self.retry_policy.is_exhausted(attempts) {
            return Decision::MarkFailed {
                reason: format!(
                    "max attempts reached: {}/{} ({error})",
                    attempts, self.retry_policy.max_attempts
                ),
            };
        }
        Decision::Retry {
            attempt: attempts,
            delay: self.retry_policy.next_delay(attempts),
        }
    }
}

//! Retry logic.
//!
//! # Responsibilities
//! - Decide whether a failed attempt may be retried on another backend
//! - Compute the pause before the next attempt
//!
//! # Design Decisions
//! - Only transient failures retry: timeouts, connection errors, pool exhaustion
//! - A backend's own error response is an answer, not a transport problem
//! - Each retry goes to a backend not yet tried for this request

use std::time::Duration;

use crate::config::RetryConfig;
use crate::dispatch::DispatchError;
use crate::resilience::backoff::calculate_backoff;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay_ms: config.base_delay_ms,
            max_delay_ms: config.max_delay_ms,
        }
    }
}

impl RetryPolicy {
    /// Whether attempt number `attempt` (1-based) failing with `error`
    /// should be followed by another.
    pub fn should_retry(&self, attempt: u32, error: &DispatchError) -> bool {
        attempt < self.max_attempts && is_transient(error)
    }

    /// Pause before attempt `attempt + 1`.
    pub fn delay(&self, attempt: u32) -> Duration {
        calculate_backoff(attempt, self.base_delay_ms, self.max_delay_ms)
    }
}

pub fn is_transient(error: &DispatchError) -> bool {
    error.is_retryable()
}

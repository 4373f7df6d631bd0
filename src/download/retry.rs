//! Retry decisions and exponential backoff for failed extraction attempts.
//!
//! The extractor boundary already classified every failure as
//! [`ExtractError::Retryable`] or [`ExtractError::Fatal`]. [`RetryPolicy`]
//! turns that plus the attempt count into a [`RetryDecision`].
//!
//! # Delay Calculation
//!
//! ```text
//! delay = min(base * 2^attempt_count, cap) + jitter     (jitter clamped to cap)
//! delay = max(delay, retry_after_hint)                  (still capped)
//! ```
//!
//! `attempt_count` is the number of attempts made so far, so the first retry
//! waits `2 * base`.

use std::time::Duration;

use rand::Rng;
use tracing::{debug, instrument};

use crate::config::EngineConfig;
use crate::extractor::{ExtractError, FailureCause};

/// Largest exponent applied before the cap takes over.
const MAX_BACKOFF_EXPONENT: u32 = 20;

/// Decision on whether to retry a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Schedule another attempt after `delay`.
    Retry {
        delay: Duration,
        /// Number of the attempt that will run next (1-indexed).
        next_attempt: u32,
    },

    DoNotRetry {
        /// Human-readable reason why retry is not attempted.
        reason: String,
    },
}

/// Retry configuration.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first.
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    /// Upper bound of the random jitter added to each delay.
    max_jitter: Duration,
}

impl RetryPolicy {
    #[must_use]
    pub fn new(
        max_attempts: u32,
        base_delay: Duration,
        max_delay: Duration,
        max_jitter: Duration,
    ) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: max_delay.max(base_delay),
            max_jitter,
        }
    }

    #[must_use]
    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(
            config.max_attempts,
            Duration::from_secs(config.backoff_base_secs),
            Duration::from_secs(config.backoff_max_secs),
            Duration::from_millis(config.backoff_jitter_ms),
        )
    }

    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Decides what happens after attempt number `attempts_made` failed with `error`.
    ///
    /// Unclassified errors get a single retry and are then treated as fatal.
    #[instrument(skip(self, error), fields(cause = error.cause().as_str(), max_attempts = self.max_attempts))]
    pub fn should_retry(&self, error: &ExtractError, attempts_made: u32) -> RetryDecision {
        let reason = match error {
            ExtractError::Fatal(_) => {
                return RetryDecision::DoNotRetry {
                    reason: "permanent failure - retry would not help".to_string(),
                };
            }
            ExtractError::Retryable(reason) => reason,
        };

        if attempts_made >= self.max_attempts {
            debug!(attempts_made, "max attempts reached");
            return RetryDecision::DoNotRetry {
                reason: format!("max attempts ({}) exhausted", self.max_attempts),
            };
        }

        if reason.cause == FailureCause::Unclassified && attempts_made >= 2 {
            return RetryDecision::DoNotRetry {
                reason: "unrecognized error persisted after a retry".to_string(),
            };
        }

        let mut delay = self.calculate_delay(attempts_made);
        if let Some(hint) = reason.retry_after {
            delay = delay.max(hint.min(self.max_delay));
        }

        debug!(
            attempts_made,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "will retry"
        );
        RetryDecision::Retry {
            delay,
            next_attempt: attempts_made + 1,
        }
    }

    /// `min(base * 2^attempt, cap)` plus jitter, never above the cap.
    #[must_use]
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        self.backoff(attempt)
            .saturating_add(self.jitter())
            .min(self.max_delay)
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1_u32 << attempt.min(MAX_BACKOFF_EXPONENT);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    fn jitter(&self) -> Duration {
        if self.max_jitter.is_zero() {
            return Duration::ZERO;
        }
        let max_ms = u64::try_from(self.max_jitter.as_millis()).unwrap_or(u64::MAX);
        Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
    }
}

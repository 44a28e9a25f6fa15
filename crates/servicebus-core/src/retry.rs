//! # Retry Policy Module
//!
//! Pluggable retry decisions for send, declare and discharge operations.
//!
//! The core consults a [`RetryPolicy`] only for transient failures and only
//! while the operation's timeout budget lasts. The policy decides whether to
//! try again and how long to wait; it never performs the retry itself.

use crate::error::MessagingError;
use rand::Rng;
use std::fmt;
use std::time::Duration;

/// Extra wait added when the broker reports it is too busy.
pub const SERVER_BUSY_BASE_DELAY: Duration = Duration::from_secs(10);

/// What the caller should do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try again once `after` has elapsed.
    Retry { after: Duration },
    /// Resolve the operation with the failure.
    GiveUp,
}

/// Backoff/retry decision component.
pub trait RetryPolicy: Send + Sync + fmt::Debug {
    /// Decide whether a failed attempt should be retried.
    ///
    /// # Arguments
    ///
    /// * `attempt` - Number of retries already made (0 before the first retry)
    /// * `error` - The failure of the latest attempt
    /// * `elapsed` - Time since the operation started
    fn should_retry(&self, attempt: u32, error: &MessagingError, elapsed: Duration)
        -> RetryDecision;
}

/// Retry policy configuration for exponential backoff
///
/// # Examples
///
/// ```rust
/// use servicebus_core::retry::{ExponentialRetryPolicy, RetryDecision, RetryPolicy};
/// use servicebus_core::{ErrorContext, MessagingError};
/// use std::time::Duration;
///
/// let policy = ExponentialRetryPolicy::new(3, Duration::from_millis(500), Duration::from_secs(5), 2.0)
///     .without_jitter();
///
/// let error = MessagingError::Communication {
///     message: "link detached".to_string(),
///     context: ErrorContext::new("contoso"),
/// };
/// assert_eq!(
///     policy.should_retry(1, &error, Duration::ZERO),
///     RetryDecision::Retry { after: Duration::from_secs(1) }
/// );
/// assert_eq!(policy.should_retry(3, &error, Duration::ZERO), RetryDecision::GiveUp);
/// ```
#[derive(Debug, Clone)]
pub struct ExponentialRetryPolicy {
    /// Maximum number of retry attempts
    pub max_retry_count: u32,

    /// Delay before the first retry
    pub min_backoff: Duration,

    /// Maximum delay between retries
    pub max_backoff: Duration,

    /// Exponential backoff multiplier (typically 2.0)
    pub backoff_multiplier: f64,

    /// Whether to add jitter to delays
    pub use_jitter: bool,

    /// Jitter range as a fraction of the delay (0.25 = ±25%)
    pub jitter_percent: f64,

    /// Stop retrying once this much time has passed since the first attempt
    pub max_elapsed: Option<Duration>,
}

impl Default for ExponentialRetryPolicy {
    fn default() -> Self {
        Self {
            max_retry_count: 5,
            min_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            use_jitter: true,
            jitter_percent: 0.25,
            max_elapsed: None,
        }
    }
}

impl ExponentialRetryPolicy {
    pub fn new(
        max_retry_count: u32,
        min_backoff: Duration,
        max_backoff: Duration,
        backoff_multiplier: f64,
    ) -> Self {
        Self {
            max_retry_count,
            min_backoff,
            max_backoff,
            backoff_multiplier,
            ..Self::default()
        }
    }

    pub fn without_jitter(mut self) -> Self {
        self.use_jitter = false;
        self
    }

    /// Set custom jitter percentage (0.0 to 1.0)
    pub fn with_jitter_percent(mut self, percent: f64) -> Self {
        self.jitter_percent = percent.clamp(0.0, 1.0);
        self
    }

    pub fn with_max_elapsed(mut self, max_elapsed: Duration) -> Self {
        self.max_elapsed = Some(max_elapsed);
        self
    }

    /// Calculate delay for a specific retry attempt
    ///
    /// delay = min_backoff * multiplier^attempt, capped at `max_backoff`,
    /// then jittered if enabled.
    ///
    /// # Arguments
    ///
    /// * `attempt` - Retry attempt number (0-based)
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let base_delay_secs = self.min_backoff.as_secs_f64() * self.backoff_multiplier.powi(exponent);

        // A negative or non-finite multiplier must not yield a negative delay.
        let max_delay_secs = self.max_backoff.as_secs_f64();
        let capped_delay_secs = if base_delay_secs.is_finite() {
            base_delay_secs.clamp(0.0, max_delay_secs)
        } else {
            max_delay_secs
        };

        let final_delay_secs = if self.use_jitter {
            Self::add_jitter(capped_delay_secs, self.jitter_percent)
        } else {
            capped_delay_secs
        };

        Duration::try_from_secs_f64(final_delay_secs).unwrap_or(self.max_backoff)
    }

    /// Total number of attempts including the first one
    pub fn total_attempts(&self) -> u32 {
        self.max_retry_count.saturating_add(1)
    }

    /// Applies random variation in range [delay * (1-jitter), delay * (1+jitter)]
    fn add_jitter(delay_secs: f64, jitter_percent: f64) -> f64 {
        let jitter_range = delay_secs * jitter_percent;
        if jitter_range <= 0.0 {
            return delay_secs;
        }

        let jitter = rand::thread_rng().gen_range(-jitter_range..=jitter_range);
        (delay_secs + jitter).max(0.0)
    }
}

impl RetryPolicy for ExponentialRetryPolicy {
    fn should_retry(
        &self,
        attempt: u32,
        error: &MessagingError,
        elapsed: Duration,
    ) -> RetryDecision {
        if !error.is_transient() || attempt >= self.max_retry_count {
            return RetryDecision::GiveUp;
        }

        if let Some(max_elapsed) = self.max_elapsed {
            if elapsed >= max_elapsed {
                return RetryDecision::GiveUp;
            }
        }

        let mut after = self.calculate_delay(attempt);
        if matches!(error, MessagingError::ServerBusy { .. }) {
            after += SERVER_BUSY_BASE_DELAY;
        }

        RetryDecision::Retry { after }
    }
}

/// Policy that never retries.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRetryPolicy;

impl RetryPolicy for NoRetryPolicy {
    fn should_retry(&self, _attempt: u32, _error: &MessagingError, _elapsed: Duration) -> RetryDecision {
        RetryDecision::GiveUp
    }
}

/// State tracker for retry operations
#[derive(Debug, Clone)]
pub struct RetryState {
    /// Retries made so far (0 while on the first attempt)
    pub attempt: u32,

    /// Attempts made so far, including the first
    pub total_attempts: u32,
}

impl Default for RetryState {
    fn default() -> Self {
        Self::new()
    }
}

impl RetryState {
    pub fn new() -> Self {
        Self {
            attempt: 0,
            total_attempts: 1,
        }
    }

    /// Increment to next retry attempt
    pub fn next_attempt(&mut self) {
        self.attempt += 1;
        self.total_attempts += 1;
    }
}

#[cfg(test)]
#[path = "retry_tests.rs"]
mod tests;

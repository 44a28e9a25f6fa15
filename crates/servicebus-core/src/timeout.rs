//! Deadline bookkeeping for in-flight operations.

use std::time::Duration;
use tokio::time::Instant;

/// Remaining-time budget for a single operation.
///
/// The deadline is fixed at construction; every query only reads it, so a
/// tracker can be shared freely between the caller, the network task and the
/// scheduler without synchronization.
///
/// # Examples
///
/// ```rust
/// use servicebus_core::TimeoutTracker;
/// use std::time::Duration;
///
/// let tracker = TimeoutTracker::new(Duration::from_secs(30));
/// assert!(!tracker.is_expired());
/// assert!(tracker.remaining() <= Duration::from_secs(30));
/// ```
#[derive(Debug, Clone, Copy)]
pub struct TimeoutTracker {
    started_at: Instant,
    deadline: Instant,
    original_timeout: Duration,
}

impl TimeoutTracker {
    /// Start tracking a budget of `timeout` from now.
    pub fn new(timeout: Duration) -> Self {
        let started_at = Instant::now();
        let deadline = started_at
            .checked_add(timeout)
            .unwrap_or_else(|| far_future(started_at));
        Self {
            started_at,
            deadline,
            original_timeout: timeout,
        }
    }

    /// Time left before the deadline; zero once it has passed.
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Time spent since the tracker was created.
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn is_expired(&self) -> bool {
        self.remaining().is_zero()
    }

    /// The budget this tracker was created with.
    pub fn original_timeout(&self) -> Duration {
        self.original_timeout
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }
}

// Roughly 30 years; large enough to never fire and small enough to add safely.
fn far_future(from: Instant) -> Instant {
    from + Duration::from_secs(86_400 * 365 * 30)
}

#[cfg(test)]
#[path = "timeout_tests.rs"]
mod tests;

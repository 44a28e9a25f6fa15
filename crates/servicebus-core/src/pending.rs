//! Single-resolution records for in-flight protocol operations.
//!
//! A [`PendingOperation`] pairs the caller-visible [`PendingResult`] with a
//! [`TimeoutTracker`] and an optional scheduled timeout callback. The network
//! task delivering an outcome and the scheduler firing a timeout may both try
//! to resolve it; a compare-and-swap on the resolution flag picks exactly one
//! winner and the loser observes a no-op.

use crate::error::{ErrorContext, MessagingError};
use crate::scheduler::{ScheduleMode, ScheduledTask, SharedScheduler};
use crate::timeout::TimeoutTracker;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::debug;

const STATE_PENDING: u8 = 0;
const STATE_RESOLVED: u8 = 1;

type Outcome<T> = Result<T, MessagingError>;

struct Shared<T> {
    state: AtomicU8,
    slot: Mutex<Option<oneshot::Sender<Outcome<T>>>>,
    tracker: TimeoutTracker,
    operation: String,
    context: ErrorContext,
    timeout_task: Mutex<Option<ScheduledTask>>,
    last_error: Mutex<Option<MessagingError>>,
}

impl<T> Shared<T> {
    fn cancel_timeout_task(&self) {
        if let Some(task) = lock(&self.timeout_task).take() {
            task.cancel();
        }
    }
}

impl<T> Drop for Shared<T> {
    fn drop(&mut self) {
        let task = self
            .timeout_task
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.cancel();
        }
    }
}

/// Client-side record of one in-flight request.
///
/// Cloning shares the same record; the issuing component and its outcome task
/// hold clones, while the scheduler only ever holds a
/// [`WeakPendingOperation`].
pub struct PendingOperation<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for PendingOperation<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Send + 'static> PendingOperation<T> {
    /// Create an unresolved operation with a fresh timeout budget.
    pub fn new(timeout: Duration) -> (Self, PendingResult<T>) {
        Self::with_context("operation", ErrorContext::default(), timeout)
    }

    /// Create an unresolved operation labelled for error reporting.
    ///
    /// # Arguments
    ///
    /// - `operation`: Name used in timeout and cancellation errors
    /// - `context`: Namespace/entity annotation for timeout errors
    /// - `timeout`: Budget before the operation fails with a timeout
    pub fn with_context(
        operation: impl Into<String>,
        context: ErrorContext,
        timeout: Duration,
    ) -> (Self, PendingResult<T>) {
        let operation = operation.into();
        let (sender, receiver) = oneshot::channel();
        let shared = Arc::new(Shared {
            state: AtomicU8::new(STATE_PENDING),
            slot: Mutex::new(Some(sender)),
            tracker: TimeoutTracker::new(timeout),
            operation: operation.clone(),
            context,
            timeout_task: Mutex::new(None),
            last_error: Mutex::new(None),
        });

        (
            Self { shared },
            PendingResult {
                receiver,
                operation,
            },
        )
    }

    pub fn tracker(&self) -> &TimeoutTracker {
        &self.shared.tracker
    }

    pub fn operation(&self) -> &str {
        &self.shared.operation
    }

    pub fn is_resolved(&self) -> bool {
        self.shared.state.load(Ordering::Acquire) == STATE_RESOLVED
    }

    /// Store the scheduled timeout callback so resolution can cancel it.
    ///
    /// Attaching a second task is a programming error: the new task is
    /// cancelled and `InvalidState` is returned. Attaching to an operation
    /// that already resolved cancels the task immediately.
    pub fn attach_timeout_task(&self, task: ScheduledTask) -> Result<(), MessagingError> {
        {
            let mut slot = lock(&self.shared.timeout_task);
            if slot.is_some() {
                task.cancel();
                return Err(MessagingError::InvalidState {
                    operation: self.shared.operation.clone(),
                    message: "a timeout task is already attached".to_string(),
                });
            }
            *slot = Some(task);
        }

        // Resolution may have raced ahead of the attachment.
        if self.is_resolved() {
            self.shared.cancel_timeout_task();
        }
        Ok(())
    }

    /// Schedule the timeout callback for the remaining budget and attach it.
    ///
    /// The callback holds only a weak reference; if every owner is gone by
    /// the time it fires, it does nothing.
    pub fn schedule_timeout(&self, scheduler: &SharedScheduler) -> Result<(), MessagingError> {
        let weak = self.downgrade();
        let task = scheduler.schedule(
            self.shared.tracker.remaining(),
            ScheduleMode::OneTimeRun,
            move || {
                if let Some(operation) = weak.upgrade() {
                    operation.expire();
                }
            },
        )?;
        self.attach_timeout_task(task)
    }

    /// Resolve the operation. The first call wins.
    ///
    /// # Returns
    ///
    /// - `true`: This call resolved the operation
    /// - `false`: The operation had already been resolved; nothing changed
    pub fn resolve(&self, result: Outcome<T>) -> bool {
        if self
            .shared
            .state
            .compare_exchange(
                STATE_PENDING,
                STATE_RESOLVED,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return false;
        }

        self.shared.cancel_timeout_task();

        if let Some(sender) = lock(&self.shared.slot).take() {
            // The caller may have stopped waiting; nothing to deliver to then.
            let _ = sender.send(result);
        }
        true
    }

    pub fn succeed(&self, value: T) -> bool {
        self.resolve(Ok(value))
    }

    pub fn fail(&self, error: MessagingError) -> bool {
        self.resolve(Err(error))
    }

    /// Remember a retryable failure without resolving.
    ///
    /// If the budget runs out before a later attempt succeeds, the timeout
    /// resolves with this error instead of a bare timeout.
    pub fn record_retryable_error(&self, error: MessagingError) {
        if self.is_resolved() {
            return;
        }
        debug!(
            operation = %self.shared.operation,
            error = %error,
            "Recorded retryable error"
        );
        *lock(&self.shared.last_error) = Some(error);
    }

    pub fn has_last_error(&self) -> bool {
        lock(&self.shared.last_error).is_some()
    }

    /// Fail the operation because its budget ran out.
    pub fn expire(&self) -> bool {
        if self.is_resolved() {
            return false;
        }

        let error = lock(&self.shared.last_error)
            .take()
            .unwrap_or_else(|| MessagingError::Timeout {
                operation: self.shared.operation.clone(),
                duration: self.shared.tracker.original_timeout(),
                context: self.shared.context.clone(),
            });

        let resolved = self.fail(error);
        if resolved {
            debug!(operation = %self.shared.operation, "Operation timed out");
        }
        resolved
    }

    pub fn downgrade(&self) -> WeakPendingOperation<T> {
        WeakPendingOperation {
            shared: Arc::downgrade(&self.shared),
        }
    }
}

impl<T> std::fmt::Debug for PendingOperation<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingOperation")
            .field("operation", &self.shared.operation)
            .field(
                "resolved",
                &(self.shared.state.load(Ordering::Acquire) == STATE_RESOLVED),
            )
            .field("tracker", &self.shared.tracker)
            .finish()
    }
}

/// Non-owning handle held by scheduled callbacks.
pub struct WeakPendingOperation<T> {
    shared: Weak<Shared<T>>,
}

impl<T> WeakPendingOperation<T> {
    pub fn upgrade(&self) -> Option<PendingOperation<T>> {
        self.shared.upgrade().map(|shared| PendingOperation { shared })
    }
}

impl<T> Clone for WeakPendingOperation<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Weak::clone(&self.shared),
        }
    }
}

/// Caller side of a [`PendingOperation`]; resolves exactly once.
///
/// If every owner of the operation is dropped without resolving it, the
/// result is `OperationCancelled`.
#[derive(Debug)]
pub struct PendingResult<T> {
    receiver: oneshot::Receiver<Outcome<T>>,
    operation: String,
}

impl<T> Future for PendingResult<T> {
    type Output = Outcome<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            Poll::Ready(Err(_)) => Poll::Ready(Err(MessagingError::OperationCancelled {
                operation: self.operation.clone(),
            })),
            Poll::Pending => Poll::Pending,
        }
    }
}

fn lock<V>(mutex: &Mutex<V>) -> MutexGuard<'_, V> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
#[path = "pending_tests.rs"]
mod tests;

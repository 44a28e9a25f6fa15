//! Request/response dispatch over a single AMQP link.
//!
//! Every delivery written through a [`LinkDispatcher`] becomes a
//! [`PendingOperation`]: its timeout is scheduled on the shared scheduler,
//! the delivery is queued on the link in call order, and a spawned outcome
//! task resolves it from the broker's disposition. Transient failures are
//! retried while the retry policy agrees and the budget lasts.

use crate::error::{ErrorContext, MessagingError};
use crate::link::{AmqpLink, Delivery, DeliveryOutcome};
use crate::pending::{PendingOperation, PendingResult};
use crate::retry::{RetryDecision, RetryPolicy, RetryState};
use crate::scheduler::SharedScheduler;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{debug, warn};

type Canceller = Box<dyn Fn(MessagingError) -> bool + Send + Sync>;

struct DispatcherInner {
    link: Arc<dyn AmqpLink>,
    scheduler: Arc<SharedScheduler>,
    retry_policy: Arc<dyn RetryPolicy>,
    context: ErrorContext,
    next_id: AtomicU64,
    in_flight: Mutex<HashMap<u64, Canceller>>,
}

impl DispatcherInner {
    fn in_flight(&self) -> MutexGuard<'_, HashMap<u64, Canceller>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Turns one link into a concurrent request/response channel.
#[derive(Clone)]
pub struct LinkDispatcher {
    inner: Arc<DispatcherInner>,
}

impl LinkDispatcher {
    pub fn new(
        link: Arc<dyn AmqpLink>,
        scheduler: Arc<SharedScheduler>,
        retry_policy: Arc<dyn RetryPolicy>,
        context: ErrorContext,
    ) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                link,
                scheduler,
                retry_policy,
                context,
                next_id: AtomicU64::new(0),
                in_flight: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn context(&self) -> &ErrorContext {
        &self.inner.context
    }

    /// Number of operations issued and not yet finished.
    pub fn in_flight_count(&self) -> usize {
        self.inner.in_flight().len()
    }

    /// Issue `delivery` and return the caller's handle to its result.
    ///
    /// The delivery is queued on the link before this returns, so calls on
    /// one dispatcher reach the broker in call order.
    ///
    /// # Arguments
    ///
    /// - `delivery`: What to write to the link
    /// - `timeout`: Budget for the whole operation, retries included
    /// - `interpret`: Maps the broker outcome to the operation result
    ///
    /// # Errors
    ///
    /// - `SchedulerUnavailable`: The shared scheduler is not running
    /// - `InvalidState`: Called outside a tokio runtime
    pub fn dispatch<T, F>(
        &self,
        delivery: Delivery,
        timeout: Duration,
        interpret: F,
    ) -> Result<PendingResult<T>, MessagingError>
    where
        T: Send + 'static,
        F: Fn(DeliveryOutcome) -> Result<T, MessagingError> + Send + 'static,
    {
        let runtime = Handle::try_current().map_err(|_| MessagingError::InvalidState {
            operation: delivery.name().to_string(),
            message: "dispatch requires a tokio runtime".to_string(),
        })?;

        let (operation, result) =
            PendingOperation::with_context(delivery.name(), self.inner.context.clone(), timeout);
        operation.schedule_timeout(&self.inner.scheduler)?;

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let canceller = {
            let operation = operation.clone();
            Box::new(move |error: MessagingError| operation.fail(error)) as Canceller
        };
        self.inner.in_flight().insert(id, canceller);

        debug!(operation = delivery.name(), id, "Dispatching delivery");
        let first_attempt = self.inner.link.send(delivery.clone());

        let inner = Arc::clone(&self.inner);
        runtime.spawn(async move {
            drive_to_outcome(&inner, &operation, delivery, first_attempt, interpret).await;
            inner.in_flight().remove(&id);
        });

        Ok(result)
    }

    /// Issue `delivery` and wait for the interpreted outcome.
    pub async fn send<T, F>(
        &self,
        delivery: Delivery,
        timeout: Duration,
        interpret: F,
    ) -> Result<T, MessagingError>
    where
        T: Send + 'static,
        F: Fn(DeliveryOutcome) -> Result<T, MessagingError> + Send + 'static,
    {
        self.dispatch(delivery, timeout, interpret)?.await
    }

    /// Fail every in-flight operation with `error`, then close the link.
    pub async fn close(&self, error: MessagingError) -> Result<(), MessagingError> {
        let cancellers: Vec<Canceller> = self.inner.in_flight().drain().map(|(_, c)| c).collect();
        let failed = cancellers.iter().filter(|cancel| cancel(error.clone())).count();
        if failed > 0 {
            debug!(failed, "Failed in-flight operations on link close");
        }
        self.inner.link.close().await
    }
}

async fn drive_to_outcome<T, F>(
    inner: &DispatcherInner,
    operation: &PendingOperation<T>,
    delivery: Delivery,
    mut in_flight: BoxFuture<'static, Result<DeliveryOutcome, MessagingError>>,
    interpret: F,
) where
    T: Send + 'static,
    F: Fn(DeliveryOutcome) -> Result<T, MessagingError>,
{
    let deadline = operation.tracker().deadline();
    let mut retry = RetryState::new();

    loop {
        // Races the scheduler's timeout callback; only one expiry resolves.
        let attempt = match tokio::time::timeout_at(deadline, in_flight).await {
            Ok(attempt) => attempt,
            Err(_) => {
                operation.expire();
                return;
            }
        };

        let error = match attempt.and_then(&interpret) {
            Ok(value) => {
                operation.succeed(value);
                return;
            }
            Err(error) => error,
        };

        if operation.is_resolved() {
            return;
        }

        let remaining = operation.tracker().remaining();
        let decision = if error.is_transient() {
            inner
                .retry_policy
                .should_retry(retry.attempt, &error, operation.tracker().elapsed())
        } else {
            RetryDecision::GiveUp
        };

        match decision {
            RetryDecision::Retry { after } if after < remaining => {
                warn!(
                    operation = operation.operation(),
                    attempt = retry.total_attempts,
                    delay_ms = u64::try_from(after.as_millis()).unwrap_or(u64::MAX),
                    error = %error,
                    "Delivery failed; retrying"
                );
                operation.record_retryable_error(error);
                tokio::time::sleep(after).await;
                if operation.is_resolved() {
                    return;
                }
                if operation.tracker().is_expired() {
                    operation.expire();
                    return;
                }
                retry.next_attempt();
                in_flight = inner.link.send(delivery.clone());
            }
            _ => {
                debug!(
                    operation = operation.operation(),
                    attempts = retry.total_attempts,
                    error = %error,
                    "Delivery failed"
                );
                operation.fail(error);
                return;
            }
        }
    }
}

#[cfg(test)]
#[path = "dispatch_tests.rs"]
mod tests;

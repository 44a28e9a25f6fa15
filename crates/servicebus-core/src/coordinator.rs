//! Transaction coordinator client.
//!
//! Each messaging connection owns one [`TransactionController`]. It attaches a
//! dedicated control link to the broker's transaction coordinator, declares
//! transactions, and discharges them (commit or rollback).
//!
//! # Lifecycle
//!
//! ```text
//! Uninitialized ──initialize()──▶ Initializing ──▶ Ready
//!                                      │
//!                                      └─────────▶ Failed (connection closed)
//! ```
//!
//! Initialization runs once. Concurrent callers share the same in-flight
//! attempt, and later callers get the memoized result. A failed attempt is
//! fatal: it is never retried, and it closes the owning connection.

use crate::dispatch::LinkDispatcher;
use crate::error::{ErrorContext, MessagingError};
use crate::link::{AmqpConnection, Delivery, DeliveryOutcome, LinkSettings, TransactionId};
use crate::retry::RetryPolicy;
use crate::scheduler::SharedScheduler;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, error, info, warn};

type InitFuture = Shared<BoxFuture<'static, Result<LinkDispatcher, MessagingError>>>;

enum ControllerState {
    Uninitialized,
    Initializing(InitFuture),
    Ready(LinkDispatcher),
    Failed(MessagingError),
    Closed,
}

/// Observable phase of a [`TransactionController`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerStatus {
    Uninitialized,
    Initializing,
    Ready,
    Failed,
    Closed,
}

/// Settings shared by the controller's operations.
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub operation_timeout: Duration,
    pub retry_policy: Arc<dyn RetryPolicy>,
    pub context: ErrorContext,
}

/// Client for the broker's transaction coordinator.
pub struct TransactionController {
    connection: Arc<dyn AmqpConnection>,
    scheduler: Arc<SharedScheduler>,
    settings: ControllerSettings,
    state: Mutex<ControllerState>,
}

impl TransactionController {
    pub fn new(
        connection: Arc<dyn AmqpConnection>,
        scheduler: Arc<SharedScheduler>,
        settings: ControllerSettings,
    ) -> Self {
        Self {
            connection,
            scheduler,
            settings,
            state: Mutex::new(ControllerState::Uninitialized),
        }
    }

    pub fn status(&self) -> ControllerStatus {
        match &*self.lock_state() {
            ControllerState::Uninitialized => ControllerStatus::Uninitialized,
            ControllerState::Initializing(_) => ControllerStatus::Initializing,
            ControllerState::Ready(_) => ControllerStatus::Ready,
            ControllerState::Failed(_) => ControllerStatus::Failed,
            ControllerState::Closed => ControllerStatus::Closed,
        }
    }

    /// Attach the coordinator link, once.
    ///
    /// # Returns
    ///
    /// - `Ok(())`: The coordinator link is attached (now or earlier)
    /// - `Err(MessagingError::InitializationFailed)`: Attaching failed; the
    ///   same error is returned to every current and future caller and the
    ///   owning connection has been closed
    pub async fn initialize(&self) -> Result<(), MessagingError> {
        let init = {
            let mut state = self.lock_state();
            let existing = match &*state {
                ControllerState::Ready(_) => return Ok(()),
                ControllerState::Failed(error) => return Err(error.clone()),
                ControllerState::Closed => return Err(closed_error("initialize")),
                ControllerState::Initializing(init) => Some(init.clone()),
                ControllerState::Uninitialized => None,
            };

            match existing {
                Some(init) => init,
                None => {
                    info!(namespace = %self.settings.context.namespace, "Opening transaction coordinator link");
                    let init = open_coordinator_link(
                        Arc::clone(&self.connection),
                        Arc::clone(&self.scheduler),
                        self.settings.clone(),
                    )
                    .boxed()
                    .shared();
                    *state = ControllerState::Initializing(init.clone());
                    init
                }
            }
        };

        let result = init.await;

        // Only the caller that moves the state out of Initializing acts on it.
        let newly_failed = {
            let mut state = self.lock_state();
            // close() ran while attaching; it detaches the new link.
            if matches!(&*state, ControllerState::Closed) {
                return Err(closed_error("initialize"));
            }
            if matches!(&*state, ControllerState::Initializing(_)) {
                match &result {
                    Ok(dispatcher) => {
                        *state = ControllerState::Ready(dispatcher.clone());
                        info!("Transaction coordinator ready");
                        None
                    }
                    Err(error) => {
                        *state = ControllerState::Failed(error.clone());
                        Some(error.clone())
                    }
                }
            } else {
                None
            }
        };

        if let Some(cause) = newly_failed {
            error!(error = %cause, "Transaction coordinator initialization failed; closing connection");
            if let Err(close_error) = self.connection.close(Some(cause)).await {
                warn!(error = %close_error, "Failed to close connection after coordinator failure");
            }
        }

        result.map(|_| ())
    }

    /// Start a transaction and return its identifier.
    ///
    /// Requires a successful [`initialize`](Self::initialize). Any outcome
    /// other than `Declared`, including a rejection, fails with
    /// `ProtocolViolation`.
    pub async fn declare(&self) -> Result<TransactionId, MessagingError> {
        let dispatcher = self.ready_dispatcher("declare")?;

        let transaction_id = dispatcher
            .send(
                Delivery::Declare,
                self.settings.operation_timeout,
                |outcome| match outcome {
                    DeliveryOutcome::Declared(transaction_id) => Ok(transaction_id),
                    other => Err(protocol_violation("declare", "Declared", other)),
                },
            )
            .await
            .map_err(log_violation)?;

        debug!(transaction = %transaction_id, "Declared transaction");
        Ok(transaction_id)
    }

    /// End a transaction: commit when `commit` is true, otherwise roll back.
    ///
    /// The discharge carries `fail = !commit`. Only `Accepted` counts as
    /// success; an unknown or already discharged id is rejected by the broker
    /// and surfaces as `ProtocolViolation`.
    pub async fn discharge(
        &self,
        transaction_id: &TransactionId,
        commit: bool,
    ) -> Result<(), MessagingError> {
        let dispatcher = self.ready_dispatcher("discharge")?;

        dispatcher
            .send(
                Delivery::Discharge {
                    transaction_id: transaction_id.clone(),
                    fail: !commit,
                },
                self.settings.operation_timeout,
                |outcome| match outcome {
                    DeliveryOutcome::Accepted => Ok(()),
                    other => Err(protocol_violation("discharge", "Accepted", other)),
                },
            )
            .await
            .map_err(log_violation)?;

        debug!(transaction = %transaction_id, commit, "Discharged transaction");
        Ok(())
    }

    pub async fn commit(&self, transaction_id: &TransactionId) -> Result<(), MessagingError> {
        self.discharge(transaction_id, true).await
    }

    pub async fn rollback(&self, transaction_id: &TransactionId) -> Result<(), MessagingError> {
        self.discharge(transaction_id, false).await
    }

    /// Detach the coordinator link and fail anything still in flight.
    ///
    /// Closing during initialization waits for the attach to finish and
    /// detaches the link it produced.
    pub async fn close(&self) -> Result<(), MessagingError> {
        let previous = std::mem::replace(&mut *self.lock_state(), ControllerState::Closed);
        match previous {
            ControllerState::Ready(dispatcher) => {
                info!("Closing transaction coordinator link");
                dispatcher.close(closed_error("transaction")).await
            }
            ControllerState::Initializing(init) => match init.await {
                Ok(dispatcher) => {
                    info!("Closing transaction coordinator link attached during close");
                    dispatcher.close(closed_error("transaction")).await
                }
                Err(_) => Ok(()),
            },
            ControllerState::Failed(error) => {
                // Failure is terminal; keep reporting the original cause.
                *self.lock_state() = ControllerState::Failed(error);
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn ready_dispatcher(&self, operation: &str) -> Result<LinkDispatcher, MessagingError> {
        match &*self.lock_state() {
            ControllerState::Ready(dispatcher) => Ok(dispatcher.clone()),
            ControllerState::Failed(error) => Err(error.clone()),
            ControllerState::Closed => Err(closed_error(operation)),
            ControllerState::Uninitialized | ControllerState::Initializing(_) => {
                Err(MessagingError::InvalidState {
                    operation: operation.to_string(),
                    message: "transaction coordinator is not initialized".to_string(),
                })
            }
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, ControllerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn open_coordinator_link(
    connection: Arc<dyn AmqpConnection>,
    scheduler: Arc<SharedScheduler>,
    settings: ControllerSettings,
) -> Result<LinkDispatcher, MessagingError> {
    let context = settings.context.clone();
    let initialization_failed = |message: String| MessagingError::InitializationFailed {
        message,
        context: context.clone(),
    };

    let link = tokio::time::timeout(
        settings.operation_timeout,
        connection.open_link(LinkSettings::coordinator()),
    )
    .await
    .map_err(|_| {
        initialization_failed(format!(
            "coordinator link did not attach within {:?}",
            settings.operation_timeout
        ))
    })?
    .map_err(|e| initialization_failed(e.to_string()))?;

    Ok(LinkDispatcher::new(
        link,
        scheduler,
        settings.retry_policy,
        settings.context,
    ))
}

fn protocol_violation(operation: &str, expected: &str, actual: DeliveryOutcome) -> MessagingError {
    let description = match &actual {
        DeliveryOutcome::Rejected {
            condition,
            description,
        } => Some(match description {
            Some(text) => format!("{}: {}", condition, text),
            None => condition.clone(),
        }),
        _ => None,
    };

    MessagingError::ProtocolViolation {
        operation: operation.to_string(),
        expected: expected.to_string(),
        actual: actual.kind().to_string(),
        description,
    }
}

fn log_violation(error: MessagingError) -> MessagingError {
    if let MessagingError::ProtocolViolation {
        operation,
        actual,
        description,
        ..
    } = &error
    {
        warn!(
            operation = %operation,
            outcome = %actual,
            description = description.as_deref().unwrap_or(""),
            "Unexpected coordinator outcome"
        );
    }
    error
}

fn closed_error(operation: &str) -> MessagingError {
    MessagingError::InvalidState {
        operation: operation.to_string(),
        message: "transaction coordinator is closed".to_string(),
    }
}

#[cfg(test)]
#[path = "coordinator_tests.rs"]
mod tests;

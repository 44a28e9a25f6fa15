//! In-memory broker implementing the link collaborator contract.
//!
//! This module provides a self-contained broker that:
//! - Issues transaction identifiers from a coordinator link
//! - Stages transactional sends until the transaction is discharged
//! - Makes non-transactional sends visible immediately
//! - Injects faults (failed attaches, lost links, slow or missing outcomes)
//!
//! It is intended for:
//! - Unit and scenario testing of the coordination core
//! - Development without a live namespace
//! - Reference behavior for real link adapters

use crate::error::{condition, ErrorContext, MessagingError};
use crate::link::{
    AmqpConnection, AmqpLink, AmqpMessage, Delivery, DeliveryOutcome, LinkSettings, LinkTarget,
    TransactionId,
};
use async_trait::async_trait;
use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::debug;

#[cfg(test)]
#[path = "memory_tests.rs"]
mod tests;

const NOT_ALLOWED: &str = "amqp:not-allowed";

// ============================================================================
// Internal Storage Structures
// ============================================================================

#[derive(Default)]
struct Faults {
    link_open_failures: VecDeque<MessagingError>,
    link_open_delay: Option<Duration>,
    outcome_delay: Option<Duration>,
    hold_outcomes: bool,
    send_failures: VecDeque<MessagingError>,
    rejected_entities: HashMap<String, String>,
}

#[derive(Default)]
struct BrokerStore {
    next_transaction: u64,
    active: HashMap<TransactionId, Vec<(String, AmqpMessage)>>,
    discharged: HashSet<TransactionId>,
    committed: usize,
    rolled_back: usize,
    entities: HashMap<String, Vec<AmqpMessage>>,
    links_opened: usize,
    links_closed: usize,
    deliveries: Vec<Delivery>,
    faults: Faults,
}

struct BrokerState {
    namespace: String,
    store: Mutex<BrokerStore>,
    closed: AtomicBool,
    close_cause: Mutex<Option<MessagingError>>,
}

impl BrokerState {
    fn store(&self) -> MutexGuard<'_, BrokerStore> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn context(&self) -> ErrorContext {
        ErrorContext::new(self.namespace.clone())
    }
}

// ============================================================================
// In-Memory Broker
// ============================================================================

/// Broker double standing in for an AMQP connection.
///
/// Cloning shares the same broker state.
#[derive(Clone)]
pub struct InMemoryBroker {
    state: Arc<BrokerState>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new("in-memory.servicebus.local")
    }
}

impl InMemoryBroker {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            state: Arc::new(BrokerState {
                namespace: namespace.into(),
                store: Mutex::new(BrokerStore::default()),
                closed: AtomicBool::new(false),
                close_cause: Mutex::new(None),
            }),
        }
    }

    // ------------------------------------------------------------------------
    // Fault injection
    // ------------------------------------------------------------------------

    /// Fail the next link attach with `error`.
    pub fn fail_next_link_open(&self, error: MessagingError) {
        self.state.store().faults.link_open_failures.push_back(error);
    }

    /// Delay every link attach.
    pub fn set_link_open_delay(&self, delay: Duration) {
        self.state.store().faults.link_open_delay = Some(delay);
    }

    /// Delay every outcome by `delay`.
    pub fn set_outcome_delay(&self, delay: Duration) {
        self.state.store().faults.outcome_delay = Some(delay);
    }

    /// Accept deliveries but never settle them while `hold` is set.
    ///
    /// Injected send failures still surface immediately.
    pub fn hold_outcomes(&self, hold: bool) {
        self.state.store().faults.hold_outcomes = hold;
    }

    /// Fail the next deliveries, one error each, without touching broker state.
    pub fn fail_next_sends(&self, errors: impl IntoIterator<Item = MessagingError>) {
        self.state.store().faults.send_failures.extend(errors);
    }

    /// Reject every send to `entity_path` with the given AMQP condition.
    pub fn reject_entity(&self, entity_path: impl Into<String>, condition: impl Into<String>) {
        self.state
            .store()
            .faults
            .rejected_entities
            .insert(entity_path.into(), condition.into());
    }

    // ------------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------------

    /// Messages a non-transactional reader of `entity_path` would see.
    pub fn visible_messages(&self, entity_path: &str) -> Vec<AmqpMessage> {
        self.state
            .store()
            .entities
            .get(entity_path)
            .cloned()
            .unwrap_or_default()
    }

    pub fn active_transactions(&self) -> usize {
        self.state.store().active.len()
    }

    pub fn committed_count(&self) -> usize {
        self.state.store().committed
    }

    pub fn rolled_back_count(&self) -> usize {
        self.state.store().rolled_back
    }

    pub fn links_opened(&self) -> usize {
        self.state.store().links_opened
    }

    pub fn links_closed(&self) -> usize {
        self.state.store().links_closed
    }

    /// Every delivery the broker received, in arrival order.
    pub fn deliveries(&self) -> Vec<Delivery> {
        self.state.store().deliveries.clone()
    }

    pub fn close_cause(&self) -> Option<MessagingError> {
        self.state
            .close_cause
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl AmqpConnection for InMemoryBroker {
    fn namespace(&self) -> &str {
        &self.state.namespace
    }

    async fn open_link(&self, settings: LinkSettings) -> Result<Arc<dyn AmqpLink>, MessagingError> {
        let delay = self.state.store().faults.link_open_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.is_closed() {
            return Err(MessagingError::Communication {
                message: "connection is closed".to_string(),
                context: self.state.context(),
            });
        }

        let mut store = self.state.store();
        if let Some(error) = store.faults.link_open_failures.pop_front() {
            return Err(error);
        }
        store.links_opened += 1;
        debug!(link = %settings.name, "Attached in-memory link");

        Ok(Arc::new(InMemoryLink {
            broker: Arc::clone(&self.state),
            settings,
        }))
    }

    async fn close(&self, cause: Option<MessagingError>) -> Result<(), MessagingError> {
        if !self.state.closed.swap(true, Ordering::AcqRel) {
            *self
                .state
                .close_cause
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = cause;
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::Acquire)
    }
}

// ============================================================================
// In-Memory Link
// ============================================================================

struct InMemoryLink {
    broker: Arc<BrokerState>,
    settings: LinkSettings,
}

impl InMemoryLink {
    fn apply(&self, store: &mut BrokerStore, delivery: Delivery) -> DeliveryOutcome {
        match (&self.settings.target, delivery) {
            (LinkTarget::Coordinator, Delivery::Declare) => {
                store.next_transaction += 1;
                let id = TransactionId::new(Bytes::copy_from_slice(
                    &store.next_transaction.to_be_bytes(),
                ));
                store.active.insert(id.clone(), Vec::new());
                DeliveryOutcome::Declared(id)
            }
            (
                LinkTarget::Coordinator,
                Delivery::Discharge {
                    transaction_id,
                    fail,
                },
            ) => match store.active.remove(&transaction_id) {
                Some(staged) => {
                    if fail {
                        store.rolled_back += 1;
                    } else {
                        for (entity, message) in staged {
                            store.entities.entry(entity).or_default().push(message);
                        }
                        store.committed += 1;
                    }
                    store.discharged.insert(transaction_id);
                    DeliveryOutcome::Accepted
                }
                None => unknown_transaction(&transaction_id, store),
            },
            (LinkTarget::Entity(path), Delivery::Message(message)) => {
                if let Some(condition) = store.faults.rejected_entities.get(path) {
                    return DeliveryOutcome::Rejected {
                        condition: condition.clone(),
                        description: Some(format!("send to '{}' refused", path)),
                    };
                }
                match message.transaction_id.clone() {
                    Some(transaction_id) => match store.active.get_mut(&transaction_id) {
                        Some(staged) => {
                            staged.push((path.clone(), message));
                            DeliveryOutcome::Accepted
                        }
                        None => unknown_transaction(&transaction_id, store),
                    },
                    None => {
                        store.entities.entry(path.clone()).or_default().push(message);
                        DeliveryOutcome::Accepted
                    }
                }
            }
            (_, other) => DeliveryOutcome::Rejected {
                condition: NOT_ALLOWED.to_string(),
                description: Some(format!(
                    "'{}' is not valid on link '{}'",
                    other.name(),
                    self.settings.name
                )),
            },
        }
    }
}

fn unknown_transaction(transaction_id: &TransactionId, store: &BrokerStore) -> DeliveryOutcome {
    let description = if store.discharged.contains(transaction_id) {
        format!("transaction {} was already discharged", transaction_id)
    } else {
        format!("unknown transaction {}", transaction_id)
    };
    DeliveryOutcome::Rejected {
        condition: condition::TRANSACTION_UNKNOWN_ID.to_string(),
        description: Some(description),
    }
}

#[async_trait]
impl AmqpLink for InMemoryLink {
    fn name(&self) -> &str {
        &self.settings.name
    }

    fn send(&self, delivery: Delivery) -> BoxFuture<'static, Result<DeliveryOutcome, MessagingError>> {
        // The outcome is decided on enqueue so broker order matches call order.
        let (result, delay, hold) = {
            let mut store = self.broker.store();
            let result = if self.broker.closed.load(Ordering::Acquire) {
                Err(MessagingError::Communication {
                    message: "connection is closed".to_string(),
                    context: self.broker.context(),
                })
            } else if let Some(error) = store.faults.send_failures.pop_front() {
                Err(error)
            } else {
                store.deliveries.push(delivery.clone());
                Ok(self.apply(&mut store, delivery))
            };
            (
                result,
                store.faults.outcome_delay,
                store.faults.hold_outcomes,
            )
        };

        let hold = hold && result.is_ok();
        async move {
            if hold {
                futures::future::pending::<()>().await;
            }
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            result
        }
        .boxed()
    }

    async fn close(&self) -> Result<(), MessagingError> {
        self.broker.store().links_closed += 1;
        debug!(link = %self.settings.name, "Detached in-memory link");
        Ok(())
    }
}

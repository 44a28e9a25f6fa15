//! Message sender for a queue or topic.
//!
//! A [`MessageSender`] attaches its entity link on first use and routes every
//! send through a [`LinkDispatcher`], so sends share the timeout and retry
//! behavior of coordinator operations. A send can be enlisted in a transaction
//! declared on the owning connection's [`TransactionController`].
//!
//! [`TransactionController`]: crate::coordinator::TransactionController

use crate::dispatch::LinkDispatcher;
use crate::error::{ErrorContext, MessagingError};
use crate::link::{AmqpConnection, AmqpMessage, Delivery, DeliveryOutcome, LinkSettings, TransactionId};
use crate::retry::RetryPolicy;
use crate::scheduler::SharedScheduler;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info};

#[cfg(test)]
#[path = "sender_tests.rs"]
mod tests;

/// Sends messages to one entity.
pub struct MessageSender {
    entity_path: String,
    connection: Arc<dyn AmqpConnection>,
    scheduler: Arc<SharedScheduler>,
    retry_policy: Arc<dyn RetryPolicy>,
    operation_timeout: Duration,
    context: ErrorContext,
    dispatcher: OnceCell<LinkDispatcher>,
    closed: AtomicBool,
}

impl std::fmt::Debug for MessageSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageSender")
            .field("entity_path", &self.entity_path)
            .field("operation_timeout", &self.operation_timeout)
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl MessageSender {
    pub fn new(
        connection: Arc<dyn AmqpConnection>,
        scheduler: Arc<SharedScheduler>,
        entity_path: impl Into<String>,
        operation_timeout: Duration,
        retry_policy: Arc<dyn RetryPolicy>,
        namespace: impl Into<String>,
    ) -> Self {
        let entity_path = entity_path.into();
        Self {
            context: ErrorContext::new(namespace).with_entity(entity_path.clone()),
            entity_path,
            connection,
            scheduler,
            retry_policy,
            operation_timeout,
            dispatcher: OnceCell::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn entity_path(&self) -> &str {
        &self.entity_path
    }

    /// Send `message` outside any transaction.
    pub async fn send(&self, message: AmqpMessage) -> Result<(), MessagingError> {
        self.send_message(AmqpMessage {
            transaction_id: None,
            ..message
        })
        .await
    }

    /// Send `message` as part of `transaction_id`.
    ///
    /// The message becomes visible only if the transaction is committed.
    pub async fn send_in_transaction(
        &self,
        message: AmqpMessage,
        transaction_id: &TransactionId,
    ) -> Result<(), MessagingError> {
        self.send_message(message.with_transaction(transaction_id.clone()))
            .await
    }

    /// Detach the entity link. Further sends fail with `InvalidState`.
    pub async fn close(&self) -> Result<(), MessagingError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        match self.dispatcher.get() {
            Some(dispatcher) => {
                info!(entity = %self.entity_path, "Closing sender link");
                dispatcher
                    .close(MessagingError::InvalidState {
                        operation: "send".to_string(),
                        message: "sender is closed".to_string(),
                    })
                    .await
            }
            None => Ok(()),
        }
    }

    async fn send_message(&self, message: AmqpMessage) -> Result<(), MessagingError> {
        let dispatcher = self.dispatcher().await?;
        let message_id = message.message_id.clone();
        let context = self.context.clone();

        dispatcher
            .send(
                Delivery::Message(message),
                self.operation_timeout,
                move |outcome| interpret_send_outcome(outcome, &context),
            )
            .await?;

        debug!(entity = %self.entity_path, message_id = %message_id, "Message sent");
        Ok(())
    }

    async fn dispatcher(&self) -> Result<&LinkDispatcher, MessagingError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(MessagingError::InvalidState {
                operation: "send".to_string(),
                message: "sender is closed".to_string(),
            });
        }

        self.dispatcher
            .get_or_try_init(|| async {
                debug!(entity = %self.entity_path, "Attaching sender link");
                let link = tokio::time::timeout(
                    self.operation_timeout,
                    self.connection
                        .open_link(LinkSettings::sender(self.entity_path.clone())),
                )
                .await
                .map_err(|_| MessagingError::Timeout {
                    operation: "attach".to_string(),
                    duration: self.operation_timeout,
                    context: self.context.clone(),
                })??;

                Ok(LinkDispatcher::new(
                    link,
                    Arc::clone(&self.scheduler),
                    Arc::clone(&self.retry_policy),
                    self.context.clone(),
                ))
            })
            .await
    }
}

fn interpret_send_outcome(
    outcome: DeliveryOutcome,
    context: &ErrorContext,
) -> Result<(), MessagingError> {
    match outcome {
        DeliveryOutcome::Accepted => Ok(()),
        DeliveryOutcome::Rejected {
            condition,
            description,
        } => Err(MessagingError::from_condition(
            &condition,
            description.as_deref(),
            context.clone(),
        )),
        DeliveryOutcome::Released | DeliveryOutcome::Modified { .. } => {
            Err(MessagingError::DeliveryNotSettled {
                outcome: outcome.kind().to_string(),
                context: context.clone(),
            })
        }
        DeliveryOutcome::Declared(_) => Err(MessagingError::ProtocolViolation {
            operation: "send".to_string(),
            expected: "Accepted".to_string(),
            actual: outcome.kind().to_string(),
            description: None,
        }),
    }
}

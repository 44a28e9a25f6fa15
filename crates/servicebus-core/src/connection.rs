//! Messaging connection: the owner of the coordinator and senders.
//!
//! A [`MessagingConnection`] wraps one external [`AmqpConnection`], registers
//! itself with the shared scheduler for as long as it is open, and owns
//! exactly one [`TransactionController`].

use crate::config::ConnectionSettings;
use crate::coordinator::{ControllerSettings, TransactionController};
use crate::error::{ConfigurationError, ErrorContext, MessagingError};
use crate::link::AmqpConnection;
use crate::retry::RetryPolicy;
use crate::scheduler::SharedScheduler;
use crate::sender::MessageSender;
use crate::ClientId;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{info, warn};

#[cfg(test)]
#[path = "connection_tests.rs"]
mod tests;

pub struct MessagingConnection {
    id: ClientId,
    connection: Arc<dyn AmqpConnection>,
    scheduler: Arc<SharedScheduler>,
    operation_timeout: Duration,
    retry_policy: Arc<dyn RetryPolicy>,
    default_entity_path: Option<String>,
    controller: TransactionController,
    senders: Mutex<Vec<Arc<MessageSender>>>,
    closed: AtomicBool,
}

impl MessagingConnection {
    /// Wrap `connection` and register with `scheduler`.
    ///
    /// # Errors
    ///
    /// Fails when the scheduler's worker pool cannot be started.
    pub fn new(
        connection: Arc<dyn AmqpConnection>,
        scheduler: Arc<SharedScheduler>,
        operation_timeout: Duration,
        retry_policy: Arc<dyn RetryPolicy>,
    ) -> Result<Self, MessagingError> {
        let id = ClientId::new();
        scheduler.register(id)?;

        let controller = TransactionController::new(
            Arc::clone(&connection),
            Arc::clone(&scheduler),
            ControllerSettings {
                operation_timeout,
                retry_policy: Arc::clone(&retry_policy),
                context: ErrorContext::new(connection.namespace()),
            },
        );

        info!(client = %id, namespace = connection.namespace(), "Opened messaging connection");
        Ok(Self {
            id,
            connection,
            scheduler,
            operation_timeout,
            retry_policy,
            default_entity_path: None,
            controller,
            senders: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }

    /// Wrap `connection` using loaded settings and the process-wide scheduler.
    pub fn from_settings(
        connection: Arc<dyn AmqpConnection>,
        settings: &ConnectionSettings,
    ) -> Result<Self, MessagingError> {
        Self::from_settings_with_scheduler(connection, settings, SharedScheduler::global())
    }

    /// Wrap `connection` using loaded settings and an explicit scheduler.
    ///
    /// The configured pool floor is applied before registering, so it takes
    /// effect whenever this registration starts the pool.
    pub fn from_settings_with_scheduler(
        connection: Arc<dyn AmqpConnection>,
        settings: &ConnectionSettings,
        scheduler: Arc<SharedScheduler>,
    ) -> Result<Self, MessagingError> {
        scheduler.set_min_threads(settings.scheduler_min_threads);
        let mut messaging = Self::new(
            connection,
            scheduler,
            settings.operation_timeout,
            Arc::clone(&settings.retry_policy),
        )?;
        messaging.default_entity_path = settings.entity_path.clone();
        Ok(messaging)
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.connection.is_closed()
    }

    pub fn transaction_controller(&self) -> &TransactionController {
        &self.controller
    }

    /// Create a sender for `entity_path`. Its link attaches on first send.
    pub fn create_sender(
        &self,
        entity_path: impl Into<String>,
    ) -> Result<Arc<MessageSender>, MessagingError> {
        if self.is_closed() {
            return Err(MessagingError::InvalidState {
                operation: "create_sender".to_string(),
                message: "connection is closed".to_string(),
            });
        }

        let sender = Arc::new(MessageSender::new(
            Arc::clone(&self.connection),
            Arc::clone(&self.scheduler),
            entity_path,
            self.operation_timeout,
            Arc::clone(&self.retry_policy),
            self.connection.namespace(),
        ));
        self.senders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::clone(&sender));
        Ok(sender)
    }

    /// Create a sender for the configured default entity.
    ///
    /// # Errors
    ///
    /// - `Configuration`: No `entity_path` was configured
    /// - `InvalidState`: The connection is closed
    pub fn create_default_sender(&self) -> Result<Arc<MessageSender>, MessagingError> {
        let entity_path = self.default_entity_path.clone().ok_or_else(|| {
            MessagingError::from(ConfigurationError::Missing {
                key: "entity_path".to_string(),
            })
        })?;
        self.create_sender(entity_path)
    }

    /// Close senders, the coordinator and the underlying connection.
    ///
    /// Only the first call does anything.
    pub async fn close(&self) -> Result<(), MessagingError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let senders: Vec<_> = self
            .senders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for sender in senders {
            if let Err(e) = sender.close().await {
                warn!(entity = sender.entity_path(), error = %e, "Failed to close sender");
            }
        }

        if let Err(e) = self.controller.close().await {
            warn!(error = %e, "Failed to close transaction coordinator");
        }

        let result = if self.connection.is_closed() {
            Ok(())
        } else {
            self.connection.close(None).await
        };

        self.scheduler.unregister(&self.id);
        info!(client = %self.id, "Closed messaging connection");
        result
    }
}

impl Drop for MessagingConnection {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::Acquire) {
            self.scheduler.unregister(&self.id);
        }
    }
}

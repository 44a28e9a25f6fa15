//! # Service Bus Core
//!
//! Pending-operation and transaction-coordination core of an AMQP messaging
//! client.
//!
//! This library provides:
//! - Deadline tracking for operations with a fixed timeout budget
//! - Single-resolution pending operations that race a broker outcome against
//!   a scheduled timeout
//! - A process-wide scheduler whose worker pool lives only while clients are
//!   registered
//! - A transaction coordinator client that declares, commits and rolls back
//!   transactions over a dedicated control link
//! - Pluggable retry policies with exponential backoff
//!
//! ## Module Organization
//!
//! - [`timeout`] - Deadline tracking
//! - [`pending`] - Single-resolution operation slots
//! - [`scheduler`] - Shared delayed and periodic execution
//! - [`dispatch`] - Request/response dispatch over one link
//! - [`coordinator`] - Transaction coordinator client
//! - [`sender`] - Entity sender with transaction enlistment
//! - [`connection`] - Owner of the coordinator and senders
//! - [`link`] - Contract the external AMQP engine implements
//! - [`memory`] - In-memory broker for tests and local development
//! - [`retry`] - Retry decisions
//! - [`config`] - Layered client configuration
//! - [`error`] - Error types

use std::fmt;
use uuid::Uuid;

pub mod config;
pub mod connection;
pub mod coordinator;
pub mod dispatch;
pub mod error;
pub mod link;
pub mod memory;
pub mod pending;
pub mod retry;
pub mod scheduler;
pub mod sender;
pub mod timeout;

pub use config::{ClientConfig, ConnectionSettings, RetryConfig};
pub use connection::MessagingConnection;
pub use coordinator::{ControllerSettings, ControllerStatus, TransactionController};
pub use dispatch::LinkDispatcher;
pub use error::{ConfigurationError, ErrorContext, ErrorKind, MessagingError};
pub use link::{
    AmqpConnection, AmqpLink, AmqpMessage, Delivery, DeliveryOutcome, LinkSettings, LinkTarget,
    TransactionId,
};
pub use memory::InMemoryBroker;
pub use pending::{PendingOperation, PendingResult};
pub use retry::{ExponentialRetryPolicy, NoRetryPolicy, RetryDecision, RetryPolicy};
pub use scheduler::{ScheduleMode, ScheduledTask, SharedScheduler};
pub use sender::MessageSender;
pub use timeout::TimeoutTracker;

/// Identity of a scheduler registrant, normally one per messaging connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(Uuid);

impl ClientId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

//! AMQP link collaborator contract.
//!
//! The core never frames or encodes AMQP itself. An external engine provides
//! connections and links implementing these traits; the core only writes
//! [`Delivery`] values to links and interprets the [`DeliveryOutcome`] the
//! broker settles them with.

use crate::error::MessagingError;
use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

#[cfg(test)]
use mockall::automock;

#[cfg(test)]
#[path = "link_tests.rs"]
mod tests;

// ============================================================================
// Transaction Identifier
// ============================================================================

/// Broker-assigned transaction identifier.
///
/// An opaque capability token: it is passed back to the broker verbatim and
/// its contents carry no meaning on the client.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct TransactionId(Bytes);

impl TransactionId {
    pub fn new(token: impl Into<Bytes>) -> Self {
        Self(token.into())
    }

    pub fn as_bytes(&self) -> &Bytes {
        &self.0
    }
}

impl fmt::Debug for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TransactionId({})", hex::encode(&self.0))
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0))
    }
}

// ============================================================================
// Deliveries and Outcomes
// ============================================================================

/// Terminal disposition the broker settled a delivery with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Accepted,
    /// Reply to a declare on the coordinator link.
    Declared(TransactionId),
    Rejected {
        condition: String,
        description: Option<String>,
    },
    Released,
    Modified {
        delivery_failed: bool,
        undeliverable_here: bool,
    },
}

impl DeliveryOutcome {
    /// Name of the outcome type, used in protocol-violation errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Accepted => "Accepted",
            Self::Declared(_) => "Declared",
            Self::Rejected { .. } => "Rejected",
            Self::Released => "Released",
            Self::Modified { .. } => "Modified",
        }
    }
}

/// A message written to an entity link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AmqpMessage {
    pub message_id: String,
    pub body: Bytes,
    /// Set when the send is enlisted in a transaction.
    pub transaction_id: Option<TransactionId>,
}

impl AmqpMessage {
    /// Create a message with a generated id.
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            message_id: Uuid::new_v4().to_string(),
            body: body.into(),
            transaction_id: None,
        }
    }

    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = message_id.into();
        self
    }

    pub fn with_transaction(mut self, transaction_id: TransactionId) -> Self {
        self.transaction_id = Some(transaction_id);
        self
    }
}

/// Everything the core writes to a link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Message(AmqpMessage),
    /// Coordinator control message opening a transaction.
    Declare,
    /// Coordinator control message ending a transaction; `fail` rolls back.
    Discharge {
        transaction_id: TransactionId,
        fail: bool,
    },
}

impl Delivery {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Message(_) => "send",
            Self::Declare => "declare",
            Self::Discharge { .. } => "discharge",
        }
    }
}

// ============================================================================
// Link Settings
// ============================================================================

/// Remote terminus a link attaches to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkTarget {
    /// The broker's transaction coordinator.
    Coordinator,
    /// A queue or topic path.
    Entity(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkSettings {
    pub name: String,
    pub target: LinkTarget,
}

impl LinkSettings {
    pub fn coordinator() -> Self {
        Self {
            name: format!("coordinator-{}", Uuid::new_v4()),
            target: LinkTarget::Coordinator,
        }
    }

    pub fn sender(entity_path: impl Into<String>) -> Self {
        let entity_path = entity_path.into();
        Self {
            name: format!("sender-{}-{}", entity_path, Uuid::new_v4()),
            target: LinkTarget::Entity(entity_path),
        }
    }
}

// ============================================================================
// Collaborator Traits
// ============================================================================

/// An attached outbound AMQP link.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AmqpLink: Send + Sync {
    fn name(&self) -> &str;

    /// Queue `delivery` on the link and return a future for its outcome.
    ///
    /// Deliveries reach the broker in the order `send` was called; the
    /// returned futures may complete in any order. Link-level failures
    /// (detach, connection loss) resolve the future with an error.
    fn send(&self, delivery: Delivery) -> BoxFuture<'static, Result<DeliveryOutcome, MessagingError>>;

    async fn close(&self) -> Result<(), MessagingError>;
}

/// The messaging connection's link-creation capability.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AmqpConnection: Send + Sync {
    /// Fully qualified namespace, used to annotate errors.
    fn namespace(&self) -> &str;

    async fn open_link(&self, settings: LinkSettings) -> Result<Arc<dyn AmqpLink>, MessagingError>;

    /// Close the connection; `cause` is the fatal error, if any.
    async fn close(&self, cause: Option<MessagingError>) -> Result<(), MessagingError>;

    fn is_closed(&self) -> bool;
}

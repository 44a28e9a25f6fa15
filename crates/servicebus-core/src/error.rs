//! Error types for link and transaction operations.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// AMQP error-condition symbols the broker reports on rejected deliveries.
pub mod condition {
    pub const UNAUTHORIZED_ACCESS: &str = "amqp:unauthorized-access";
    pub const NOT_FOUND: &str = "amqp:not-found";
    pub const RESOURCE_LIMIT_EXCEEDED: &str = "amqp:resource-limit-exceeded";
    pub const TRANSACTION_UNKNOWN_ID: &str = "amqp:transaction:unknown-id";
    pub const ENTITY_ALREADY_EXISTS: &str = "com.microsoft:entity-already-exists";
    pub const MESSAGE_LOCK_LOST: &str = "com.microsoft:message-lock-lost";
    pub const SESSION_LOCK_LOST: &str = "com.microsoft:session-lock-lost";
    pub const SERVER_BUSY: &str = "com.microsoft:server-busy";
    pub const TIMEOUT: &str = "com.microsoft:timeout";
}

/// Where an error happened: the namespace and, when known, the entity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorContext {
    pub namespace: String,
    pub entity_path: Option<String>,
}

impl ErrorContext {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            entity_path: None,
        }
    }

    pub fn with_entity(mut self, entity_path: impl Into<String>) -> Self {
        self.entity_path = Some(entity_path.into());
        self
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.entity_path {
            Some(path) => write!(f, "namespace: {}, entity: {}", self.namespace, path),
            None => write!(f, "namespace: {}", self.namespace),
        }
    }
}

/// Fieldless classification of [`MessagingError`] for explicit matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Timeout,
    ProtocolViolation,
    InitializationFailed,
    Authorization,
    EntityNotFound,
    EntityAlreadyExists,
    LockLost,
    ServerBusy,
    QuotaExceeded,
    Communication,
    DeliveryNotSettled,
    InvalidState,
    SchedulerUnavailable,
    OperationCancelled,
    Configuration,
}

/// Comprehensive error type for all link, scheduler and transaction operations
#[derive(Debug, Clone, Error)]
pub enum MessagingError {
    #[error("Operation '{operation}' timed out after {duration:?} ({context})")]
    Timeout {
        operation: String,
        duration: Duration,
        context: ErrorContext,
    },

    #[error("Protocol violation during '{operation}': expected {expected}, received {actual}")]
    ProtocolViolation {
        operation: String,
        expected: String,
        actual: String,
        description: Option<String>,
    },

    #[error("Link initialization failed ({context}): {message}")]
    InitializationFailed {
        message: String,
        context: ErrorContext,
    },

    #[error("Unauthorized ({context}): {message}")]
    Authorization {
        message: String,
        context: ErrorContext,
    },

    #[error("Messaging entity not found ({context}): {message}")]
    EntityNotFound {
        message: String,
        context: ErrorContext,
    },

    #[error("Messaging entity already exists ({context}): {message}")]
    EntityAlreadyExists {
        message: String,
        context: ErrorContext,
    },

    #[error("Lock lost ({context}): {message}")]
    LockLost {
        message: String,
        context: ErrorContext,
    },

    #[error("Server busy ({context}): {message}")]
    ServerBusy {
        message: String,
        context: ErrorContext,
    },

    #[error("Quota exceeded ({context}): {message}")]
    QuotaExceeded {
        message: String,
        context: ErrorContext,
    },

    #[error("Communication failure ({context}): {message}")]
    Communication {
        message: String,
        context: ErrorContext,
    },

    #[error("Delivery was not settled by the broker ({context}): outcome {outcome}")]
    DeliveryNotSettled {
        outcome: String,
        context: ErrorContext,
    },

    #[error("Invalid state for '{operation}': {message}")]
    InvalidState { operation: String, message: String },

    #[error("Shared scheduler is not running; register before scheduling")]
    SchedulerUnavailable,

    #[error("Operation '{operation}' was cancelled before it resolved")]
    OperationCancelled { operation: String },

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),
}

impl MessagingError {
    /// Map an AMQP error condition reported by the broker to a typed error.
    ///
    /// Unknown conditions become [`MessagingError::Communication`] carrying the
    /// condition symbol so nothing the broker said is lost.
    pub fn from_condition(
        condition: &str,
        description: Option<&str>,
        context: ErrorContext,
    ) -> Self {
        let message = description.unwrap_or(condition).to_string();
        match condition {
            condition::UNAUTHORIZED_ACCESS => Self::Authorization { message, context },
            condition::NOT_FOUND => Self::EntityNotFound { message, context },
            condition::ENTITY_ALREADY_EXISTS => Self::EntityAlreadyExists { message, context },
            condition::MESSAGE_LOCK_LOST | condition::SESSION_LOCK_LOST => {
                Self::LockLost { message, context }
            }
            condition::SERVER_BUSY => Self::ServerBusy { message, context },
            condition::RESOURCE_LIMIT_EXCEEDED => Self::QuotaExceeded { message, context },
            // A broker-side timeout carries no local deadline; keep its text.
            other => Self::Communication {
                message: format!("{}: {}", other, message),
                context,
            },
        }
    }

    /// Classify the error without its payload.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::ProtocolViolation { .. } => ErrorKind::ProtocolViolation,
            Self::InitializationFailed { .. } => ErrorKind::InitializationFailed,
            Self::Authorization { .. } => ErrorKind::Authorization,
            Self::EntityNotFound { .. } => ErrorKind::EntityNotFound,
            Self::EntityAlreadyExists { .. } => ErrorKind::EntityAlreadyExists,
            Self::LockLost { .. } => ErrorKind::LockLost,
            Self::ServerBusy { .. } => ErrorKind::ServerBusy,
            Self::QuotaExceeded { .. } => ErrorKind::QuotaExceeded,
            Self::Communication { .. } => ErrorKind::Communication,
            Self::DeliveryNotSettled { .. } => ErrorKind::DeliveryNotSettled,
            Self::InvalidState { .. } => ErrorKind::InvalidState,
            Self::SchedulerUnavailable => ErrorKind::SchedulerUnavailable,
            Self::OperationCancelled { .. } => ErrorKind::OperationCancelled,
            Self::Configuration(_) => ErrorKind::Configuration,
        }
    }

    /// Check if error is transient and the operation may be attempted again
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::ProtocolViolation { .. } => false,
            Self::InitializationFailed { .. } => false,
            Self::Authorization { .. } => false,
            Self::EntityNotFound { .. } => false,
            Self::EntityAlreadyExists { .. } => false,
            Self::LockLost { .. } => false,
            Self::ServerBusy { .. } => true,
            Self::QuotaExceeded { .. } => false,
            Self::Communication { .. } => true,
            Self::DeliveryNotSettled { .. } => true,
            Self::InvalidState { .. } => false,
            Self::SchedulerUnavailable => false,
            Self::OperationCancelled { .. } => false,
            Self::Configuration(_) => false,
        }
    }

    /// Operation context attached to broker-originated errors, if any.
    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            Self::Timeout { context, .. }
            | Self::InitializationFailed { context, .. }
            | Self::Authorization { context, .. }
            | Self::EntityNotFound { context, .. }
            | Self::EntityAlreadyExists { context, .. }
            | Self::LockLost { context, .. }
            | Self::ServerBusy { context, .. }
            | Self::QuotaExceeded { context, .. }
            | Self::Communication { context, .. }
            | Self::DeliveryNotSettled { context, .. } => Some(context),
            _ => None,
        }
    }
}

/// Configuration errors
#[derive(Debug, Clone, Error)]
pub enum ConfigurationError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Missing required configuration: {key}")]
    Missing { key: String },

    #[error("Configuration parsing failed: {message}")]
    Parsing { message: String },
}

impl From<config::ConfigError> for ConfigurationError {
    fn from(err: config::ConfigError) -> Self {
        match err {
            config::ConfigError::NotFound(key) => Self::Missing { key },
            other => Self::Parsing {
                message: other.to_string(),
            },
        }
    }
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;

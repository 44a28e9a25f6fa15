//! Client configuration.
//!
//! Sources are applied in order, later ones overriding earlier ones:
//!
//! 1. Built-in defaults (every field carries a serde default)
//! 2. An optional file; TOML, YAML or JSON chosen by extension
//! 3. Environment variables prefixed `SERVICEBUS__` with `__` between nested
//!    keys, e.g. `SERVICEBUS__RETRY__MAX_RETRY_COUNT=2`

use crate::error::ConfigurationError;
use crate::retry::{ExponentialRetryPolicy, NoRetryPolicy, RetryPolicy};
use crate::scheduler::MIN_WORKER_THREADS;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use url::Url;

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;

/// Prefix of environment variables read by [`ClientConfig::load`].
pub const ENV_PREFIX: &str = "SERVICEBUS";

/// Top-level client configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ClientConfig {
    /// Namespace endpoint, e.g. `amqps://contoso.servicebus.windows.net`
    #[serde(default)]
    pub endpoint: Option<Url>,

    /// Queue or topic targeted by the connection's default sender
    #[serde(default)]
    pub entity_path: Option<String>,

    /// Budget for each operation, retries included
    #[serde(default = "default_operation_timeout_ms")]
    pub operation_timeout_ms: u64,

    #[serde(default)]
    pub retry: RetryConfig,

    /// Lower bound on the shared scheduler's worker count
    #[serde(default = "default_scheduler_min_threads")]
    pub scheduler_min_threads: usize,
}

/// Retry settings used to build the connection's retry policy.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RetryConfig {
    /// Retries after the first attempt; 0 disables retrying
    #[serde(default = "default_max_retry_count")]
    pub max_retry_count: u32,

    #[serde(default = "default_min_backoff_ms")]
    pub min_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Jitter as a fraction of each delay; 0 disables jitter
    #[serde(default = "default_jitter_percent")]
    pub jitter_percent: f64,
}

fn default_operation_timeout_ms() -> u64 {
    60_000
}

fn default_scheduler_min_threads() -> usize {
    MIN_WORKER_THREADS
}

fn default_max_retry_count() -> u32 {
    3
}

fn default_min_backoff_ms() -> u64 {
    800
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

fn default_jitter_percent() -> f64 {
    0.25
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retry_count: default_max_retry_count(),
            min_backoff_ms: default_min_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            jitter_percent: default_jitter_percent(),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            entity_path: None,
            operation_timeout_ms: default_operation_timeout_ms(),
            retry: RetryConfig::default(),
            scheduler_min_threads: default_scheduler_min_threads(),
        }
    }
}

/// What the messaging core needs to open a connection.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub endpoint: Url,
    pub operation_timeout: Duration,
    pub retry_policy: Arc<dyn RetryPolicy>,
    /// Entity used by [`MessagingConnection::create_default_sender`]
    ///
    /// [`MessagingConnection::create_default_sender`]: crate::connection::MessagingConnection::create_default_sender
    pub entity_path: Option<String>,
    pub scheduler_min_threads: usize,
}

impl ClientConfig {
    /// Load configuration from an optional file and the environment.
    ///
    /// A missing or malformed file given explicitly is an error, as is an
    /// environment value that cannot be coerced to its field's type.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigurationError> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            info!(path = %path.display(), "Loading client configuration from file");
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let config = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let client_config: ClientConfig = config.try_deserialize()?;
        client_config.validate()?;
        Ok(client_config)
    }

    /// Reject settings the core cannot run with.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.operation_timeout_ms == 0 {
            return Err(ConfigurationError::Invalid {
                message: "operation_timeout_ms must be greater than zero".to_string(),
            });
        }

        if self.scheduler_min_threads == 0 {
            return Err(ConfigurationError::Invalid {
                message: "scheduler_min_threads must be greater than zero".to_string(),
            });
        }

        if self.retry.min_backoff_ms > self.retry.max_backoff_ms {
            return Err(ConfigurationError::Invalid {
                message: format!(
                    "retry.min_backoff_ms ({}) exceeds retry.max_backoff_ms ({})",
                    self.retry.min_backoff_ms, self.retry.max_backoff_ms
                ),
            });
        }

        if !(0.0..=1.0).contains(&self.retry.jitter_percent) {
            return Err(ConfigurationError::Invalid {
                message: "retry.jitter_percent must be between 0.0 and 1.0".to_string(),
            });
        }

        if let Some(endpoint) = &self.endpoint {
            if endpoint.host_str().is_none() {
                return Err(ConfigurationError::Invalid {
                    message: format!("endpoint '{}' has no host", endpoint),
                });
            }
        }

        Ok(())
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    /// Build the retry policy described by [`RetryConfig`].
    pub fn retry_policy(&self) -> Arc<dyn RetryPolicy> {
        if self.retry.max_retry_count == 0 {
            return Arc::new(NoRetryPolicy);
        }

        let policy = ExponentialRetryPolicy::new(
            self.retry.max_retry_count,
            Duration::from_millis(self.retry.min_backoff_ms),
            Duration::from_millis(self.retry.max_backoff_ms),
            2.0,
        );
        if self.retry.jitter_percent > 0.0 {
            Arc::new(policy.with_jitter_percent(self.retry.jitter_percent))
        } else {
            Arc::new(policy.without_jitter())
        }
    }

    /// Everything a connection needs from this configuration.
    pub fn connection_settings(&self) -> Result<ConnectionSettings, ConfigurationError> {
        self.validate()?;
        let endpoint = self.endpoint.clone().ok_or_else(|| ConfigurationError::Missing {
            key: "endpoint".to_string(),
        })?;

        Ok(ConnectionSettings {
            endpoint,
            operation_timeout: self.operation_timeout(),
            retry_policy: self.retry_policy(),
            entity_path: self.entity_path.clone(),
            scheduler_min_threads: self.scheduler_min_threads,
        })
    }
}

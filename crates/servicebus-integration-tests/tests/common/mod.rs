//! Common test utilities for servicebus-core scenario tests
//!
//! This module provides:
//! - Tracing setup honoring `RUST_LOG`
//! - A fixture wiring an in-memory broker to a messaging connection
//! - Retry policies with millisecond backoff

use servicebus_core::{
    ExponentialRetryPolicy, InMemoryBroker, MessagingConnection, NoRetryPolicy, RetryPolicy,
    SharedScheduler,
};
use std::sync::{Arc, Once};
use std::time::Duration;

static TRACING: Once = Once::new();

/// Install a test-writer subscriber once per test binary.
#[allow(dead_code)]
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

/// Retry quickly so scenario tests stay fast.
#[allow(dead_code)]
pub fn fast_retries(max_retry_count: u32) -> Arc<dyn RetryPolicy> {
    Arc::new(
        ExponentialRetryPolicy::new(
            max_retry_count,
            Duration::from_millis(2),
            Duration::from_millis(10),
            2.0,
        )
        .without_jitter(),
    )
}

/// A broker, a private scheduler, and a connection over both.
pub struct Fixture {
    pub broker: InMemoryBroker,
    pub scheduler: Arc<SharedScheduler>,
    pub connection: MessagingConnection,
}

impl Fixture {
    #[allow(dead_code)]
    pub fn new() -> Self {
        Self::with(Duration::from_secs(5), Arc::new(NoRetryPolicy))
    }

    #[allow(dead_code)]
    pub fn with(operation_timeout: Duration, retry_policy: Arc<dyn RetryPolicy>) -> Self {
        init_tracing();
        let broker = InMemoryBroker::new("scenario.servicebus.local");
        let scheduler = Arc::new(SharedScheduler::with_min_threads(2));
        let connection = MessagingConnection::new(
            Arc::new(broker.clone()),
            Arc::clone(&scheduler),
            operation_timeout,
            retry_policy,
        )
        .expect("connection should open");

        Self {
            broker,
            scheduler,
            connection,
        }
    }

    /// Open a second connection on the same broker and scheduler.
    #[allow(dead_code)]
    pub fn second_connection(&self) -> MessagingConnection {
        MessagingConnection::new(
            Arc::new(self.broker.clone()),
            Arc::clone(&self.scheduler),
            Duration::from_secs(5),
            Arc::new(NoRetryPolicy),
        )
        .expect("connection should open")
    }
}

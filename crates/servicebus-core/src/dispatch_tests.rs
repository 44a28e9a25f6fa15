//! Tests for link dispatch.

use super::*;
use crate::error::ErrorKind;
use crate::link::{AmqpMessage, MockAmqpLink};
use crate::retry::{ExponentialRetryPolicy, NoRetryPolicy};
use crate::ClientId;
use futures::FutureExt;
use std::sync::atomic::AtomicUsize;

// ============================================================================
// Helper Functions
// ============================================================================

fn scheduler() -> Arc<SharedScheduler> {
    let scheduler = Arc::new(SharedScheduler::with_min_threads(2));
    scheduler.register(ClientId::new()).unwrap();
    scheduler
}

fn fast_retries(max_retry_count: u32) -> Arc<dyn RetryPolicy> {
    Arc::new(
        ExponentialRetryPolicy::new(
            max_retry_count,
            Duration::from_millis(1),
            Duration::from_millis(5),
            2.0,
        )
        .without_jitter(),
    )
}

fn dispatcher(link: MockAmqpLink, retry_policy: Arc<dyn RetryPolicy>) -> LinkDispatcher {
    LinkDispatcher::new(
        Arc::new(link),
        scheduler(),
        retry_policy,
        ErrorContext::new("test-namespace").with_entity("orders"),
    )
}

fn link_error() -> MessagingError {
    MessagingError::Communication {
        message: "link detached".to_string(),
        context: ErrorContext::new("test-namespace"),
    }
}

fn accept(outcome: DeliveryOutcome) -> Result<(), MessagingError> {
    match outcome {
        DeliveryOutcome::Accepted => Ok(()),
        other => Err(MessagingError::ProtocolViolation {
            operation: "send".to_string(),
            expected: "Accepted".to_string(),
            actual: other.kind().to_string(),
            description: None,
        }),
    }
}

fn message(id: &str) -> Delivery {
    Delivery::Message(AmqpMessage::new("body").with_message_id(id))
}

// ============================================================================
// Outcome Resolution
// ============================================================================

mod outcomes {
    use super::*;

    #[tokio::test]
    async fn test_accepted_outcome_resolves_operation() {
        let mut link = MockAmqpLink::new();
        link.expect_send()
            .times(1)
            .returning(|_| futures::future::ready(Ok(DeliveryOutcome::Accepted)).boxed());
        let dispatcher = dispatcher(link, fast_retries(3));

        let result = dispatcher
            .send(message("m1"), Duration::from_secs(5), accept)
            .await;

        assert!(result.is_ok());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(dispatcher.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn test_deliveries_reach_link_in_call_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut link = MockAmqpLink::new();
        let seen = Arc::clone(&order);
        link.expect_send().times(3).returning(move |delivery| {
            if let Delivery::Message(message) = &delivery {
                seen.lock().unwrap().push(message.message_id.clone());
            }
            async {
                tokio::time::sleep(Duration::from_millis(5)).await;
                Ok(DeliveryOutcome::Accepted)
            }
            .boxed()
        });
        let dispatcher = dispatcher(link, fast_retries(0));

        let first = dispatcher
            .dispatch(message("m1"), Duration::from_secs(5), accept)
            .unwrap();
        let second = dispatcher
            .dispatch(message("m2"), Duration::from_secs(5), accept)
            .unwrap();
        let third = dispatcher
            .dispatch(message("m3"), Duration::from_secs(5), accept)
            .unwrap();

        let (a, b, c) = tokio::join!(third, first, second);
        assert!(a.is_ok() && b.is_ok() && c.is_ok());
        assert_eq!(*order.lock().unwrap(), vec!["m1", "m2", "m3"]);
    }

    #[tokio::test]
    async fn test_unexpected_outcome_is_not_retried() {
        let mut link = MockAmqpLink::new();
        link.expect_send()
            .times(1)
            .returning(|_| futures::future::ready(Ok(DeliveryOutcome::Released)).boxed());
        let dispatcher = dispatcher(link, fast_retries(3));

        let error = dispatcher
            .send(message("m1"), Duration::from_secs(5), accept)
            .await
            .unwrap_err();

        assert_eq!(error.kind(), ErrorKind::ProtocolViolation);
    }

    #[tokio::test]
    async fn test_unsettled_delivery_times_out() {
        let mut link = MockAmqpLink::new();
        link.expect_send()
            .returning(|_| futures::future::pending().boxed());
        let dispatcher = dispatcher(link, fast_retries(3));

        let error = dispatcher
            .send(message("m1"), Duration::from_millis(20), accept)
            .await
            .unwrap_err();

        match error {
            MessagingError::Timeout {
                operation, context, ..
            } => {
                assert_eq!(operation, "send");
                assert_eq!(context.entity_path.as_deref(), Some("orders"));
            }
            other => panic!("expected Timeout, got {:?}", other),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_unsettled_deliveries_always_time_out() {
        let mut link = MockAmqpLink::new();
        link.expect_send()
            .returning(|_| futures::future::pending().boxed());
        let dispatcher = dispatcher(link, fast_retries(0));

        let pending: Vec<_> = (0..200)
            .map(|i| {
                dispatcher
                    .dispatch(message(&format!("m{}", i)), Duration::from_millis(10), accept)
                    .unwrap()
            })
            .collect();
        let results = futures::future::join_all(pending).await;

        let timeouts = results
            .iter()
            .filter(|result| matches!(result, Err(MessagingError::Timeout { .. })))
            .count();
        assert_eq!(timeouts, 200, "results: {:?}", results);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsettled_delivery_times_out_with_paused_clock() {
        let mut link = MockAmqpLink::new();
        link.expect_send()
            .returning(|_| futures::future::pending().boxed());
        let dispatcher = dispatcher(link, fast_retries(0));

        let error = dispatcher
            .send(message("m1"), Duration::from_secs(30), accept)
            .await
            .unwrap_err();

        match error {
            MessagingError::Timeout { duration, .. } => {
                assert_eq!(duration, Duration::from_secs(30));
            }
            other => panic!("expected Timeout, got {:?}", other),
        }
    }
}

// ============================================================================
// Retry Behavior
// ============================================================================

mod retries {
    use super::*;

    #[tokio::test]
    async fn test_transient_failures_are_retried_until_success() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let mut link = MockAmqpLink::new();
        link.expect_send().times(3).returning(move |_| {
            let attempt = counter.fetch_add(1, Ordering::SeqCst);
            let result = if attempt < 2 {
                Err(link_error())
            } else {
                Ok(DeliveryOutcome::Accepted)
            };
            futures::future::ready(result).boxed()
        });
        let dispatcher = dispatcher(link, fast_retries(3));

        let result = dispatcher
            .send(message("m1"), Duration::from_secs(5), accept)
            .await;

        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_transient_failure_is_not_retried() {
        let mut link = MockAmqpLink::new();
        link.expect_send().times(1).returning(|_| {
            futures::future::ready(Err(MessagingError::Authorization {
                message: "no send claim".to_string(),
                context: ErrorContext::new("test-namespace"),
            }))
            .boxed()
        });
        let dispatcher = dispatcher(link, fast_retries(3));

        let error = dispatcher
            .send(message("m1"), Duration::from_secs(5), accept)
            .await
            .unwrap_err();

        assert_eq!(error.kind(), ErrorKind::Authorization);
    }

    #[tokio::test]
    async fn test_policy_give_up_fails_with_last_error() {
        let mut link = MockAmqpLink::new();
        link.expect_send()
            .times(1)
            .returning(|_| futures::future::ready(Err(link_error())).boxed());
        let dispatcher = dispatcher(link, Arc::new(NoRetryPolicy));

        let error = dispatcher
            .send(message("m1"), Duration::from_secs(5), accept)
            .await
            .unwrap_err();

        assert_eq!(error.kind(), ErrorKind::Communication);
    }

    #[tokio::test]
    async fn test_exhausted_retries_fail_with_link_error() {
        let mut link = MockAmqpLink::new();
        link.expect_send()
            .times(3)
            .returning(|_| futures::future::ready(Err(link_error())).boxed());
        let dispatcher = dispatcher(link, fast_retries(2));

        let error = dispatcher
            .send(message("m1"), Duration::from_secs(5), accept)
            .await
            .unwrap_err();

        assert_eq!(error.kind(), ErrorKind::Communication);
    }

    #[tokio::test]
    async fn test_backoff_beyond_budget_gives_up() {
        let mut link = MockAmqpLink::new();
        link.expect_send()
            .times(1)
            .returning(|_| futures::future::ready(Err(link_error())).boxed());
        let slow_policy: Arc<dyn RetryPolicy> = Arc::new(
            ExponentialRetryPolicy::new(5, Duration::from_secs(10), Duration::from_secs(10), 2.0)
                .without_jitter(),
        );
        let dispatcher = dispatcher(link, slow_policy);

        let error = dispatcher
            .send(message("m1"), Duration::from_millis(200), accept)
            .await
            .unwrap_err();

        assert_eq!(error.kind(), ErrorKind::Communication);
    }
}

// ============================================================================
// Lifecycle
// ============================================================================

mod lifecycle {
    use super::*;

    #[tokio::test]
    async fn test_close_fails_in_flight_operations() {
        let mut link = MockAmqpLink::new();
        link.expect_send()
            .returning(|_| futures::future::pending().boxed());
        link.expect_close().times(1).returning(|| Ok(()));
        let dispatcher = dispatcher(link, fast_retries(0));

        let pending = dispatcher
            .dispatch(message("m1"), Duration::from_secs(5), accept)
            .unwrap();
        assert_eq!(dispatcher.in_flight_count(), 1);

        dispatcher
            .close(MessagingError::OperationCancelled {
                operation: "close".to_string(),
            })
            .await
            .unwrap();

        let error = pending.await.unwrap_err();
        assert_eq!(error.kind(), ErrorKind::OperationCancelled);
        assert_eq!(dispatcher.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn test_scheduler_teardown_still_times_out_in_flight_operation() {
        let scheduler = Arc::new(SharedScheduler::with_min_threads(2));
        let owner = ClientId::new();
        scheduler.register(owner).unwrap();
        let mut link = MockAmqpLink::new();
        link.expect_send()
            .returning(|_| futures::future::pending().boxed());
        let dispatcher = LinkDispatcher::new(
            Arc::new(link),
            Arc::clone(&scheduler),
            fast_retries(0),
            ErrorContext::new("test-namespace"),
        );

        let pending = dispatcher
            .dispatch(message("m1"), Duration::from_millis(30), accept)
            .unwrap();
        assert!(scheduler.unregister(&owner));
        assert!(!scheduler.is_running());

        let result = tokio::time::timeout(Duration::from_secs(5), pending)
            .await
            .expect("operation resolves without the scheduler");
        assert_eq!(result.unwrap_err().kind(), ErrorKind::Timeout);
    }

    #[test]
    fn test_dispatch_outside_runtime_is_rejected() {
        let link = MockAmqpLink::new();
        let dispatcher = dispatcher(link, fast_retries(0));

        let error = dispatcher
            .dispatch(message("m1"), Duration::from_secs(1), accept)
            .unwrap_err();

        assert_eq!(error.kind(), ErrorKind::InvalidState);
    }

    #[tokio::test]
    async fn test_dispatch_requires_running_scheduler() {
        let link = MockAmqpLink::new();
        let dispatcher = LinkDispatcher::new(
            Arc::new(link),
            Arc::new(SharedScheduler::new()),
            fast_retries(0),
            ErrorContext::default(),
        );

        let error = dispatcher
            .dispatch(message("m1"), Duration::from_secs(1), accept)
            .unwrap_err();

        assert_eq!(error.kind(), ErrorKind::SchedulerUnavailable);
    }
}

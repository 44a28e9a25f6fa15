//! Tests for the in-memory broker.

use super::*;

fn broker() -> InMemoryBroker {
    InMemoryBroker::new("memory-test")
}

async fn coordinator(broker: &InMemoryBroker) -> Arc<dyn AmqpLink> {
    broker.open_link(LinkSettings::coordinator()).await.unwrap()
}

async fn sender(broker: &InMemoryBroker, entity: &str) -> Arc<dyn AmqpLink> {
    broker.open_link(LinkSettings::sender(entity)).await.unwrap()
}

async fn declare(link: &Arc<dyn AmqpLink>) -> TransactionId {
    match link.send(Delivery::Declare).await.unwrap() {
        DeliveryOutcome::Declared(id) => id,
        other => panic!("expected Declared, got {:?}", other),
    }
}

mod transactions {
    use super::*;

    #[tokio::test]
    async fn test_declare_issues_distinct_ids() {
        let broker = broker();
        let link = coordinator(&broker).await;

        let first = declare(&link).await;
        let second = declare(&link).await;

        assert_ne!(first, second);
        assert_eq!(broker.active_transactions(), 2);
    }

    #[tokio::test]
    async fn test_commit_publishes_staged_messages() {
        let broker = broker();
        let control = coordinator(&broker).await;
        let orders = sender(&broker, "orders").await;
        let transaction_id = declare(&control).await;

        let outcome = orders
            .send(Delivery::Message(
                AmqpMessage::new("a").with_transaction(transaction_id.clone()),
            ))
            .await
            .unwrap();
        assert_eq!(outcome, DeliveryOutcome::Accepted);
        assert!(broker.visible_messages("orders").is_empty());

        let outcome = control
            .send(Delivery::Discharge {
                transaction_id,
                fail: false,
            })
            .await
            .unwrap();

        assert_eq!(outcome, DeliveryOutcome::Accepted);
        assert_eq!(broker.visible_messages("orders").len(), 1);
        assert_eq!(broker.committed_count(), 1);
        assert_eq!(broker.active_transactions(), 0);
    }

    #[tokio::test]
    async fn test_rollback_discards_staged_messages() {
        let broker = broker();
        let control = coordinator(&broker).await;
        let orders = sender(&broker, "orders").await;
        let transaction_id = declare(&control).await;

        orders
            .send(Delivery::Message(
                AmqpMessage::new("a").with_transaction(transaction_id.clone()),
            ))
            .await
            .unwrap();
        control
            .send(Delivery::Discharge {
                transaction_id,
                fail: true,
            })
            .await
            .unwrap();

        assert!(broker.visible_messages("orders").is_empty());
        assert_eq!(broker.rolled_back_count(), 1);
    }

    #[tokio::test]
    async fn test_discharge_twice_is_rejected() {
        let broker = broker();
        let control = coordinator(&broker).await;
        let transaction_id = declare(&control).await;
        let discharge = Delivery::Discharge {
            transaction_id,
            fail: false,
        };

        control.send(discharge.clone()).await.unwrap();
        let outcome = control.send(discharge).await.unwrap();

        match outcome {
            DeliveryOutcome::Rejected {
                condition,
                description,
            } => {
                assert_eq!(condition, condition::TRANSACTION_UNKNOWN_ID);
                assert!(description.unwrap().contains("already discharged"));
            }
            other => panic!("expected Rejected, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_send_in_unknown_transaction_is_rejected() {
        let broker = broker();
        let orders = sender(&broker, "orders").await;

        let outcome = orders
            .send(Delivery::Message(
                AmqpMessage::new("a").with_transaction(TransactionId::new(Bytes::from_static(b"x"))),
            ))
            .await
            .unwrap();

        assert!(matches!(outcome, DeliveryOutcome::Rejected { .. }));
        assert!(broker.visible_messages("orders").is_empty());
    }
}

mod links {
    use super::*;

    #[tokio::test]
    async fn test_plain_send_is_visible_immediately() {
        let broker = broker();
        let orders = sender(&broker, "orders").await;

        orders
            .send(Delivery::Message(AmqpMessage::new("a").with_message_id("m1")))
            .await
            .unwrap();

        let visible = broker.visible_messages("orders");
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].message_id, "m1");
        assert_eq!(broker.deliveries().len(), 1);
    }

    #[tokio::test]
    async fn test_control_messages_on_entity_link_are_not_allowed() {
        let broker = broker();
        let orders = sender(&broker, "orders").await;

        let outcome = orders.send(Delivery::Declare).await.unwrap();

        assert!(matches!(
            outcome,
            DeliveryOutcome::Rejected { ref condition, .. } if condition == NOT_ALLOWED
        ));
    }

    #[tokio::test]
    async fn test_messages_on_coordinator_link_are_not_allowed() {
        let broker = broker();
        let control = coordinator(&broker).await;

        let outcome = control
            .send(Delivery::Message(AmqpMessage::new("a")))
            .await
            .unwrap();

        assert!(matches!(outcome, DeliveryOutcome::Rejected { .. }));
    }

    #[tokio::test]
    async fn test_outcome_is_decided_in_send_order() {
        let broker = broker();
        broker.set_outcome_delay(Duration::from_millis(10));
        let orders = sender(&broker, "orders").await;

        let first = orders.send(Delivery::Message(AmqpMessage::new("a").with_message_id("1")));
        let second = orders.send(Delivery::Message(AmqpMessage::new("b").with_message_id("2")));
        let (b, a) = tokio::join!(second, first);
        assert!(a.is_ok() && b.is_ok());

        let ids: Vec<String> = broker
            .visible_messages("orders")
            .into_iter()
            .map(|m| m.message_id)
            .collect();
        assert_eq!(ids, vec!["1", "2"]);
    }
}

mod faults {
    use super::*;
    use crate::error::ErrorKind;

    #[tokio::test]
    async fn test_failed_link_open_is_consumed_once() {
        let broker = broker();
        broker.fail_next_link_open(MessagingError::Communication {
            message: "attach refused".to_string(),
            context: ErrorContext::new("memory-test"),
        });

        assert!(broker.open_link(LinkSettings::coordinator()).await.is_err());
        assert!(broker.open_link(LinkSettings::coordinator()).await.is_ok());
        assert_eq!(broker.links_opened(), 1);
    }

    #[tokio::test]
    async fn test_injected_send_failures_leave_state_untouched() {
        let broker = broker();
        let orders = sender(&broker, "orders").await;
        broker.fail_next_sends([MessagingError::ServerBusy {
            message: "busy".to_string(),
            context: ErrorContext::new("memory-test"),
        }]);

        let failed = orders.send(Delivery::Message(AmqpMessage::new("a"))).await;
        let succeeded = orders.send(Delivery::Message(AmqpMessage::new("b"))).await;

        assert_eq!(failed.unwrap_err().kind(), ErrorKind::ServerBusy);
        assert!(succeeded.is_ok());
        assert_eq!(broker.visible_messages("orders").len(), 1);
    }

    #[tokio::test]
    async fn test_rejected_entity_reports_condition() {
        let broker = broker();
        broker.reject_entity("orders", condition::UNAUTHORIZED_ACCESS);
        let orders = sender(&broker, "orders").await;

        let outcome = orders.send(Delivery::Message(AmqpMessage::new("a"))).await.unwrap();

        assert!(matches!(
            outcome,
            DeliveryOutcome::Rejected { ref condition, .. } if condition == condition::UNAUTHORIZED_ACCESS
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_held_outcomes_never_settle() {
        let broker = broker();
        broker.hold_outcomes(true);
        let orders = sender(&broker, "orders").await;

        let outcome = tokio::time::timeout(
            Duration::from_secs(60),
            orders.send(Delivery::Message(AmqpMessage::new("a"))),
        )
        .await;

        assert!(outcome.is_err());
    }

    #[tokio::test]
    async fn test_close_records_first_cause_and_blocks_links() {
        let broker = broker();
        broker
            .close(Some(MessagingError::InitializationFailed {
                message: "coordinator".to_string(),
                context: ErrorContext::new("memory-test"),
            }))
            .await
            .unwrap();
        broker.close(None).await.unwrap();

        assert!(broker.is_closed());
        assert_eq!(
            broker.close_cause().map(|e| e.kind()),
            Some(ErrorKind::InitializationFailed)
        );
        assert!(broker.open_link(LinkSettings::coordinator()).await.is_err());
    }
}

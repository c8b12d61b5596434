//! End-to-end consumer scenarios over the mock broker
//!
//! Each test delivers a message through a running component and observes the
//! successor message and the settlement of the original delivery.

use async_trait::async_trait;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use waybill::component::{Component, Operator, OperatorError, OperatorOutput};
use waybill::payload::{
    Arguments, Document, Documents, Encoding, ErrorHandling, Message, MetaData, Routing, Step,
};
use waybill::testing::mocks::{AckOutcome, MockBroker};
use waybill::LIVENESS_MARKER;

const WAIT: Duration = Duration::from_secs(1);
const SHORT_WAIT: Duration = Duration::from_millis(200);

/// Operator adding a single named document on every invocation.
struct AppendDocument {
    name: &'static str,
    value: &'static str,
}

#[async_trait]
impl Operator for AppendDocument {
    async fn process(
        &self,
        _trace_id: &str,
        _metadata: &MetaData,
        _arguments: &Arguments,
        _documents: &Documents,
    ) -> Result<OperatorOutput, OperatorError> {
        let mut documents = Documents::new();
        documents.insert(
            self.name.to_string(),
            Document::new(self.value, "text/plain", Encoding::None),
        );
        Ok(OperatorOutput::with_documents(documents))
    }
}

/// Operator that always fails.
struct AlwaysFail;

#[async_trait]
impl Operator for AlwaysFail {
    async fn process(
        &self,
        _trace_id: &str,
        _metadata: &MetaData,
        _arguments: &Arguments,
        _documents: &Documents,
    ) -> Result<OperatorOutput, OperatorError> {
        Err("induced failure".into())
    }
}

/// Operator recording whether it was invoked at all.
struct TrackingOperator {
    invoked: Arc<AtomicBool>,
}

#[async_trait]
impl Operator for TrackingOperator {
    async fn process(
        &self,
        _trace_id: &str,
        _metadata: &MetaData,
        _arguments: &Arguments,
        _documents: &Documents,
    ) -> Result<OperatorOutput, OperatorError> {
        self.invoked.store(true, Ordering::SeqCst);
        Ok(OperatorOutput::unchanged())
    }
}

fn two_step_message() -> Message {
    Message::new(
        Routing {
            name: "test-route".to_string(),
            position: 0,
            slip: vec![
                Step {
                    queue: "foo".to_string(),
                    ..Step::default()
                },
                Step {
                    queue: "bar".to_string(),
                    ..Step::default()
                },
            ],
        },
        MetaData::new(),
        Documents::from([(
            "input".to_string(),
            Document::new("Hello", "text/plain", Encoding::None),
        )]),
    )
}

#[tokio::test]
async fn successful_step_advances_and_merges_documents() {
    let broker = MockBroker::new();
    let mut component = Component::consumer(
        broker.clone(),
        1,
        AppendDocument {
            name: "test",
            value: "passed",
        },
    );
    component.run().await.expect("component should run");

    let original = two_step_message();
    broker
        .deliver_message(&original)
        .await
        .expect("delivery should be accepted");

    let successor = broker
        .take_message(WAIT)
        .await
        .expect("a successor message should be sent");
    assert_eq!(successor.trace_id, original.trace_id);
    assert_eq!(successor.routing.position, 1);
    assert_eq!(successor.documents["input"].data, "Hello");
    assert_eq!(successor.documents["test"].data, "passed");

    assert_eq!(broker.next_ack(WAIT).await, Some(AckOutcome::Acked));

    component.shutdown().await;
}

#[tokio::test]
async fn failure_without_retry_budget_acks_and_drops() {
    let broker = MockBroker::new();
    let mut component = Component::consumer(broker.clone(), 1, AlwaysFail);
    component.run().await.expect("component should run");

    let original = Message::direct(
        "solo",
        MetaData::new(),
        Documents::from([(
            "input".to_string(),
            Document::new("Hello", "text/plain", Encoding::None),
        )]),
    );
    broker.deliver_message(&original).await.unwrap();

    assert_eq!(broker.next_ack(WAIT).await, Some(AckOutcome::Acked));
    assert!(
        broker.take_message(SHORT_WAIT).await.is_none(),
        "no successor should be sent"
    );

    component.shutdown().await;
}

#[tokio::test]
async fn liveness_probe_bypasses_operator() {
    let invoked = Arc::new(AtomicBool::new(false));
    let broker = MockBroker::new();
    let mut component = Component::consumer(
        broker.clone(),
        1,
        TrackingOperator {
            invoked: invoked.clone(),
        },
    );
    component.run().await.expect("component should run");

    let mut original = two_step_message();
    original
        .metadata
        .insert(LIVENESS_MARKER.to_string(), json!(true));
    broker.deliver_message(&original).await.unwrap();

    let successor = broker
        .take_message(WAIT)
        .await
        .expect("probe should advance");
    assert_eq!(successor.trace_id, original.trace_id);
    assert_eq!(successor.routing.position, 1);
    assert_eq!(broker.next_ack(WAIT).await, Some(AckOutcome::Acked));

    assert!(
        !invoked.load(Ordering::SeqCst),
        "operator must not run for a probe"
    );

    component.shutdown().await;
}

#[tokio::test]
async fn undecodable_delivery_is_rejected_without_requeue() {
    let broker = MockBroker::new();
    let mut component = Component::consumer(
        broker.clone(),
        1,
        AppendDocument {
            name: "test",
            value: "unreached",
        },
    );
    component.run().await.expect("component should run");

    broker
        .deliver_raw(&br#"{"broken"#[..], "corrupt-body")
        .await
        .unwrap();

    assert_eq!(
        broker.next_ack(WAIT).await,
        Some(AckOutcome::Rejected { requeue: false })
    );
    assert!(broker.take_message(SHORT_WAIT).await.is_none());

    component.shutdown().await;
}

#[tokio::test]
async fn out_of_range_position_is_rejected_without_requeue() {
    let broker = MockBroker::new();
    let mut component = Component::consumer(broker.clone(), 1, AlwaysFail);
    component.run().await.expect("component should run");

    let mut original = two_step_message();
    original.routing.position = 5;
    broker.deliver_message(&original).await.unwrap();

    assert_eq!(
        broker.next_ack(WAIT).await,
        Some(AckOutcome::Rejected { requeue: false })
    );

    component.shutdown().await;
}

#[tokio::test]
async fn send_failure_requeues_the_delivery() {
    let broker = MockBroker::with_failing_sends();
    let mut component = Component::consumer(
        broker.clone(),
        1,
        AppendDocument {
            name: "test",
            value: "passed",
        },
    );
    component.run().await.expect("component should run");

    broker.deliver_message(&two_step_message()).await.unwrap();

    assert_eq!(
        broker.next_ack(WAIT).await,
        Some(AckOutcome::Rejected { requeue: true })
    );

    component.shutdown().await;
}

#[tokio::test]
async fn operator_failure_rewinds_with_retry_policy() {
    let broker = MockBroker::new();
    let mut component = Component::consumer(broker.clone(), 1, AlwaysFail);
    component.run().await.expect("component should run");

    let original = Message::new(
        Routing {
            name: "rewind-route".to_string(),
            position: 1,
            slip: vec![
                Step {
                    queue: "fetch".to_string(),
                    ..Step::default()
                },
                Step {
                    queue: "parse".to_string(),
                    error_handling: ErrorHandling {
                        max_retries: 3,
                        attempt: 0,
                        rewind: 1,
                    },
                    ..Step::default()
                },
            ],
        },
        MetaData::from([("origin".to_string(), json!("test"))]),
        Documents::from([(
            "input".to_string(),
            Document::new("Hello", "text/plain", Encoding::None),
        )]),
    );
    broker.deliver_message(&original).await.unwrap();

    let successor = broker
        .take_message(WAIT)
        .await
        .expect("a retry successor should be sent");
    assert_eq!(successor.trace_id, original.trace_id);
    assert_eq!(successor.routing.position, 0);
    assert_eq!(successor.routing.slip[1].error_handling.attempt, 1);
    // failed attempts do not get to change the payload
    assert_eq!(successor.metadata, original.metadata);
    assert_eq!(successor.documents, original.documents);

    assert_eq!(broker.next_ack(WAIT).await, Some(AckOutcome::Acked));

    component.shutdown().await;
}

#[tokio::test]
async fn multiple_workers_process_many_deliveries() {
    let broker = MockBroker::new();
    let mut component = Component::consumer(
        broker.clone(),
        4,
        AppendDocument {
            name: "test",
            value: "passed",
        },
    );
    component.run().await.expect("component should run");

    for _ in 0..8 {
        broker.deliver_message(&two_step_message()).await.unwrap();
    }

    for _ in 0..8 {
        assert!(broker.take_message(WAIT).await.is_some());
        assert_eq!(broker.next_ack(WAIT).await, Some(AckOutcome::Acked));
    }

    component.shutdown().await;
}

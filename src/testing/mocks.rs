//! Mock broker implementation for testing
//!
//! Provides an in-memory [`Broker`] so components can be exercised without a
//! running message broker. Sent messages and settlement outcomes are exposed
//! through observable channels.

use crate::broker::{Acknowledger, Broker, BrokerError, Delivery};
use crate::payload::Message;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

const DELIVERY_CAPACITY: usize = 16;

/// Settlement recorded for one delivery handed out by the mock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    Acked,
    Rejected { requeue: bool },
}

/// In-memory broker for tests. Cloning yields another handle onto the same
/// queues, so a test can keep a handle after moving the broker into a
/// component.
#[derive(Clone)]
pub struct MockBroker {
    inner: Arc<Inner>,
}

struct Inner {
    deliveries_tx: mpsc::Sender<Delivery>,
    deliveries_rx: Mutex<Option<mpsc::Receiver<Delivery>>>,
    sent_tx: mpsc::UnboundedSender<Message>,
    sent_rx: Mutex<mpsc::UnboundedReceiver<Message>>,
    acks_tx: mpsc::UnboundedSender<AckOutcome>,
    acks_rx: Mutex<mpsc::UnboundedReceiver<AckOutcome>>,
    fail_sends: AtomicBool,
}

impl MockBroker {
    pub fn new() -> Self {
        let (deliveries_tx, deliveries_rx) = mpsc::channel(DELIVERY_CAPACITY);
        let (sent_tx, sent_rx) = mpsc::unbounded_channel();
        let (acks_tx, acks_rx) = mpsc::unbounded_channel();

        Self {
            inner: Arc::new(Inner {
                deliveries_tx,
                deliveries_rx: Mutex::new(Some(deliveries_rx)),
                sent_tx,
                sent_rx: Mutex::new(sent_rx),
                acks_tx,
                acks_rx: Mutex::new(acks_rx),
                fail_sends: AtomicBool::new(false),
            }),
        }
    }

    /// A broker whose `send_message` always fails.
    pub fn with_failing_sends() -> Self {
        let broker = Self::new();
        broker.set_fail_sends(true);
        broker
    }

    /// Toggle send failures at runtime.
    pub fn set_fail_sends(&self, fail: bool) {
        self.inner.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Inject a message into the incoming delivery stream.
    pub async fn deliver_message(&self, message: &Message) -> Result<(), BrokerError> {
        let body = serde_json::to_vec(message).map_err(BrokerError::Serialization)?;
        self.deliver_raw(body, message.trace_id.clone()).await
    }

    /// Inject raw bytes into the incoming delivery stream, e.g. a body that
    /// does not decode into a message.
    pub async fn deliver_raw(
        &self,
        body: impl Into<Bytes>,
        correlation_id: impl Into<String>,
    ) -> Result<(), BrokerError> {
        let delivery = Delivery::new(
            body,
            correlation_id,
            Box::new(MockAcknowledger {
                outcomes: self.inner.acks_tx.clone(),
            }),
        );
        self.inner
            .deliveries_tx
            .send(delivery)
            .await
            .map_err(|_| BrokerError::NotConnected)
    }

    /// Pop the next message sent through this broker, waiting up to `wait`.
    pub async fn take_message(&self, wait: Duration) -> Option<Message> {
        let mut sent = self.inner.sent_rx.lock().await;
        tokio::time::timeout(wait, sent.recv()).await.ok().flatten()
    }

    /// Pop the next recorded settlement, waiting up to `wait`.
    pub async fn next_ack(&self, wait: Duration) -> Option<AckOutcome> {
        let mut acks = self.inner.acks_rx.lock().await;
        tokio::time::timeout(wait, acks.recv()).await.ok().flatten()
    }
}

impl Default for MockBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for MockBroker {
    async fn connect(
        &self,
        _prefetch: usize,
    ) -> Result<Option<mpsc::Receiver<Delivery>>, BrokerError> {
        Ok(self.inner.deliveries_rx.lock().await.take())
    }

    async fn send_message(&self, message: &Message) -> Result<(), BrokerError> {
        if self.inner.fail_sends.load(Ordering::SeqCst) {
            return Err(BrokerError::PublishFailed("mock send failure".into()));
        }
        self.inner
            .sent_tx
            .send(message.clone())
            .map_err(|_| BrokerError::NotConnected)
    }

    async fn close(&self) {}
}

struct MockAcknowledger {
    outcomes: mpsc::UnboundedSender<AckOutcome>,
}

#[async_trait]
impl Acknowledger for MockAcknowledger {
    async fn ack(self: Box<Self>) -> Result<(), BrokerError> {
        let _ = self.outcomes.send(AckOutcome::Acked);
        Ok(())
    }

    async fn reject(self: Box<Self>, requeue: bool) -> Result<(), BrokerError> {
        let _ = self.outcomes.send(AckOutcome::Rejected { requeue });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::{Documents, Message, MetaData};

    #[tokio::test]
    async fn delivered_messages_reach_the_stream() {
        let broker = MockBroker::new();
        let mut deliveries = broker.connect(1).await.unwrap().unwrap();

        let message = Message::direct("test", MetaData::new(), Documents::new());
        broker.deliver_message(&message).await.unwrap();

        let delivery = deliveries.recv().await.unwrap();
        assert_eq!(delivery.correlation_id, message.trace_id);

        delivery.ack().await.unwrap();
        assert_eq!(
            broker.next_ack(Duration::from_secs(1)).await,
            Some(AckOutcome::Acked)
        );
    }

    #[tokio::test]
    async fn second_connect_yields_no_stream() {
        let broker = MockBroker::new();
        assert!(broker.connect(1).await.unwrap().is_some());
        assert!(broker.connect(1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn sent_messages_are_observable() {
        let broker = MockBroker::new();
        let message = Message::direct("out", MetaData::new(), Documents::new());
        broker.send_message(&message).await.unwrap();

        let sent = broker.take_message(Duration::from_secs(1)).await.unwrap();
        assert_eq!(sent.trace_id, message.trace_id);
    }

    #[tokio::test]
    async fn failing_sends_report_publish_errors() {
        let broker = MockBroker::with_failing_sends();
        let message = Message::direct("out", MetaData::new(), Documents::new());
        assert!(matches!(
            broker.send_message(&message).await,
            Err(BrokerError::PublishFailed(_))
        ));
    }
}

//! Broker port for routing-slip transport
//!
//! The orchestration layer depends on this interface only: a broker connects
//! into a stream of [`Delivery`] items, publishes messages to the queue named
//! by their current step, and tears down idempotently. The production MQTT
//! adapter lives in [`mqtt`]; a pure in-memory implementation for tests lives
//! in [`crate::testing::mocks`].

use crate::payload::Message;
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use thiserror::Error;
use tokio::sync::mpsc;

pub mod mqtt;

pub use mqtt::MqttBroker;

/// Broker transport errors.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("connection failed")]
    ConnectionFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("publish failed")]
    PublishFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("acknowledgement failed")]
    AckFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("invalid broker URL: {0}")]
    InvalidUrl(String),
    #[error("serialization error")]
    Serialization(#[source] serde_json::Error),
    #[error("not connected")]
    NotConnected,
    #[error("message has no deliverable step: {0}")]
    InvalidDestination(String),
}

/// Transport abstraction over a message broker.
///
/// Implementations must be safe for concurrent use by multiple workers; the
/// receivers are `&self` so one broker handle can be shared across a pool.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Establish connectivity and begin dispatching deliveries.
    ///
    /// `prefetch` bounds how many unacknowledged deliveries the broker hands
    /// out at once. Producer-only connections (no queue bound) succeed but
    /// yield no delivery stream.
    async fn connect(&self, prefetch: usize)
        -> Result<Option<mpsc::Receiver<Delivery>>, BrokerError>;

    /// Publish a message to the queue named by its current step.
    async fn send_message(&self, message: &Message) -> Result<(), BrokerError>;

    /// Tear down all connection resources. Idempotent.
    async fn close(&self);
}

/// Settlement operations for one delivery, implemented per transport.
#[async_trait]
pub trait Acknowledger: Send {
    async fn ack(self: Box<Self>) -> Result<(), BrokerError>;
    async fn reject(self: Box<Self>, requeue: bool) -> Result<(), BrokerError>;
}

/// One unit handed to a worker by the broker.
///
/// Settling consumes the delivery, so a delivery is acknowledged or rejected
/// exactly once.
pub struct Delivery {
    pub body: Bytes,
    pub correlation_id: String,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(
        body: impl Into<Bytes>,
        correlation_id: impl Into<String>,
        acker: Box<dyn Acknowledger>,
    ) -> Self {
        Self {
            body: body.into(),
            correlation_id: correlation_id.into(),
            acker,
        }
    }

    /// Permanently acknowledge the delivery.
    pub async fn ack(self) -> Result<(), BrokerError> {
        self.acker.ack().await
    }

    /// Reject the delivery, optionally asking the broker to redeliver it.
    pub async fn reject(self, requeue: bool) -> Result<(), BrokerError> {
        self.acker.reject(requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("correlation_id", &self.correlation_id)
            .field("body_len", &self.body.len())
            .finish()
    }
}

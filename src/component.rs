//! Component orchestration
//!
//! A [`Component`] couples one broker handle, one [`Operator`], and a pool of
//! worker tasks. Consumer components run workers that process deliveries;
//! producer components carry no workers and only send messages.

use crate::broker::{Broker, BrokerError};
use crate::consumer::Worker;
use crate::error::{ComponentError, ComponentResult};
use crate::payload::{Arguments, Documents, Message, MetaData};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Error returned by an operator; never inspected by the engine, only logged.
pub type OperatorError = Box<dyn std::error::Error + Send + Sync>;

/// Updates an operator hands back after a successful step execution.
///
/// `None` fields leave the corresponding map on the successor untouched.
#[derive(Debug, Default)]
pub struct OperatorOutput {
    pub documents: Option<Documents>,
    pub metadata: Option<MetaData>,
}

impl OperatorOutput {
    /// Advance without touching documents or metadata.
    pub fn unchanged() -> Self {
        Self::default()
    }

    /// Advance with new or replacement documents.
    pub fn with_documents(documents: Documents) -> Self {
        Self {
            documents: Some(documents),
            ..Self::default()
        }
    }

    /// Advance with new or replacement metadata.
    pub fn with_metadata(metadata: MetaData) -> Self {
        Self {
            metadata: Some(metadata),
            ..Self::default()
        }
    }
}

/// User-supplied processing logic, invoked once per non-probe delivery.
///
/// A returned error drives the retry path; the engine never interprets its
/// content.
#[async_trait]
pub trait Operator: Send + Sync {
    async fn process(
        &self,
        trace_id: &str,
        metadata: &MetaData,
        arguments: &Arguments,
        documents: &Documents,
    ) -> Result<OperatorOutput, OperatorError>;
}

/// Broker-backed consumer or producer for routing-slip messages.
pub struct Component<B: Broker + 'static> {
    broker: Arc<B>,
    operator: Option<Arc<dyn Operator>>,
    workers: usize,
    prefetch: usize,
    shutdown: Option<watch::Sender<bool>>,
    handles: Vec<JoinHandle<()>>,
    active_workers: Arc<AtomicUsize>,
}

impl<B: Broker + 'static> Component<B> {
    /// Create a consumer component: `workers` loops around one operator.
    pub fn consumer(broker: B, workers: usize, operator: impl Operator + 'static) -> Self {
        Self {
            broker: Arc::new(broker),
            operator: Some(Arc::new(operator)),
            workers,
            prefetch: workers.max(1),
            shutdown: None,
            handles: Vec::new(),
            active_workers: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Create a producer component: no workers, send-only.
    pub fn producer(broker: B) -> Self {
        Self {
            broker: Arc::new(broker),
            operator: None,
            workers: 0,
            prefetch: 0,
            shutdown: None,
            handles: Vec::new(),
            active_workers: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Override the prefetch window (defaults to the worker count).
    pub fn with_prefetch(mut self, prefetch: usize) -> Self {
        self.prefetch = prefetch;
        self
    }

    /// The shared broker handle.
    pub fn broker(&self) -> &Arc<B> {
        &self.broker
    }

    /// Number of worker loops currently executing.
    pub fn active_workers(&self) -> usize {
        self.active_workers.load(Ordering::SeqCst)
    }

    /// Open the broker connection without launching workers. Producer use.
    pub async fn connect(&self) -> ComponentResult<()> {
        self.broker
            .connect(self.prefetch)
            .await
            .map_err(ComponentError::Connect)?;
        Ok(())
    }

    /// Validate preconditions, connect to the broker, and launch the worker
    /// pool. Fails before launching any worker if the connection cannot be
    /// established; a failed connection is closed before returning.
    pub async fn run(&mut self) -> ComponentResult<()> {
        let operator = self
            .operator
            .clone()
            .ok_or(ComponentError::MissingOperator)?;
        if self.workers < 1 {
            return Err(ComponentError::NoWorkers);
        }

        let stream = match self.broker.connect(self.prefetch).await {
            Ok(stream) => stream,
            Err(err) => {
                self.broker.close().await;
                return Err(ComponentError::Connect(err));
            }
        };
        let Some(deliveries) = stream else {
            self.broker.close().await;
            return Err(ComponentError::NoDeliveryStream);
        };

        info!(workers = self.workers, "broker connected, launching workers");

        let deliveries = Arc::new(Mutex::new(deliveries));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        for id in 0..self.workers {
            let worker = Worker::new(
                id,
                self.broker.clone(),
                operator.clone(),
                self.active_workers.clone(),
            );
            self.handles
                .push(tokio::spawn(worker.run(deliveries.clone(), shutdown_rx.clone())));
        }

        self.shutdown = Some(shutdown_tx);
        Ok(())
    }

    /// Signal all workers to stop, wait for each to exit, then close the
    /// broker. A no-op when the component is not running, so it is safe to
    /// call repeatedly or before [`Component::run`].
    pub async fn shutdown(&mut self) {
        let Some(shutdown) = self.shutdown.take() else {
            return;
        };

        info!("shutting down component");
        let _ = shutdown.send(true);

        for handle in self.handles.drain(..) {
            if let Err(err) = handle.await {
                error!(error = %err, "worker task aborted");
            }
        }

        self.broker.close().await;
        info!("component stopped");
    }

    /// Close the broker connection. Producer counterpart to
    /// [`Component::shutdown`].
    pub async fn close(&self) {
        self.broker.close().await;
    }

    /// Publish a message to the queue named by its current step.
    pub async fn send_message(&self, message: &Message) -> Result<(), BrokerError> {
        self.broker.send_message(message).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operator_output_constructors() {
        let output = OperatorOutput::unchanged();
        assert!(output.documents.is_none());
        assert!(output.metadata.is_none());

        let output = OperatorOutput::with_documents(Documents::new());
        assert!(output.documents.is_some());
        assert!(output.metadata.is_none());

        let output = OperatorOutput::with_metadata(MetaData::new());
        assert!(output.documents.is_none());
        assert!(output.metadata.is_some());
    }
}

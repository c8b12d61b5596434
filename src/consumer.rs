//! Consumer worker loop
//!
//! Each worker races the shared cancellation signal against the shared
//! delivery stream, cancellation winning when both are ready. A delivery that
//! was already pulled is always handled to completion: decoded, dispatched
//! through the operator, advanced or retried, and settled against the broker
//! before the loop re-checks cancellation.

use crate::broker::{Broker, BrokerError, Delivery};
use crate::component::Operator;
use crate::payload::{Message, MessageError};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, error, warn};

/// Metadata key marking a liveness probe. Probe messages bypass the operator
/// and advance as if the step succeeded with no updates.
pub const LIVENESS_MARKER: &str = "ping";

/// One worker loop of a consumer component.
pub(crate) struct Worker<B: Broker + 'static> {
    id: usize,
    broker: Arc<B>,
    operator: Arc<dyn Operator>,
    active: Arc<AtomicUsize>,
}

impl<B: Broker + 'static> Worker<B> {
    pub(crate) fn new(
        id: usize,
        broker: Arc<B>,
        operator: Arc<dyn Operator>,
        active: Arc<AtomicUsize>,
    ) -> Self {
        Self {
            id,
            broker,
            operator,
            active,
        }
    }

    /// Control loop: RUNNING until the shutdown signal fires or the delivery
    /// stream closes.
    pub(crate) async fn run(
        self,
        deliveries: Arc<Mutex<mpsc::Receiver<Delivery>>>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        self.active.fetch_add(1, Ordering::SeqCst);
        debug!(worker = self.id, "worker started");

        loop {
            let delivery = tokio::select! {
                // cancellation wins over a simultaneously-available delivery
                biased;

                _ = shutdown.changed() => break,

                received = next_delivery(&deliveries) => match received {
                    Some(delivery) => delivery,
                    None => break,
                },
            };

            self.handle_delivery(delivery).await;
        }

        debug!(worker = self.id, "worker stopped");
        self.active.fetch_sub(1, Ordering::SeqCst);
    }

    /// Process one delivery end to end and settle it.
    ///
    /// Settlement discipline: acknowledge only once a successor was sent or a
    /// terminal decision is certain; reject with requeue when the outbound
    /// hop failed but the inbound delivery is still valid; reject without
    /// requeue when no amount of redelivery can help.
    async fn handle_delivery(&self, delivery: Delivery) {
        let message = match Message::from_bytes(&delivery.body) {
            Ok(message) => message,
            Err(err) => {
                error!(
                    worker = self.id,
                    correlation_id = %delivery.correlation_id,
                    error = %err,
                    "undecodable delivery, rejecting"
                );
                settle(delivery.reject(false)).await;
                return;
            }
        };

        let step = match message.current_step() {
            Ok(step) => step.clone(),
            Err(err) => {
                error!(
                    worker = self.id,
                    trace_id = %message.trace_id,
                    error = %err,
                    "delivery carries an unusable routing slip, rejecting"
                );
                settle(delivery.reject(false)).await;
                return;
            }
        };

        let outcome: Result<Option<Message>, MessageError> =
            if message.metadata.contains_key(LIVENESS_MARKER) {
                debug!(
                    worker = self.id,
                    trace_id = %message.trace_id,
                    "liveness probe, bypassing operator"
                );
                message.advance(None, None)
            } else {
                match self
                    .operator
                    .process(
                        &message.trace_id,
                        &message.metadata,
                        &step.arguments,
                        &message.documents,
                    )
                    .await
                {
                    Ok(output) => message.advance(output.documents, output.metadata),
                    Err(cause) => {
                        warn!(
                            worker = self.id,
                            trace_id = %message.trace_id,
                            error = %cause,
                            "operator failed, consulting retry policy"
                        );
                        match message.retry() {
                            Ok(successor) => Ok(successor),
                            Err(err) => {
                                // no further retry can be built for an
                                // already-invalid route
                                error!(
                                    worker = self.id,
                                    trace_id = %message.trace_id,
                                    error = %err,
                                    "retry not possible, dropping message"
                                );
                                Ok(None)
                            }
                        }
                    }
                }
            };

        match outcome {
            Err(err) => {
                error!(
                    worker = self.id,
                    trace_id = %message.trace_id,
                    error = %err,
                    "corrupt routing state, rejecting"
                );
                settle(delivery.reject(false)).await;
            }
            Ok(None) => settle(delivery.ack()).await,
            Ok(Some(successor)) => match self.broker.send_message(&successor).await {
                Ok(()) => settle(delivery.ack()).await,
                Err(err) => {
                    warn!(
                        worker = self.id,
                        trace_id = %successor.trace_id,
                        error = %err,
                        "failed to forward successor, requeueing delivery"
                    );
                    settle(delivery.reject(true)).await;
                }
            },
        }
    }
}

async fn next_delivery(deliveries: &Arc<Mutex<mpsc::Receiver<Delivery>>>) -> Option<Delivery> {
    deliveries.lock().await.recv().await
}

async fn settle<F>(operation: F)
where
    F: Future<Output = Result<(), BrokerError>>,
{
    if let Err(err) = operation.await {
        error!(error = %err, "failed to settle delivery");
    }
}

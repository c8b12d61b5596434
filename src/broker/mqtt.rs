//! MQTT broker adapter
//!
//! Production transport built on rumqttc with manual acknowledgements. Each
//! routing-slip queue maps onto an MQTT topic; messages travel as JSON with
//! the trace id in the v5 correlation-data property.
//!
//! MQTT has no broker-side negative acknowledgement, so rejecting a delivery
//! with `requeue` republishes the payload to its topic before settling the
//! original.

use crate::broker::{Acknowledger, Broker, BrokerError, Delivery};
use crate::config::BrokerSection;
use crate::payload::Message;
use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::v5::mqttbytes::v5::{Packet, Publish, PublishProperties};
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::{AsyncClient, Event, EventLoop, MqttOptions};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use url::Url;
use uuid::Uuid;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const RECONNECT_DELAY: Duration = Duration::from_millis(250);
const KEEP_ALIVE: Duration = Duration::from_secs(60);

/// Link state reported by the event-loop task.
#[derive(Debug, Clone, PartialEq)]
enum LinkState {
    Connecting,
    Connected,
    Lost(String),
}

/// MQTT implementation of the [`Broker`] port.
pub struct MqttBroker {
    section: BrokerSection,
    state: Mutex<ConnectionHandle>,
}

#[derive(Default)]
struct ConnectionHandle {
    client: Option<AsyncClient>,
    event_loop: Option<JoinHandle<()>>,
    shutdown: Option<watch::Sender<bool>>,
}

impl MqttBroker {
    /// Create a broker handle ready to connect. Consumers bind the queue
    /// named in the configuration section; a section without a queue is a
    /// producer-only handle.
    pub fn new(section: BrokerSection) -> Self {
        Self {
            section,
            state: Mutex::new(ConnectionHandle::default()),
        }
    }

    async fn teardown(state: &mut ConnectionHandle) {
        if let Some(client) = state.client.take() {
            let _ = client.disconnect().await;
        }
        if let Some(shutdown) = state.shutdown.take() {
            let _ = shutdown.send(true);
        }
        if let Some(handle) = state.event_loop.take() {
            let _ = handle.await;
        }
    }
}

#[async_trait]
impl Broker for MqttBroker {
    async fn connect(
        &self,
        prefetch: usize,
    ) -> Result<Option<mpsc::Receiver<Delivery>>, BrokerError> {
        let mut state = self.state.lock().await;
        Self::teardown(&mut state).await;

        let client_id = format!(
            "waybill-{}-{}",
            self.section.queue.as_deref().unwrap_or("producer"),
            Uuid::new_v4().simple()
        );
        let options = configure_mqtt_options(&client_id, &self.section)?;

        let (client, event_loop) = AsyncClient::new(options, prefetch.max(10));
        let (state_tx, state_rx) = watch::channel(LinkState::Connecting);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let (deliveries_tx, deliveries_rx) = match &self.section.queue {
            Some(queue) => {
                client
                    .subscribe(queue.clone(), QoS::AtLeastOnce)
                    .await
                    .map_err(|err| BrokerError::ConnectionFailed(Box::new(err)))?;
                let (tx, rx) = mpsc::channel(prefetch.max(1));
                (Some(tx), Some(rx))
            }
            None => (None, None),
        };

        let handle = tokio::spawn(drive_event_loop(
            event_loop,
            client.clone(),
            state_tx,
            shutdown_rx,
            deliveries_tx,
        ));

        if let Err(err) = wait_until_connected(state_rx, CONNECT_TIMEOUT).await {
            let _ = shutdown_tx.send(true);
            let _ = handle.await;
            return Err(err);
        }

        state.client = Some(client);
        state.event_loop = Some(handle);
        state.shutdown = Some(shutdown_tx);

        Ok(deliveries_rx)
    }

    async fn send_message(&self, message: &Message) -> Result<(), BrokerError> {
        let client = self
            .state
            .lock()
            .await
            .client
            .clone()
            .ok_or(BrokerError::NotConnected)?;

        let step = message
            .current_step()
            .map_err(|err| BrokerError::InvalidDestination(err.to_string()))?;
        let body = serde_json::to_vec(message).map_err(BrokerError::Serialization)?;

        let properties = PublishProperties {
            correlation_data: Some(Bytes::from(message.trace_id.clone().into_bytes())),
            content_type: Some("application/json".to_string()),
            ..PublishProperties::default()
        };

        client
            .publish_with_properties(step.queue.clone(), QoS::AtLeastOnce, false, body, properties)
            .await
            .map_err(|err| BrokerError::PublishFailed(Box::new(err)))
    }

    async fn close(&self) {
        let mut state = self.state.lock().await;
        Self::teardown(&mut state).await;
    }
}

/// Poll the event loop, routing ConnAck into the link-state watch and
/// inbound publishes into the delivery stream, until shut down.
async fn drive_event_loop(
    mut event_loop: EventLoop,
    client: AsyncClient,
    state_tx: watch::Sender<LinkState>,
    mut shutdown_rx: watch::Receiver<bool>,
    deliveries_tx: Option<mpsc::Sender<Delivery>>,
) {
    let mut connected_once = false;

    loop {
        tokio::select! {
            biased;

            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    debug!("event loop shutting down");
                    break;
                }
            }

            polled = event_loop.poll() => match polled {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    connected_once = true;
                    debug!("broker connection acknowledged");
                    let _ = state_tx.send(LinkState::Connected);
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    if let Some(tx) = &deliveries_tx {
                        let delivery = delivery_from_publish(&client, publish);
                        if tx.send(delivery).await.is_err() {
                            debug!("delivery stream dropped, stopping event loop");
                            break;
                        }
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    if !connected_once {
                        let _ = state_tx.send(LinkState::Lost(err.to_string()));
                        break;
                    }
                    warn!(error = %err, "broker connection error, retrying");
                    tokio::time::sleep(RECONNECT_DELAY).await;
                }
            }
        }
    }
}

/// Block until the first ConnAck, or fail on a lost link or timeout.
async fn wait_until_connected(
    mut state_rx: watch::Receiver<LinkState>,
    timeout: Duration,
) -> Result<(), BrokerError> {
    let wait = tokio::time::timeout(timeout, async {
        loop {
            match state_rx.borrow_and_update().clone() {
                LinkState::Connected => return Ok(()),
                LinkState::Lost(reason) => {
                    return Err(BrokerError::ConnectionFailed(reason.into()));
                }
                LinkState::Connecting => {}
            }
            if state_rx.changed().await.is_err() {
                return Err(BrokerError::ConnectionFailed(
                    "event loop terminated".into(),
                ));
            }
        }
    })
    .await;

    match wait {
        Ok(result) => result,
        Err(_) => Err(BrokerError::ConnectionFailed(
            "timed out waiting for broker acknowledgement".into(),
        )),
    }
}

fn delivery_from_publish(client: &AsyncClient, publish: Publish) -> Delivery {
    let correlation_id = publish
        .properties
        .as_ref()
        .and_then(|properties| properties.correlation_data.as_ref())
        .map(|data| String::from_utf8_lossy(data).into_owned())
        .unwrap_or_default();

    Delivery::new(
        publish.payload.clone(),
        correlation_id,
        Box::new(MqttAcknowledger {
            client: client.clone(),
            publish,
        }),
    )
}

struct MqttAcknowledger {
    client: AsyncClient,
    publish: Publish,
}

#[async_trait]
impl Acknowledger for MqttAcknowledger {
    async fn ack(self: Box<Self>) -> Result<(), BrokerError> {
        self.client
            .ack(&self.publish)
            .await
            .map_err(|err| BrokerError::AckFailed(Box::new(err)))
    }

    async fn reject(self: Box<Self>, requeue: bool) -> Result<(), BrokerError> {
        if requeue {
            let topic = String::from_utf8_lossy(&self.publish.topic).into_owned();
            let properties = self.publish.properties.clone().unwrap_or_default();
            self.client
                .publish_with_properties(
                    topic,
                    QoS::AtLeastOnce,
                    false,
                    self.publish.payload.clone(),
                    properties,
                )
                .await
                .map_err(|err| BrokerError::PublishFailed(Box::new(err)))?;
        }
        self.client
            .ack(&self.publish)
            .await
            .map_err(|err| BrokerError::AckFailed(Box::new(err)))
    }
}

/// Parsed broker endpoint: host, port, and whether to wrap in TLS.
#[derive(Debug, Clone, PartialEq, Eq)]
struct BrokerEndpoint {
    host: String,
    port: u16,
    tls: bool,
}

/// Parse and validate a broker URL. Only `mqtt` and `mqtts` schemes are
/// accepted, defaulting to ports 1883 and 8883 respectively.
fn parse_broker_url(broker_url: &str) -> Result<BrokerEndpoint, BrokerError> {
    let url =
        Url::parse(broker_url).map_err(|_| BrokerError::InvalidUrl(broker_url.to_string()))?;

    let tls = match url.scheme() {
        "mqtt" => false,
        "mqtts" => true,
        _ => return Err(BrokerError::InvalidUrl(broker_url.to_string())),
    };

    let host = url
        .host_str()
        .ok_or_else(|| BrokerError::InvalidUrl(broker_url.to_string()))?
        .to_string();
    let port = url.port().unwrap_or(if tls { 8883 } else { 1883 });

    Ok(BrokerEndpoint { host, port, tls })
}

/// Build rumqttc options from the broker section. Credentials are resolved
/// from the configured environment variables at connect time.
fn configure_mqtt_options(
    client_id: &str,
    section: &BrokerSection,
) -> Result<MqttOptions, BrokerError> {
    let endpoint = parse_broker_url(&section.broker_url)?;

    let mut options = MqttOptions::new(client_id, endpoint.host, endpoint.port);

    if endpoint.tls {
        options.set_transport(rumqttc::Transport::tls_with_default_config());
    }

    if let Some(username) = section.username() {
        options.set_credentials(username, section.password().unwrap_or_default());
    }

    options.set_keep_alive(KEEP_ALIVE);
    // settlement is driven by the worker loop, not the event loop
    options.set_manual_acks(true);
    options.set_max_packet_size(Some(256 * 1024));

    Ok(options)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_parses_host_and_port() {
        let endpoint = parse_broker_url("mqtt://broker.local:2883").unwrap();
        assert_eq!(
            endpoint,
            BrokerEndpoint {
                host: "broker.local".to_string(),
                port: 2883,
                tls: false,
            }
        );
    }

    #[test]
    fn endpoint_defaults_port_per_scheme() {
        assert_eq!(parse_broker_url("mqtt://broker.local").unwrap().port, 1883);

        let endpoint = parse_broker_url("mqtts://broker.local").unwrap();
        assert_eq!(endpoint.port, 8883);
        assert!(endpoint.tls);
    }

    #[test]
    fn endpoint_rejects_unparseable_url() {
        assert!(matches!(
            parse_broker_url("not a url"),
            Err(BrokerError::InvalidUrl(_))
        ));
    }

    #[test]
    fn endpoint_rejects_foreign_scheme() {
        assert!(matches!(
            parse_broker_url("amqp://broker.local:5672"),
            Err(BrokerError::InvalidUrl(_))
        ));
    }
}

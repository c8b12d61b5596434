//! Waybill - routing-slip message processing
//!
//! A library for building pipelines of independent worker processes that
//! cooperate through a message broker. Every message carries its own
//! itinerary (the routing slip), its payload documents, and a per-step retry
//! policy; each hop executes one step and forwards the result to the next
//! queue.
//!
//! # Overview
//!
//! - [`payload`] - the self-describing message: documents, metadata, routing
//!   slip, and the advance/retry state machine
//! - [`broker`] - the transport port plus the MQTT production adapter
//! - [`component`] - worker-pool orchestration around a user-supplied
//!   [`Operator`](component::Operator)
//! - [`consumer`] - the per-worker receive/dispatch/acknowledge loop
//! - [`testing`] - an in-memory broker for exercising components in tests
//!
//! Delivery semantics are at-least-once: a delivery is only acknowledged
//! once its successor has been handed to the broker or a terminal decision
//! (route finished, retries exhausted, unparseable body) is certain.
//!
//! # Quick Start
//!
//! ```rust
//! use waybill::payload::{Document, Documents, Encoding, Message, MetaData, Routing, Step};
//!
//! let message = Message::new(
//!     Routing {
//!         name: "thumbnailer".to_string(),
//!         position: 0,
//!         slip: vec![
//!             Step { queue: "fetch".to_string(), ..Step::default() },
//!             Step { queue: "resize".to_string(), ..Step::default() },
//!         ],
//!     },
//!     MetaData::new(),
//!     Documents::from([(
//!         "source".to_string(),
//!         Document::new("https://example.org/cat.png", "text/plain", Encoding::None),
//!     )]),
//! );
//!
//! // A successful step produces a successor one position further along,
//! // with the same trace id and slip.
//! let successor = message.advance(None, None).unwrap().expect("route not finished");
//! assert_eq!(successor.routing.position, 1);
//! assert_eq!(successor.trace_id, message.trace_id);
//! ```

pub mod broker;
pub mod component;
pub mod config;
pub mod consumer;
pub mod error;
pub mod observability;
pub mod payload;
pub mod testing;

pub use broker::{Acknowledger, Broker, BrokerError, Delivery, MqttBroker};
pub use component::{Component, Operator, OperatorError, OperatorOutput};
pub use config::{BrokerSection, ComponentConfig, ConfigError, PoolSection};
pub use consumer::LIVENESS_MARKER;
pub use error::{ComponentError, ComponentResult};
pub use payload::{
    Arguments, Document, Documents, Encoding, ErrorHandling, Message, MessageError, MetaData,
    Routing, Step,
};

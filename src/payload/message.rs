//! Routing-slip message model and state machine
//!
//! A [`Message`] carries its own itinerary: an ordered slip of [`Step`]s with
//! a current position, a globally unique trace id, free-form metadata, and a
//! set of named documents. [`Message::advance`] and [`Message::retry`] are
//! the only state transitions; both return a fresh value with a deep-copied
//! slip so no routing state is ever shared between processing attempts.

use crate::payload::document::Documents;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Key-value arguments specific to a single step.
pub type Arguments = HashMap<String, Value>;

/// Key-value pairs describing the message as a whole.
pub type MetaData = HashMap<String, Value>;

/// Errors produced by the message state machine.
#[derive(Debug, Error)]
pub enum MessageError {
    #[error("invalid routing position {position} of {len}")]
    InvalidPosition { position: i32, len: usize },
    #[error("malformed message body")]
    Malformed(#[source] serde_json::Error),
}

/// Retry and rewind policy local to one step.
///
/// `attempt` counts how often this step has been retried so far; it is only
/// ever bumped on the slip copy carried by a successor message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorHandling {
    #[serde(default)]
    pub max_retries: i32,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub attempt: i32,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub rewind: i32,
}

impl ErrorHandling {
    fn is_default(&self) -> bool {
        self.max_retries == 0 && self.attempt == 0 && self.rewind == 0
    }
}

/// A single hop in a routing slip: destination queue, step arguments, and
/// this step's own error-handling policy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub queue: String,
    #[serde(default, skip_serializing_if = "Arguments::is_empty")]
    pub arguments: Arguments,
    #[serde(
        rename = "on_error",
        default,
        skip_serializing_if = "ErrorHandling::is_default"
    )]
    pub error_handling: ErrorHandling,
}

/// The itinerary: route name, ordered slip of steps, and current position.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Routing {
    pub name: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub position: i32,
    pub slip: Vec<Step>,
}

/// A self-describing pipeline message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub routing: Routing,
    pub trace_id: String,
    #[serde(default, skip_serializing_if = "MetaData::is_empty")]
    pub metadata: MetaData,
    #[serde(default, skip_serializing_if = "Documents::is_empty")]
    pub documents: Documents,
}

fn is_zero(value: &i32) -> bool {
    *value == 0
}

impl Message {
    /// Create a message with a fresh trace id for the given route.
    pub fn new(routing: Routing, metadata: MetaData, documents: Documents) -> Self {
        Self {
            routing,
            trace_id: Uuid::new_v4().to_string(),
            metadata,
            documents,
        }
    }

    /// Create a message with a fresh trace id and a single-step slip
    /// targeting the named queue.
    pub fn direct(queue: impl Into<String>, metadata: MetaData, documents: Documents) -> Self {
        let queue = queue.into();
        Self::new(
            Routing {
                name: queue.clone(),
                position: 0,
                slip: vec![Step {
                    queue,
                    ..Step::default()
                }],
            },
            metadata,
            documents,
        )
    }

    /// Decode a message from its JSON wire form.
    pub fn from_bytes(body: &[u8]) -> Result<Self, MessageError> {
        serde_json::from_slice(body).map_err(MessageError::Malformed)
    }

    /// The step at the current routing position.
    pub fn current_step(&self) -> Result<&Step, MessageError> {
        let len = self.routing.slip.len();
        if self.routing.position < 0 || self.routing.position as usize >= len {
            return Err(MessageError::InvalidPosition {
                position: self.routing.position,
                len,
            });
        }
        Ok(&self.routing.slip[self.routing.position as usize])
    }

    /// Successor message after a successful step execution.
    ///
    /// Returns `Ok(None)` when the slip is exhausted: the route finished and
    /// there is nothing left to send. Optional document and metadata updates
    /// are shallow-merged over the current maps, update keys winning.
    pub fn advance(
        &self,
        documents: Option<Documents>,
        metadata: Option<MetaData>,
    ) -> Result<Option<Message>, MessageError> {
        let len = self.routing.slip.len();
        if self.routing.position < 0 {
            return Err(MessageError::InvalidPosition {
                position: self.routing.position,
                len,
            });
        }

        let next = self.routing.position + 1;
        if next as usize >= len {
            info!(trace_id = %self.trace_id, steps = len, "route finished");
            return Ok(None);
        }

        debug!(trace_id = %self.trace_id, step = next + 1, of = len, "advancing route");

        Ok(Some(Message {
            routing: Routing {
                name: self.routing.name.clone(),
                position: next,
                slip: self.routing.slip.clone(),
            },
            trace_id: self.trace_id.clone(),
            metadata: self.merged_metadata(metadata),
            documents: self.merged_documents(documents),
        }))
    }

    /// Successor message after a failed step execution, governed by the
    /// current step's [`ErrorHandling`] policy.
    ///
    /// Returns `Ok(None)` when retries are exhausted or the policy is
    /// unusable (negative rewind, rewind past the start of the slip); these
    /// are deliberate drops, not errors. The successor carries the attempt
    /// counter bump on its own slip copy; metadata and documents travel
    /// unchanged.
    pub fn retry(&self) -> Result<Option<Message>, MessageError> {
        let step = self.current_step()?;
        let policy = &step.error_handling;

        if policy.attempt >= policy.max_retries {
            info!(
                trace_id = %self.trace_id,
                attempt = policy.attempt + 1,
                max_retries = policy.max_retries,
                "retries exhausted, dropping message"
            );
            return Ok(None);
        }

        if policy.rewind < 0 {
            warn!(
                trace_id = %self.trace_id,
                rewind = policy.rewind,
                "negative rewind in retry policy, dropping message"
            );
            return Ok(None);
        }

        let target = self.routing.position - policy.rewind;
        if target < 0 {
            warn!(
                trace_id = %self.trace_id,
                position = self.routing.position,
                rewind = policy.rewind,
                "rewind crosses the start of the slip, dropping message"
            );
            return Ok(None);
        }

        debug!(
            trace_id = %self.trace_id,
            step = target + 1,
            of = self.routing.slip.len(),
            "retrying route"
        );

        let mut slip = self.routing.slip.clone();
        slip[self.routing.position as usize].error_handling.attempt += 1;

        Ok(Some(Message {
            routing: Routing {
                name: self.routing.name.clone(),
                position: target,
                slip,
            },
            trace_id: self.trace_id.clone(),
            metadata: self.metadata.clone(),
            documents: self.documents.clone(),
        }))
    }

    fn merged_metadata(&self, update: Option<MetaData>) -> MetaData {
        match update {
            None => self.metadata.clone(),
            Some(update) => {
                let mut merged = self.metadata.clone();
                merged.extend(update);
                merged
            }
        }
    }

    fn merged_documents(&self, update: Option<Documents>) -> Documents {
        match update {
            None => self.documents.clone(),
            Some(update) => {
                let mut merged = self.documents.clone();
                merged.extend(update);
                merged
            }
        }
    }
}

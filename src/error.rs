//! Component-level error types

use crate::broker::BrokerError;
use thiserror::Error;

/// Errors raised by [`crate::component::Component`] orchestration.
///
/// Precondition violations surface before the broker is touched; connection
/// failures are returned after the broker handle has been closed again.
#[derive(Debug, Error)]
pub enum ComponentError {
    #[error("cannot run without an operator")]
    MissingOperator,
    #[error("cannot run without workers")]
    NoWorkers,
    #[error("failed to connect to broker")]
    Connect(#[source] BrokerError),
    #[error("broker yielded no delivery stream")]
    NoDeliveryStream,
}

/// Result type for component operations.
pub type ComponentResult<T> = Result<T, ComponentError>;

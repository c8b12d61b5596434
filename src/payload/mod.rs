//! Message payload model
//!
//! The data carried by every pipeline hop: named, optionally-encoded
//! documents plus the routing-slip message wrapping them.

pub mod document;
pub mod message;

pub use document::{Document, DocumentWriter, Documents, Encoding};
pub use message::{
    Arguments, ErrorHandling, Message, MessageError, MetaData, Routing, Step,
};

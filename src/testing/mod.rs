//! Testing utilities

pub mod mocks;

pub use mocks::{AckOutcome, MockBroker};

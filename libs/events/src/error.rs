//! Error types for event handling.

use pulse_id::WatchId;
use thiserror::Error;

use crate::bill::BillOptsError;

/// Errors that can occur when handling events.
#[derive(Debug, Error, Clone)]
pub enum EventError {
    /// A subscription or query request is malformed.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The event type is unknown.
    #[error("unknown event type: {0}")]
    UnknownEventType(String),

    /// The event action is unknown.
    #[error("unknown event action: {0}")]
    UnknownAction(String),

    /// The event payload is invalid.
    #[error("invalid event payload: {0}")]
    InvalidPayload(String),

    /// A retention override could not be parsed.
    #[error("invalid retention policy: {0}")]
    InvalidRetention(String),

    /// No live subscription is registered under this id.
    #[error("no active watch with id {0}")]
    WatchNotFound(WatchId),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for EventError {
    fn from(err: serde_json::Error) -> Self {
        EventError::Serialization(err.to_string())
    }
}

impl From<BillOptsError> for EventError {
    fn from(err: BillOptsError) -> Self {
        EventError::InvalidPayload(err.to_string())
    }
}

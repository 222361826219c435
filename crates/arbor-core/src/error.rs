//! Error types for the Arbor overlay

use thiserror::Error;

use crate::ConnectionId;

/// Core Arbor errors
#[derive(Error, Debug)]
pub enum ArborError {
    // Wire errors
    #[error("Invalid wire format: {0}")]
    InvalidWireFormat(String),

    #[error("Line too long: limit {limit}, got {actual}")]
    LineTooLong { limit: usize, actual: usize },

    // Connection errors
    #[error("Unknown connection: {0}")]
    UnknownConnection(ConnectionId),

    #[error("Connection closed: {0}")]
    ConnectionClosed(ConnectionId),

    // Transport errors
    #[error("Transport error: {0}")]
    TransportError(String),

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // Runtime errors
    #[error("Event queue closed")]
    QueueClosed,
}

impl From<std::io::Error> for ArborError {
    fn from(e: std::io::Error) -> Self {
        ArborError::TransportError(e.to_string())
    }
}

/// Result type for Arbor operations
pub type ArborResult<T> = Result<T, ArborError>;

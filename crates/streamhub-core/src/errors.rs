//! Error taxonomy for the hub.
//!
//! - [`TransportError`]: the outbound handle of a connection is gone or saturated.
//!   Always recovered locally by treating the connection as disconnected.
//! - [`FrameError`]: a client sent something that is not a usable control frame.
//! - [`FetchError`]: a data producer failed; logged and retried on the next tick.
//! - [`RegistryError`]: contract violations on the connection registry, fatal to
//!   the offending call only.

use thiserror::Error;

use crate::ids::ConnectionId;

/// Failure to hand a frame to a connection's transport.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The transport was released or its writer has gone away.
    #[error("transport closed")]
    Closed,
    /// The outbound queue is full; this frame was dropped.
    #[error("send queue full")]
    Full,
    /// The underlying socket reported an error.
    #[error("transport I/O error: {0}")]
    Io(String),
}

/// A client frame that could not be interpreted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// The text is not JSON at all.
    #[error("Invalid JSON format")]
    InvalidJson,
    /// Valid JSON, but not a recognized control frame shape.
    #[error("unrecognized frame: {0}")]
    Unrecognized(String),
}

/// Failure reported by a data producer.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The backing data source cannot be reached right now.
    #[error("data source unavailable: {0}")]
    Unavailable(String),
    /// The query or computation failed.
    #[error("fetch failed: {message}")]
    Failed {
        /// Human-readable reason.
        message: String,
    },
    /// The produced value could not be converted to JSON.
    #[error("failed to serialize payload: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl FetchError {
    /// Shorthand for [`FetchError::Failed`].
    #[must_use]
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
        }
    }
}

/// Registry contract violations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// An id was registered twice.
    #[error("connection {0} is already registered")]
    DuplicateConnection(ConnectionId),
    /// The id is not (or no longer) registered.
    #[error("connection {0} is not registered")]
    UnknownConnection(ConnectionId),
    /// The hub is at its connection limit.
    #[error("connection limit of {limit} reached")]
    CapacityExceeded {
        /// Configured maximum.
        limit: usize,
    },
}

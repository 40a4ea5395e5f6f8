//! Error types for the devhub library.

use thiserror::Error;

use crate::types::{DeviceManagerId, DevicePrefix};

/// The main error type for devhub operations.
#[derive(Debug, Error)]
pub enum Error {
    /// ZeroMQ socket error.
    #[error("zmq error: {0}")]
    Zmq(#[from] zmq::Error),

    /// JSON encoding error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Protocol error reported by the remote side.
    #[error("protocol error: {message}")]
    Protocol { message: String },

    /// Request timed out waiting for a correlated reply.
    #[error("request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// Unknown protocol prefix name or raw value.
    #[error("unknown device prefix: {0}")]
    UnknownPrefix(String),

    /// Malformed identity string (device manager id, device id, module id).
    #[error("invalid identity: {0}")]
    InvalidIdentity(String),

    /// Device manager id not present in the registry.
    #[error("device manager {0} is not registered")]
    NotRegistered(DeviceManagerId),

    /// All 256 idents for a prefix are taken.
    #[error("maximum number of device managers reached for prefix {0}")]
    ManagerTableFull(DevicePrefix),

    /// Internal channel closed (receiver dropped).
    #[error("channel closed")]
    ChannelClosed,
}

/// Result type alias for devhub operations.
pub type Result<T> = std::result::Result<T, Error>;

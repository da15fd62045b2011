//! Error types for the FleetView environment abstraction.

use thiserror::Error;

/// Errors that can occur in the environment abstraction layer.
#[derive(Debug, Error)]
pub enum EnvError {
    /// Socket-level failure (refused, reset, DNS, ...)
    #[error("Transport error: {0}")]
    Transport(String),

    /// The server reported a failure frame
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The connection handshake was rejected
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// Operation attempted on a closed connection
    #[error("Connection closed")]
    Closed,

    /// Frame serialization/deserialization failed
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Operation timed out
    #[error("Timeout after {0}ms")]
    Timeout(u64),
}

impl EnvError {
    /// Creates a transport error.
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Creates a protocol error.
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }
}

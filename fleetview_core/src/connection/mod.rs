//! Streaming connection lifecycle.
//!
//! Split in two, like every engine in this crate:
//! - [`ConnectionMachine`]: pure state machine. Takes requests, transport
//!   events and timer expiries; returns [`Command`]s. No I/O, no clock.
//! - [`ConnectionManager`]: async driver that executes those commands against
//!   a [`StreamTransport`](fleetview_env::StreamTransport), runs merges and
//!   publishes results through `watch` channels.
//!
//! # State Diagram
//!
//! ```text
//!                 connect()                 handshake ok
//! Disconnected ─────────────> Connecting ─────────────────> Connected
//!      ^                        ^    │                          │
//!      │ disconnect()           │    │ error / reset            │ error / reset
//!      │ graceful close         │    v                          v
//!      │                  timer │  Reconnecting <───────────────┘
//!      │                        └────┘   │
//!      │                                 │ attempts == max
//!      │         reconnect()             v
//!      └──────────────────────────────  Failed
//! ```

mod machine;
mod manager;

pub use machine::{Command, ConnectionMachine, TimerKind};
pub use manager::{ConnectionHandle, ConnectionManager, LocationUpdate};

use fleetview_env::Channel;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// What a client wants to watch: one vehicle, one order, or both.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionTarget {
    pub vehicle_id: Option<String>,
    pub order_id: Option<String>,
}

impl ConnectionTarget {
    pub fn new(vehicle_id: Option<String>, order_id: Option<String>) -> Self {
        Self { vehicle_id, order_id }
    }

    pub fn vehicle(id: impl Into<String>) -> Self {
        Self {
            vehicle_id: Some(id.into()),
            order_id: None,
        }
    }

    pub fn order(id: impl Into<String>) -> Self {
        Self {
            vehicle_id: None,
            order_id: Some(id.into()),
        }
    }

    /// The single channel to subscribe to.
    ///
    /// A vehicle id wins over an order id so the two subscriptions never
    /// overlap. Blank ids count as absent.
    pub fn channel(&self) -> Option<Channel> {
        let present = |id: &Option<String>| id.as_deref().map(str::trim).filter(|s| !s.is_empty()).map(str::to_string);

        present(&self.vehicle_id)
            .map(Channel::Vehicle)
            .or_else(|| present(&self.order_id).map(Channel::Order))
    }

    /// Fails with [`ConfigError::MissingTarget`] when neither id is usable.
    pub fn validate(&self) -> Result<Channel, ConfigError> {
        self.channel().ok_or(ConfigError::MissingTarget)
    }
}

/// Lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Retry budget exhausted; only a manual reconnect leaves this state
    Failed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// What the UI sees of the connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionStatus {
    pub state: ConnectionState,

    /// UI "connecting" flag; cleared by the soft timeout even while the
    /// handshake is still pending
    pub connecting: bool,

    /// Consecutive failed attempts
    pub attempts: u32,

    /// Active subscription, if connected
    pub channel: Option<Channel>,

    /// Human-readable reason for the last failure
    pub last_error: Option<String>,
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            connecting: false,
            attempts: 0,
            channel: None,
            last_error: None,
        }
    }
}

/// `connect` was called without what it needs; no attempt was made.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("No credential available; sign in before connecting")]
    MissingCredential,

    #[error("Neither a vehicle id nor an order id was given")]
    MissingTarget,
}

/// Reconnection gave up.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Live tracking unavailable after {attempts} failed attempts ({reason}); reconnect manually to retry")]
pub struct TerminalError {
    pub attempts: u32,
    pub reason: String,
}

//! Streaming transport abstraction for FleetView clients.

use async_trait::async_trait;
use crate::error::EnvError;
use crate::types::{Channel, Credential, SessionId, SnapshotRequest, TransportEvent};

/// Abstraction over one persistent, bidirectional streaming connection.
///
/// The transport is event-driven: calls only *start* work, and outcomes
/// (handshake result, frames, failures, close) are delivered through
/// [`next_event`](StreamTransport::next_event).
///
/// # Implementations
///
/// - **Production**: zenoh session (see the `agent` crate)
/// - **Simulation**: scripted in-process server with fault injection
///
/// # Event Flow
///
/// ```text
/// Client                         Transport                       Server
///   |-- open(cred) -> s1 ----------->|-- handshake ------------------->|
///   |<-- Connected{s1} --------------|<-- CONNECTED -------------------|
///   |-- subscribe(ch) -------------->|-- SUBSCRIBE ------------------->|
///   |-- send(snapshot) ------------->|-- SEND ------------------------>|
///   |<-- Message{s1, ch, payload} ---|<-- MESSAGE ---------------------|
/// ```
#[async_trait]
pub trait StreamTransport: Send + Sync + 'static {
    /// Starts a new connection attempt and returns its session id.
    ///
    /// Any previous session is abandoned. The handshake outcome is reported
    /// later as `Connected` or `Failed`.
    ///
    /// # Returns
    /// * `Ok(session)` - Attempt started
    /// * `Err(EnvError)` - The attempt could not even be started
    async fn open(&self, credential: &Credential) -> Result<SessionId, EnvError>;

    /// Subscribes the current session to a channel.
    async fn subscribe(&self, channel: &Channel) -> Result<(), EnvError>;

    /// Removes a subscription from the current session.
    async fn unsubscribe(&self, channel: &Channel) -> Result<(), EnvError>;

    /// Sends a fire-and-forget snapshot request.
    async fn send(&self, request: &SnapshotRequest) -> Result<(), EnvError>;

    /// Receives the next event from any session.
    ///
    /// # Returns
    /// * `Some(event)` - An event was received
    /// * `None` - The transport was shut down
    async fn next_event(&self) -> Option<TransportEvent>;

    /// Closes the current session, if any.
    async fn close(&self);
}

/// Fault-injection hooks for simulated transports.
pub trait TransportController: Send + Sync {
    /// Drops the live connection (`graceful = false` simulates a reset).
    fn drop_connection(&self, graceful: bool);

    /// Makes the next `count` handshakes fail.
    fn refuse_connections(&self, count: usize);

    /// Sends a server-side failure frame on the live session.
    fn inject_error_frame(&self, message: &str);
}

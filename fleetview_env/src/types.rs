//! Common types for the FleetView environment abstraction.

use serde::{Deserialize, Serialize};

/// Identifier of one connection attempt.
///
/// Transports hand out a fresh, strictly increasing id from every `open()`
/// call and stamp each event with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SessionId(pub u64);

impl SessionId {
    /// Returns the id that follows this one.
    pub fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "s{}", self.0)
    }
}

/// Opaque bearer credential presented during the handshake.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential(String);

impl Credential {
    /// Wraps a token. Blank tokens are rejected.
    pub fn new(token: impl Into<String>) -> Option<Self> {
        let token = token.into();
        if token.trim().is_empty() {
            None
        } else {
            Some(Self(token))
        }
    }

    /// Returns the raw token.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Credential(***)")
    }
}

/// A logical subscription channel.
///
/// A client holds at most one of these at a time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Channel {
    /// Location updates for one vehicle
    Vehicle(String),

    /// Location updates for every vehicle assigned to an order
    Order(String),
}

impl Channel {
    /// Returns the topic this channel is published on.
    pub fn topic(&self) -> String {
        match self {
            Channel::Vehicle(id) => format!("/topic/vehicles/{id}"),
            Channel::Order(id) => format!("/topic/orders/{id}"),
        }
    }

    /// Builds the initial-snapshot request matching this channel.
    pub fn snapshot_request(&self) -> SnapshotRequest {
        match self {
            Channel::Vehicle(id) => SnapshotRequest::Vehicle { vehicle_id: id.clone() },
            Channel::Order(id) => SnapshotRequest::Order { order_id: id.clone() },
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.topic())
    }
}

/// Client-to-server request for the current state of a channel.
///
/// Fire-and-forget: the answer arrives as an ordinary channel message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SnapshotRequest {
    Vehicle {
        #[serde(rename = "vehicleId")]
        vehicle_id: String,
    },
    Order {
        #[serde(rename = "orderId")]
        order_id: String,
    },
}

impl SnapshotRequest {
    /// Returns the endpoint the request is addressed to.
    pub fn destination(&self) -> String {
        match self {
            SnapshotRequest::Vehicle { vehicle_id } => format!("/app/vehicles/{vehicle_id}/snapshot"),
            SnapshotRequest::Order { order_id } => format!("/app/orders/{order_id}/snapshot"),
        }
    }

    /// Serializes the request body (`{"vehicleId":..}` or `{"orderId":..}`).
    pub fn body(&self) -> Vec<u8> {
        // A two-variant enum of plain strings cannot fail to serialize.
        serde_json::to_vec(self).unwrap_or_default()
    }
}

/// Something that happened on the streaming connection.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Handshake completed
    Connected { session: SessionId },

    /// A frame arrived on a subscribed channel
    Message {
        session: SessionId,
        channel: Channel,
        payload: Vec<u8>,
    },

    /// The server sent a failure frame
    ErrorFrame { session: SessionId, message: String },

    /// Socket-level failure (also used for a rejected handshake)
    Failed { session: SessionId, reason: String },

    /// The connection closed
    Closed { session: SessionId, graceful: bool },
}

impl TransportEvent {
    /// Returns the session this event belongs to.
    pub fn session(&self) -> SessionId {
        match self {
            TransportEvent::Connected { session }
            | TransportEvent::Message { session, .. }
            | TransportEvent::ErrorFrame { session, .. }
            | TransportEvent::Failed { session, .. }
            | TransportEvent::Closed { session, .. } => *session,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_topics() {
        assert_eq!(Channel::Vehicle("v1".into()).topic(), "/topic/vehicles/v1");
        assert_eq!(Channel::Order("o9".into()).topic(), "/topic/orders/o9");
    }

    #[test]
    fn test_snapshot_request_body() {
        let vehicle = Channel::Vehicle("v1".into()).snapshot_request();
        assert_eq!(vehicle.destination(), "/app/vehicles/v1/snapshot");
        assert_eq!(vehicle.body(), br#"{"vehicleId":"v1"}"#.to_vec());

        let order = Channel::Order("o9".into()).snapshot_request();
        assert_eq!(order.destination(), "/app/orders/o9/snapshot");
        assert_eq!(order.body(), br#"{"orderId":"o9"}"#.to_vec());
    }

    #[test]
    fn test_credential_rejects_blank_and_redacts() {
        assert!(Credential::new("   ").is_none());
        let cred = Credential::new("secret-token").unwrap();
        assert_eq!(cred.expose(), "secret-token");
        assert_eq!(format!("{:?}", cred), "Credential(***)");
    }

    #[test]
    fn test_session_ids_increase() {
        let s = SessionId(7);
        assert!(s.next() > s);
        assert_eq!(s.to_string(), "s7");
    }
}

//! Simulated streaming server with fault injection.
//!
//! [`SimTransport`] is the client side handed to the ConnectionManager;
//! [`SimTransportController`] is the scenario's grip on the "server": it
//! publishes frames, answers snapshot requests, refuses handshakes and
//! drops connections.

use async_trait::async_trait;
use fleetview_env::{
    Channel, Credential, EnvError, SessionId, SnapshotRequest, StreamTransport, TransportController, TransportEvent,
};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;

/// Server-side view of the connection.
#[derive(Default)]
struct ServerState {
    last_session: u64,

    /// Session of the current connection, pending or established
    live: Option<SessionId>,

    /// Handshake completed for `live`
    established: bool,

    subscriptions: HashSet<Channel>,
    snapshots: HashMap<Channel, Vec<u8>>,
    snapshot_requests: Vec<SnapshotRequest>,

    refuse_remaining: usize,
    ignore_snapshot_requests: usize,
    handshake_latency: Duration,

    opens: usize,
    frames_delivered: u64,
}

struct Shared {
    state: Mutex<ServerState>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: TransportEvent) {
        // The receiver lives as long as the SimTransport; after that nobody listens.
        let _ = self.events.send(event);
    }
}

/// Client end of the simulated connection.
pub struct SimTransport {
    shared: Arc<Shared>,

    /// Receiver for outgoing events (behind tokio mutex for async)
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<TransportEvent>>,
}

impl SimTransport {
    /// Creates a transport and the controller driving its server side.
    pub fn pair() -> (Arc<SimTransport>, SimTransportController) {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            state: Mutex::new(ServerState::default()),
            events: tx,
        });
        let transport = Arc::new(SimTransport {
            shared: shared.clone(),
            rx: tokio::sync::Mutex::new(rx),
        });
        (transport, SimTransportController { shared })
    }
}

#[async_trait]
impl StreamTransport for SimTransport {
    async fn open(&self, _credential: &Credential) -> Result<SessionId, EnvError> {
        let (session, refused, latency) = {
            let mut state = self.shared.state();
            state.opens += 1;
            state.last_session += 1;
            let session = SessionId(state.last_session);
            state.live = Some(session);
            state.established = false;
            state.subscriptions.clear();

            let refused = state.refuse_remaining > 0;
            if refused {
                state.refuse_remaining -= 1;
                state.live = None;
            }
            (session, refused, state.handshake_latency)
        };

        if refused {
            self.shared.emit(TransportEvent::Failed {
                session,
                reason: "handshake refused".to_string(),
            });
            return Ok(session);
        }

        if latency.is_zero() {
            self.shared.state().established = true;
            self.shared.emit(TransportEvent::Connected { session });
        } else {
            let shared = self.shared.clone();
            tokio::spawn(async move {
                tokio::time::sleep(latency).await;
                let still_live = {
                    let mut state = shared.state();
                    let live = state.live == Some(session);
                    if live {
                        state.established = true;
                    }
                    live
                };
                if still_live {
                    shared.emit(TransportEvent::Connected { session });
                }
            });
        }
        Ok(session)
    }

    async fn subscribe(&self, channel: &Channel) -> Result<(), EnvError> {
        let mut state = self.shared.state();
        if !state.established {
            return Err(EnvError::Closed);
        }
        state.subscriptions.insert(channel.clone());
        Ok(())
    }

    async fn unsubscribe(&self, channel: &Channel) -> Result<(), EnvError> {
        self.shared.state().subscriptions.remove(channel);
        Ok(())
    }

    async fn send(&self, request: &SnapshotRequest) -> Result<(), EnvError> {
        let reply = {
            let mut state = self.shared.state();
            let Some(session) = state.live.filter(|_| state.established) else {
                return Err(EnvError::Closed);
            };
            state.snapshot_requests.push(request.clone());

            if state.ignore_snapshot_requests > 0 {
                state.ignore_snapshot_requests -= 1;
                None
            } else {
                let channel = match request {
                    SnapshotRequest::Vehicle { vehicle_id } => Channel::Vehicle(vehicle_id.clone()),
                    SnapshotRequest::Order { order_id } => Channel::Order(order_id.clone()),
                };
                let payload = state.snapshots.get(&channel).cloned();
                match payload {
                    Some(payload) if state.subscriptions.contains(&channel) => {
                        state.frames_delivered += 1;
                        Some(TransportEvent::Message {
                            session,
                            channel,
                            payload,
                        })
                    }
                    _ => None,
                }
            }
        };

        if let Some(event) = reply {
            self.shared.emit(event);
        }
        Ok(())
    }

    async fn next_event(&self) -> Option<TransportEvent> {
        let mut rx = self.rx.lock().await;
        rx.recv().await
    }

    async fn close(&self) {
        let mut state = self.shared.state();
        state.live = None;
        state.established = false;
        state.subscriptions.clear();
    }
}

/// Scenario-side control of the simulated server.
#[derive(Clone)]
pub struct SimTransportController {
    shared: Arc<Shared>,
}

impl SimTransportController {
    /// Pushes a frame to `channel`. Returns false if no live subscriber.
    pub fn publish(&self, channel: &Channel, payload: Vec<u8>) -> bool {
        let event = {
            let mut state = self.shared.state();
            match state.live {
                Some(session) if state.established && state.subscriptions.contains(channel) => {
                    state.frames_delivered += 1;
                    TransportEvent::Message {
                        session,
                        channel: channel.clone(),
                        payload,
                    }
                }
                _ => return false,
            }
        };
        self.shared.emit(event);
        true
    }

    /// Sets what the server answers to a snapshot request for `channel`.
    pub fn set_snapshot(&self, channel: &Channel, payload: Vec<u8>) {
        self.shared.state().snapshots.insert(channel.clone(), payload);
    }

    /// Silently drops the next `count` snapshot requests.
    pub fn ignore_snapshot_requests(&self, count: usize) {
        self.shared.state().ignore_snapshot_requests = count;
    }

    /// Delays every future handshake by `latency`.
    pub fn set_handshake_latency(&self, latency: Duration) {
        self.shared.state().handshake_latency = latency;
    }

    /// Delivers an arbitrary event, e.g. a late callback from an old session.
    pub fn inject_event(&self, event: TransportEvent) {
        self.shared.emit(event);
    }

    /// Session of the current connection, if any.
    pub fn live_session(&self) -> Option<SessionId> {
        let state = self.shared.state();
        state.live.filter(|_| state.established)
    }

    pub fn subscriptions(&self) -> HashSet<Channel> {
        self.shared.state().subscriptions.clone()
    }

    pub fn snapshot_requests(&self) -> Vec<SnapshotRequest> {
        self.shared.state().snapshot_requests.clone()
    }

    /// Number of handshakes the client started.
    pub fn opens(&self) -> usize {
        self.shared.state().opens
    }

    pub fn frames_delivered(&self) -> u64 {
        self.shared.state().frames_delivered
    }
}

impl TransportController for SimTransportController {
    fn drop_connection(&self, graceful: bool) {
        let session = {
            let mut state = self.shared.state();
            let session = state.live.take();
            state.established = false;
            state.subscriptions.clear();
            session
        };
        if let Some(session) = session {
            self.shared.emit(TransportEvent::Closed { session, graceful });
        }
    }

    fn refuse_connections(&self, count: usize) {
        self.shared.state().refuse_remaining = count;
    }

    fn inject_error_frame(&self, message: &str) {
        let session = self.shared.state().live;
        if let Some(session) = session {
            self.shared.emit(TransportEvent::ErrorFrame {
                session,
                message: message.to_string(),
            });
        }
    }
}

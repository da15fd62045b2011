//! Async driver for [`ConnectionMachine`].
//!
//! One task owns the machine, the transport and the write side of the
//! location store. It multiplexes three event sources with `tokio::select!`:
//! requests from [`ConnectionHandle`]s, transport events, and the machine's
//! next timer deadline. Results go out through `watch` channels, so
//! subscribers always see the most recent value.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use fleetview_env::{Credential, FleetContext, StreamTransport};
use tokio::sync::{mpsc, watch};

use super::machine::{Command, ConnectionMachine};
use super::{ConfigError, ConnectionStatus, ConnectionTarget};
use crate::config::ConnectionConfig;
use crate::location::LocationRecord;
use crate::merge::{merge_payload, MergeReport};
use crate::store::{lock_store, SharedLocationStore};

/// What the UI layer receives on every merge.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LocationUpdate {
    /// Every valid record in the store
    pub locations: Vec<LocationRecord>,

    /// Vehicle ids whose stored record changed in this update
    pub changes: Vec<String>,

    pub duplicates_removed: usize,

    /// Published straight from the cache (startup, or a malformed frame)
    pub from_cache: bool,
}

impl From<MergeReport> for LocationUpdate {
    fn from(report: MergeReport) -> Self {
        Self {
            locations: report.locations,
            changes: report.changed,
            duplicates_removed: report.duplicates_removed,
            from_cache: report.fell_back,
        }
    }
}

#[derive(Debug)]
enum Request {
    Connect {
        target: ConnectionTarget,
        credential: Credential,
    },
    Disconnect,
    Reconnect(Option<ConnectionTarget>),
    Shutdown,
}

/// Cloneable control and observation handle.
#[derive(Clone)]
pub struct ConnectionHandle {
    requests: mpsc::UnboundedSender<Request>,
    locations: watch::Receiver<LocationUpdate>,
    status: watch::Receiver<ConnectionStatus>,
    /// Set once a `connect` has been accepted; the manager keeps its
    /// credential and target from then on
    configured: Arc<AtomicBool>,
}

impl ConnectionHandle {
    /// Starts watching `target`.
    ///
    /// Configuration errors are returned here, before anything reaches the
    /// network.
    pub fn connect(&self, target: ConnectionTarget, credential: Option<Credential>) -> Result<(), ConfigError> {
        let credential = credential.ok_or(ConfigError::MissingCredential)?;
        target.validate()?;
        self.send(Request::Connect { target, credential });
        self.configured.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub fn disconnect(&self) {
        self.send(Request::Disconnect);
    }

    /// Manual reconnect, optionally switching target.
    ///
    /// Fails with [`ConfigError::MissingCredential`] until a `connect` has
    /// been accepted, since there is no credential to reconnect with.
    pub fn reconnect(&self, new_target: Option<ConnectionTarget>) -> Result<(), ConfigError> {
        if !self.configured.load(Ordering::SeqCst) {
            return Err(ConfigError::MissingCredential);
        }
        if let Some(target) = &new_target {
            target.validate()?;
        }
        self.send(Request::Reconnect(new_target));
        Ok(())
    }

    /// Disconnects and stops the manager task.
    pub fn shutdown(&self) {
        self.send(Request::Shutdown);
    }

    /// Subscribes to location updates.
    pub fn locations(&self) -> watch::Receiver<LocationUpdate> {
        self.locations.clone()
    }

    /// Subscribes to status changes.
    pub fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    pub fn current_status(&self) -> ConnectionStatus {
        self.status.borrow().clone()
    }

    pub fn current_locations(&self) -> LocationUpdate {
        self.locations.borrow().clone()
    }

    fn send(&self, request: Request) {
        if self.requests.send(request).is_err() {
            tracing::warn!("Connection manager has stopped, request dropped");
        }
    }
}

/// Owns one streaming connection and feeds its frames through the merge.
pub struct ConnectionManager<Ctx: FleetContext, T: StreamTransport> {
    ctx: Arc<Ctx>,
    transport: Arc<T>,
    store: SharedLocationStore,
    machine: ConnectionMachine,
    requests: mpsc::UnboundedReceiver<Request>,
    locations: watch::Sender<LocationUpdate>,
    status: watch::Sender<ConnectionStatus>,
}

impl<Ctx: FleetContext, T: StreamTransport> ConnectionManager<Ctx, T> {
    /// Builds a manager and its handle. Nothing happens until [`run`](Self::run).
    pub fn new(
        ctx: Arc<Ctx>,
        transport: Arc<T>,
        store: SharedLocationStore,
        config: ConnectionConfig,
    ) -> (Self, ConnectionHandle) {
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (locations_tx, locations_rx) = watch::channel(LocationUpdate::default());
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::default());

        let manager = Self {
            ctx,
            transport,
            store,
            machine: ConnectionMachine::new(config),
            requests: request_rx,
            locations: locations_tx,
            status: status_tx,
        };
        let handle = ConnectionHandle {
            requests: request_tx,
            locations: locations_rx,
            status: status_rx,
            configured: Arc::new(AtomicBool::new(false)),
        };
        (manager, handle)
    }

    /// Runs until [`ConnectionHandle::shutdown`] or until every handle is dropped.
    pub async fn run(mut self) {
        self.publish_cached();

        loop {
            let listening = self.machine.session().is_some();
            let next_timer = self
                .machine
                .next_deadline()
                .map(|deadline| deadline.saturating_sub(self.ctx.now()));

            tokio::select! {
                biased;

                request = self.requests.recv() => {
                    let keep_running = match request {
                        Some(request) => self.handle_request(request).await,
                        None => false,
                    };
                    if !keep_running {
                        let commands = self.machine.disconnect(self.ctx.now());
                        self.execute(commands).await;
                        break;
                    }
                }

                event = self.transport.next_event(), if listening => {
                    let now = self.ctx.now();
                    let commands = match event {
                        Some(event) => self.machine.on_event(event, now),
                        None => self.machine.on_transport_error("transport shut down", now),
                    };
                    self.execute(commands).await;
                }

                _ = self.ctx.sleep(next_timer.unwrap_or_default()), if next_timer.is_some() => {
                    let commands = self.machine.on_timers(self.ctx.now());
                    self.execute(commands).await;
                }
            }
        }

        tracing::debug!("Connection manager stopped");
    }

    /// Returns false on shutdown.
    async fn handle_request(&mut self, request: Request) -> bool {
        let now = self.ctx.now();
        let result = match request {
            Request::Connect { target, credential } => self.machine.connect(target, Some(credential), now),
            Request::Disconnect => Ok(self.machine.disconnect(now)),
            Request::Reconnect(target) => self.machine.reconnect(target, now),
            Request::Shutdown => return false,
        };

        match result {
            Ok(commands) => self.execute(commands).await,
            Err(e) => tracing::warn!(error = %e, "Connection request rejected"),
        }
        true
    }

    async fn execute(&mut self, commands: Vec<Command>) {
        let mut queue: VecDeque<Command> = commands.into();

        while let Some(command) = queue.pop_front() {
            match command {
                Command::Open { epoch, credential } => {
                    let follow_up = match self.transport.open(&credential).await {
                        Ok(session) => {
                            tracing::debug!(%session, epoch, "Handshake started");
                            self.machine.on_opened(epoch, session)
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, epoch, "Could not start connection attempt");
                            self.machine.on_open_failed(epoch, &e.to_string(), self.ctx.now())
                        }
                    };
                    queue.extend(follow_up);
                }
                Command::Subscribe(channel) => {
                    if let Err(e) = self.transport.subscribe(&channel).await {
                        tracing::warn!(error = %e, channel = %channel, "Subscribe failed");
                        queue.extend(self.machine.on_transport_error(&e.to_string(), self.ctx.now()));
                    }
                }
                Command::Unsubscribe(channel) => {
                    if let Err(e) = self.transport.unsubscribe(&channel).await {
                        tracing::debug!(error = %e, channel = %channel, "Unsubscribe failed");
                    }
                }
                Command::RequestSnapshot(request) => match self.transport.send(&request).await {
                    Ok(()) => tracing::debug!(destination = %request.destination(), "Snapshot requested"),
                    Err(e) => tracing::warn!(error = %e, destination = %request.destination(), "Snapshot request failed"),
                },
                Command::Close => self.transport.close().await,
                Command::Deliver(payload) => self.deliver(&payload),
                Command::Status(status) => {
                    tracing::debug!(
                        state = %status.state,
                        connecting = status.connecting,
                        attempts = status.attempts,
                        "Connection status changed"
                    );
                    self.status.send_replace(status);
                }
            }
        }
    }

    fn deliver(&self, payload: &[u8]) {
        let report = {
            let mut store = lock_store(&self.store);
            merge_payload(payload, &mut store)
        };
        tracing::debug!(
            locations = report.locations.len(),
            changed = report.changed.len(),
            "Publishing merged locations"
        );
        self.locations.send_replace(report.into());
    }

    /// Last-known positions go out before any network activity.
    fn publish_cached(&self) {
        let locations = lock_store(&self.store).valid_records();
        tracing::info!(count = locations.len(), "Publishing cached locations");
        self.locations.send_replace(LocationUpdate {
            locations,
            from_cache: true,
            ..LocationUpdate::default()
        });
    }
}

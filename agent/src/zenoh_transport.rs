//! [`StreamTransport`] over a zenoh session.
//!
//! Channel topics map onto key expressions by dropping the leading slash
//! (`/topic/orders/o1` → `topic/orders/o1`). Server failure frames arrive on
//! `<topic>/errors`. Snapshot requests are `put`s to the request destination
//! with the bearer token as attachment.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fleetview_env::{Channel, Credential, EnvError, SessionId, SnapshotRequest, StreamTransport, TransportEvent};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

/// Handshakes slower than this are reported as failed.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Maps a channel topic or request destination to a zenoh key expression.
pub fn key_expr(path: &str) -> String {
    path.trim_start_matches('/').to_string()
}

fn error_key_expr(channel: &Channel) -> String {
    format!("{}/errors", key_expr(&channel.topic()))
}

struct Live {
    id: SessionId,
    session: zenoh::Session,
    credential: Credential,
    forwarders: HashMap<Channel, JoinHandle<()>>,
}

impl Live {
    async fn shutdown(self) {
        for (_, task) in self.forwarders {
            task.abort();
        }
        if let Err(e) = self.session.close().await {
            tracing::debug!(error = %e, session = %self.id, "zenoh session close failed");
        }
    }
}

struct Inner {
    config: zenoh::Config,
    live: Mutex<Option<Live>>,
    last_session: AtomicU64,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl Inner {
    fn emit(&self, event: TransportEvent) {
        // Receiver lives in the transport itself
        let _ = self.events.send(event);
    }

    fn is_latest(&self, id: SessionId) -> bool {
        self.last_session.load(Ordering::SeqCst) == id.0
    }

    async fn handshake(self: Arc<Self>, id: SessionId, credential: Credential) {
        let opened = tokio::time::timeout(HANDSHAKE_TIMEOUT, zenoh::open(self.config.clone())).await;
        let session = match opened {
            Ok(Ok(session)) => session,
            Ok(Err(e)) => {
                self.emit(TransportEvent::Failed {
                    session: id,
                    reason: EnvError::Handshake(e.to_string()).to_string(),
                });
                return;
            }
            Err(_) => {
                self.emit(TransportEvent::Failed {
                    session: id,
                    reason: EnvError::Timeout(HANDSHAKE_TIMEOUT.as_millis() as u64).to_string(),
                });
                return;
            }
        };

        let mut live = self.live.lock().await;
        if !self.is_latest(id) {
            drop(live);
            tracing::debug!(session = %id, "Handshake finished for abandoned attempt");
            let _ = session.close().await;
            return;
        }
        tracing::info!(session = %id, zid = %session.zid(), "zenoh session open");
        *live = Some(Live {
            id,
            session,
            credential,
            forwarders: HashMap::new(),
        });
        drop(live);
        self.emit(TransportEvent::Connected { session: id });
    }
}

/// Production transport.
pub struct ZenohTransport {
    inner: Arc<Inner>,
    rx: Mutex<mpsc::UnboundedReceiver<TransportEvent>>,
}

impl ZenohTransport {
    pub fn new(config: zenoh::Config) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                config,
                live: Mutex::new(None),
                last_session: AtomicU64::new(0),
                events: tx,
            }),
            rx: Mutex::new(rx),
        }
    }

    /// Loads a zenoh configuration file (JSON5).
    pub fn from_config_file(path: &Path) -> Result<Self, EnvError> {
        let config = zenoh::Config::from_file(path).map_err(|e| EnvError::transport(e.to_string()))?;
        Ok(Self::new(config))
    }
}

#[async_trait]
impl StreamTransport for ZenohTransport {
    async fn open(&self, credential: &Credential) -> Result<SessionId, EnvError> {
        let id = SessionId(self.inner.last_session.fetch_add(1, Ordering::SeqCst) + 1);

        if let Some(previous) = self.inner.live.lock().await.take() {
            tracing::debug!(old = %previous.id, new = %id, "Replacing zenoh session");
            tokio::spawn(previous.shutdown());
        }

        tokio::spawn(self.inner.clone().handshake(id, credential.clone()));
        Ok(id)
    }

    async fn subscribe(&self, channel: &Channel) -> Result<(), EnvError> {
        let mut guard = self.inner.live.lock().await;
        let live = guard.as_mut().ok_or(EnvError::Closed)?;

        let data = live
            .session
            .declare_subscriber(key_expr(&channel.topic()))
            .await
            .map_err(|e| EnvError::transport(e.to_string()))?;
        let errors = live
            .session
            .declare_subscriber(error_key_expr(channel))
            .await
            .map_err(|e| EnvError::transport(e.to_string()))?;

        let inner = self.inner.clone();
        let session = live.id;
        let forwarded = channel.clone();
        let task = tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    sample = data.recv_async() => match sample {
                        Ok(sample) => TransportEvent::Message {
                            session,
                            channel: forwarded.clone(),
                            payload: sample.payload().to_bytes().into_owned(),
                        },
                        Err(_) => TransportEvent::Closed { session, graceful: false },
                    },
                    sample = errors.recv_async() => match sample {
                        Ok(sample) => TransportEvent::ErrorFrame {
                            session,
                            message: String::from_utf8_lossy(&sample.payload().to_bytes()).into_owned(),
                        },
                        Err(_) => TransportEvent::Closed { session, graceful: false },
                    },
                };
                let closed = matches!(event, TransportEvent::Closed { .. });
                inner.emit(event);
                if closed {
                    break;
                }
            }
        });

        if let Some(old) = live.forwarders.insert(channel.clone(), task) {
            old.abort();
        }
        tracing::debug!(channel = %channel, session = %session, "Subscribed");
        Ok(())
    }

    async fn unsubscribe(&self, channel: &Channel) -> Result<(), EnvError> {
        let mut guard = self.inner.live.lock().await;
        if let Some(task) = guard.as_mut().and_then(|live| live.forwarders.remove(channel)) {
            // Dropping the subscribers undeclares them
            task.abort();
        }
        Ok(())
    }

    async fn send(&self, request: &SnapshotRequest) -> Result<(), EnvError> {
        let guard = self.inner.live.lock().await;
        let live = guard.as_ref().ok_or(EnvError::Closed)?;
        live.session
            .put(key_expr(&request.destination()), request.body())
            .attachment(live.credential.expose().to_string())
            .await
            .map_err(|e| EnvError::transport(e.to_string()))
    }

    async fn next_event(&self) -> Option<TransportEvent> {
        self.rx.lock().await.recv().await
    }

    async fn close(&self) {
        let live = self.inner.live.lock().await.take();
        if let Some(live) = live {
            tracing::debug!(session = %live.id, "Closing zenoh session");
            live.shutdown().await;
        }
    }
}

//! Disconnected-view self-healing poll.
//!
//! While the stream is down and the user is only looking (not interacting),
//! a request/response endpoint is polled on a fixed interval to keep the
//! displayed count fresh. The poll never touches location data, and stops
//! the moment the stream is back.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fleetview_env::{Channel, Credential, FleetContext};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::config::FallbackConfig;
use crate::connection::{ConnectionState, ConnectionStatus};

/// Default HTTP timeout for catalog lookups.
const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid response body: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Credential rejected by catalog service")]
    Unauthorized,
}

/// The REST catalog service, as far as the poller needs it.
#[async_trait]
pub trait CatalogClient: Send + Sync + 'static {
    /// Fetches the current count shown for `target`.
    async fn fetch_count(&self, target: &Channel) -> Result<u64, CatalogError>;
}

#[derive(Deserialize)]
struct Summary {
    #[serde(alias = "unreadCount")]
    count: u64,
}

/// `reqwest`-based catalog client.
pub struct HttpCatalogClient {
    http: reqwest::Client,
    base_url: String,
    credential: Credential,
}

impl HttpCatalogClient {
    pub fn new(base_url: impl Into<String>, credential: Credential) -> Result<Self, CatalogError> {
        let http = reqwest::Client::builder().timeout(DEFAULT_HTTP_TIMEOUT).build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            credential,
        })
    }

    fn summary_url(&self, target: &Channel) -> String {
        match target {
            Channel::Vehicle(id) => format!("{}/vehicles/{}/summary", self.base_url, id),
            Channel::Order(id) => format!("{}/orders/{}/summary", self.base_url, id),
        }
    }
}

#[async_trait]
impl CatalogClient for HttpCatalogClient {
    async fn fetch_count(&self, target: &Channel) -> Result<u64, CatalogError> {
        let url = self.summary_url(target);
        let response = self.http.get(&url).bearer_auth(self.credential.expose()).send().await?;

        match response.status() {
            reqwest::StatusCode::UNAUTHORIZED | reqwest::StatusCode::FORBIDDEN => {
                return Err(CatalogError::Unauthorized)
            }
            reqwest::StatusCode::NOT_FOUND => return Err(CatalogError::NotFound(url)),
            _ => {}
        }

        let bytes = response.error_for_status()?.bytes().await?;
        let summary: Summary = serde_json::from_slice(&bytes)?;
        tracing::debug!(%url, count = summary.count, "Catalog summary fetched");
        Ok(summary.count)
    }
}

/// Whether the user is interacting with the view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewMode {
    /// Just watching; fallback polling allowed
    Passive,
    /// Typing, scrolling etc.; no polling
    Interactive,
}

/// Polls a [`CatalogClient`] while the stream is down.
pub struct FallbackPoller<Ctx: FleetContext, C: CatalogClient> {
    ctx: Arc<Ctx>,
    client: Arc<C>,
    target: Channel,
    config: FallbackConfig,
    status: watch::Receiver<ConnectionStatus>,
    view: watch::Receiver<ViewMode>,
    count: watch::Sender<Option<u64>>,
    cancel: CancellationToken,
}

impl<Ctx: FleetContext, C: CatalogClient> FallbackPoller<Ctx, C> {
    /// Builds a poller and the receiver its counts are published on.
    pub fn new(
        ctx: Arc<Ctx>,
        client: Arc<C>,
        target: Channel,
        config: FallbackConfig,
        status: watch::Receiver<ConnectionStatus>,
        view: watch::Receiver<ViewMode>,
        cancel: CancellationToken,
    ) -> (Self, watch::Receiver<Option<u64>>) {
        let (count_tx, count_rx) = watch::channel(None);
        let poller = Self {
            ctx,
            client,
            target,
            config,
            status,
            view,
            count: count_tx,
            cancel,
        };
        (poller, count_rx)
    }

    fn should_poll(&self) -> bool {
        self.status.borrow().state != ConnectionState::Connected && *self.view.borrow() == ViewMode::Passive
    }

    /// Runs until cancelled. Returns immediately when disabled.
    pub async fn run(self) {
        if !self.config.enabled {
            tracing::debug!("Fallback poll disabled");
            return;
        }

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = self.ctx.sleep(self.config.poll_interval) => {}
            }

            if !self.should_poll() {
                continue;
            }

            let mut status = self.status.clone();
            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = status.wait_for(|s| s.state == ConnectionState::Connected) => {
                    tracing::debug!(channel = %self.target, "Stream recovered, abandoning fallback poll");
                    continue;
                }
                result = self.client.fetch_count(&self.target) => result,
            };

            match result {
                Ok(count) => {
                    tracing::debug!(channel = %self.target, count, "Fallback poll refreshed count");
                    self.count.send_replace(Some(count));
                }
                Err(e) => tracing::warn!(error = %e, channel = %self.target, "Fallback poll failed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetview_env::TokioContext;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct FakeCatalog {
        calls: AtomicU64,
        latency: Duration,
    }

    impl FakeCatalog {
        fn new(latency: Duration) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU64::new(0),
                latency,
            })
        }
    }

    #[async_trait]
    impl CatalogClient for FakeCatalog {
        async fn fetch_count(&self, _target: &Channel) -> Result<u64, CatalogError> {
            tokio::time::sleep(self.latency).await;
            Ok(self.calls.fetch_add(1, Ordering::SeqCst) + 1)
        }
    }

    fn status(state: ConnectionState) -> ConnectionStatus {
        ConnectionStatus {
            state,
            ..ConnectionStatus::default()
        }
    }

    struct Harness {
        status: watch::Sender<ConnectionStatus>,
        view: watch::Sender<ViewMode>,
        count: watch::Receiver<Option<u64>>,
        cancel: CancellationToken,
        task: tokio::task::JoinHandle<()>,
    }

    fn start(client: Arc<FakeCatalog>, state: ConnectionState, mode: ViewMode, config: FallbackConfig) -> Harness {
        let (status_tx, status_rx) = watch::channel(status(state));
        let (view_tx, view_rx) = watch::channel(mode);
        let cancel = CancellationToken::new();
        let (poller, count) = FallbackPoller::new(
            TokioContext::shared(),
            client,
            Channel::Order("o1".into()),
            config,
            status_rx,
            view_rx,
            cancel.clone(),
        );
        Harness {
            status: status_tx,
            view: view_tx,
            count,
            cancel,
            task: tokio::spawn(poller.run()),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_polls_while_disconnected_and_passive() {
        let client = FakeCatalog::new(Duration::ZERO);
        let h = start(client.clone(), ConnectionState::Reconnecting, ViewMode::Passive, FallbackConfig::default());

        tokio::time::sleep(Duration::from_secs(35)).await;
        assert_eq!(client.calls.load(Ordering::SeqCst), 3);
        assert_eq!(*h.count.borrow(), Some(3));

        h.cancel.cancel();
        h.task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_suppressed_when_connected_or_interactive() {
        let client = FakeCatalog::new(Duration::ZERO);
        let h = start(client.clone(), ConnectionState::Connected, ViewMode::Passive, FallbackConfig::default());
        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(client.calls.load(Ordering::SeqCst), 0);

        h.status.send_replace(status(ConnectionState::Failed));
        h.view.send_replace(ViewMode::Interactive);
        tokio::time::sleep(Duration::from_secs(22)).await;
        assert_eq!(client.calls.load(Ordering::SeqCst), 0);

        h.view.send_replace(ViewMode::Passive);
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(client.calls.load(Ordering::SeqCst), 1);

        h.cancel.cancel();
        h.task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_flight_result_dropped_on_reconnect() {
        let client = FakeCatalog::new(Duration::from_secs(5));
        let h = start(client.clone(), ConnectionState::Disconnected, ViewMode::Passive, FallbackConfig::default());

        // Poll starts at 10s and would finish at 15s.
        tokio::time::sleep(Duration::from_secs(12)).await;
        h.status.send_replace(status(ConnectionState::Connected));
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(*h.count.borrow(), None);
        h.cancel.cancel();
        h.task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_poller_returns() {
        let client = FakeCatalog::new(Duration::ZERO);
        let config = FallbackConfig {
            enabled: false,
            ..FallbackConfig::default()
        };
        let h = start(client.clone(), ConnectionState::Disconnected, ViewMode::Passive, config);
        h.task.await.unwrap();
        assert_eq!(client.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_summary_urls_and_body() {
        let client = HttpCatalogClient::new("https://api.example.test/", Credential::new("t").unwrap()).unwrap();
        assert_eq!(
            client.summary_url(&Channel::Order("o1".into())),
            "https://api.example.test/orders/o1/summary"
        );
        assert_eq!(
            client.summary_url(&Channel::Vehicle("v1".into())),
            "https://api.example.test/vehicles/v1/summary"
        );

        let summary: Summary = serde_json::from_str(r#"{"unreadCount": 4, "other": 1}"#).unwrap();
        assert_eq!(summary.count, 4);
        let summary: Summary = serde_json::from_str(r#"{"count": 2}"#).unwrap();
        assert_eq!(summary.count, 2);
    }
}

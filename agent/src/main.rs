//! FleetView Agent - headless live vehicle tracking
//!
//! Runs the full location pipeline against a zenoh router:
//! - Persistent last-known cache (sled)
//! - Live stream with bounded reconnects
//! - Marker animation, reported through the log
//! - REST fallback poll while the stream is down

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use fleetview_core::{
    ConnectionManager, ConnectionState, ConnectionTarget, FallbackPoller, HttpCatalogClient, LatLng, LocationStore,
    MarkerRenderer, PipelineConfig, RenderSink, SledBackend, ViewMode,
};
use fleetview_env::{Credential, FleetContext, TokioContext};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

mod zenoh_transport;

use zenoh_transport::ZenohTransport;

/// FleetView live tracking agent
#[derive(Parser, Debug)]
#[command(name = "fleetview-agent", version)]
#[command(about = "Track vehicles live with a persistent last-known cache", long_about = None)]
struct Args {
    /// Bearer token for the stream and catalog service
    #[arg(long, env = "FLEETVIEW_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Track a single vehicle
    #[arg(long, env = "FLEETVIEW_VEHICLE")]
    vehicle: Option<String>,

    /// Track every vehicle on an order (ignored when --vehicle is set)
    #[arg(long, env = "FLEETVIEW_ORDER")]
    order: Option<String>,

    /// Directory of the persistent location cache
    #[arg(long, env = "FLEETVIEW_CACHE", default_value = "fleetview-cache")]
    cache: PathBuf,

    /// Catalog service base URL; enables the fallback poll
    #[arg(long, env = "FLEETVIEW_CATALOG_URL")]
    catalog_url: Option<String>,

    /// Pipeline configuration (JSON)
    #[arg(long)]
    config: Option<PathBuf>,

    /// zenoh configuration (JSON5)
    #[arg(long)]
    zenoh_config: Option<PathBuf>,

    /// Debug logging (RUST_LOG takes precedence)
    #[arg(short, long)]
    verbose: bool,
}

/// Map layer stand-in: logs where each marker is drawn.
#[derive(Default)]
struct LogSink {
    draws: u64,
}

impl RenderSink for LogSink {
    fn draw(&mut self, vehicle_id: &str, position: LatLng) {
        self.draws += 1;
        tracing::trace!(%vehicle_id, lat = position.lat, lng = position.lng, "Marker");
    }

    fn remove(&mut self, vehicle_id: &str) {
        tracing::info!(%vehicle_id, "Marker removed");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .init();

    let config = match &args.config {
        Some(path) => PipelineConfig::from_json_file(path)
            .with_context(|| format!("loading pipeline config {}", path.display()))?,
        None => PipelineConfig::default(),
    };

    let ctx = TokioContext::shared();
    let backend = SledBackend::open(&args.cache, config.store.storage_key.clone())
        .with_context(|| format!("opening location cache {}", args.cache.display()))?;
    let store = LocationStore::open(Arc::new(backend), config.store.clone(), chrono::Utc::now()).shared();

    let transport = match &args.zenoh_config {
        Some(path) => ZenohTransport::from_config_file(path)?,
        None => ZenohTransport::new(zenoh::Config::default()),
    };

    let (manager, handle) = ConnectionManager::new(ctx.clone(), Arc::new(transport), store, config.connection.clone());
    let manager = tokio::spawn(manager.run());

    let target = ConnectionTarget::new(args.vehicle.clone(), args.order.clone());
    let credential = args.token.as_deref().and_then(Credential::new);
    let channel = target.validate()?;
    handle.connect(target, credential.clone())?;
    tracing::info!(channel = %channel, "Tracking");

    let cancel = CancellationToken::new();

    let renderer = MarkerRenderer::new(
        ctx.clone(),
        config.interpolation.clone(),
        LogSink::default(),
        handle.locations(),
        cancel.clone(),
    );
    ctx.spawn("renderer", async move {
        let sink = renderer.run().await;
        tracing::debug!(draws = sink.draws, "Renderer stopped");
    });

    let mut status = handle.status();
    ctx.spawn("status-log", async move {
        while status.changed().await.is_ok() {
            let current = status.borrow_and_update().clone();
            match current.state {
                ConnectionState::Failed => tracing::error!(
                    error = current.last_error.as_deref().unwrap_or("unknown"),
                    "Live tracking stopped"
                ),
                state => tracing::info!(%state, attempts = current.attempts, "Connection"),
            }
        }
    });

    let mut locations = handle.locations();
    ctx.spawn("location-log", async move {
        while locations.changed().await.is_ok() {
            let update = locations.borrow_and_update().clone();
            tracing::info!(
                vehicles = update.locations.len(),
                changed = update.changes.len(),
                cached = update.from_cache,
                "Locations"
            );
        }
    });

    // Headless: nobody is typing, so the view is always passive
    let (_view_tx, view_rx) = watch::channel(ViewMode::Passive);
    if let (Some(url), Some(credential)) = (&args.catalog_url, credential) {
        let client = HttpCatalogClient::new(url.clone(), credential)?;
        let (poller, mut count) = FallbackPoller::new(
            ctx.clone(),
            Arc::new(client),
            channel,
            config.fallback.clone(),
            handle.status(),
            view_rx,
            cancel.clone(),
        );
        ctx.spawn("fallback-poll", poller.run());
        ctx.spawn("fallback-log", async move {
            while count.changed().await.is_ok() {
                if let Some(value) = *count.borrow_and_update() {
                    tracing::info!(count = value, "Catalog count refreshed");
                }
            }
        });
    }

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    tracing::info!("Shutting down");

    cancel.cancel();
    handle.shutdown();
    manager.await.context("connection manager task")?;
    Ok(())
}

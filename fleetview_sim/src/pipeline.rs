//! The full client pipeline wired to a simulated server.

use chrono::{DateTime, Utc};
use fleetview_core::{
    lock_store, ConnectionHandle, ConnectionManager, ConnectionTarget, LatLng, LocationStore, MarkerRenderer,
    MemoryBackend, PipelineConfig, RenderSink, SharedLocationStore,
};
use fleetview_env::{Credential, FleetContext};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::context::SimContext;
use crate::transport::{SimTransport, SimTransportController};

/// What the map layer was asked to draw.
#[derive(Debug, Clone, Default)]
pub struct DrawLog {
    pub draws: u64,

    /// Draw calls with a position failing the validity predicate
    pub invalid_draws: u64,

    pub removals: u64,

    /// Latest drawn position per vehicle
    pub last: HashMap<String, LatLng>,
}

/// [`RenderSink`] that records every call for later inspection.
#[derive(Clone, Default)]
pub struct DrawRecorder {
    state: Arc<Mutex<DrawLog>>,
}

impl DrawRecorder {
    pub fn snapshot(&self) -> DrawLog {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, DrawLog> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl RenderSink for DrawRecorder {
    fn draw(&mut self, vehicle_id: &str, position: LatLng) {
        let mut state = self.lock();
        state.draws += 1;
        if !position.is_valid() {
            tracing::error!(%vehicle_id, ?position, "Invalid position reached the map");
            state.invalid_draws += 1;
        }
        state.last.insert(vehicle_id.to_string(), position);
    }

    fn remove(&mut self, vehicle_id: &str) {
        let mut state = self.lock();
        state.removals += 1;
        state.last.remove(vehicle_id);
    }
}

/// Wall-clock "now" as the pipeline sees it.
pub fn wall_now(ctx: &SimContext) -> DateTime<Utc> {
    DateTime::<Utc>::from(ctx.system_time())
}

/// Store, manager and renderer running against one [`SimTransport`].
pub struct SimPipeline {
    pub ctx: Arc<SimContext>,
    pub server: SimTransportController,
    pub store: SharedLocationStore,
    pub handle: ConnectionHandle,
    pub recorder: DrawRecorder,
    cancel: CancellationToken,
    manager: JoinHandle<()>,
    renderer: JoinHandle<DrawRecorder>,
}

impl SimPipeline {
    /// Hydrates a store from `backend` and starts the manager and renderer.
    ///
    /// Must be called inside the simulation runtime.
    pub fn start(ctx: Arc<SimContext>, backend: Arc<MemoryBackend>, config: &PipelineConfig) -> Self {
        let store = LocationStore::open(backend, config.store.clone(), wall_now(&ctx)).shared();
        let (transport, server) = SimTransport::pair();

        let (manager, handle) = ConnectionManager::new(ctx.clone(), transport, store.clone(), config.connection.clone());
        let manager = tokio::spawn(manager.run());

        let recorder = DrawRecorder::default();
        let cancel = CancellationToken::new();
        let renderer = MarkerRenderer::new(
            ctx.clone(),
            config.interpolation.clone(),
            recorder.clone(),
            handle.locations(),
            cancel.clone(),
        );
        let renderer = tokio::spawn(renderer.run());

        Self {
            ctx,
            server,
            store,
            handle,
            recorder,
            cancel,
            manager,
            renderer,
        }
    }

    /// Connects with the simulation credential.
    pub fn connect(&self, target: ConnectionTarget) -> Result<(), String> {
        let credential = Credential::new("sim-token");
        self.handle.connect(target, credential).map_err(|e| e.to_string())
    }

    /// Lets every task run until idle, advancing virtual time by `duration`.
    pub async fn settle(&self, duration: Duration) {
        self.ctx.sleep(duration).await;
    }

    /// Stored position for a vehicle, if valid.
    pub fn stored_position(&self, vehicle_id: &str) -> Option<LatLng> {
        lock_store(&self.store).get(vehicle_id).and_then(|r| r.position())
    }

    pub fn stored_count(&self) -> usize {
        lock_store(&self.store).valid_records().len()
    }

    /// Stops everything and returns what the map layer saw.
    pub async fn shutdown(self) -> DrawLog {
        self.handle.shutdown();
        if let Err(e) = self.manager.await {
            tracing::error!(error = %e, "Connection manager task failed");
        }
        self.cancel.cancel();
        match self.renderer.await {
            Ok(recorder) => recorder.snapshot(),
            Err(e) => {
                tracing::error!(error = %e, "Renderer task failed");
                self.recorder.snapshot()
            }
        }
    }
}

/// True iff `a` and `b` are the same position up to JSON float round-off.
pub fn same_position(a: LatLng, b: LatLng) -> bool {
    (a.lat - b.lat).abs() < 1e-9 && (a.lng - b.lng).abs() < 1e-9
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetview_core::ConnectionState;
    use fleetview_env::Channel;

    #[test]
    fn test_pipeline_connects_and_stops() {
        let rt = SimContext::runtime().unwrap();
        rt.block_on(async {
            let ctx = SimContext::shared(1);
            let pipeline = SimPipeline::start(ctx, Arc::new(MemoryBackend::new()), &PipelineConfig::default());
            pipeline.connect(ConnectionTarget::order("o1")).unwrap();
            pipeline.settle(Duration::from_millis(10)).await;

            assert_eq!(pipeline.handle.current_status().state, ConnectionState::Connected);
            assert!(pipeline.server.subscriptions().contains(&Channel::Order("o1".into())));

            let recorder = pipeline.shutdown().await;
            assert_eq!(recorder.invalid_draws, 0);
        });
    }

    #[test]
    fn test_recorder_flags_invalid_draws() {
        let mut recorder = DrawRecorder::default();
        recorder.draw("v1", LatLng::new(10.0, 106.0));
        recorder.draw("v1", LatLng::new(0.0, 0.0));
        recorder.remove("v1");

        let state = recorder.snapshot();
        assert_eq!(state.draws, 2);
        assert_eq!(state.invalid_draws, 1);
        assert!(state.last.is_empty());
    }
}

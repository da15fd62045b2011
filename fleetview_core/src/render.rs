//! Marker rendering task.
//!
//! Consumes published [`LocationUpdate`]s, hands new targets to the
//! [`InterpolationScheduler`] and ticks it once per frame while any marker
//! is moving. The map layer itself sits behind [`RenderSink`].

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use fleetview_env::FleetContext;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::config::InterpolationConfig;
use crate::connection::LocationUpdate;
use crate::interpolation::{InterpolationScheduler, TargetOutcome};
use crate::location::{LatLng, LocationRecord};

/// Floor for the frame tick, so a zero interval cannot spin the task.
const MIN_FRAME_INTERVAL: Duration = Duration::from_millis(1);

/// The map layer.
pub trait RenderSink: Send + 'static {
    /// Draws a marker at `position`, creating it if needed.
    fn draw(&mut self, vehicle_id: &str, position: LatLng);

    /// Removes a marker that is no longer published.
    fn remove(&mut self, vehicle_id: &str);
}

/// Calls `tick` with the current time every `interval` until it returns
/// true or `cancel` fires.
///
/// Returns true if `tick` reported completion, false if cancelled.
pub async fn run_until<Ctx, F>(ctx: &Ctx, interval: Duration, cancel: &CancellationToken, mut tick: F) -> bool
where
    Ctx: FleetContext,
    F: FnMut(Duration) -> bool,
{
    loop {
        if tick(ctx.now()) {
            return true;
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return false,
            _ = ctx.sleep(interval) => {}
        }
    }
}

/// Drives marker animation from a stream of location updates.
pub struct MarkerRenderer<Ctx: FleetContext, S: RenderSink> {
    ctx: Arc<Ctx>,
    scheduler: InterpolationScheduler,
    sink: S,
    updates: watch::Receiver<LocationUpdate>,
    cancel: CancellationToken,
}

impl<Ctx: FleetContext, S: RenderSink> MarkerRenderer<Ctx, S> {
    pub fn new(
        ctx: Arc<Ctx>,
        config: InterpolationConfig,
        sink: S,
        updates: watch::Receiver<LocationUpdate>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            ctx,
            scheduler: InterpolationScheduler::new(config),
            sink,
            updates,
            cancel,
        }
    }

    /// Runs until cancelled, or until the update channel closes and every
    /// marker has come to rest. Returns the sink.
    pub async fn run(mut self) -> S {
        let frame_interval = self.scheduler.config().frame_interval.max(MIN_FRAME_INTERVAL);
        let mut updates_open = true;
        self.apply_latest();

        loop {
            let animating = self.scheduler.is_active();
            if !updates_open && !animating {
                break;
            }

            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    tracing::debug!(active = self.scheduler.active_count(), "Renderer cancelled");
                    break;
                }

                changed = self.updates.changed(), if updates_open => match changed {
                    Ok(()) => self.apply_latest(),
                    Err(_) => updates_open = false,
                },

                _ = self.ctx.sleep(frame_interval), if animating => self.frame(),
            }
        }

        self.sink
    }

    fn apply_latest(&mut self) {
        let update = self.updates.borrow_and_update().clone();
        let now = self.ctx.now();

        let published: HashSet<&str> = update.locations.iter().map(|r| r.vehicle_id.as_str()).collect();
        let gone: Vec<String> = self
            .scheduler
            .ids()
            .filter(|id| !published.contains(id.as_str()))
            .cloned()
            .collect();
        for id in gone {
            self.scheduler.remove(&id);
            self.sink.remove(&id);
        }

        // Changed vehicles, plus markers still short of their published
        // position (watch only keeps the newest update, so earlier change
        // lists can be lost).
        let changed: HashSet<&str> = update.changes.iter().map(String::as_str).collect();
        let targets: Vec<&LocationRecord> = update
            .locations
            .iter()
            .filter(|record| {
                changed.contains(record.vehicle_id.as_str())
                    || self.scheduler.destination(&record.vehicle_id) != record.position()
            })
            .collect();

        for (vehicle_id, outcome) in self.scheduler.apply(targets, now) {
            match outcome {
                TargetOutcome::Placed(position) => self.sink.draw(&vehicle_id, position),
                TargetOutcome::Throttled => tracing::trace!(%vehicle_id, "Update throttled"),
                TargetOutcome::Rejected => tracing::debug!(%vehicle_id, "Rejected invalid marker position"),
                TargetOutcome::Started { .. } | TargetOutcome::Unchanged => {}
            }
        }
    }

    fn frame(&mut self) {
        for (vehicle_id, position) in self.scheduler.tick(self.ctx.now()) {
            self.sink.draw(&vehicle_id, position);
        }
    }
}

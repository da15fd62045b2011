//! Scenario runner - executes fault scenarios against the full pipeline.

use crate::context::SimContext;
use crate::oracle::{DataFaults, FleetOracle};
use crate::pipeline::{same_position, wall_now, SimPipeline};
use crate::scenarios::ScenarioId;

use chrono::Duration as ChronoDuration;
use fleetview_core::render::run_until;
use fleetview_core::{
    lock_store, ConnectionState, ConnectionTarget, LatLng, LocationRecord, LocationStore, MemoryBackend,
    PipelineConfig,
};
use fleetview_env::{Channel, FleetContext, SessionId, TransportController, TransportEvent};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Ho Chi Minh City, where the simulated fleet drives.
const FLEET_CENTER: LatLng = LatLng {
    lat: 10.7769,
    lng: 106.7009,
};

/// Results from running a scenario.
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioResult {
    /// Scenario that was run
    pub scenario: String,

    /// Seed used
    pub seed: u64,

    /// Whether scenario passed all assertions
    pub passed: bool,

    /// Stream frames the server pushed
    pub total_frames: u64,

    /// Final virtual time in seconds
    pub final_time_secs: f64,

    /// Valid records in the client cache at the end
    pub final_vehicle_count: usize,

    /// Failure message if any
    pub failure_reason: Option<String>,

    /// Metrics collected during run
    pub metrics: ScenarioMetrics,
}

/// Metrics collected during scenario execution.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScenarioMetrics {
    /// Handshakes the client started
    pub connection_attempts: usize,

    pub snapshot_requests: usize,

    /// Frames offered while the client was not subscribed
    pub frames_missed: u64,

    pub duplicates_injected: u64,
    pub invalid_coordinates_injected: u64,
    pub malformed_frames_injected: u64,

    /// Draw calls reaching the map layer
    pub marker_draws: u64,

    /// Draw calls with invalid coordinates (must stay 0)
    pub invalid_draws: u64,

    /// Connections dropped by the server
    pub drops: u64,
}

type Check = Result<(), String>;

fn ensure(condition: bool, message: impl FnOnce() -> String) -> Check {
    if condition {
        Ok(())
    } else {
        Err(message())
    }
}

/// Runs fault scenarios.
pub struct ScenarioRunner {
    /// Configuration seed
    seed: u64,

    /// Streaming phase length in seconds
    duration_secs: u64,

    config: PipelineConfig,
}

/// State threaded through one scenario run.
struct Run {
    ctx: Arc<SimContext>,
    oracle: FleetOracle,
    metrics: ScenarioMetrics,
    frames: u64,
    final_vehicle_count: usize,
}

impl Run {
    /// Publishes one fresh frame if the client is subscribed to `channel`.
    fn push_frame(&mut self, pipeline: &SimPipeline, channel: &Channel) -> bool {
        if !pipeline.server.subscriptions().contains(channel) {
            self.metrics.frames_missed += 1;
            return false;
        }
        let now = wall_now(&self.ctx);
        let payload = match channel {
            Channel::Order(_) => Some(self.oracle.frame(now)),
            Channel::Vehicle(id) => self.oracle.vehicle_frame(id, now),
        };
        let Some(payload) = payload else {
            return false;
        };
        let sent = pipeline.server.publish(channel, payload);
        if sent {
            self.frames += 1;
        }
        sent
    }

    /// Every vehicle the oracle delivered must be stored where the oracle says.
    fn check_store_matches(&self, pipeline: &SimPipeline) -> Check {
        for vehicle_id in self.oracle.vehicle_ids() {
            let Some(expected) = self.oracle.expected_position(&vehicle_id) else {
                continue;
            };
            let stored = pipeline.stored_position(&vehicle_id);
            ensure(stored.is_some_and(|p| same_position(p, expected)), || {
                format!("{}: stored {:?}, expected {:?}", vehicle_id, stored, expected)
            })?;
        }
        Ok(())
    }

    fn collect(&mut self, pipeline: &SimPipeline) {
        let server = &pipeline.server;
        self.metrics.connection_attempts = server.opens();
        self.metrics.snapshot_requests = server.snapshot_requests().len();
        let faults = self.oracle.injected_faults();
        self.metrics.duplicates_injected = faults.duplicates;
        self.metrics.invalid_coordinates_injected = faults.zeroed + faults.nulled;
        self.metrics.malformed_frames_injected = faults.malformed_frames;
        self.final_vehicle_count = pipeline.stored_count();
    }
}

/// Every published location list must be valid and unique per vehicle.
fn check_published(pipeline: &SimPipeline) -> Check {
    let update = pipeline.handle.current_locations();
    let mut seen = HashSet::new();
    for record in &update.locations {
        ensure(record.is_valid(), || format!("{} published with invalid coordinates", record.vehicle_id))?;
        ensure(seen.insert(record.vehicle_id.clone()), || {
            format!("{} published twice", record.vehicle_id)
        })?;
    }
    Ok(())
}

/// Waits (in virtual time) until `predicate` holds, at most `limit`.
async fn wait_until(ctx: &Arc<SimContext>, limit: Duration, mut predicate: impl FnMut() -> bool) -> bool {
    let deadline = CancellationToken::new();
    {
        let deadline = deadline.clone();
        let ctx_inner = ctx.clone();
        ctx.spawn("wait-deadline", async move {
            ctx_inner.sleep(limit).await;
            deadline.cancel();
        });
    }
    let reached = run_until(ctx.as_ref(), Duration::from_millis(100), &deadline, |_| predicate()).await;
    deadline.cancel();
    reached
}

impl ScenarioRunner {
    /// Creates a new scenario runner.
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            duration_secs: 30,
            config: PipelineConfig::default(),
        }
    }

    /// Sets the streaming phase length.
    pub fn with_duration(mut self, secs: u64) -> Self {
        self.duration_secs = secs.max(10);
        self
    }

    pub fn with_config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    /// Runs a scenario and returns the result.
    pub fn run(&self, scenario: ScenarioId) -> ScenarioResult {
        info!("Starting scenario: {} (seed={})", scenario.name(), self.seed);

        let runtime = match SimContext::runtime() {
            Ok(runtime) => runtime,
            Err(e) => return self.failed(scenario, format!("could not build runtime: {}", e)),
        };
        runtime.block_on(self.run_async(scenario))
    }

    fn failed(&self, scenario: ScenarioId, reason: String) -> ScenarioResult {
        ScenarioResult {
            scenario: scenario.name().to_string(),
            seed: self.seed,
            passed: false,
            total_frames: 0,
            final_time_secs: 0.0,
            final_vehicle_count: 0,
            failure_reason: Some(reason),
            metrics: ScenarioMetrics::default(),
        }
    }

    async fn run_async(&self, scenario: ScenarioId) -> ScenarioResult {
        let ctx = SimContext::shared(self.seed);
        let physics_seed = self.seed.wrapping_mul(0x9e3779b97f4a7c15);
        let mut run = Run {
            ctx: ctx.clone(),
            oracle: FleetOracle::new(physics_seed),
            metrics: ScenarioMetrics::default(),
            frames: 0,
            final_vehicle_count: 0,
        };

        let outcome = match scenario {
            ScenarioId::SteadyStream => self.run_steady_stream(&mut run).await,
            ScenarioId::FlappingLink => self.run_flapping_link(&mut run).await,
            ScenarioId::RetryExhaustion => self.run_retry_exhaustion(&mut run).await,
            ScenarioId::DirtyData => self.run_dirty_data(&mut run).await,
            ScenarioId::StaleReplay => self.run_stale_replay(&mut run).await,
            ScenarioId::ColdStart => self.run_cold_start(&mut run).await,
            ScenarioId::TargetSwitch => self.run_target_switch(&mut run).await,
        };

        if let Err(reason) = &outcome {
            warn!("{} FAILED: {}", scenario.name(), reason);
        } else {
            info!("{} PASSED", scenario.name());
        }

        ScenarioResult {
            scenario: scenario.name().to_string(),
            seed: self.seed,
            passed: outcome.is_ok(),
            total_frames: run.frames,
            final_time_secs: ctx.now().as_secs_f64(),
            final_vehicle_count: run.final_vehicle_count,
            failure_reason: outcome.err(),
            metrics: run.metrics,
        }
    }

    /// Streams one frame per second for the configured duration.
    async fn stream(&self, run: &mut Run, pipeline: &SimPipeline, channel: &Channel) {
        for _ in 0..self.duration_secs {
            pipeline.settle(Duration::from_secs(1)).await;
            run.oracle.step(1.0);
            run.push_frame(pipeline, channel);
        }
    }

    /// Markers must have come to rest exactly on the stored positions.
    fn check_markers_converged(&self, run: &Run, pipeline: &SimPipeline) -> Check {
        let recorder = pipeline.recorder.snapshot();
        ensure(recorder.invalid_draws == 0, || {
            format!("{} invalid positions reached the map", recorder.invalid_draws)
        })?;
        for vehicle_id in run.oracle.vehicle_ids() {
            let Some(expected) = run.oracle.expected_position(&vehicle_id) else {
                continue;
            };
            let drawn = recorder.last.get(&vehicle_id).copied();
            ensure(drawn.is_some_and(|p| same_position(p, expected)), || {
                format!("{}: marker at {:?}, expected {:?}", vehicle_id, drawn, expected)
            })?;
        }
        Ok(())
    }

    async fn finish(&self, run: &mut Run, pipeline: SimPipeline) -> Check {
        run.collect(&pipeline);
        let recorder = pipeline.shutdown().await;
        run.metrics.marker_draws = recorder.draws;
        run.metrics.invalid_draws = recorder.invalid_draws;
        ensure(recorder.invalid_draws == 0, || {
            format!("{} invalid positions reached the map", recorder.invalid_draws)
        })
    }

    /// FV-001: SteadyStream - clean 1 Hz stream.
    ///
    /// **Assertion**: cache and markers end exactly on the last fix of every
    /// vehicle; one handshake, one snapshot request.
    async fn run_steady_stream(&self, run: &mut Run) -> Check {
        info!("FV-001: SteadyStream - clean 1 Hz stream");
        run.oracle.spawn_fleet(20, FLEET_CENTER);

        let pipeline = SimPipeline::start(run.ctx.clone(), Arc::new(MemoryBackend::new()), &self.config);
        let channel = Channel::Order("order-1".into());
        pipeline
            .server
            .set_snapshot(&channel, run.oracle.frame(wall_now(&run.ctx)));
        pipeline.connect(ConnectionTarget::order("order-1"))?;

        self.stream(run, &pipeline, &channel).await;
        // Longest animation is max_duration
        pipeline.settle(self.config.interpolation.max_duration * 2).await;

        let status = pipeline.handle.current_status();
        let checks = ensure(status.state == ConnectionState::Connected, || {
            format!("expected connected, got {}", status.state)
        })
        .and_then(|_| {
            ensure(pipeline.stored_count() == 20, || {
                format!("expected 20 vehicles, store has {}", pipeline.stored_count())
            })
        })
        .and_then(|_| run.check_store_matches(&pipeline))
        .and_then(|_| self.check_markers_converged(run, &pipeline))
        .and_then(|_| ensure(pipeline.server.opens() == 1, || format!("{} handshakes", pipeline.server.opens())))
        .and_then(|_| {
            let requests = pipeline.server.snapshot_requests().len();
            ensure(requests == 1, || format!("{} snapshot requests, expected 1", requests))
        });

        self.finish(run, pipeline).await?;
        checks
    }

    /// FV-002: FlappingLink - ungraceful drops every 7 seconds.
    ///
    /// **Assertion**: the cache never shrinks while disconnected, the client
    /// recovers after each drop with a fresh retry budget, and ends on the
    /// latest delivered fix.
    async fn run_flapping_link(&self, run: &mut Run) -> Check {
        info!("FV-002: FlappingLink - ungraceful drops");
        run.oracle.spawn_fleet(10, FLEET_CENTER);

        let pipeline = SimPipeline::start(run.ctx.clone(), Arc::new(MemoryBackend::new()), &self.config);
        let channel = Channel::Order("order-1".into());
        // Replayed on every reconnect; stale after the first
        pipeline
            .server
            .set_snapshot(&channel, run.oracle.frame(wall_now(&run.ctx)));
        pipeline.connect(ConnectionTarget::order("order-1"))?;

        let mut high_water = 0;
        let mut result = Ok(());
        for second in 1..=self.duration_secs {
            pipeline.settle(Duration::from_secs(1)).await;
            run.oracle.step(1.0);
            run.push_frame(&pipeline, &channel);

            if second % 7 == 0 {
                debug!(second, "Dropping connection");
                pipeline.server.drop_connection(false);
                run.metrics.drops += 1;
            }

            let count = pipeline.stored_count();
            let published = pipeline.handle.current_locations().locations.len();
            if count < high_water || published < high_water {
                result = Err(format!(
                    "cache shrank to {} (published {}) from {} at t={}s",
                    count, published, high_water, second
                ));
                break;
            }
            high_water = count;
        }
        result?;

        let reconnected = wait_until(&run.ctx, self.config.connection.reconnect_interval * 2, || {
            pipeline.handle.current_status().state == ConnectionState::Connected
        })
        .await;

        let status = pipeline.handle.current_status();
        let checks = ensure(reconnected, || format!("did not recover, state {}", status.state))
            .and_then(|_| ensure(status.attempts == 0, || format!("attempts not reset: {}", status.attempts)))
            .and_then(|_| {
                let opens = pipeline.server.opens() as u64;
                ensure(opens == run.metrics.drops + 1, || {
                    format!("{} handshakes for {} drops", opens, run.metrics.drops)
                })
            })
            .and_then(|_| run.check_store_matches(&pipeline));

        self.finish(run, pipeline).await?;
        checks
    }

    /// FV-003: RetryExhaustion - the server refuses every handshake.
    ///
    /// **Assertion**: exactly `max_reconnect_attempts` handshakes, then
    /// `Failed` with a visible error and no further attempts; cached data
    /// stays published; a manual reconnect recovers.
    async fn run_retry_exhaustion(&self, run: &mut Run) -> Check {
        info!("FV-003: RetryExhaustion - all handshakes refused");
        let max_attempts = self.config.connection.max_reconnect_attempts as usize;

        // A position left over from an earlier session
        let backend = Arc::new(MemoryBackend::new());
        {
            let mut store = LocationStore::new(backend.clone(), self.config.store.clone());
            let seen = wall_now(&run.ctx) - ChronoDuration::minutes(10);
            store.apply_batch(vec![LocationRecord::new("v1").at(10.78, 106.70).updated_at(seen)]);
        }

        let pipeline = SimPipeline::start(run.ctx.clone(), backend, &self.config);
        pipeline.server.refuse_connections(usize::MAX);
        pipeline.connect(ConnectionTarget::order("order-1"))?;

        let budget = self.config.connection.reconnect_interval * (max_attempts as u32 + 1);
        let failed = wait_until(&run.ctx, budget, || {
            pipeline.handle.current_status().state == ConnectionState::Failed
        })
        .await;
        let opens_at_failure = pipeline.server.opens();

        // Nothing may retry on its own after the terminal failure
        pipeline.settle(self.config.connection.reconnect_interval * 4).await;

        let status = pipeline.handle.current_status();
        let update = pipeline.handle.current_locations();
        let now = wall_now(&run.ctx);
        let mut checks = ensure(failed, || format!("never failed, state {}", status.state))
            .and_then(|_| {
                ensure(opens_at_failure == max_attempts, || {
                    format!("{} handshakes, budget {}", opens_at_failure, max_attempts)
                })
            })
            .and_then(|_| {
                ensure(pipeline.server.opens() == opens_at_failure, || {
                    format!("{} handshakes after Failed", pipeline.server.opens() - opens_at_failure)
                })
            })
            .and_then(|_| ensure(status.last_error.is_some(), || "no terminal error surfaced".to_string()))
            .and_then(|_| {
                ensure(update.locations.len() == 1 && update.from_cache, || {
                    format!("cached location not published: {:?}", update.locations)
                })
            })
            .and_then(|_| {
                let store = lock_store(&pipeline.store);
                let online = store.get("v1").map(|r| store.is_online(r, now));
                ensure(online == Some(false), || format!("cached v1 online state {:?}", online))
            });

        if checks.is_ok() {
            pipeline.server.refuse_connections(0);
            pipeline.handle.reconnect(None).map_err(|e| e.to_string())?;
            let recovered = wait_until(&run.ctx, self.config.connection.manual_reconnect_grace * 5, || {
                pipeline.handle.current_status().state == ConnectionState::Connected
            })
            .await;
            let status = pipeline.handle.current_status();
            checks = ensure(recovered, || format!("manual reconnect ended in {}", status.state))
                .and_then(|_| ensure(status.last_error.is_none(), || "terminal error not cleared".to_string()));
        }

        self.finish(run, pipeline).await?;
        checks
    }

    /// FV-004: DirtyData - faulty records and frames.
    ///
    /// **Assertion**: nothing invalid is published or drawn, duplicates
    /// resolve to the first occurrence, and invalid coordinates never
    /// overwrite a valid stored position.
    async fn run_dirty_data(&self, run: &mut Run) -> Check {
        info!("FV-004: DirtyData - duplicates, sentinels, nulls, truncation");
        run.oracle.spawn_fleet(15, FLEET_CENTER);
        run.oracle.set_faults(DataFaults::dirty());

        let pipeline = SimPipeline::start(run.ctx.clone(), Arc::new(MemoryBackend::new()), &self.config);
        let channel = Channel::Order("order-1".into());
        pipeline.connect(ConnectionTarget::order("order-1"))?;

        let mut result = Ok(());
        for _ in 0..self.duration_secs {
            pipeline.settle(Duration::from_secs(1)).await;
            run.oracle.step(1.0);
            run.push_frame(&pipeline, &channel);
            // Let the frame be merged before inspecting it
            pipeline.settle(Duration::from_millis(1)).await;

            result = check_published(&pipeline).and_then(|_| run.check_store_matches(&pipeline));
            if result.is_err() {
                break;
            }
        }
        result?;
        pipeline.settle(self.config.interpolation.max_duration * 2).await;

        let faults = run.oracle.injected_faults();
        let checks = ensure(faults.duplicates > 0 && faults.zeroed + faults.nulled > 0, || {
            format!("too few faults injected: {:?}", faults)
        })
        .and_then(|_| self.check_markers_converged(run, &pipeline));

        self.finish(run, pipeline).await?;
        checks
    }

    /// FV-005: StaleReplay - old frames after fresh ones.
    ///
    /// **Assertion**: replayed frames and frames from a dead session change
    /// nothing.
    async fn run_stale_replay(&self, run: &mut Run) -> Check {
        info!("FV-005: StaleReplay - out-of-order old frames");
        run.oracle.spawn_fleet(8, FLEET_CENTER);

        let pipeline = SimPipeline::start(run.ctx.clone(), Arc::new(MemoryBackend::new()), &self.config);
        let channel = Channel::Order("order-1".into());
        pipeline.connect(ConnectionTarget::order("order-1"))?;

        let mut result = Ok(());
        for second in 1..=self.duration_secs {
            pipeline.settle(Duration::from_secs(1)).await;
            run.oracle.step(1.0);
            run.push_frame(&pipeline, &channel);
            if second < 5 {
                continue;
            }

            let age = ChronoDuration::seconds(run.ctx.with_rng(|rng| rand::Rng::gen_range(rng, 1..60)));
            let stale = run.oracle.stale_frame(wall_now(&run.ctx), age);
            pipeline.settle(Duration::from_millis(1)).await;
            pipeline.server.publish(&channel, stale.clone());

            // Same frame from a session that no longer exists
            if let Some(SessionId(live)) = pipeline.server.live_session() {
                pipeline.server.inject_event(TransportEvent::Message {
                    session: SessionId(live.wrapping_sub(1)),
                    channel: channel.clone(),
                    payload: stale,
                });
            }
            pipeline.settle(Duration::from_millis(1)).await;

            let update = pipeline.handle.current_locations();
            result = ensure(update.changes.is_empty(), || {
                format!("stale frame changed {:?} at t={}s", update.changes, second)
            })
            .and_then(|_| run.check_store_matches(&pipeline));
            if result.is_err() {
                break;
            }
        }

        self.finish(run, pipeline).await?;
        result
    }

    /// FV-006: ColdStart - restart with a persisted cache.
    ///
    /// **Assertion**: after 2h of downtime the map shows every persisted
    /// position (offline) before any connection; after 25h the cache is
    /// empty.
    async fn run_cold_start(&self, run: &mut Run) -> Check {
        info!("FV-006: ColdStart - persisted cache and retention");
        run.oracle.spawn_fleet(5, FLEET_CENTER);
        let backend = Arc::new(MemoryBackend::new());
        let channel = Channel::Order("order-1".into());

        // First process lifetime
        let pipeline = SimPipeline::start(run.ctx.clone(), backend.clone(), &self.config);
        pipeline.connect(ConnectionTarget::order("order-1"))?;
        pipeline.settle(Duration::from_millis(10)).await;
        for _ in 0..10 {
            pipeline.settle(Duration::from_secs(1)).await;
            run.oracle.step(1.0);
            run.push_frame(&pipeline, &channel);
        }
        pipeline.settle(Duration::from_millis(10)).await;
        run.collect(&pipeline);
        pipeline.shutdown().await;

        // Restart after 2h down
        run.ctx.skip_wall_clock(Duration::from_secs(2 * 60 * 60));
        let pipeline = SimPipeline::start(run.ctx.clone(), backend.clone(), &self.config);
        pipeline.settle(Duration::from_millis(10)).await;

        let update = pipeline.handle.current_locations();
        let recorder = pipeline.recorder.snapshot();
        let now = wall_now(&run.ctx);
        let restored = ensure(update.from_cache && update.locations.len() == 5, || {
            format!("restart published {} cached records", update.locations.len())
        })
        .and_then(|_| run.check_store_matches(&pipeline))
        .and_then(|_| {
            let store = lock_store(&pipeline.store);
            ensure(update.locations.iter().all(|r| !store.is_online(r, now)), || {
                "restored vehicle reported online after 2h".to_string()
            })
        })
        .and_then(|_| {
            ensure(recorder.last.len() == 5, || {
                format!("{} markers drawn from cache before connecting", recorder.last.len())
            })
        })
        .and_then(|_| ensure(pipeline.server.opens() == 0, || "connected without a request".to_string()));
        self.finish(run, pipeline).await?;
        restored?;

        // Restart after 25h down in total
        run.ctx.skip_wall_clock(Duration::from_secs(23 * 60 * 60));
        let pipeline = SimPipeline::start(run.ctx.clone(), backend, &self.config);
        pipeline.settle(Duration::from_millis(10)).await;
        let update = pipeline.handle.current_locations();
        let expired = ensure(update.locations.is_empty() && pipeline.stored_count() == 0, || {
            format!("{} records survived 25h retention", update.locations.len())
        });
        self.finish(run, pipeline).await?;
        expired
    }

    /// FV-007: TargetSwitch - reconnect onto another vehicle.
    ///
    /// **Assertion**: exactly one subscription at a time, moved to the new
    /// channel with its own snapshot request; the old vehicle stays cached.
    async fn run_target_switch(&self, run: &mut Run) -> Check {
        info!("FV-007: TargetSwitch - manual reconnect to a new target");
        run.oracle.spawn_vehicle("v1", FLEET_CENTER, LatLng::new(1e-4, 0.0));
        run.oracle
            .spawn_vehicle("v2", LatLng::new(FLEET_CENTER.lat + 0.02, FLEET_CENTER.lng), LatLng::new(0.0, 1e-4));

        let pipeline = SimPipeline::start(run.ctx.clone(), Arc::new(MemoryBackend::new()), &self.config);
        let first = Channel::Vehicle("v1".into());
        let second = Channel::Vehicle("v2".into());
        pipeline.connect(ConnectionTarget::vehicle("v1"))?;

        let half = self.duration_secs / 2;
        for _ in 0..half {
            pipeline.settle(Duration::from_secs(1)).await;
            run.oracle.step(1.0);
            run.push_frame(&pipeline, &first);
        }

        pipeline
            .handle
            .reconnect(Some(ConnectionTarget::vehicle("v2")))
            .map_err(|e| e.to_string())?;
        let switched = wait_until(&run.ctx, self.config.connection.manual_reconnect_grace * 5, || {
            pipeline.server.subscriptions().contains(&second)
        })
        .await;

        for _ in half..self.duration_secs {
            pipeline.settle(Duration::from_secs(1)).await;
            run.oracle.step(1.0);
            run.push_frame(&pipeline, &second);
        }
        pipeline.settle(Duration::from_millis(10)).await;

        let subscriptions = pipeline.server.subscriptions();
        let status = pipeline.handle.current_status();
        let requests = pipeline.server.snapshot_requests();
        let checks = ensure(switched, || "subscription never moved to v2".to_string())
            .and_then(|_| {
                ensure(subscriptions.len() == 1 && subscriptions.contains(&second), || {
                    format!("subscriptions after switch: {:?}", subscriptions)
                })
            })
            .and_then(|_| ensure(!pipeline.server.publish(&first, b"[]".to_vec()), || "v1 still subscribed".to_string()))
            .and_then(|_| {
                ensure(status.channel == Some(second.clone()), || format!("status channel {:?}", status.channel))
            })
            .and_then(|_| {
                ensure(requests.last() == Some(&second.snapshot_request()), || {
                    format!("last snapshot request {:?}", requests.last())
                })
            })
            .and_then(|_| ensure(pipeline.stored_count() == 2, || format!("{} vehicles cached", pipeline.stored_count())))
            .and_then(|_| run.check_store_matches(&pipeline));

        self.finish(run, pipeline).await?;
        checks
    }
}

//! End-to-end pipeline behaviour against the simulated server.

use chrono::Duration as ChronoDuration;
use fleetview_core::{lock_store, ConnectionState, ConnectionTarget, LatLng, LocationRecord, MemoryBackend, PipelineConfig};
use fleetview_env::{Channel, FleetContext, TransportController};
use fleetview_sim::scenarios::ScenarioId;
use fleetview_sim::{wall_now, ScenarioRunner, SimContext, SimPipeline};
use proptest::prelude::*;
use std::sync::Arc;
use std::time::Duration;

fn batch(records: &[LocationRecord]) -> Vec<u8> {
    serde_json::to_vec(records).unwrap()
}

#[test]
fn test_last_known_position_goes_offline_after_timeout() {
    let rt = SimContext::runtime().unwrap();
    rt.block_on(async {
        let ctx = SimContext::shared(1);
        let pipeline = SimPipeline::start(ctx.clone(), Arc::new(MemoryBackend::new()), &PipelineConfig::default());
        let channel = Channel::Vehicle("v1".into());
        pipeline.connect(ConnectionTarget::vehicle("v1")).unwrap();
        pipeline.settle(Duration::from_millis(10)).await;

        let t1 = wall_now(&ctx);
        let record = LocationRecord::new("v1").at(10.0, 106.0).updated_at(t1);
        assert!(pipeline.server.publish(&channel, serde_json::to_vec(&record).unwrap()));
        pipeline.settle(Duration::from_secs(2)).await;

        // Network gone for good
        pipeline.server.refuse_connections(usize::MAX);
        pipeline.server.drop_connection(false);

        pipeline.settle(Duration::from_secs(4 * 60 + 55)).await;
        {
            let store = lock_store(&pipeline.store);
            let cached = store.get("v1").unwrap();
            assert_eq!(cached.position(), Some(LatLng::new(10.0, 106.0)));
            assert!(store.is_online(cached, wall_now(&ctx)));
        }

        pipeline.settle(Duration::from_secs(10)).await;
        {
            let store = lock_store(&pipeline.store);
            let cached = store.get("v1").unwrap();
            assert_eq!(cached.last_updated_at(), Some(t1));
            assert!(!store.is_online(cached, wall_now(&ctx)));
        }

        // Still on the map while the stream is dead
        assert_eq!(pipeline.handle.current_status().state, ConnectionState::Failed);
        assert_eq!(pipeline.handle.current_locations().locations, vec![record]);
        pipeline.shutdown().await;
    });
}

#[test]
fn test_mixed_batch_through_manager() {
    let rt = SimContext::runtime().unwrap();
    rt.block_on(async {
        let ctx = SimContext::shared(2);
        let pipeline = SimPipeline::start(ctx.clone(), Arc::new(MemoryBackend::new()), &PipelineConfig::default());
        let channel = Channel::Order("o1".into());
        pipeline.connect(ConnectionTarget::order("o1")).unwrap();
        pipeline.settle(Duration::from_millis(10)).await;

        let t0 = wall_now(&ctx);
        pipeline
            .server
            .publish(&channel, batch(&[LocationRecord::new("v2").at(11.0, 107.0).updated_at(t0)]));
        pipeline.settle(Duration::from_secs(1)).await;

        let t1 = wall_now(&ctx);
        let mut v2_lost_fix = LocationRecord::new("v2").updated_at(t1);
        v2_lost_fix.speed = Some(0.0);
        pipeline.server.publish(
            &channel,
            batch(&[
                LocationRecord::new("v1").at(10.0, 106.0).updated_at(t1),
                LocationRecord::new("v1").at(10.5, 106.5).updated_at(t1),
                v2_lost_fix,
            ]),
        );
        pipeline.settle(Duration::from_millis(10)).await;

        let update = pipeline.handle.current_locations();
        assert_eq!(update.locations.len(), 2);
        assert_eq!(update.duplicates_removed, 1);

        let v1 = update.locations.iter().find(|r| r.vehicle_id == "v1").unwrap();
        assert_eq!(v1.position(), Some(LatLng::new(10.0, 106.0)));
        let v2 = update.locations.iter().find(|r| r.vehicle_id == "v2").unwrap();
        assert_eq!(v2.position(), Some(LatLng::new(11.0, 107.0)));
        assert_eq!(v2.speed, Some(0.0));
        assert_eq!(v2.last_updated_at(), Some(t1));

        pipeline.shutdown().await;
    });
}

#[test]
fn test_snapshot_retried_once_when_server_ignores_it() {
    let rt = SimContext::runtime().unwrap();
    rt.block_on(async {
        let ctx = SimContext::shared(3);
        let config = PipelineConfig::default();
        let pipeline = SimPipeline::start(ctx.clone(), Arc::new(MemoryBackend::new()), &config);
        let channel = Channel::Order("o1".into());
        let t0 = wall_now(&ctx) - ChronoDuration::seconds(5);
        pipeline
            .server
            .set_snapshot(&channel, batch(&[LocationRecord::new("v1").at(10.0, 106.0).updated_at(t0)]));
        pipeline.server.ignore_snapshot_requests(1);

        pipeline.connect(ConnectionTarget::order("o1")).unwrap();
        pipeline.settle(config.connection.snapshot_retry_after / 2).await;
        assert_eq!(pipeline.server.snapshot_requests().len(), 1);
        assert_eq!(pipeline.stored_count(), 0);

        pipeline.settle(config.connection.snapshot_retry_after).await;
        assert_eq!(pipeline.server.snapshot_requests().len(), 2);
        assert_eq!(pipeline.stored_count(), 1);

        pipeline.settle(config.connection.snapshot_retry_after * 3).await;
        assert_eq!(pipeline.server.snapshot_requests().len(), 2);
        pipeline.shutdown().await;
    });
}

#[test]
fn test_error_frame_triggers_reconnect() {
    let rt = SimContext::runtime().unwrap();
    rt.block_on(async {
        let ctx = SimContext::shared(4);
        let config = PipelineConfig::default();
        let pipeline = SimPipeline::start(ctx.clone(), Arc::new(MemoryBackend::new()), &config);
        pipeline.connect(ConnectionTarget::order("o1")).unwrap();
        pipeline.settle(Duration::from_millis(10)).await;
        assert_eq!(pipeline.server.opens(), 1);

        pipeline.server.inject_error_frame("AMQ-1001 subscription revoked");
        pipeline.settle(Duration::from_millis(10)).await;
        let status = pipeline.handle.current_status();
        assert_eq!(status.state, ConnectionState::Reconnecting);
        assert!(status.last_error.unwrap().contains("AMQ-1001"));

        pipeline.settle(config.connection.reconnect_interval).await;
        assert_eq!(pipeline.handle.current_status().state, ConnectionState::Connected);
        assert_eq!(pipeline.server.opens(), 2);
        pipeline.shutdown().await;
    });
}

#[test]
fn test_graceful_close_does_not_retry() {
    let rt = SimContext::runtime().unwrap();
    rt.block_on(async {
        let ctx = SimContext::shared(5);
        let config = PipelineConfig::default();
        let pipeline = SimPipeline::start(ctx.clone(), Arc::new(MemoryBackend::new()), &config);
        pipeline.connect(ConnectionTarget::order("o1")).unwrap();
        pipeline.settle(Duration::from_millis(10)).await;

        pipeline.server.drop_connection(true);
        pipeline.settle(config.connection.reconnect_interval * 3).await;

        assert_eq!(pipeline.handle.current_status().state, ConnectionState::Disconnected);
        assert_eq!(pipeline.server.opens(), 1);
        pipeline.shutdown().await;
    });
}

#[test]
fn test_disconnect_while_reconnect_pending() {
    let rt = SimContext::runtime().unwrap();
    rt.block_on(async {
        let ctx = SimContext::shared(6);
        let config = PipelineConfig::default();
        let pipeline = SimPipeline::start(ctx.clone(), Arc::new(MemoryBackend::new()), &config);
        pipeline.connect(ConnectionTarget::order("o1")).unwrap();
        pipeline.settle(Duration::from_millis(10)).await;

        pipeline.server.drop_connection(false);
        pipeline.settle(Duration::from_millis(10)).await;
        assert_eq!(pipeline.handle.current_status().state, ConnectionState::Reconnecting);

        pipeline.handle.disconnect();
        pipeline.handle.disconnect();
        pipeline.settle(config.connection.reconnect_interval * 4).await;

        assert_eq!(pipeline.handle.current_status().state, ConnectionState::Disconnected);
        assert_eq!(pipeline.server.opens(), 1);
        pipeline.shutdown().await;
    });
}

#[test]
fn test_handshake_latency_sets_connecting_flag() {
    let rt = SimContext::runtime().unwrap();
    rt.block_on(async {
        let ctx = SimContext::shared(7);
        let config = PipelineConfig::default();
        let pipeline = SimPipeline::start(ctx.clone(), Arc::new(MemoryBackend::new()), &config);
        pipeline.server.set_handshake_latency(Duration::from_secs(10));
        pipeline.connect(ConnectionTarget::order("o1")).unwrap();

        pipeline.settle(Duration::from_millis(10)).await;
        let status = pipeline.handle.current_status();
        assert_eq!(status.state, ConnectionState::Connecting);
        assert!(status.connecting);

        // Spinner hidden after the soft timeout, handshake still pending
        pipeline.settle(config.connection.connecting_soft_timeout).await;
        let status = pipeline.handle.current_status();
        assert_eq!(status.state, ConnectionState::Connecting);
        assert!(!status.connecting);

        pipeline.settle(Duration::from_secs(10)).await;
        assert_eq!(pipeline.handle.current_status().state, ConnectionState::Connected);
        pipeline.shutdown().await;
    });
}

#[test]
fn test_cold_start_then_expiry() {
    let result = ScenarioRunner::new(99).run(ScenarioId::ColdStart);
    assert!(result.passed, "{:?}", result.failure_reason);
    assert_eq!(result.final_vehicle_count, 0);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(8))]

    #[test]
    fn prop_dirty_data_never_reaches_map(seed in any::<u64>()) {
        let result = ScenarioRunner::new(seed).with_duration(15).run(ScenarioId::DirtyData);
        prop_assert!(result.passed, "seed {}: {:?}", seed, result.failure_reason);
        prop_assert_eq!(result.metrics.invalid_draws, 0);
    }

    #[test]
    fn prop_stale_replay_is_noop(seed in any::<u64>()) {
        let result = ScenarioRunner::new(seed).with_duration(12).run(ScenarioId::StaleReplay);
        prop_assert!(result.passed, "seed {}: {:?}", seed, result.failure_reason);
    }
}

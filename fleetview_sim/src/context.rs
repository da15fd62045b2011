//! Simulation context implementing FleetContext for deterministic testing.

use async_trait::async_trait;
use fleetview_env::FleetContext;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::Instant;

/// Simulation context backed by deterministic time and RNG.
///
/// This implements `FleetContext` using:
/// - tokio's clock on a paused runtime (see [`SimContext::runtime`]), which
///   jumps straight to the next timer whenever every task is idle
/// - a fixed epoch for the wall clock, plus an offset that scenarios can
///   push forward to model downtime between process runs
/// - a seeded ChaCha8 RNG for scenario decisions
pub struct SimContext {
    /// Master seed for this simulation
    seed: u64,

    /// Virtual time zero
    start: Instant,

    /// Deterministic RNG for fault scheduling
    rng: Arc<Mutex<ChaCha8Rng>>,

    /// Epoch offset (virtual time 0 maps to this wall-clock time)
    epoch: SystemTime,

    /// Extra wall-clock time that passed without the monotonic clock moving
    wall_offset: Arc<Mutex<Duration>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SimContext {
    /// Creates a new SimContext with the given seed.
    ///
    /// Call inside the runtime returned by [`SimContext::runtime`].
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            start: Instant::now(),
            rng: Arc::new(Mutex::new(ChaCha8Rng::seed_from_u64(seed))),
            epoch: UNIX_EPOCH + Duration::from_secs(1704067200), // 2024-01-01 00:00:00 UTC
            wall_offset: Arc::new(Mutex::new(Duration::ZERO)),
        }
    }

    /// Creates an Arc-wrapped context for sharing.
    pub fn shared(seed: u64) -> Arc<Self> {
        Arc::new(Self::new(seed))
    }

    /// Builds the single-threaded, paused-clock runtime simulations run on.
    pub fn runtime() -> std::io::Result<tokio::runtime::Runtime> {
        tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .start_paused(true)
            .build()
    }

    /// Moves the wall clock forward without touching the monotonic clock.
    ///
    /// Models the process being down (or the device asleep) for `duration`.
    pub fn skip_wall_clock(&self, duration: Duration) {
        *lock(&self.wall_offset) += duration;
    }

    /// Runs `f` with the shared RNG.
    pub fn with_rng<T>(&self, f: impl FnOnce(&mut ChaCha8Rng) -> T) -> T {
        f(&mut lock(&self.rng))
    }
}

impl Clone for SimContext {
    fn clone(&self) -> Self {
        Self {
            seed: self.seed,
            start: self.start,
            rng: Arc::clone(&self.rng),
            epoch: self.epoch,
            wall_offset: Arc::clone(&self.wall_offset),
        }
    }
}

#[async_trait]
impl FleetContext for SimContext {
    fn now(&self) -> Duration {
        self.start.elapsed()
    }

    fn system_time(&self) -> SystemTime {
        self.epoch + self.now() + *lock(&self.wall_offset)
    }

    async fn sleep(&self, duration: Duration) {
        // On a paused runtime this completes as soon as every task is idle
        tokio::time::sleep(duration).await;
    }

    fn spawn<F>(&self, name: &str, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let name = name.to_string();
        tokio::spawn(async move {
            future.await;
            tracing::trace!(task = %name, "Simulated task finished");
        });
    }

    fn seed(&self) -> u64 {
        self.seed
    }
}

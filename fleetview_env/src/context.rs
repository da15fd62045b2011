//! Core environment context trait for FleetView clients.

use async_trait::async_trait;
use std::future::Future;
use std::time::{Duration, SystemTime};

/// The central interface for Environment Interaction.
///
/// This trait abstracts the "real world" so that the connection state
/// machine, the cache and the animation scheduler can run in both
/// production (tokio) and simulation (virtual clock) environments.
///
/// # Implementations
///
/// - **Production**: `TokioContext` - wraps `tokio::time` and the OS wall clock
/// - **Simulation**: `SimContext` - virtual clock with a fixed epoch
#[async_trait]
pub trait FleetContext: Send + Sync + 'static {
    /// Returns the current monotonic time since context creation.
    ///
    /// Used for timer deadlines and animation progress.
    fn now(&self) -> Duration;

    /// Returns the wall-clock time.
    ///
    /// Freshness (`lastUpdated`), the online predicate and the cache
    /// retention window are all measured against this clock.
    fn system_time(&self) -> SystemTime;

    /// Suspends execution for the given duration.
    ///
    /// In production: wraps `tokio::time::sleep`
    /// In simulation: advances the virtual clock
    async fn sleep(&self, duration: Duration);

    /// Spawns a background task.
    fn spawn<F>(&self, name: &str, future: F)
    where
        F: Future<Output = ()> + Send + 'static;

    /// Returns the context's seed (for logging/debugging).
    ///
    /// In production, returns 0 (not seeded).
    /// In simulation, returns the master seed.
    fn seed(&self) -> u64;
}

//! FleetView Core - Real-Time Vehicle Location Pipeline
//!
//! Turns a flaky 1 Hz GPS stream into a map that always has something
//! sensible to show:
//! 1. **Last-known cache**: [`LocationStore`] keeps a persisted, never
//!    regressing position per vehicle across reloads and disconnects
//! 2. **Reconciliation**: [`merge`] folds each inbound batch into the cache
//!    and publishes only valid records
//! 3. **Connection lifecycle**: [`ConnectionManager`] owns the stream, with
//!    bounded reconnects, snapshot retry and an epoch guard against stale
//!    callbacks
//! 4. **Smooth motion**: [`InterpolationScheduler`] animates each marker
//!    between samples with a cubic ease-out
//!
//! All time-dependent code is generic over [`fleetview_env::FleetContext`],
//! so the same pipeline runs under tokio or the deterministic simulator.

pub mod config;
pub mod connection;
pub mod fallback;
pub mod interpolation;
pub mod location;
pub mod merge;
pub mod render;
pub mod store;

// Re-export key types for convenience
pub use config::{ConfigFileError, ConnectionConfig, FallbackConfig, InterpolationConfig, PipelineConfig, StoreConfig};
pub use connection::{
    ConfigError, ConnectionHandle, ConnectionManager, ConnectionState, ConnectionStatus, ConnectionTarget,
    LocationUpdate, TerminalError,
};
pub use fallback::{CatalogClient, CatalogError, FallbackPoller, HttpCatalogClient, ViewMode};
pub use interpolation::{InterpolationScheduler, TargetOutcome};
pub use location::{is_valid_coordinate, LatLng, LocationRecord, ParseError};
pub use merge::{merge, merge_payload, MergeReport};
pub use render::{MarkerRenderer, RenderSink};
pub use store::{lock_store, LocationStore, MemoryBackend, PersistenceBackend, SharedLocationStore, SledBackend, StoreError};

//! FleetView Deterministic Simulation Harness
//!
//! Runs the real location pipeline (store, merge, connection manager,
//! marker renderer) against a scripted streaming server, with every source
//! of non-determinism under control:
//! - **Time**: tokio's paused clock; virtual time jumps to the next timer
//!   whenever every task is idle, and the wall clock can be skipped forward
//!   to model downtime
//! - **Network**: [`SimTransport`] with refused handshakes, drops, error
//!   frames and injected stale-session events
//! - **Data**: [`FleetOracle`] drives ground-truth vehicles and injects
//!   duplicates, `(0,0)` sentinels, null coordinates and truncated frames
//! - **Randomness**: all entropy derived from a single 64-bit seed
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │ paused tokio runtime (SimContext)                        │
//! │                                                          │
//! │  FleetOracle ──frames──► SimTransportController          │
//! │                               │                          │
//! │                          SimTransport                    │
//! │                               │ TransportEvent           │
//! │                      ConnectionManager ──► LocationStore │
//! │                               │ watch                    │
//! │                        MarkerRenderer ──► DrawRecorder   │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use fleetview_sim::{ScenarioRunner, scenarios::ScenarioId};
//!
//! let result = ScenarioRunner::new(42).run(ScenarioId::FlappingLink);
//! assert!(result.passed);
//! ```

mod context;
mod oracle;
mod pipeline;
mod runner;
pub mod scenarios;
mod transport;

pub use context::SimContext;
pub use oracle::{DataFaults, FaultCounts, FleetOracle, GroundTruthVehicle};
pub use pipeline::{same_position, wall_now, DrawRecorder, DrawLog, SimPipeline};
pub use runner::{ScenarioMetrics, ScenarioResult, ScenarioRunner};
pub use transport::{SimTransport, SimTransportController};

//! FleetView Environment Abstraction Layer
//!
//! This crate provides the "Sans-IO" abstraction allowing the FleetView
//! location pipeline to run in both **Production** (tokio + a real streaming
//! transport) and **Simulation** (virtual clock + scripted server).
//!
//! # Core Concept: The Reactor Pattern
//!
//! For deterministic testing, we intercept all I/O:
//! - Time (`now()`, `system_time()`, `sleep()`)
//! - The streaming connection (`open()`, `subscribe()`, `next_event()`)
//!
//! Every transport event is tagged with the [`SessionId`] of the connection
//! attempt that produced it, so callbacks from a superseded attempt can be
//! told apart from live ones.
//!
//! # Example
//!
//! ```ignore
//! use fleetview_env::{FleetContext, StreamTransport};
//!
//! async fn client_loop<Ctx: FleetContext, T: StreamTransport>(ctx: &Ctx, transport: &T) {
//!     loop {
//!         tokio::select! {
//!             event = transport.next_event() => handle_event(event),
//!             _ = ctx.sleep(Duration::from_secs(5)) => reconnect(),
//!         }
//!     }
//! }
//! ```

mod context;
mod transport;
mod types;
mod error;
mod tokio_impl;

pub use context::FleetContext;
pub use transport::{StreamTransport, TransportController};
pub use types::{Channel, Credential, SessionId, SnapshotRequest, TransportEvent};
pub use error::EnvError;
pub use tokio_impl::TokioContext;

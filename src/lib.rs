//! QueryGrid - query lifecycle control for a distributed SQL engine
//!
//! This library owns a single query's state from submission through its
//! terminal outcome: the state machine itself, phase timing, memory
//! watermarks, incremental output publication, transaction finalization,
//! and point-in-time snapshots composed from stage telemetry.
//!
//! # High-Level API
//!
//! The [`controller::QueryController`] is the entry point. Collaborators
//! (dispatcher, planner, scheduler, memory manager) drive it through its
//! transition methods while pollers read snapshots:
//!
//! ```ignore
//! use querygrid::controller::{BeginQuery, QueryController};
//!
//! let controller = QueryController::begin(BeginQuery { /* ... */ });
//!
//! controller.to_dispatching();
//! controller.to_planning();
//! controller.to_starting();
//! controller.to_running();
//!
//! // A periodic poller composes snapshots from the stage tree.
//! let info = controller.basic_snapshot(root_stage_stats);
//! ```

pub mod controller;
pub mod error;
pub mod notify;
pub mod output;
pub mod session;
pub mod stage;
pub mod state;
pub mod testing;
pub mod timing;
pub mod transaction;

/// Version of the QueryGrid library.
///
/// The version is defined in `Cargo.toml` and injected at compile time.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

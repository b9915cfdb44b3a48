//! Stage execution on a Stratus worker.
//!
//! A worker process wires together:
//!
//! - [`StageExecutor`]: runs one stage assignment end to end (resolve
//!   inputs, run the operator, route the output).
//! - [`ProgressHub`]: throttled progress publication, consumed by the
//!   `StreamProgress` RPC.
//! - [`QueryTracker`]: per-query cancellation tokens and the
//!   `active_queries` counter reported in heartbeats.
//! - [`HeartbeatTask`]: periodic registration-keepalive towards the control
//!   plane.
//! - [`ExecutionRpcService`]: the tonic server for `ExecuteStage`,
//!   `StreamProgress`, `CancelQuery` and `ReportHealth`.
//!
//! The exchange half (chunk streams, intermediate store) lives in the
//! `data_exchange` crate and is served next to the execution service.

#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

mod executor;
mod heartbeat;
mod operators;
mod progress;
mod server;
mod table_source;
mod tracker;

pub use executor::{StageAssignment, StageExecutor, StageOutcome};
pub use heartbeat::{register_with_control_plane, HeartbeatConfig, HeartbeatTask, ResourceMonitor, StaticResourceMonitor};
pub use progress::ProgressHub;
pub use server::ExecutionRpcService;
pub use table_source::{InMemoryTableSource, TableSource};
pub use tracker::QueryTracker;

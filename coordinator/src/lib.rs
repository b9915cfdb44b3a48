//! Query lifecycle and distributed stage scheduling.
//!
//! One [`QueryCoordinator`] owns every query's state machine: admission,
//! planning through the external [`QueryPlanner`], dependency-ordered stage
//! dispatch with bounded retry, progress multiplexing, cancellation fan-out
//! and result collection.

#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

mod coordinator;
mod dag;
mod planner;
mod results;

pub use coordinator::{CoordinatorConfig, QueryCoordinator};
pub use dag::{topological_order, validate_plan};
pub use planner::QueryPlanner;
pub use results::ResultBuffer;

//! Load-driven scaling of the worker pool.
//!
//! The decision function is pure; the [`Autoscaler`] wraps it with cooldown
//! tracking, pending-launch supervision and the [`WorkerLauncher`] boundary
//! to whatever actually spawns worker processes.

#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

mod policy;
mod scaler;

pub use policy::{evaluate, AutoscalerConfig, Decision};
pub use scaler::{Autoscaler, AutoscaleOutcome, LaunchedWorker, QueryLoad, WorkerLauncher};

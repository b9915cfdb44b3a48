//! Control-plane worker registry: registration, heartbeats, liveness
//! sweeping and placement.

#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

mod registry;
mod service;
mod sweeper;

pub use registry::{RegistryConfig, WorkerRegistry};
pub use service::{EndpointEvictor, ManagementRpcService};
pub use sweeper::LivenessSweeper;

//! Peer-to-peer exchange of intermediate partitions between workers.
//!
//! Three pieces live here:
//!
//! - [`IntermediateStore`]: per-worker in-memory map of produced partitions,
//!   readable by downstream peers until query cleanup.
//! - [`ExchangeTransport`]: client side of the exchange protocol
//!   (send / request / broadcast / shuffle), with bounded retry.
//! - [`ExchangeService`]: the tonic server half backing `StreamData`,
//!   `RequestData`, `SendResults` and `GetAvailablePartitions`.

#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

mod pool;
mod server;
mod store;
mod transport;

pub use pool::ConnectionPool;
pub use server::{ExchangeService, ResultSink};
pub use store::{IntermediateStore, DEFAULT_STORE_CAPACITY_BYTES};
pub use transport::{ExchangeTransport, TransportConfig};

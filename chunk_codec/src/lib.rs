//! Encode/decode between Arrow record batches and the chunked exchange wire
//! format, plus row-wise hash partitioning for shuffles.

#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

mod codec;
mod partition;

pub use codec::{
    decode, encode, schema_descriptor, Error, Result, TransferMeta, DEFAULT_MAX_CHUNK_BYTES,
    MAX_CHUNK_BYTES_CAP,
};
pub use partition::{hash_partition, Error as PartitionError};

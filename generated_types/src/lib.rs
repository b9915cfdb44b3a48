//! Protobuf types and tonic service definitions for the Stratus RPC surface.

// This crate deliberately does not use the same linting rules as the other
// crates because of all the generated code it contains that we have little
// control over.
#![deny(rustdoc::bare_urls, rust_2018_idioms)]
#![allow(clippy::derive_partial_eq_without_eq, clippy::large_enum_variant)]

/// This module imports the generated protobuf code into a Rust module
/// hierarchy that matches the namespace hierarchy of the protobuf
/// definitions
pub mod stratus {
    pub mod plan {
        pub mod v1 {
            tonic::include_proto!("stratus.plan.v1");
        }
    }

    pub mod management {
        pub mod v1 {
            tonic::include_proto!("stratus.management.v1");
        }
    }

    pub mod execution {
        pub mod v1 {
            tonic::include_proto!("stratus.execution.v1");
        }
    }

    pub mod exchange {
        pub mod v1 {
            tonic::include_proto!("stratus.exchange.v1");
        }
    }
}

mod conversions;
mod status;

pub use conversions::FieldViolation;
pub use status::{code_for_kind, engine_error_from_status, kind_for_code, status_from_engine_error};

pub use prost::{DecodeError, EncodeError, Message};

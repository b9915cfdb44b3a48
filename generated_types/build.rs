//! Compiles protobuf definitions into Rust.

use std::path::{Path, PathBuf};

type Error = Box<dyn std::error::Error>;
type Result<T, E = Error> = std::result::Result<T, E>;

fn main() -> Result<()> {
    let root = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("protos");

    generate_grpc_types(&root)?;

    Ok(())
}

/// Schema used for RPC between the control plane, workers and peers.
///
/// Creates:
///
/// - `stratus.plan.v1.rs`
/// - `stratus.management.v1.rs`
/// - `stratus.execution.v1.rs`
/// - `stratus.exchange.v1.rs`
fn generate_grpc_types(root: &Path) -> Result<()> {
    let proto_files = vec![
        root.join("stratus/plan/v1/plan.proto"),
        root.join("stratus/management/v1/management.proto"),
        root.join("stratus/execution/v1/execution.proto"),
        root.join("stratus/exchange/v1/exchange.proto"),
    ];

    // Tell cargo to recompile if any of these proto files are changed
    for proto_file in &proto_files {
        println!("cargo:rerun-if-changed={}", proto_file.display());
    }

    tonic_build::configure()
        .compile(&proto_files, &[root.to_path_buf()])?;

    Ok(())
}

//! The boundary to columnar file reading.
//!
//! File formats, schema inference and object access live outside the
//! engine; scans only see record batches handed back for a
//! [`DataPartition`].

use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use data_types::{DataPartition, EngineError};
use hashbrown::HashMap;
use parking_lot::RwLock;

/// Resolves [`DataPartition`]s to record batches.
///
/// Implementations must be side-effect free per call: scanning the same
/// partition twice yields the same rows, which stage retry relies on.
#[async_trait]
pub trait TableSource: Send + Sync + std::fmt::Debug + 'static {
    async fn read_partition(&self, partition: &DataPartition)
        -> Result<Vec<RecordBatch>, EngineError>;
}

/// A [`TableSource`] over pre-registered batches, keyed by file reference.
/// Used by tests and local development.
#[derive(Debug, Default)]
pub struct InMemoryTableSource {
    files: RwLock<HashMap<String, Vec<RecordBatch>>>,
}

impl InMemoryTableSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the batches served for `file_ref`.
    pub fn register(&self, file_ref: impl Into<String>, batches: Vec<RecordBatch>) {
        self.files.write().insert(file_ref.into(), batches);
    }
}

#[async_trait]
impl TableSource for InMemoryTableSource {
    async fn read_partition(
        &self,
        partition: &DataPartition,
    ) -> Result<Vec<RecordBatch>, EngineError> {
        let files = self.files.read();
        let mut batches = Vec::new();
        for file_ref in &partition.file_refs {
            let file_batches = files.get(file_ref).ok_or_else(|| {
                EngineError::not_found(format!("unknown file reference {}", file_ref))
            })?;
            batches.extend(file_batches.iter().cloned());
        }
        Ok(batches)
    }
}

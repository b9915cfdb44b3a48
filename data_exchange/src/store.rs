//! The per-worker intermediate result store.

use arrow::record_batch::RecordBatch;
use data_types::{EngineError, PartitionInfo, QueryId};
use hashbrown::HashMap;
use observability_deps::tracing::debug;
use parking_lot::RwLock;
use std::collections::BTreeMap;

/// Default ceiling for batches held by one store.
pub const DEFAULT_STORE_CAPACITY_BYTES: usize = 1024 * 1024 * 1024;

#[derive(Debug)]
struct StoredPartition {
    batch: RecordBatch,
    rows: u64,
    bytes: u64,
}

#[derive(Debug, Default)]
struct StoreState {
    /// `(query, stage) -> partition -> batch`
    queries: HashMap<QueryId, HashMap<u64, BTreeMap<u64, StoredPartition>>>,
    total_bytes: u64,
}

/// In-memory map of intermediate partitions produced (or received) by one
/// worker. Entries live until [`IntermediateStore::cleanup_query`].
///
/// Concurrent `put`/`get` are supported; cleanup serializes against them
/// through the write lock. Readers keep whatever batch they already cloned
/// out; later lookups simply miss.
#[derive(Debug)]
pub struct IntermediateStore {
    state: RwLock<StoreState>,
    capacity_bytes: u64,
}

impl Default for IntermediateStore {
    fn default() -> Self {
        Self::new(DEFAULT_STORE_CAPACITY_BYTES)
    }
}

impl IntermediateStore {
    pub fn new(capacity_bytes: usize) -> Self {
        Self {
            state: RwLock::new(StoreState::default()),
            capacity_bytes: capacity_bytes as u64,
        }
    }

    /// Store one partition, replacing any previous batch under the same key.
    ///
    /// Fails with `ResourceExhausted` when the store would exceed its byte
    /// ceiling; the caller backs off and retries or fails its stage.
    pub fn put(
        &self,
        query_id: &QueryId,
        stage_id: u64,
        partition_id: u64,
        batch: RecordBatch,
    ) -> Result<(), EngineError> {
        let bytes = batch_bytes(&batch);
        let rows = batch.num_rows() as u64;

        let mut state = self.state.write();

        let replaced_bytes = state
            .queries
            .get(query_id)
            .and_then(|stages| stages.get(&stage_id))
            .and_then(|parts| parts.get(&partition_id))
            .map(|p| p.bytes)
            .unwrap_or(0);

        let projected = state.total_bytes - replaced_bytes + bytes;
        if projected > self.capacity_bytes {
            return Err(EngineError::resource_exhausted(format!(
                "intermediate store over capacity: {} + {} > {} bytes",
                state.total_bytes - replaced_bytes,
                bytes,
                self.capacity_bytes
            ))
            .scope_query(query_id.clone())
            .scope_stage(stage_id));
        }

        state
            .queries
            .entry(query_id.clone())
            .or_default()
            .entry(stage_id)
            .or_default()
            .insert(partition_id, StoredPartition { batch, rows, bytes });
        state.total_bytes = projected;

        debug!(
            query_id=%query_id,
            stage_id,
            partition_id,
            rows,
            bytes,
            "stored intermediate partition",
        );
        Ok(())
    }

    /// Fetch one partition; cheap column-Arc clone.
    pub fn get(
        &self,
        query_id: &QueryId,
        stage_id: u64,
        partition_id: u64,
    ) -> Option<RecordBatch> {
        let state = self.state.read();
        state
            .queries
            .get(query_id)?
            .get(&stage_id)?
            .get(&partition_id)
            .map(|p| p.batch.clone())
    }

    /// Partitions currently available for `(query, stage)`, ordered by id.
    pub fn list_partitions(&self, query_id: &QueryId, stage_id: u64) -> Vec<PartitionInfo> {
        let state = self.state.read();
        state
            .queries
            .get(query_id)
            .and_then(|stages| stages.get(&stage_id))
            .map(|parts| {
                parts
                    .iter()
                    .map(|(id, p)| PartitionInfo {
                        partition_id: *id,
                        rows: p.rows,
                        bytes: p.bytes,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Atomically drop every partition of every stage of `query_id`.
    /// Idempotent: cleaning an unknown query is a no-op.
    pub fn cleanup_query(&self, query_id: &QueryId) {
        let mut state = self.state.write();
        if let Some(stages) = state.queries.remove(query_id) {
            let freed: u64 = stages
                .values()
                .flat_map(|parts| parts.values())
                .map(|p| p.bytes)
                .sum();
            state.total_bytes -= freed;
            debug!(query_id=%query_id, freed_bytes=freed, "cleaned up intermediate partitions");
        }
    }

    /// Bytes currently held across all queries.
    pub fn total_bytes(&self) -> u64 {
        self.state.read().total_bytes
    }
}

fn batch_bytes(batch: &RecordBatch) -> u64 {
    batch
        .columns()
        .iter()
        .map(|c| c.get_array_memory_size() as u64)
        .sum()
}

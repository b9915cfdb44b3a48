//! The coordinator's result buffer.
//!
//! Final stages stream their output here through the exchange service's
//! `SendResults` RPC; the buffer holds batches until the client drains them.

use arrow::record_batch::RecordBatch;
use data_exchange::ResultSink;
use data_types::{EngineError, QueryId};
use hashbrown::HashMap;
use parking_lot::Mutex;

/// Per-query buffered final-stage output, in arrival order.
#[derive(Debug, Default)]
pub struct ResultBuffer {
    batches: Mutex<HashMap<QueryId, Vec<RecordBatch>>>,
}

impl ResultBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take every buffered batch for `query_id`, in arrival order.
    pub fn take(&self, query_id: &QueryId) -> Vec<RecordBatch> {
        self.batches.lock().remove(query_id).unwrap_or_default()
    }

    /// Total buffered rows for `query_id`.
    pub fn row_count(&self, query_id: &QueryId) -> usize {
        self.batches
            .lock()
            .get(query_id)
            .map(|batches| batches.iter().map(|b| b.num_rows()).sum())
            .unwrap_or(0)
    }

    /// Drop anything buffered for `query_id`.
    pub fn discard(&self, query_id: &QueryId) {
        self.batches.lock().remove(query_id);
    }
}

impl ResultSink for ResultBuffer {
    fn put_results(&self, query_id: &QueryId, batch: RecordBatch) -> Result<(), EngineError> {
        self.batches
            .lock()
            .entry(query_id.clone())
            .or_default()
            .push(batch);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::Int64Array;
    use arrow::datatypes::{DataType, Field, Schema};
    use std::sync::Arc;

    fn batch(rows: usize) -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![Field::new("v", DataType::Int64, false)]));
        RecordBatch::try_new(
            schema,
            vec![Arc::new(Int64Array::from_iter_values(0..rows as i64))],
        )
        .unwrap()
    }

    #[test]
    fn buffers_in_arrival_order_and_drains_once() {
        let buffer = ResultBuffer::new();
        let q = QueryId::new("q-1");

        buffer.put_results(&q, batch(3)).unwrap();
        buffer.put_results(&q, batch(5)).unwrap();
        assert_eq!(buffer.row_count(&q), 8);

        let drained = buffer.take(&q);
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].num_rows(), 3);
        assert_eq!(drained[1].num_rows(), 5);

        assert!(buffer.take(&q).is_empty());
        assert_eq!(buffer.row_count(&q), 0);
    }

    #[test]
    fn discard_drops_buffered_output() {
        let buffer = ResultBuffer::new();
        let q = QueryId::new("q-1");
        buffer.put_results(&q, batch(3)).unwrap();

        buffer.discard(&q);
        assert!(buffer.take(&q).is_empty());
    }
}

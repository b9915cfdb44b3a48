//! Multi-column lexicographic sort.

use super::value::column_index;
use arrow::compute::{lexsort_to_indices, take, SortColumn, SortOptions};
use arrow::record_batch::RecordBatch;
use data_types::EngineError;
use generated_types::stratus::plan::v1::SortOperator;

pub(crate) fn apply(op: &SortOperator, batch: &RecordBatch) -> Result<RecordBatch, EngineError> {
    if op.keys.is_empty() {
        return Err(EngineError::invalid_request("sort with no keys"));
    }

    let sort_columns = op
        .keys
        .iter()
        .map(|key| {
            let idx = column_index(batch, &key.column)?;
            Ok(SortColumn {
                values: batch.column(idx).clone(),
                options: Some(SortOptions {
                    descending: key.descending,
                    nulls_first: true,
                }),
            })
        })
        .collect::<Result<Vec<_>, EngineError>>()?;

    let indices = lexsort_to_indices(&sort_columns, None)
        .map_err(|e| EngineError::internal(e.to_string()))?;

    let columns = batch
        .columns()
        .iter()
        .map(|col| take(col.as_ref(), &indices, None))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| EngineError::internal(e.to_string()))?;

    RecordBatch::try_new(batch.schema(), columns)
        .map_err(|e| EngineError::internal(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::super::test_util::orders_batch;
    use super::*;
    use arrow::array::Int64Array;
    use generated_types::stratus::plan::v1::SortKey;

    fn ids(batch: &RecordBatch) -> Vec<i64> {
        batch
            .column(0)
            .as_any()
            .downcast_ref::<Int64Array>()
            .unwrap()
            .values()
            .to_vec()
    }

    #[test]
    fn sorts_ascending_and_descending() {
        let batch = orders_batch(&[(1, "B", 10.), (2, "A", 30.), (3, "A", 20.)]);

        let op = SortOperator {
            keys: vec![
                SortKey {
                    column: "category".to_string(),
                    descending: false,
                },
                SortKey {
                    column: "price".to_string(),
                    descending: true,
                },
            ],
        };

        let sorted = apply(&op, &batch).unwrap();
        // A/30, A/20, B/10
        assert_eq!(ids(&sorted), vec![2, 3, 1]);
    }

    #[test]
    fn missing_keys_are_invalid() {
        let batch = orders_batch(&[(1, "A", 10.)]);
        let err = apply(&SortOperator { keys: vec![] }, &batch).unwrap_err();
        assert_eq!(err.kind(), data_types::ErrorKind::InvalidRequest);
    }
}

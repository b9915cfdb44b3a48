//! Column subset / reorder.

use super::value::column_index;
use arrow::record_batch::RecordBatch;
use data_types::EngineError;
use generated_types::stratus::plan::v1::ProjectOperator;

pub(crate) fn apply(op: &ProjectOperator, batch: &RecordBatch) -> Result<RecordBatch, EngineError> {
    apply_columns(&op.columns, batch)
}

pub(crate) fn apply_columns(
    columns: &[String],
    batch: &RecordBatch,
) -> Result<RecordBatch, EngineError> {
    if columns.is_empty() {
        return Err(EngineError::invalid_request("projection with no columns"));
    }

    let indices = columns
        .iter()
        .map(|name| column_index(batch, name))
        .collect::<Result<Vec<_>, _>>()?;

    batch
        .project(&indices)
        .map_err(|e| EngineError::internal(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::super::test_util::orders_batch;
    use super::*;

    #[test]
    fn subset_and_reorder() {
        let batch = orders_batch(&[(1, "A", 10.), (2, "B", 20.)]);
        let op = ProjectOperator {
            columns: vec!["price".to_string(), "id".to_string()],
        };

        let projected = apply(&op, &batch).unwrap();
        assert_eq!(projected.num_columns(), 2);
        assert_eq!(projected.schema().field(0).name(), "price");
        assert_eq!(projected.schema().field(1).name(), "id");
        assert_eq!(projected.num_rows(), 2);
    }

    #[test]
    fn empty_projection_is_invalid() {
        let batch = orders_batch(&[(1, "A", 10.)]);
        let err = apply(&ProjectOperator { columns: vec![] }, &batch).unwrap_err();
        assert_eq!(err.kind(), data_types::ErrorKind::InvalidRequest);
    }
}

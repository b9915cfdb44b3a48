//! Row filtering: `column <op> literal`.

use super::value::{column_index, value_at, OrderedF64, Value};
use arrow::array::BooleanArray;
use arrow::compute::filter_record_batch;
use arrow::record_batch::RecordBatch;
use data_types::EngineError;
use generated_types::stratus::plan::v1::{literal, CompareOp, FilterOperator, Literal};
use std::cmp::Ordering;

pub(crate) fn apply(op: &FilterOperator, batch: &RecordBatch) -> Result<RecordBatch, EngineError> {
    let compare_op = CompareOp::from_i32(op.op)
        .filter(|op| *op != CompareOp::Unspecified)
        .ok_or_else(|| EngineError::invalid_request("filter without comparison operator"))?;
    let literal = literal_value(
        op.value
            .as_ref()
            .ok_or_else(|| EngineError::invalid_request("filter without literal"))?,
    );
    let column = batch.column(column_index(batch, &op.column)?).clone();

    let mut mask = Vec::with_capacity(batch.num_rows());
    for row in 0..batch.num_rows() {
        let cell = value_at(column.as_ref(), row)?;
        // null cells never satisfy a comparison
        let keep = match cell.compare(&literal) {
            None => false,
            Some(ordering) => matches(compare_op, ordering),
        };
        mask.push(keep);
    }

    filter_record_batch(batch, &BooleanArray::from(mask))
        .map_err(|e| EngineError::internal(e.to_string()))
}

fn matches(op: CompareOp, ordering: Ordering) -> bool {
    match op {
        CompareOp::Unspecified => false,
        CompareOp::Eq => ordering == Ordering::Equal,
        CompareOp::NotEq => ordering != Ordering::Equal,
        CompareOp::Lt => ordering == Ordering::Less,
        CompareOp::LtEq => ordering != Ordering::Greater,
        CompareOp::Gt => ordering == Ordering::Greater,
        CompareOp::GtEq => ordering != Ordering::Less,
    }
}

fn literal_value(literal: &Literal) -> Value {
    match &literal.value {
        None => Value::Null,
        Some(literal::Value::Int64Value(i)) => Value::Int(*i),
        Some(literal::Value::Float64Value(f)) => Value::Float(OrderedF64(*f)),
        Some(literal::Value::StringValue(s)) => Value::Str(s.clone()),
        Some(literal::Value::BoolValue(b)) => Value::Bool(*b),
    }
}

//! Inner hash join.
//!
//! The build side is the smaller input by in-memory size, ties going to the
//! left input. Both sides arrive shuffled by the join keys, so one
//! assignment only ever sees matching key ranges.

use super::value::{column_index, key_at, Value};
use arrow::array::UInt32Array;
use arrow::compute::take;
use arrow::datatypes::Schema;
use arrow::record_batch::RecordBatch;
use data_types::EngineError;
use generated_types::stratus::plan::v1::JoinOperator;
use hashbrown::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Left,
    Right,
}

pub(crate) fn apply(
    op: &JoinOperator,
    left: &[RecordBatch],
    right: &[RecordBatch],
) -> Result<RecordBatch, EngineError> {
    if op.left_keys.is_empty() || op.left_keys.len() != op.right_keys.len() {
        return Err(EngineError::invalid_request("join key lists must match"));
    }

    // an empty side produces an empty inner join
    if left.is_empty() || right.is_empty() {
        return Ok(RecordBatch::new_empty(Arc::new(Schema::empty())));
    }

    let left = super::concat_input(left)?;
    let right = super::concat_input(right)?;

    let left_keys = op
        .left_keys
        .iter()
        .map(|name| column_index(&left, name))
        .collect::<Result<Vec<_>, _>>()?;
    let right_keys = op
        .right_keys
        .iter()
        .map(|name| column_index(&right, name))
        .collect::<Result<Vec<_>, _>>()?;

    let left_bytes: usize = left.columns().iter().map(|c| c.get_array_memory_size()).sum();
    let right_bytes: usize = right.columns().iter().map(|c| c.get_array_memory_size()).sum();
    let build_side = if left_bytes <= right_bytes {
        Side::Left
    } else {
        Side::Right
    };

    let (build, build_keys, probe, probe_keys) = match build_side {
        Side::Left => (&left, &left_keys, &right, &right_keys),
        Side::Right => (&right, &right_keys, &left, &left_keys),
    };

    let mut table: HashMap<Vec<Value>, Vec<u32>> = HashMap::new();
    for row in 0..build.num_rows() {
        let key = key_at(build, build_keys, row)?;
        if key.iter().any(Value::is_null) {
            continue;
        }
        table.entry(key).or_default().push(row as u32);
    }

    let mut left_indices = Vec::new();
    let mut right_indices = Vec::new();
    for probe_row in 0..probe.num_rows() {
        let key = key_at(probe, probe_keys, probe_row)?;
        if key.iter().any(Value::is_null) {
            continue;
        }
        if let Some(build_rows) = table.get(&key) {
            for build_row in build_rows {
                match build_side {
                    Side::Left => {
                        left_indices.push(*build_row);
                        right_indices.push(probe_row as u32);
                    }
                    Side::Right => {
                        left_indices.push(probe_row as u32);
                        right_indices.push(*build_row);
                    }
                }
            }
        }
    }

    materialize(&left, &right, &right_keys, left_indices, right_indices)
}

/// Output columns: every left column, then right columns minus the join
/// keys; a remaining name collision gets a `_right` suffix.
fn materialize(
    left: &RecordBatch,
    right: &RecordBatch,
    right_keys: &[usize],
    left_indices: Vec<u32>,
    right_indices: Vec<u32>,
) -> Result<RecordBatch, EngineError> {
    let left_take = UInt32Array::from(left_indices);
    let right_take = UInt32Array::from(right_indices);

    let mut fields = Vec::new();
    let mut arrays = Vec::new();

    for (field, column) in left.schema().fields().iter().zip(left.columns()) {
        fields.push(field.clone());
        arrays.push(
            take(column.as_ref(), &left_take, None)
                .map_err(|e| EngineError::internal(e.to_string()))?,
        );
    }

    let left_names: Vec<String> = left
        .schema()
        .fields()
        .iter()
        .map(|f| f.name().clone())
        .collect();
    for (idx, (field, column)) in right
        .schema()
        .fields()
        .iter()
        .zip(right.columns())
        .enumerate()
    {
        if right_keys.contains(&idx) {
            continue;
        }
        let name = if left_names.contains(field.name()) {
            format!("{}_right", field.name())
        } else {
            field.name().clone()
        };
        fields.push(arrow::datatypes::Field::new(
            &name,
            field.data_type().clone(),
            field.is_nullable(),
        ));
        arrays.push(
            take(column.as_ref(), &right_take, None)
                .map_err(|e| EngineError::internal(e.to_string()))?,
        );
    }

    RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays)
        .map_err(|e| EngineError::internal(e.to_string()))
}

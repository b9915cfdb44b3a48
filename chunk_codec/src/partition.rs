//! Row-wise hash partitioning for shuffles.

use arrow::array::{
    Array, BooleanArray, Float64Array, Int64Array, StringArray, UInt32Array, UInt64Array,
};
use arrow::compute::take;
use arrow::datatypes::DataType;
use arrow::record_batch::RecordBatch;
use siphasher::sip::SipHasher13;
use snafu::{ensure, OptionExt, ResultExt, Snafu};
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Unknown partition key column: {}", column))]
    UnknownKeyColumn { column: String },

    #[snafu(display(
        "Unsupported partition key type {} for column {}",
        datatype,
        column
    ))]
    UnsupportedKeyType { column: String, datatype: String },

    #[snafu(display("hash_partition requires at least one key column"))]
    NoKeyColumns,

    #[snafu(display("Error materializing partition: {}", source))]
    Materialize { source: arrow::error::ArrowError },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl From<Error> for data_types::EngineError {
    fn from(e: Error) -> Self {
        Self::invalid_request(e.to_string())
    }
}

/// Split `batch` into at most `partition_count` partitions by hashing the
/// composite key formed from `columns`, assignment `hash % partition_count`.
///
/// Rows with equal keys always land in the same partition. Input column
/// order is preserved and only non-empty partitions are returned.
pub fn hash_partition(
    batch: &RecordBatch,
    columns: &[String],
    partition_count: u32,
) -> Result<BTreeMap<u64, RecordBatch>> {
    ensure!(!columns.is_empty(), NoKeyColumnsSnafu);
    let partition_count = partition_count.max(1) as u64;

    let schema = batch.schema();
    let key_arrays = columns
        .iter()
        .map(|name| {
            let (idx, _) = schema
                .column_with_name(name)
                .context(UnknownKeyColumnSnafu { column: name })?;
            Ok(batch.column(idx).clone())
        })
        .collect::<Result<Vec<_>>>()?;

    let mut assignments: BTreeMap<u64, Vec<u32>> = BTreeMap::new();
    for row in 0..batch.num_rows() {
        let mut hasher = SipHasher13::new();
        for (array, name) in key_arrays.iter().zip(columns) {
            hash_value(array.as_ref(), name, row, &mut hasher)?;
        }
        let partition = hasher.finish() % partition_count;
        assignments.entry(partition).or_default().push(row as u32);
    }

    let mut partitions = BTreeMap::new();
    for (partition, rows) in assignments {
        let indices = UInt32Array::from(rows);
        let taken = batch
            .columns()
            .iter()
            .map(|col| take(col.as_ref(), &indices, None))
            .collect::<Result<Vec<_>, _>>()
            .context(MaterializeSnafu)?;
        let part =
            RecordBatch::try_new(batch.schema(), taken).context(MaterializeSnafu)?;
        partitions.insert(partition, part);
    }

    Ok(partitions)
}

/// Feed one row's key column value into the hasher. Nulls hash as a
/// distinct marker so they group together.
fn hash_value(
    array: &dyn Array,
    column: &str,
    row: usize,
    hasher: &mut SipHasher13,
) -> Result<()> {
    if array.is_null(row) {
        0xff_u8.hash(hasher);
        return Ok(());
    }

    match array.data_type() {
        DataType::Int64 => {
            let array = array.as_any().downcast_ref::<Int64Array>().unwrap();
            array.value(row).hash(hasher);
        }
        DataType::UInt64 => {
            let array = array.as_any().downcast_ref::<UInt64Array>().unwrap();
            array.value(row).hash(hasher);
        }
        DataType::Float64 => {
            let array = array.as_any().downcast_ref::<Float64Array>().unwrap();
            array.value(row).to_bits().hash(hasher);
        }
        DataType::Utf8 => {
            let array = array.as_any().downcast_ref::<StringArray>().unwrap();
            array.value(row).hash(hasher);
        }
        DataType::Boolean => {
            let array = array.as_any().downcast_ref::<BooleanArray>().unwrap();
            array.value(row).hash(hasher);
        }
        other => {
            return UnsupportedKeyTypeSnafu {
                column,
                datatype: other.to_string(),
            }
            .fail()
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::datatypes::{Field, Schema};
    use std::sync::Arc;

    fn category_batch() -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![
            Field::new("category", DataType::Utf8, false),
            Field::new("value", DataType::Int64, false),
        ]));
        let categories: Vec<&str> = ["A", "B", "C"]
            .iter()
            .cycle()
            .take(15)
            .copied()
            .collect();
        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(StringArray::from(categories)),
                Arc::new(Int64Array::from_iter_values(0..15)),
            ],
        )
        .unwrap()
    }

    #[test]
    fn rows_with_equal_keys_share_a_partition() {
        let batch = category_batch();
        let partitions = hash_partition(&batch, &["category".to_string()], 4).unwrap();

        // every category lands in exactly one partition
        let mut seen: BTreeMap<String, u64> = BTreeMap::new();
        for (partition, part) in &partitions {
            let categories = part
                .column(0)
                .as_any()
                .downcast_ref::<StringArray>()
                .unwrap();
            for i in 0..part.num_rows() {
                let prev = seen.insert(categories.value(i).to_string(), *partition);
                if let Some(prev) = prev {
                    assert_eq!(prev, *partition);
                }
            }
        }
        assert_eq!(seen.len(), 3);

        // no rows are lost or duplicated
        let total: usize = partitions.values().map(|p| p.num_rows()).sum();
        assert_eq!(total, 15);
    }

    #[test]
    fn assignment_is_deterministic() {
        let batch = category_batch();
        let a = hash_partition(&batch, &["category".to_string()], 4).unwrap();
        let b = hash_partition(&batch, &["category".to_string()], 4).unwrap();

        assert_eq!(a.keys().collect::<Vec<_>>(), b.keys().collect::<Vec<_>>());
        for (k, part) in &a {
            assert_eq!(part, &b[k]);
        }
    }

    #[test]
    fn only_non_empty_partitions_are_returned() {
        let batch = category_batch();
        let partitions = hash_partition(&batch, &["category".to_string()], 64).unwrap();

        assert!(partitions.len() <= 3);
        assert!(partitions.values().all(|p| p.num_rows() > 0));
        assert!(partitions.keys().all(|p| *p < 64));
    }

    #[test]
    fn column_order_is_preserved() {
        let batch = category_batch();
        let partitions = hash_partition(&batch, &["category".to_string()], 2).unwrap();
        for part in partitions.values() {
            assert_eq!(part.schema(), batch.schema());
        }
    }

    #[test]
    fn composite_keys() {
        let batch = category_batch();
        let partitions =
            hash_partition(&batch, &["category".to_string(), "value".to_string()], 4).unwrap();
        let total: usize = partitions.values().map(|p| p.num_rows()).sum();
        assert_eq!(total, 15);
    }

    #[test]
    fn single_partition_collapses_everything() {
        let batch = category_batch();
        let partitions = hash_partition(&batch, &["category".to_string()], 1).unwrap();
        assert_eq!(partitions.len(), 1);
        assert_eq!(partitions.values().next().unwrap().num_rows(), 15);
    }

    #[test]
    fn unknown_column_is_rejected() {
        let batch = category_batch();
        let err = hash_partition(&batch, &["nope".to_string()], 4).unwrap_err();
        assert!(matches!(err, Error::UnknownKeyColumn { .. }), "{err}");
    }

    #[test]
    fn missing_key_columns_are_rejected() {
        let batch = category_batch();
        let err = hash_partition(&batch, &[], 4).unwrap_err();
        assert!(matches!(err, Error::NoKeyColumns), "{err}");
    }
}

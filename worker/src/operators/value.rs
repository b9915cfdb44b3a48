//! A totally ordered scalar value used for group keys, join keys and
//! row-wise comparisons.

use arrow::array::{Array, BooleanArray, Float64Array, Int64Array, StringArray};
use arrow::datatypes::DataType;
use arrow::record_batch::RecordBatch;
use data_types::EngineError;
use std::cmp::Ordering;
use std::hash::{Hash, Hasher};

/// `f64` with total ordering and bit-pattern hashing.
#[derive(Debug, Clone, Copy)]
pub(crate) struct OrderedF64(pub f64);

impl PartialEq for OrderedF64 {
    fn eq(&self, other: &Self) -> bool {
        self.0.total_cmp(&other.0) == Ordering::Equal
    }
}

impl Eq for OrderedF64 {}

impl PartialOrd for OrderedF64 {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrderedF64 {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

impl Hash for OrderedF64 {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.to_bits().hash(state)
    }
}

/// One scalar cell. Nulls order first.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(OrderedF64),
    Str(String),
}

impl Value {
    pub(crate) fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Compare with numeric coercion between ints and floats; `None` when
    /// the types are incomparable or either side is null.
    pub(crate) fn compare(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Self::Null, _) | (_, Self::Null) => None,
            (Self::Int(a), Self::Float(b)) => Some((*a as f64).total_cmp(&b.0)),
            (Self::Float(a), Self::Int(b)) => Some(a.0.total_cmp(&(*b as f64))),
            (Self::Bool(a), Self::Bool(b)) => Some(a.cmp(b)),
            (Self::Int(a), Self::Int(b)) => Some(a.cmp(b)),
            (Self::Float(a), Self::Float(b)) => Some(a.cmp(b)),
            (Self::Str(a), Self::Str(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

/// Read the cell at `row` of `array`.
pub(crate) fn value_at(array: &dyn Array, row: usize) -> Result<Value, EngineError> {
    if array.is_null(row) {
        return Ok(Value::Null);
    }

    let value = match array.data_type() {
        DataType::Int64 => {
            Value::Int(array.as_any().downcast_ref::<Int64Array>().unwrap().value(row))
        }
        DataType::Float64 => Value::Float(OrderedF64(
            array
                .as_any()
                .downcast_ref::<Float64Array>()
                .unwrap()
                .value(row),
        )),
        DataType::Utf8 => Value::Str(
            array
                .as_any()
                .downcast_ref::<StringArray>()
                .unwrap()
                .value(row)
                .to_string(),
        ),
        DataType::Boolean => Value::Bool(
            array
                .as_any()
                .downcast_ref::<BooleanArray>()
                .unwrap()
                .value(row),
        ),
        other => {
            return Err(EngineError::invalid_request(format!(
                "unsupported value type {}",
                other
            )))
        }
    };
    Ok(value)
}

/// Resolve a column name to its index, or `InvalidRequest`.
pub(crate) fn column_index(batch: &RecordBatch, name: &str) -> Result<usize, EngineError> {
    batch
        .schema()
        .column_with_name(name)
        .map(|(idx, _)| idx)
        .ok_or_else(|| EngineError::invalid_request(format!("unknown column {}", name)))
}

/// The composite key over `columns` at `row`.
pub(crate) fn key_at(
    batch: &RecordBatch,
    columns: &[usize],
    row: usize,
) -> Result<Vec<Value>, EngineError> {
    columns
        .iter()
        .map(|idx| value_at(batch.column(*idx).as_ref(), row))
        .collect()
}

/// Materialize a column of `values` with the given output type.
pub(crate) fn build_array(
    values: &[Value],
    datatype: &DataType,
) -> Result<arrow::array::ArrayRef, EngineError> {
    use std::sync::Arc;

    let array: arrow::array::ArrayRef = match datatype {
        DataType::Int64 => Arc::new(
            values
                .iter()
                .map(|v| match v {
                    Value::Int(i) => Some(*i),
                    _ => None,
                })
                .collect::<Int64Array>(),
        ),
        DataType::Float64 => Arc::new(
            values
                .iter()
                .map(|v| match v {
                    Value::Float(f) => Some(f.0),
                    Value::Int(i) => Some(*i as f64),
                    _ => None,
                })
                .collect::<Float64Array>(),
        ),
        DataType::Utf8 => Arc::new(
            values
                .iter()
                .map(|v| match v {
                    Value::Str(s) => Some(s.as_str()),
                    _ => None,
                })
                .collect::<StringArray>(),
        ),
        DataType::Boolean => Arc::new(
            values
                .iter()
                .map(|v| match v {
                    Value::Bool(b) => Some(*b),
                    _ => None,
                })
                .collect::<BooleanArray>(),
        ),
        other => {
            return Err(EngineError::invalid_request(format!(
                "unsupported output type {}",
                other
            )))
        }
    };
    Ok(array)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_and_coercion() {
        assert_eq!(
            Value::Int(3).compare(&Value::Float(OrderedF64(3.5))),
            Some(Ordering::Less)
        );
        assert_eq!(
            Value::Float(OrderedF64(4.0)).compare(&Value::Int(4)),
            Some(Ordering::Equal)
        );
        assert_eq!(
            Value::Str("a".into()).compare(&Value::Str("b".into())),
            Some(Ordering::Less)
        );
        assert_eq!(Value::Null.compare(&Value::Int(1)), None);
        assert_eq!(Value::Int(1).compare(&Value::Str("x".into())), None);
    }

    #[test]
    fn nulls_sort_first_in_derived_order() {
        let mut values = vec![Value::Int(2), Value::Null, Value::Int(1)];
        values.sort();
        assert_eq!(values[0], Value::Null);
    }
}

//! Two-phase hash aggregation.
//!
//! The partial phase pre-aggregates local input; its output is hash
//! partitioned on the group columns so every group lands on exactly one
//! finalizer. The final phase merges partial states: counts sum, sums sum,
//! mins min, maxes max. Output groups are emitted in key order, which makes
//! replay deterministic.

use super::value::{build_array, key_at, value_at, Value};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use data_types::EngineError;
use generated_types::stratus::plan::v1::{
    AggregateExpr, AggregateFunction, AggregateMode, AggregateOperator,
};
use std::collections::BTreeMap;
use std::sync::Arc;

struct AggSpec {
    input: Option<usize>,
    output_name: String,
    output_type: DataType,
    kind: AccKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AccKind {
    CountRows,
    SumInt,
    SumFloat,
    Min,
    Max,
}

#[derive(Debug, Clone)]
enum Acc {
    Count(i64),
    SumInt { sum: i64, seen: bool },
    SumFloat { sum: f64, seen: bool },
    Min(Option<Value>),
    Max(Option<Value>),
}

impl Acc {
    fn new(kind: AccKind) -> Self {
        match kind {
            AccKind::CountRows => Self::Count(0),
            AccKind::SumInt => Self::SumInt { sum: 0, seen: false },
            AccKind::SumFloat => Self::SumFloat { sum: 0., seen: false },
            AccKind::Min => Self::Min(None),
            AccKind::Max => Self::Max(None),
        }
    }

    fn update(&mut self, value: Option<Value>) -> Result<(), EngineError> {
        match self {
            Self::Count(n) => match value {
                // COUNT(*) counts rows, COUNT(col) counts non-null cells
                None => *n += 1,
                Some(v) if !v.is_null() => *n += 1,
                Some(_) => {}
            },
            Self::SumInt { sum, seen } => match value {
                Some(Value::Int(i)) => {
                    *sum += i;
                    *seen = true;
                }
                Some(Value::Null) | None => {}
                Some(other) => {
                    return Err(EngineError::invalid_request(format!(
                        "cannot sum non-integer value {:?}",
                        other
                    )))
                }
            },
            Self::SumFloat { sum, seen } => match value {
                Some(Value::Float(f)) => {
                    *sum += f.0;
                    *seen = true;
                }
                Some(Value::Int(i)) => {
                    *sum += i as f64;
                    *seen = true;
                }
                Some(Value::Null) | None => {}
                Some(other) => {
                    return Err(EngineError::invalid_request(format!(
                        "cannot sum non-numeric value {:?}",
                        other
                    )))
                }
            },
            Self::Min(current) => {
                if let Some(v) = value {
                    if !v.is_null()
                        && current
                            .as_ref()
                            .map_or(true, |c| v.compare(c) == Some(std::cmp::Ordering::Less))
                    {
                        *current = Some(v);
                    }
                }
            }
            Self::Max(current) => {
                if let Some(v) = value {
                    if !v.is_null()
                        && current
                            .as_ref()
                            .map_or(true, |c| v.compare(c) == Some(std::cmp::Ordering::Greater))
                    {
                        *current = Some(v);
                    }
                }
            }
        }
        Ok(())
    }

    fn finalize(self) -> Value {
        match self {
            Self::Count(n) => Value::Int(n),
            Self::SumInt { sum, seen } => {
                if seen {
                    Value::Int(sum)
                } else {
                    Value::Null
                }
            }
            Self::SumFloat { sum, seen } => {
                if seen {
                    Value::Float(super::value::OrderedF64(sum))
                } else {
                    Value::Null
                }
            }
            Self::Min(v) | Self::Max(v) => v.unwrap_or(Value::Null),
        }
    }
}

pub(crate) fn apply(
    op: &AggregateOperator,
    batch: &RecordBatch,
) -> Result<RecordBatch, EngineError> {
    let mode = AggregateMode::from_i32(op.mode)
        .filter(|m| *m != AggregateMode::Unspecified)
        .ok_or_else(|| EngineError::invalid_request("aggregate without mode"))?;

    if op.aggregates.is_empty() {
        return Err(EngineError::invalid_request("aggregate with no expressions"));
    }

    let schema = batch.schema();
    let group_indices = op
        .group_columns
        .iter()
        .map(|name| super::value::column_index(batch, name))
        .collect::<Result<Vec<_>, _>>()?;

    let specs = op
        .aggregates
        .iter()
        .map(|expr| resolve_spec(expr, mode, batch))
        .collect::<Result<Vec<_>, _>>()?;

    let mut groups: BTreeMap<Vec<Value>, Vec<Acc>> = BTreeMap::new();
    for row in 0..batch.num_rows() {
        let key = key_at(batch, &group_indices, row)?;
        let accs = groups
            .entry(key)
            .or_insert_with(|| specs.iter().map(|s| Acc::new(s.kind)).collect());
        for (spec, acc) in specs.iter().zip(accs.iter_mut()) {
            let value = match spec.input {
                Some(idx) => Some(value_at(batch.column(idx).as_ref(), row)?),
                None => None,
            };
            acc.update(value)?;
        }
    }

    // a global aggregate over no rows still emits one row (COUNT -> 0)
    if groups.is_empty() && group_indices.is_empty() {
        groups.insert(vec![], specs.iter().map(|s| Acc::new(s.kind)).collect());
    }

    let mut fields = Vec::with_capacity(group_indices.len() + specs.len());
    for idx in &group_indices {
        fields.push(schema.field(*idx).clone());
    }
    for spec in &specs {
        let nullable = spec.kind != AccKind::CountRows;
        fields.push(Field::new(&spec.output_name, spec.output_type.clone(), nullable));
    }
    let out_schema = Arc::new(Schema::new(fields));

    let group_count = groups.len();
    let mut key_columns: Vec<Vec<Value>> =
        vec![Vec::with_capacity(group_count); group_indices.len()];
    let mut agg_columns: Vec<Vec<Value>> = vec![Vec::with_capacity(group_count); specs.len()];
    for (key, accs) in groups {
        for (column, value) in key_columns.iter_mut().zip(key) {
            column.push(value);
        }
        for (column, acc) in agg_columns.iter_mut().zip(accs) {
            column.push(acc.finalize());
        }
    }

    let mut arrays = Vec::with_capacity(out_schema.fields().len());
    for (values, idx) in key_columns.iter().zip(&group_indices) {
        arrays.push(build_array(values, schema.field(*idx).data_type())?);
    }
    for (values, spec) in agg_columns.iter().zip(&specs) {
        arrays.push(build_array(values, &spec.output_type)?);
    }

    RecordBatch::try_new(out_schema, arrays).map_err(|e| EngineError::internal(e.to_string()))
}

fn resolve_spec(
    expr: &AggregateExpr,
    mode: AggregateMode,
    batch: &RecordBatch,
) -> Result<AggSpec, EngineError> {
    let function = AggregateFunction::from_i32(expr.function)
        .filter(|f| *f != AggregateFunction::Unspecified)
        .ok_or_else(|| EngineError::invalid_request("aggregate without function"))?;

    let output_name = if expr.output_name.is_empty() {
        return Err(EngineError::invalid_request("aggregate without output name"));
    } else {
        expr.output_name.clone()
    };

    // the final phase reads the partial phase's output column
    let input_name = match mode {
        AggregateMode::Partial => expr.column.clone(),
        _ => output_name.clone(),
    };

    let input = if input_name.is_empty() {
        None
    } else {
        Some(super::value::column_index(batch, &input_name)?)
    };
    let input_type = input.map(|idx| batch.schema().field(idx).data_type().clone());

    let (kind, output_type) = match (function, mode) {
        (AggregateFunction::Count, AggregateMode::Partial) => (AccKind::CountRows, DataType::Int64),
        // partial counts merge by summation
        (AggregateFunction::Count, _) => (AccKind::SumInt, DataType::Int64),
        (AggregateFunction::Sum, _) => match input_type {
            Some(DataType::Int64) => (AccKind::SumInt, DataType::Int64),
            Some(DataType::Float64) => (AccKind::SumFloat, DataType::Float64),
            other => {
                return Err(EngineError::invalid_request(format!(
                    "sum over unsupported type {:?}",
                    other
                )))
            }
        },
        (AggregateFunction::Min, _) | (AggregateFunction::Max, _) => {
            let datatype = input_type.ok_or_else(|| {
                EngineError::invalid_request("min/max requires an input column")
            })?;
            let kind = if function == AggregateFunction::Min {
                AccKind::Min
            } else {
                AccKind::Max
            };
            (kind, datatype)
        }
        (AggregateFunction::Unspecified, _) => unreachable!("filtered above"),
    };

    if kind != AccKind::CountRows && input.is_none() {
        return Err(EngineError::invalid_request(format!(
            "aggregate {:?} requires an input column",
            function
        )));
    }

    Ok(AggSpec {
        input,
        output_name,
        output_type,
        kind,
    })
}

#[cfg(test)]
mod tests {
    use super::super::test_util::orders_batch;
    use super::*;
    use arrow::array::{Float64Array, Int64Array, StringArray};

    fn count_by_category(mode: AggregateMode) -> AggregateOperator {
        AggregateOperator {
            group_columns: vec!["category".to_string()],
            aggregates: vec![AggregateExpr {
                function: AggregateFunction::Count as i32,
                column: String::new(),
                output_name: "count".to_string(),
            }],
            mode: mode as i32,
        }
    }

    #[test]
    fn partial_count_group_by() {
        let batch = orders_batch(&[
            (1, "A", 10.),
            (2, "B", 20.),
            (3, "A", 30.),
            (4, "C", 40.),
            (5, "A", 50.),
        ]);

        let out = apply(&count_by_category(AggregateMode::Partial), &batch).unwrap();
        assert_eq!(out.num_rows(), 3);

        let categories = out.column(0).as_any().downcast_ref::<StringArray>().unwrap();
        let counts = out.column(1).as_any().downcast_ref::<Int64Array>().unwrap();
        let pairs: Vec<_> = (0..3)
            .map(|i| (categories.value(i).to_string(), counts.value(i)))
            .collect();
        assert_eq!(
            pairs,
            vec![("A".to_string(), 3), ("B".to_string(), 1), ("C".to_string(), 1)]
        );
    }

    #[test]
    fn final_merges_partial_counts() {
        let partial_a = apply(
            &count_by_category(AggregateMode::Partial),
            &orders_batch(&[(1, "A", 10.), (2, "B", 20.)]),
        )
        .unwrap();
        let partial_b = apply(
            &count_by_category(AggregateMode::Partial),
            &orders_batch(&[(3, "A", 30.), (4, "A", 40.)]),
        )
        .unwrap();

        let merged_input =
            arrow::compute::concat_batches(&partial_a.schema(), &[partial_a, partial_b]).unwrap();
        let out = apply(&count_by_category(AggregateMode::Final), &merged_input).unwrap();

        let categories = out.column(0).as_any().downcast_ref::<StringArray>().unwrap();
        let counts = out.column(1).as_any().downcast_ref::<Int64Array>().unwrap();
        let pairs: Vec<_> = (0..out.num_rows())
            .map(|i| (categories.value(i).to_string(), counts.value(i)))
            .collect();
        assert_eq!(pairs, vec![("A".to_string(), 3), ("B".to_string(), 1)]);
    }

    #[test]
    fn sum_min_max() {
        let batch = orders_batch(&[(1, "A", 10.), (2, "A", 30.), (3, "B", 5.)]);
        let op = AggregateOperator {
            group_columns: vec!["category".to_string()],
            aggregates: vec![
                AggregateExpr {
                    function: AggregateFunction::Sum as i32,
                    column: "price".to_string(),
                    output_name: "total".to_string(),
                },
                AggregateExpr {
                    function: AggregateFunction::Min as i32,
                    column: "price".to_string(),
                    output_name: "lowest".to_string(),
                },
                AggregateExpr {
                    function: AggregateFunction::Max as i32,
                    column: "id".to_string(),
                    output_name: "latest".to_string(),
                },
            ],
            mode: AggregateMode::Partial as i32,
        };

        let out = apply(&op, &batch).unwrap();
        assert_eq!(out.num_rows(), 2);

        let totals = out.column(1).as_any().downcast_ref::<Float64Array>().unwrap();
        let lowest = out.column(2).as_any().downcast_ref::<Float64Array>().unwrap();
        let latest = out.column(3).as_any().downcast_ref::<Int64Array>().unwrap();
        assert_eq!(totals.value(0), 40.);
        assert_eq!(lowest.value(0), 10.);
        assert_eq!(latest.value(0), 2);
        assert_eq!(totals.value(1), 5.);
        assert_eq!(latest.value(1), 3);
    }

    #[test]
    fn global_count_over_empty_input_is_zero() {
        let batch = orders_batch(&[]);
        let op = AggregateOperator {
            group_columns: vec![],
            aggregates: vec![AggregateExpr {
                function: AggregateFunction::Count as i32,
                column: String::new(),
                output_name: "count".to_string(),
            }],
            mode: AggregateMode::Partial as i32,
        };

        let out = apply(&op, &batch).unwrap();
        assert_eq!(out.num_rows(), 1);
        let counts = out.column(0).as_any().downcast_ref::<Int64Array>().unwrap();
        assert_eq!(counts.value(0), 0);
    }

    #[test]
    fn grouped_aggregate_over_empty_input_has_no_rows() {
        let batch = orders_batch(&[]);
        let out = apply(&count_by_category(AggregateMode::Partial), &batch).unwrap();
        assert_eq!(out.num_rows(), 0);
        assert_eq!(out.num_columns(), 2);
    }
}

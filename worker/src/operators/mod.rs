//! Stage operators.
//!
//! Dispatch is a match on the stage type; the operator parameters come from
//! the plan message the external planner serialized into the stage.

mod aggregate;
mod filter;
mod join;
mod project;
mod sort;
mod value;

use arrow::record_batch::RecordBatch;
use data_types::{EngineError, StageType};
use generated_types::stratus::plan::v1::{stage_plan::Operator, StagePlan};
use std::collections::BTreeMap;

/// Inputs resolved for one stage assignment.
///
/// Unary operators consume `batches`; joins address their two sides through
/// `by_stage` using the upstream stage ids recorded in the join plan.
#[derive(Debug, Default)]
pub(crate) struct StageInputs {
    pub batches: Vec<RecordBatch>,
    pub by_stage: BTreeMap<u64, Vec<RecordBatch>>,
}

/// Run the operator for `stage_type` over `inputs`, producing the stage's
/// output batch. Inputs are never mutated; replaying the same call yields
/// the same output.
pub(crate) fn run_operator(
    stage_type: StageType,
    plan: &StagePlan,
    inputs: &StageInputs,
) -> Result<RecordBatch, EngineError> {
    let operator = plan
        .operator
        .as_ref()
        .ok_or_else(|| EngineError::invalid_request("stage plan carries no operator"))?;

    match (stage_type, operator) {
        (StageType::Scan, Operator::Scan(op)) => {
            let batch = concat_input(&inputs.batches)?;
            if op.columns.is_empty() {
                Ok(batch)
            } else {
                project::apply_columns(&op.columns, &batch)
            }
        }
        (StageType::Filter, Operator::Filter(op)) => {
            filter::apply(op, &concat_input(&inputs.batches)?)
        }
        (StageType::Project, Operator::Project(op)) => {
            project::apply(op, &concat_input(&inputs.batches)?)
        }
        (StageType::Aggregate, Operator::Aggregate(op)) => {
            aggregate::apply(op, &concat_input(&inputs.batches)?)
        }
        (StageType::Join, Operator::Join(op)) => {
            let left = inputs.by_stage.get(&op.left_stage_id).cloned().unwrap_or_default();
            let right = inputs
                .by_stage
                .get(&op.right_stage_id)
                .cloned()
                .unwrap_or_default();
            join::apply(op, &left, &right)
        }
        (StageType::Sort, Operator::Sort(op)) => {
            sort::apply(op, &concat_input(&inputs.batches)?)
        }
        (StageType::Exchange, Operator::Exchange(_)) | (StageType::Final, Operator::FinalOp(_)) => {
            concat_input(&inputs.batches)
        }
        (stage_type, _) => Err(EngineError::invalid_request(format!(
            "stage type {} does not match the serialized operator",
            stage_type
        ))),
    }
}

/// Concatenate input batches into the operator's single logical input.
pub(crate) fn concat_input(batches: &[RecordBatch]) -> Result<RecordBatch, EngineError> {
    match batches.len() {
        0 => Err(EngineError::invalid_request("stage has no input batches")),
        1 => Ok(batches[0].clone()),
        _ => arrow::compute::concat_batches(&batches[0].schema(), batches)
            .map_err(|e| EngineError::internal(e.to_string())),
    }
}

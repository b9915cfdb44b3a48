//! Stage graph validation and ordering.

use data_types::{EngineError, ExecutionPlan, Stage};
use hashbrown::{HashMap, HashSet};

/// Check that the stage graph is a DAG with exactly one sink (the terminal
/// stage) and that every dependency edge points at a known stage.
pub fn validate_plan(plan: &ExecutionPlan) -> Result<(), EngineError> {
    if plan.stages.is_empty() {
        return Err(EngineError::invalid_request("plan has no stages")
            .scope_query(plan.query_id.clone()));
    }

    let ids: HashSet<u64> = plan.stages.iter().map(|s| s.stage_id).collect();
    if ids.len() != plan.stages.len() {
        return Err(EngineError::invalid_request("duplicate stage ids")
            .scope_query(plan.query_id.clone()));
    }

    for stage in &plan.stages {
        for dep in &stage.depends_on {
            if !ids.contains(dep) {
                return Err(EngineError::invalid_request(format!(
                    "stage {} depends on unknown stage {}",
                    stage.stage_id, dep
                ))
                .scope_query(plan.query_id.clone()));
            }
            if *dep == stage.stage_id {
                return Err(EngineError::invalid_request(format!(
                    "stage {} depends on itself",
                    stage.stage_id
                ))
                .scope_query(plan.query_id.clone()));
            }
        }
    }

    // exactly one stage must have no dependents
    let mut depended_on: HashSet<u64> = HashSet::new();
    for stage in &plan.stages {
        depended_on.extend(stage.depends_on.iter().copied());
    }
    let sinks: Vec<u64> = plan
        .stages
        .iter()
        .map(|s| s.stage_id)
        .filter(|id| !depended_on.contains(id))
        .collect();
    if sinks.len() != 1 {
        return Err(EngineError::invalid_request(format!(
            "plan must have exactly one terminal stage, found {:?}",
            sinks
        ))
        .scope_query(plan.query_id.clone()));
    }

    // cycle check falls out of the topological sort
    topological_order(plan).map(|_| ())
}

/// Kahn's algorithm over the dependency edges; stages only appear after
/// everything they depend on.
pub fn topological_order(plan: &ExecutionPlan) -> Result<Vec<&Stage>, EngineError> {
    let by_id: HashMap<u64, &Stage> = plan.stages.iter().map(|s| (s.stage_id, s)).collect();
    let mut in_degree: HashMap<u64, usize> = plan
        .stages
        .iter()
        .map(|s| (s.stage_id, s.depends_on.len()))
        .collect();
    let mut dependents: HashMap<u64, Vec<u64>> = HashMap::new();
    for stage in &plan.stages {
        for dep in &stage.depends_on {
            dependents.entry(*dep).or_default().push(stage.stage_id);
        }
    }

    let mut ready: Vec<u64> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(id, _)| *id)
        .collect();
    ready.sort_unstable();

    let mut order = Vec::with_capacity(plan.stages.len());
    while let Some(id) = ready.pop() {
        order.push(by_id[&id]);
        for dependent in dependents.get(&id).into_iter().flatten() {
            let degree = in_degree.get_mut(dependent).expect("known stage");
            *degree -= 1;
            if *degree == 0 {
                ready.push(*dependent);
            }
        }
    }

    if order.len() != plan.stages.len() {
        return Err(
            EngineError::invalid_request("stage dependencies contain a cycle")
                .scope_query(plan.query_id.clone()),
        );
    }
    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use data_types::{Partitioning, QueryId, StageType};

    fn stage(stage_id: u64, depends_on: Vec<u64>) -> Stage {
        Stage {
            stage_id,
            stage_type: StageType::Scan,
            serialized_plan: vec![].into(),
            input_partitions: vec![],
            output_partitioning: Partitioning::single(),
            depends_on,
        }
    }

    fn plan(stages: Vec<Stage>) -> ExecutionPlan {
        ExecutionPlan {
            query_id: QueryId::new("q-dag"),
            stages,
        }
    }

    #[test]
    fn linear_plan_orders_dependencies_first() {
        let plan = plan(vec![stage(3, vec![2]), stage(1, vec![]), stage(2, vec![1])]);
        validate_plan(&plan).unwrap();

        let order: Vec<u64> = topological_order(&plan)
            .unwrap()
            .iter()
            .map(|s| s.stage_id)
            .collect();
        assert_eq!(order, vec![1, 2, 3]);
    }

    #[test]
    fn diamond_is_valid() {
        let plan = plan(vec![
            stage(1, vec![]),
            stage(2, vec![1]),
            stage(3, vec![1]),
            stage(4, vec![2, 3]),
        ]);
        validate_plan(&plan).unwrap();

        let order: Vec<u64> = topological_order(&plan)
            .unwrap()
            .iter()
            .map(|s| s.stage_id)
            .collect();
        let position = |id: u64| order.iter().position(|x| *x == id).unwrap();
        assert!(position(1) < position(2));
        assert!(position(1) < position(3));
        assert!(position(2) < position(4));
        assert!(position(3) < position(4));
    }

    #[test]
    fn cycle_is_rejected() {
        let plan = plan(vec![stage(1, vec![2]), stage(2, vec![1]), stage(3, vec![1, 2])]);
        let err = validate_plan(&plan).unwrap_err();
        assert!(err.to_string().contains("cycle"), "{err}");
    }

    #[test]
    fn two_sinks_are_rejected() {
        let plan = plan(vec![stage(1, vec![]), stage(2, vec![1]), stage(3, vec![1])]);
        let err = validate_plan(&plan).unwrap_err();
        assert!(err.to_string().contains("terminal"), "{err}");
    }

    #[test]
    fn unknown_dependency_is_rejected() {
        let plan = plan(vec![stage(1, vec![99])]);
        let err = validate_plan(&plan).unwrap_err();
        assert!(err.to_string().contains("unknown"), "{err}");
    }

    #[test]
    fn empty_plan_is_rejected() {
        let err = validate_plan(&plan(vec![])).unwrap_err();
        assert_eq!(err.kind(), data_types::ErrorKind::InvalidRequest);
    }
}

//! The boundary to SQL parsing and relational planning.

use async_trait::async_trait;
use data_types::{EngineError, ExecutionPlan, QueryId};

/// Produces a staged physical plan for a SQL statement.
///
/// Parsing, validation and relational optimization live outside the engine;
/// the coordinator consumes the finished stage graph.
#[async_trait]
pub trait QueryPlanner: Send + Sync + std::fmt::Debug + 'static {
    async fn plan(
        &self,
        query_id: &QueryId,
        sql: &str,
        session_id: Option<&str>,
    ) -> Result<ExecutionPlan, EngineError>;
}

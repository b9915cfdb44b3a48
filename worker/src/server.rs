//! The worker-side execution RPC service.

use crate::executor::{StageAssignment, StageExecutor, CANCELLATION_WINDOW};
use crate::heartbeat::ResourceMonitor;
use crate::progress::ProgressHub;
use crate::tracker::QueryTracker;
use data_types::{QueryId, Stage, WorkerEndpoint, WorkerId, WorkerStatus};
use futures::stream::BoxStream;
use futures::StreamExt;
use generated_types::status_from_engine_error;
use generated_types::stratus::execution::v1::{
    execution_service_server::ExecutionService, CancelQueryRequest, CancelQueryResponse,
    ExecuteStageRequest, ExecuteStageResponse, ProgressUpdate as ProgressUpdateProto,
    ReportHealthRequest, ReportHealthResponse, StageStatus as StageStatusProto,
    StreamProgressRequest,
};
use generated_types::stratus::management::v1::WorkerInfo as WorkerInfoProto;
use observability_deps::tracing::info;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use stratus_time::TimeProvider;
use tokio_stream::wrappers::BroadcastStream;
use tonic::{Request, Response, Status};

/// Server-side deadline for one stage execution.
pub const EXECUTE_STAGE_TIMEOUT: Duration = Duration::from_secs(30);

/// tonic server for `ExecuteStage`, `StreamProgress`, `CancelQuery` and
/// `ReportHealth`.
#[derive(Debug)]
pub struct ExecutionRpcService {
    executor: Arc<StageExecutor>,
    progress: Arc<ProgressHub>,
    tracker: Arc<QueryTracker>,
    worker_id: WorkerId,
    endpoint: WorkerEndpoint,
    monitor: Arc<dyn ResourceMonitor>,
    time_provider: Arc<dyn TimeProvider>,
}

impl ExecutionRpcService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        executor: Arc<StageExecutor>,
        progress: Arc<ProgressHub>,
        tracker: Arc<QueryTracker>,
        worker_id: WorkerId,
        endpoint: WorkerEndpoint,
        monitor: Arc<dyn ResourceMonitor>,
        time_provider: Arc<dyn TimeProvider>,
    ) -> Self {
        Self {
            executor,
            progress,
            tracker,
            worker_id,
            endpoint,
            monitor,
            time_provider,
        }
    }
}

#[tonic::async_trait]
impl ExecutionService for ExecutionRpcService {
    async fn execute_stage(
        &self,
        request: Request<ExecuteStageRequest>,
    ) -> Result<Response<ExecuteStageResponse>, Status> {
        let req = request.into_inner();

        let stage: Stage = req
            .stage
            .ok_or_else(|| Status::invalid_argument("missing stage"))?
            .try_into()
            .map_err(|e: generated_types::FieldViolation| {
                Status::invalid_argument(e.to_string())
            })?;

        let upstream_locations: BTreeMap<u64, Vec<WorkerEndpoint>> = req
            .upstream_locations
            .into_iter()
            .map(|location| {
                (
                    location.stage_id,
                    location
                        .worker_endpoints
                        .into_iter()
                        .map(WorkerEndpoint::new)
                        .collect(),
                )
            })
            .collect();

        let assignment = StageAssignment {
            query_id: QueryId::new(req.query_id),
            stage,
            assigned_partitions: req.assigned_partitions,
            upstream_locations,
            exchange_targets: req
                .exchange_targets
                .into_iter()
                .map(WorkerEndpoint::new)
                .collect(),
            coordinator_endpoint: (!req.coordinator_endpoint.is_empty())
                .then(|| WorkerEndpoint::new(req.coordinator_endpoint)),
            trace_id: req.trace_id,
        };
        let stage_id = assignment.stage.stage_id;

        let outcome = tokio::time::timeout(EXECUTE_STAGE_TIMEOUT, self.executor.execute(assignment))
            .await
            .map_err(|_| {
                Status::deadline_exceeded(format!(
                    "stage {} did not finish within {:?}",
                    stage_id, EXECUTE_STAGE_TIMEOUT
                ))
            })?
            .map_err(|e| status_from_engine_error(&e))?;

        Ok(Response::new(ExecuteStageResponse {
            stage_id,
            status: StageStatusProto::from(outcome.status) as i32,
            produced_partitions: outcome.produced.into_iter().map(Into::into).collect(),
            stats: Some(outcome.stats.into()),
        }))
    }

    type StreamProgressStream = BoxStream<'static, Result<ProgressUpdateProto, Status>>;

    async fn stream_progress(
        &self,
        request: Request<StreamProgressRequest>,
    ) -> Result<Response<Self::StreamProgressStream>, Status> {
        let query_id = QueryId::new(request.into_inner().query_id);
        let receiver = self.progress.subscribe();

        let stream = BroadcastStream::new(receiver)
            .filter_map(move |update| {
                let query_id = query_id.clone();
                async move {
                    match update {
                        // a lagged subscriber just misses throttled updates
                        Err(_) => None,
                        Ok(update) if update.query_id != query_id => None,
                        Ok(update) => Some(Ok(update.into())),
                    }
                }
            })
            .boxed();

        Ok(Response::new(stream))
    }

    async fn cancel_query(
        &self,
        request: Request<CancelQueryRequest>,
    ) -> Result<Response<CancelQueryResponse>, Status> {
        let req = request.into_inner();
        let query_id = QueryId::new(req.query_id);
        info!(query_id=%query_id, reason=%req.reason, "cancel requested");

        let cancelled = self.tracker.cancel(&query_id);
        if cancelled {
            // give in-flight assignments their cancellation window
            let deadline = tokio::time::Instant::now() + CANCELLATION_WINDOW;
            while self.tracker.is_active(&query_id)
                && tokio::time::Instant::now() < deadline
            {
                tokio::time::sleep(Duration::from_millis(25)).await;
            }
        }

        Ok(Response::new(CancelQueryResponse { cancelled }))
    }

    async fn report_health(
        &self,
        _request: Request<ReportHealthRequest>,
    ) -> Result<Response<ReportHealthResponse>, Status> {
        let mut resources = self.monitor.snapshot().sanitized();
        resources.active_queries = self.tracker.active_queries();

        let status = if self.tracker.is_draining() {
            WorkerStatus::Draining
        } else {
            WorkerStatus::Healthy
        };

        let info = data_types::WorkerInfo {
            id: self.worker_id.clone(),
            endpoint: self.endpoint.clone(),
            status,
            resources,
            last_heartbeat_at: self.time_provider.now(),
            metadata: BTreeMap::new(),
        };

        Ok(Response::new(ReportHealthResponse {
            info: Some(WorkerInfoProto::from(info)),
        }))
    }
}

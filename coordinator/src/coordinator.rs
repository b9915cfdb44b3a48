//! The query coordinator: one state machine per query, dispatched over the
//! healthy worker pool.

use crate::dag::{topological_order, validate_plan};
use crate::planner::QueryPlanner;
use crate::results::ResultBuffer;
use arrow::record_batch::RecordBatch;
use data_exchange::ExchangeTransport;
use data_types::{
    EngineError, ErrorKind, ExecutionPlan, PartitionInfo, PartitionScheme, ProgressUpdate,
    QueryId, QueryState, QueryStatus, Stage, StageType, WorkerEndpoint, WorkerId, WorkerInfo,
};
use futures::stream::{BoxStream, StreamExt};
use generated_types::engine_error_from_status;
use generated_types::stratus::execution::v1::{
    execution_service_client::ExecutionServiceClient, CancelQueryRequest, ExecuteStageRequest,
    StageLocation, StreamProgressRequest,
};
use hashbrown::{HashMap, HashSet};
use observability_deps::tracing::{debug, info, warn};
use parking_lot::Mutex;
use registry::WorkerRegistry;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use stratus_time::TimeProvider;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use tonic::Request;

/// Coordinator tunables.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Queries admitted to RUNNING at once; excess stays SUBMITTED in FIFO
    /// order.
    pub max_concurrent_queries: usize,
    /// Dispatch attempts per stage, each on a different healthy worker.
    pub stage_max_attempts: usize,
    /// Rounds of upstream re-execution after losing a worker that held
    /// intermediate output.
    pub max_recovery_rounds: usize,
    /// How long cancellation waits for worker acknowledgements.
    pub cancel_ack_timeout: Duration,
    /// Wall-clock budget for one query end to end; `None` means unbounded.
    pub query_deadline: Option<Duration>,
    /// The exchange endpoint of this process; final stages stream results
    /// here.
    pub coordinator_endpoint: WorkerEndpoint,
}

impl CoordinatorConfig {
    pub fn new(coordinator_endpoint: WorkerEndpoint) -> Self {
        Self {
            max_concurrent_queries: 16,
            stage_max_attempts: 2,
            max_recovery_rounds: 2,
            cancel_ack_timeout: Duration::from_secs(10),
            query_deadline: None,
            coordinator_endpoint,
        }
    }
}

/// Where one stage's output partitions live after it succeeded.
#[derive(Debug, Clone)]
struct StagePlacement {
    holders: Vec<WorkerInfo>,
    scheme: PartitionScheme,
    partition_count: u32,
}

#[derive(Debug)]
struct QueryEntry {
    state: QueryState,
    sql: String,
    session_id: Option<String>,
    trace_id: String,
    cancel: CancellationToken,
    progress_tx: broadcast::Sender<ProgressUpdate>,
    /// Highest percent seen per stage; lower updates are dropped.
    last_percent: HashMap<u64, f64>,
    /// Workers with an open progress stream for this query.
    progress_streams: HashSet<WorkerId>,
}

/// Coordinates query execution across the worker pool.
///
/// Each query's transitions run on its own dispatcher task; the state map
/// has a single mutator per query, making per-query transitions
/// linearizable.
#[derive(Debug)]
pub struct QueryCoordinator {
    config: CoordinatorConfig,
    planner: Arc<dyn QueryPlanner>,
    registry: Arc<WorkerRegistry>,
    transport: Arc<ExchangeTransport>,
    results: Arc<ResultBuffer>,
    time_provider: Arc<dyn TimeProvider>,
    queries: Mutex<HashMap<QueryId, QueryEntry>>,
    admission: Mutex<VecDeque<QueryId>>,
}

impl QueryCoordinator {
    pub fn new(
        config: CoordinatorConfig,
        planner: Arc<dyn QueryPlanner>,
        registry: Arc<WorkerRegistry>,
        transport: Arc<ExchangeTransport>,
        results: Arc<ResultBuffer>,
        time_provider: Arc<dyn TimeProvider>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            planner,
            registry,
            transport,
            results,
            time_provider,
            queries: Mutex::new(HashMap::new()),
            admission: Mutex::new(VecDeque::new()),
        })
    }

    /// The buffer final stages stream into; register it as the result sink
    /// of this process's exchange service.
    pub fn result_buffer(&self) -> &Arc<ResultBuffer> {
        &self.results
    }

    /// Queries currently admitted (PLANNING or RUNNING); feeds the
    /// autoscaler's load metrics.
    pub fn running_queries(&self) -> usize {
        self.queries
            .lock()
            .values()
            .filter(|e| {
                matches!(
                    e.state.status,
                    QueryStatus::Planning | QueryStatus::Running
                )
            })
            .count()
    }

    /// Accept a query, returning its id immediately. The query waits in the
    /// FIFO admission queue until a running slot frees up.
    pub fn submit(self: &Arc<Self>, sql: impl Into<String>, session_id: Option<String>) -> QueryId {
        let query_id = QueryId::new_random();
        let trace_id = uuid::Uuid::new_v4().to_string();
        let (progress_tx, _) = broadcast::channel(256);

        let entry = QueryEntry {
            state: QueryState::new(query_id.clone(), self.time_provider.now()),
            sql: sql.into(),
            session_id,
            trace_id: trace_id.clone(),
            cancel: CancellationToken::new(),
            progress_tx,
            last_percent: HashMap::new(),
            progress_streams: HashSet::new(),
        };

        info!(query_id=%query_id, trace_id=%trace_id, "query submitted");
        self.queries.lock().insert(query_id.clone(), entry);
        self.admission.lock().push_back(query_id.clone());
        self.try_admit();

        query_id
    }

    /// Admit queued queries while running slots are free.
    fn try_admit(self: &Arc<Self>) {
        loop {
            if self.running_queries() >= self.config.max_concurrent_queries {
                return;
            }
            let Some(query_id) = self.admission.lock().pop_front() else {
                return;
            };

            {
                let mut queries = self.queries.lock();
                let Some(entry) = queries.get_mut(&query_id) else {
                    continue;
                };
                // cancelled while still queued
                if entry.state.status.is_terminal() {
                    continue;
                }
                entry.state.status = QueryStatus::Planning;
            }

            let coordinator = Arc::clone(self);
            tokio::spawn(async move {
                coordinator.run_query(query_id).await;
                coordinator.try_admit();
            });
        }
    }

    async fn run_query(self: &Arc<Self>, query_id: QueryId) {
        let (sql, session_id, trace_id, cancel) = {
            let queries = self.queries.lock();
            let entry = queries.get(&query_id).expect("admitted query has state");
            (
                entry.sql.clone(),
                entry.session_id.clone(),
                entry.trace_id.clone(),
                entry.cancel.clone(),
            )
        };

        let dispatch =
            self.plan_and_dispatch(&query_id, &sql, session_id.as_deref(), &trace_id, &cancel);
        let outcome = match self.config.query_deadline {
            None => dispatch.await,
            Some(deadline) => match tokio::time::timeout(deadline, dispatch).await {
                Ok(outcome) => outcome,
                Err(_) => Err(EngineError::timeout(format!(
                    "query exceeded its {:?} deadline",
                    deadline
                ))
                .scope_query(query_id.clone())),
            },
        };

        match outcome {
            Ok(holders) => self.finalize(&query_id, QueryStatus::Completed, None, holders),
            Err(e) if e.kind() == ErrorKind::Cancelled => {
                self.finalize(&query_id, QueryStatus::Cancelled, Some(e.to_string()), vec![])
            }
            Err(e) => {
                warn!(query_id=%query_id, error=%e, "query failed");
                self.finalize(&query_id, QueryStatus::Failed, Some(e.to_string()), vec![])
            }
        }
    }

    async fn plan_and_dispatch(
        self: &Arc<Self>,
        query_id: &QueryId,
        sql: &str,
        session_id: Option<&str>,
        trace_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<WorkerEndpoint>, EngineError> {
        let plan = self
            .planner
            .plan(query_id, sql, session_id)
            .await
            .map_err(|e| e.scope_query(query_id.clone()))?;
        validate_plan(&plan)?;
        let order: Vec<Stage> = topological_order(&plan)?
            .into_iter()
            .cloned()
            .collect();

        {
            let mut queries = self.queries.lock();
            if let Some(entry) = queries.get_mut(query_id) {
                if entry.state.status.is_terminal() {
                    return Err(EngineError::cancelled("query cancelled during planning"));
                }
                entry.state.status = QueryStatus::Running;
                entry.state.started_at = Some(self.time_provider.now());
            }
        }
        info!(query_id=%query_id, stages=order.len(), "query running");

        self.dispatch_stages(query_id, &plan, order, trace_id, cancel)
            .await
    }

    async fn dispatch_stages(
        self: &Arc<Self>,
        query_id: &QueryId,
        plan: &ExecutionPlan,
        order: Vec<Stage>,
        trace_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<WorkerEndpoint>, EngineError> {
        let total_stages = order.len();
        // bounded stage parallelism, default healthy pool size at admission
        let max_parallel = self.registry.healthy().len().max(1);

        let mut pending: VecDeque<Stage> = order.into();
        let mut succeeded: HashSet<u64> = HashSet::new();
        let mut placements: HashMap<u64, StagePlacement> = HashMap::new();
        let mut recovery_rounds = 0;

        while !pending.is_empty() {
            if cancel.is_cancelled() {
                return Err(EngineError::cancelled("query cancelled"));
            }

            // a stage is dispatched only when every dependency succeeded
            let mut ready = Vec::new();
            let mut rest = VecDeque::new();
            while let Some(stage) = pending.pop_front() {
                if ready.len() < max_parallel
                    && stage.depends_on.iter().all(|d| succeeded.contains(d))
                {
                    ready.push(stage);
                } else {
                    rest.push_back(stage);
                }
            }
            pending = rest;

            if ready.is_empty() {
                return Err(EngineError::internal(
                    "validated stage graph produced no runnable stage",
                ));
            }

            let results = futures::future::join_all(ready.iter().map(|stage| {
                self.run_stage(query_id, stage, &placements, trace_id, cancel)
            }))
            .await;

            let mut failure: Option<EngineError> = None;
            for (stage, result) in ready.iter().zip(results) {
                match result {
                    Ok(placement) => {
                        succeeded.insert(stage.stage_id);
                        placements.insert(stage.stage_id, placement);
                    }
                    Err(e) => {
                        failure = Some(e);
                        pending.push_front(stage.clone());
                    }
                }
            }

            if let Some(e) = failure {
                let recoverable = e.kind().is_retryable()
                    && recovery_rounds < self.config.max_recovery_rounds;
                if !recoverable {
                    return Err(e);
                }
                recovery_rounds += 1;
                warn!(
                    query_id=%query_id,
                    error=%e,
                    round=recovery_rounds,
                    "stage failed on lost worker, re-running affected upstream stages",
                );
                self.recover_lost_stages(plan, &mut succeeded, &mut pending, &mut placements);
            }

            let progress = succeeded.len() as f64 / total_stages.max(1) as f64;
            if let Some(entry) = self.queries.lock().get_mut(query_id) {
                entry.state.progress = progress;
            }
        }

        Ok(placements
            .values()
            .flat_map(|p| p.holders.iter().map(|w| w.endpoint.clone()))
            .collect::<HashSet<_>>()
            .into_iter()
            .collect())
    }

    /// Drop completed stages whose output lives on workers that are no
    /// longer healthy, queueing them for re-execution.
    fn recover_lost_stages(
        &self,
        plan: &ExecutionPlan,
        succeeded: &mut HashSet<u64>,
        pending: &mut VecDeque<Stage>,
        placements: &mut HashMap<u64, StagePlacement>,
    ) {
        let healthy: HashSet<WorkerId> =
            self.registry.healthy().into_iter().map(|w| w.id).collect();

        let lost: Vec<u64> = placements
            .iter()
            .filter(|(_, p)| p.holders.iter().any(|w| !healthy.contains(&w.id)))
            .map(|(id, _)| *id)
            .collect();

        for stage_id in lost {
            warn!(stage_id, "intermediate output lost, stage will re-run");
            succeeded.remove(&stage_id);
            placements.remove(&stage_id);
            if let Some(stage) = plan.stage(stage_id) {
                if !pending.iter().any(|s| s.stage_id == stage_id) {
                    pending.push_front(stage.clone());
                }
            }
        }
    }

    /// Run one stage to success, retrying on different healthy workers up
    /// to the attempt budget.
    async fn run_stage(
        self: &Arc<Self>,
        query_id: &QueryId,
        stage: &Stage,
        placements: &HashMap<u64, StagePlacement>,
        trace_id: &str,
        cancel: &CancellationToken,
    ) -> Result<StagePlacement, EngineError> {
        let mut excluded: HashSet<WorkerId> = HashSet::new();
        let mut last_error: Option<EngineError> = None;

        for attempt in 1..=self.config.stage_max_attempts {
            if cancel.is_cancelled() {
                return Err(EngineError::cancelled("query cancelled"));
            }

            let (runners, holders) = self.place_stage(stage, placements, &excluded)?;
            debug!(
                query_id=%query_id,
                stage_id=stage.stage_id,
                stage_type=%stage.stage_type,
                depends_on=%data_types::format_depends_on(&stage.depends_on),
                attempt,
                workers=runners.len(),
                "dispatching stage",
            );

            {
                let mut queries = self.queries.lock();
                if let Some(entry) = queries.get_mut(query_id) {
                    entry
                        .state
                        .assignments
                        .insert(stage.stage_id, runners.iter().map(|w| w.id.clone()).collect());
                }
            }
            for worker in &runners {
                self.ensure_progress_stream(query_id, worker);
            }

            let dispatches =
                futures::future::join_all(runners.iter().enumerate().map(|(index, worker)| {
                    self.dispatch_assignment(
                        query_id,
                        stage,
                        worker,
                        index,
                        &runners,
                        &holders,
                        placements,
                        trace_id,
                    )
                }))
                .await;

            let mut produced: Vec<PartitionInfo> = Vec::new();
            let mut attempt_failed = false;
            for (worker, result) in runners.iter().zip(dispatches) {
                match result {
                    Ok(partitions) => produced.extend(partitions),
                    Err(e) => {
                        warn!(
                            query_id=%query_id,
                            stage_id=stage.stage_id,
                            worker_id=%worker.id,
                            error=%e,
                            "stage assignment failed",
                        );
                        if matches!(e.kind(), ErrorKind::Cancelled | ErrorKind::InvalidRequest) {
                            return Err(e);
                        }
                        excluded.insert(worker.id.clone());
                        attempt_failed = true;
                        last_error = Some(e);
                    }
                }
            }

            if !attempt_failed {
                if let Some(entry) = self.queries.lock().get_mut(query_id) {
                    entry.state.outputs.insert(stage.stage_id, produced);
                }
                return Ok(StagePlacement {
                    holders,
                    scheme: stage.output_partitioning.scheme,
                    partition_count: stage.output_partitioning.partition_count,
                });
            }
        }

        Err(last_error
            .unwrap_or_else(|| EngineError::internal("stage retries exhausted"))
            .scope_query(query_id.clone())
            .scope_stage(stage.stage_id))
    }

    /// Choose the workers that run a stage and the workers that will hold
    /// its output (they differ only for exchange stages, which push).
    fn place_stage(
        &self,
        stage: &Stage,
        placements: &HashMap<u64, StagePlacement>,
        excluded: &HashSet<WorkerId>,
    ) -> Result<(Vec<WorkerInfo>, Vec<WorkerInfo>), EngineError> {
        let mut healthy: Vec<WorkerInfo> = self
            .registry
            .healthy()
            .into_iter()
            .filter(|w| !excluded.contains(&w.id))
            .collect();
        if healthy.is_empty() {
            return Err(EngineError::unavailable("no healthy workers available")
                .scope_stage(stage.stage_id));
        }
        healthy.sort_by(|a, b| {
            a.resources
                .active_queries
                .cmp(&b.resources.active_queries)
                .then(a.last_heartbeat_at.cmp(&b.last_heartbeat_at))
        });

        // upstream workers still healthy and not excluded
        let upstream: Vec<WorkerInfo> = {
            let mut seen = HashSet::new();
            stage
                .depends_on
                .iter()
                .filter_map(|d| placements.get(d))
                .flat_map(|p| p.holders.iter())
                .filter(|w| healthy.iter().any(|h| h.id == w.id))
                .filter(|w| seen.insert(w.id.clone()))
                .cloned()
                .collect()
        };

        let hash_fanout = stage
            .depends_on
            .iter()
            .filter_map(|d| placements.get(d))
            .filter(|p| p.scheme == PartitionScheme::Hash)
            .map(|p| p.partition_count as usize)
            .max();

        let runners = match stage.stage_type {
            StageType::Scan => {
                let n = stage.input_partitions.len().clamp(1, healthy.len());
                healthy.iter().take(n).cloned().collect::<Vec<_>>()
            }
            StageType::Final => {
                // single worker, preferably one already holding input
                vec![upstream
                    .first()
                    .cloned()
                    .unwrap_or_else(|| healthy[0].clone())]
            }
            StageType::Exchange => {
                // exchange runs on the producers of its dependency
                if upstream.is_empty() {
                    vec![healthy[0].clone()]
                } else {
                    upstream.clone()
                }
            }
            _ => {
                // fan out to one consumer per hash partition slot; non-hash
                // inputs gather onto a single worker that fetches them all
                let n = hash_fanout.unwrap_or(1).clamp(1, healthy.len());
                let mut chosen = upstream.clone();
                chosen.truncate(n);
                for candidate in &healthy {
                    if chosen.len() >= n {
                        break;
                    }
                    if !chosen.iter().any(|w| w.id == candidate.id) {
                        chosen.push(candidate.clone());
                    }
                }
                chosen
            }
        };

        let holders = if stage.stage_type == StageType::Exchange {
            // exchange pushes to its targets, which then hold the output
            let n = (stage.output_partitioning.partition_count as usize).clamp(1, healthy.len());
            healthy.iter().take(n).cloned().collect()
        } else if stage.stage_type == StageType::Final {
            vec![]
        } else {
            runners.clone()
        };

        Ok((runners, holders))
    }

    #[allow(clippy::too_many_arguments)]
    async fn dispatch_assignment(
        self: &Arc<Self>,
        query_id: &QueryId,
        stage: &Stage,
        worker: &WorkerInfo,
        index: usize,
        runners: &[WorkerInfo],
        holders: &[WorkerInfo],
        placements: &HashMap<u64, StagePlacement>,
        trace_id: &str,
    ) -> Result<Vec<PartitionInfo>, EngineError> {
        let mut stage_for_worker = stage.clone();
        if stage.stage_type == StageType::Scan {
            // input partitions round-robin across the chosen workers
            stage_for_worker.input_partitions = stage
                .input_partitions
                .iter()
                .enumerate()
                .filter(|(i, _)| i % runners.len() == index)
                .map(|(_, p)| p.clone())
                .collect();
        }

        let hash_fanout = stage
            .depends_on
            .iter()
            .filter_map(|d| placements.get(d))
            .filter(|p| p.scheme == PartitionScheme::Hash)
            .map(|p| p.partition_count)
            .max();
        let assigned_partitions: Vec<u64> = match hash_fanout {
            Some(count) => (0..count as u64)
                .filter(|p| (*p as usize) % runners.len() == index)
                .collect(),
            None => vec![],
        };

        let upstream_locations = stage
            .depends_on
            .iter()
            .filter_map(|d| placements.get(d).map(|p| (*d, p)))
            .map(|(dep, placement)| {
                let runner_ids: HashSet<&WorkerId> = runners.iter().map(|w| &w.id).collect();
                let holder_ids: HashSet<&WorkerId> =
                    placement.holders.iter().map(|w| &w.id).collect();
                // map-side continuation reads only its local share
                let local_continuation = placement.scheme != PartitionScheme::Hash
                    && runner_ids == holder_ids;
                let endpoints = if local_continuation {
                    vec![worker.endpoint.to_string()]
                } else {
                    placement
                        .holders
                        .iter()
                        .map(|w| w.endpoint.to_string())
                        .collect()
                };
                StageLocation {
                    stage_id: dep,
                    worker_endpoints: endpoints,
                }
            })
            .collect();

        let request = ExecuteStageRequest {
            query_id: query_id.to_string(),
            stage: Some(stage_for_worker.into()),
            assigned_partitions,
            upstream_locations,
            exchange_targets: if stage.stage_type == StageType::Exchange {
                holders.iter().map(|w| w.endpoint.to_string()).collect()
            } else {
                vec![]
            },
            coordinator_endpoint: if stage.stage_type == StageType::Final {
                self.config.coordinator_endpoint.to_string()
            } else {
                String::new()
            },
            trace_id: trace_id.to_string(),
        };

        let connection = self.transport.pool().get(&worker.endpoint).await?;
        let mut client = ExecutionServiceClient::new(connection);
        let response = client
            .execute_stage(Request::new(request))
            .await
            .map_err(engine_error_from_status)?
            .into_inner();

        Ok(response
            .produced_partitions
            .into_iter()
            .map(Into::into)
            .collect())
    }

    /// Open (once per query and worker) a progress stream and forward
    /// updates into the query's broadcast, dropping non-monotonic percents.
    fn ensure_progress_stream(self: &Arc<Self>, query_id: &QueryId, worker: &WorkerInfo) {
        {
            let mut queries = self.queries.lock();
            let Some(entry) = queries.get_mut(query_id) else {
                return;
            };
            if !entry.progress_streams.insert(worker.id.clone()) {
                return;
            }
        }

        let coordinator = Arc::clone(self);
        let query_id = query_id.clone();
        let endpoint = worker.endpoint.clone();
        let worker_id = worker.id.clone();
        tokio::spawn(async move {
            let connection = match coordinator.transport.pool().get(&endpoint).await {
                Ok(connection) => connection,
                Err(e) => {
                    debug!(worker_id=%worker_id, error=%e, "progress stream unavailable");
                    return;
                }
            };
            let mut client = ExecutionServiceClient::new(connection);
            let mut stream = match client
                .stream_progress(Request::new(StreamProgressRequest {
                    query_id: query_id.to_string(),
                    trace_id: String::new(),
                }))
                .await
            {
                Ok(response) => response.into_inner(),
                Err(e) => {
                    debug!(worker_id=%worker_id, error=%e, "progress stream rejected");
                    return;
                }
            };

            while let Ok(Some(update)) = stream.message().await {
                let Ok(update) = ProgressUpdate::try_from(update) else {
                    continue;
                };
                let mut queries = coordinator.queries.lock();
                let Some(entry) = queries.get_mut(&query_id) else {
                    return;
                };
                let last = entry
                    .last_percent
                    .get(&update.stage_id)
                    .copied()
                    .unwrap_or(-1.);
                if update.percent < last {
                    continue;
                }
                entry.last_percent.insert(update.stage_id, update.percent);
                let _ = entry.progress_tx.send(update);
                if entry.state.status.is_terminal() {
                    return;
                }
            }
        });
    }

    fn finalize(
        self: &Arc<Self>,
        query_id: &QueryId,
        status: QueryStatus,
        error_msg: Option<String>,
        holders: Vec<WorkerEndpoint>,
    ) {
        {
            let mut queries = self.queries.lock();
            let Some(entry) = queries.get_mut(query_id) else {
                return;
            };
            if entry.state.status.is_terminal() {
                return;
            }
            entry.state.status = status;
            entry.state.completed_at = Some(self.time_provider.now());
            entry.state.error_msg = error_msg;
            if status == QueryStatus::Completed {
                entry.state.progress = 1.;
            }
            info!(query_id=%query_id, status=%status, "query finished");
        }

        if status != QueryStatus::Completed {
            self.results.discard(query_id);
        }

        // release intermediates on every worker that held some
        let coordinator = Arc::clone(self);
        let query_id = query_id.clone();
        tokio::spawn(async move {
            for endpoint in holders {
                if let Err(e) = coordinator.transport.cleanup_query(&endpoint, &query_id).await {
                    debug!(endpoint=%endpoint, error=%e, "intermediate cleanup failed");
                }
            }
        });
    }

    /// State snapshot for one query.
    pub fn status(&self, query_id: &QueryId) -> Result<QueryState, EngineError> {
        self.queries
            .lock()
            .get(query_id)
            .map(|e| e.state.clone())
            .ok_or_else(|| {
                EngineError::not_found(format!("unknown query {}", query_id))
                    .scope_query(query_id.clone())
            })
    }

    /// Multiplexed per-stage progress for one query. Percent is monotone
    /// per stage as observed here.
    pub fn progress(
        &self,
        query_id: &QueryId,
    ) -> Result<BoxStream<'static, ProgressUpdate>, EngineError> {
        let queries = self.queries.lock();
        let entry = queries.get(query_id).ok_or_else(|| {
            EngineError::not_found(format!("unknown query {}", query_id))
        })?;

        let stream = BroadcastStream::new(entry.progress_tx.subscribe())
            .filter_map(|update| async move { update.ok() })
            .boxed();
        Ok(stream)
    }

    /// Best-effort cancellation: fan out to every assigned worker, join
    /// acknowledgements up to the configured deadline, then mark the query
    /// CANCELLED regardless.
    pub async fn cancel(
        self: &Arc<Self>,
        query_id: &QueryId,
        reason: &str,
    ) -> Result<bool, EngineError> {
        let (cancel, assigned_workers) = {
            let queries = self.queries.lock();
            let entry = queries.get(query_id).ok_or_else(|| {
                EngineError::not_found(format!("unknown query {}", query_id))
            })?;
            if entry.state.status.is_terminal() {
                return Ok(false);
            }
            let workers: HashSet<WorkerId> = entry
                .state
                .assignments
                .values()
                .flat_map(|workers| workers.iter().cloned())
                .collect();
            (entry.cancel.clone(), workers)
        };

        info!(query_id=%query_id, reason, workers=assigned_workers.len(), "cancelling query");
        cancel.cancel();

        let endpoints: Vec<WorkerEndpoint> = assigned_workers
            .iter()
            .filter_map(|id| self.registry.get(id))
            .map(|info| info.endpoint)
            .collect();

        let fan_out = futures::future::join_all(endpoints.iter().map(|endpoint| async {
            let connection = self.transport.pool().get(endpoint).await?;
            let mut client = ExecutionServiceClient::new(connection);
            client
                .cancel_query(Request::new(CancelQueryRequest {
                    query_id: query_id.to_string(),
                    reason: reason.to_string(),
                    trace_id: String::new(),
                }))
                .await
                .map_err(engine_error_from_status)?;
            Ok::<_, EngineError>(())
        }));

        // join acks with a deadline, then transition regardless
        if tokio::time::timeout(self.config.cancel_ack_timeout, fan_out)
            .await
            .is_err()
        {
            warn!(query_id=%query_id, "cancellation acks timed out");
        }

        self.finalize(
            query_id,
            QueryStatus::Cancelled,
            Some(format!("cancelled: {}", reason)),
            endpoints,
        );
        Ok(true)
    }

    /// Drain the result stream of a COMPLETED query.
    pub fn results(
        &self,
        query_id: &QueryId,
    ) -> Result<BoxStream<'static, RecordBatch>, EngineError> {
        let status = self.status(query_id)?.status;
        if status != QueryStatus::Completed {
            return Err(EngineError::invalid_request(format!(
                "results are only available for completed queries, query {} is {}",
                query_id, status
            ))
            .scope_query(query_id.clone()));
        }
        Ok(futures::stream::iter(self.results.take(query_id)).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use data_exchange::{ConnectionPool, TransportConfig};
    use data_types::Partitioning;
    use registry::RegistryConfig;
    use stratus_time::{MockProvider, Time};

    #[derive(Debug)]
    struct FailingPlanner;

    #[async_trait]
    impl QueryPlanner for FailingPlanner {
        async fn plan(
            &self,
            _query_id: &QueryId,
            _sql: &str,
            _session_id: Option<&str>,
        ) -> Result<ExecutionPlan, EngineError> {
            Err(EngineError::invalid_request("unknown table t"))
        }
    }

    #[derive(Debug)]
    struct SingleScanPlanner;

    #[async_trait]
    impl QueryPlanner for SingleScanPlanner {
        async fn plan(
            &self,
            query_id: &QueryId,
            _sql: &str,
            _session_id: Option<&str>,
        ) -> Result<ExecutionPlan, EngineError> {
            Ok(ExecutionPlan {
                query_id: query_id.clone(),
                stages: vec![Stage {
                    stage_id: 1,
                    stage_type: StageType::Final,
                    serialized_plan: vec![].into(),
                    input_partitions: vec![],
                    output_partitioning: Partitioning::single(),
                    depends_on: vec![],
                }],
            })
        }
    }

    fn coordinator(planner: Arc<dyn QueryPlanner>) -> Arc<QueryCoordinator> {
        let clock = Arc::new(MockProvider::new(Time::from_timestamp_millis(0)));
        let time_provider: Arc<dyn TimeProvider> = clock;
        let registry = Arc::new(WorkerRegistry::new(
            RegistryConfig::default(),
            Arc::clone(&time_provider),
        ));
        let transport = Arc::new(ExchangeTransport::new(
            Arc::new(ConnectionPool::default()),
            TransportConfig::default(),
            Arc::clone(&time_provider),
        ));
        QueryCoordinator::new(
            CoordinatorConfig::new(WorkerEndpoint::new("127.0.0.1:0")),
            planner,
            registry,
            transport,
            Arc::new(ResultBuffer::new()),
            time_provider,
        )
    }

    async fn wait_terminal(
        coordinator: &Arc<QueryCoordinator>,
        query_id: &QueryId,
    ) -> QueryState {
        for _ in 0..200 {
            let state = coordinator.status(query_id).unwrap();
            if state.status.is_terminal() {
                return state;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("query never reached a terminal state");
    }

    #[tokio::test]
    async fn planner_failure_fails_the_query() {
        let coordinator = coordinator(Arc::new(FailingPlanner));
        let query_id = coordinator.submit("SELECT * FROM t", None);

        let state = wait_terminal(&coordinator, &query_id).await;
        assert_eq!(state.status, QueryStatus::Failed);
        assert!(state.error_msg.unwrap().contains("unknown table"));
    }

    #[tokio::test]
    async fn no_healthy_workers_fails_the_query() {
        let coordinator = coordinator(Arc::new(SingleScanPlanner));
        let query_id = coordinator.submit("SELECT 1", None);

        let state = wait_terminal(&coordinator, &query_id).await;
        assert_eq!(state.status, QueryStatus::Failed);
        assert!(state.error_msg.unwrap().contains("no healthy workers"));
    }

    #[tokio::test]
    async fn unknown_query_is_not_found() {
        let coordinator = coordinator(Arc::new(FailingPlanner));
        let err = coordinator.status(&QueryId::new("ghost")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let err = coordinator
            .cancel(&QueryId::new("ghost"), "test")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn results_require_completion() {
        let coordinator = coordinator(Arc::new(FailingPlanner));
        let query_id = coordinator.submit("SELECT * FROM t", None);
        wait_terminal(&coordinator, &query_id).await;

        let err = coordinator.results(&query_id).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidRequest);
    }

    #[tokio::test]
    async fn cancelling_a_terminal_query_reports_false() {
        let coordinator = coordinator(Arc::new(FailingPlanner));
        let query_id = coordinator.submit("SELECT * FROM t", None);
        wait_terminal(&coordinator, &query_id).await;

        assert!(!coordinator.cancel(&query_id, "too late").await.unwrap());
    }
}

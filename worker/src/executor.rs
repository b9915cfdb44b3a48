//! Runs one stage assignment to a terminal state.

use crate::operators::{self, StageInputs};
use crate::progress::ProgressHub;
use crate::table_source::TableSource;
use crate::tracker::QueryTracker;
use arrow::record_batch::RecordBatch;
use data_exchange::{ExchangeTransport, IntermediateStore};
use data_types::{
    EngineError, PartitionInfo, PartitionScheme, ProgressUpdate, QueryId, Stage, StageStats,
    StageStatus, StageType, WorkerEndpoint, WorkerId,
};
use generated_types::stratus::plan::v1::StagePlan;
use observability_deps::tracing::{info, warn};
use prost::Message;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use stratus_time::TimeProvider;
use tokio_util::sync::CancellationToken;

/// How long a cancelled stage may take to abort and release its buffers.
pub const CANCELLATION_WINDOW: Duration = Duration::from_secs(2);

/// One stage assignment as dispatched by the coordinator.
#[derive(Debug, Clone)]
pub struct StageAssignment {
    pub query_id: QueryId,
    pub stage: Stage,
    /// Output partition ids of upstream stages this assignment consumes;
    /// empty means everything available.
    pub assigned_partitions: Vec<u64>,
    /// Where each dependency stage's output can be fetched.
    pub upstream_locations: BTreeMap<u64, Vec<WorkerEndpoint>>,
    /// Exchange stages push here.
    pub exchange_targets: Vec<WorkerEndpoint>,
    /// Final stages stream here.
    pub coordinator_endpoint: Option<WorkerEndpoint>,
    pub trace_id: String,
}

/// Terminal result of a successful assignment.
#[derive(Debug, Clone)]
pub struct StageOutcome {
    pub status: StageStatus,
    pub produced: Vec<PartitionInfo>,
    pub stats: StageStats,
}

/// Executes stages against local and remote inputs.
///
/// Inputs are never mutated, so a retried `(stage, inputs)` pair replays
/// deterministically.
#[derive(Debug)]
pub struct StageExecutor {
    worker_id: WorkerId,
    store: Arc<IntermediateStore>,
    transport: Arc<ExchangeTransport>,
    table_source: Arc<dyn TableSource>,
    progress: Arc<ProgressHub>,
    tracker: Arc<QueryTracker>,
    time_provider: Arc<dyn TimeProvider>,
}

impl StageExecutor {
    pub fn new(
        worker_id: WorkerId,
        store: Arc<IntermediateStore>,
        transport: Arc<ExchangeTransport>,
        table_source: Arc<dyn TableSource>,
        progress: Arc<ProgressHub>,
        tracker: Arc<QueryTracker>,
        time_provider: Arc<dyn TimeProvider>,
    ) -> Self {
        Self {
            worker_id,
            store,
            transport,
            table_source,
            progress,
            tracker,
            time_provider,
        }
    }

    pub fn tracker(&self) -> &Arc<QueryTracker> {
        &self.tracker
    }

    /// Run `assignment` to a terminal state, publishing progress along the
    /// way. Returns the produced partitions on success.
    pub async fn execute(&self, assignment: StageAssignment) -> Result<StageOutcome, EngineError> {
        if self.tracker.is_draining() {
            return Err(EngineError::unavailable(
                "worker is draining and refuses new assignments",
            )
            .scope_worker(self.worker_id.clone()));
        }

        let token = self.tracker.begin_assignment(&assignment.query_id);
        let started = self.time_provider.now();

        let result = self.execute_inner(&assignment, &token, started).await;
        self.tracker.finish_assignment(&assignment.query_id);

        let elapsed_ms = self
            .time_provider
            .now()
            .checked_duration_since(started)
            .unwrap_or_default()
            .as_millis() as u64;

        match &result {
            Ok(outcome) => {
                info!(
                    query_id=%assignment.query_id,
                    stage_id=assignment.stage.stage_id,
                    stage_type=%assignment.stage.stage_type,
                    rows=outcome.stats.rows_processed,
                    elapsed_ms,
                    "stage succeeded",
                );
                self.publish(&assignment, StageStatus::Succeeded, 1., outcome.stats);
            }
            Err(e) if e.kind() == data_types::ErrorKind::Cancelled => {
                info!(
                    query_id=%assignment.query_id,
                    stage_id=assignment.stage.stage_id,
                    "stage cancelled",
                );
                self.publish(
                    &assignment,
                    StageStatus::Cancelled,
                    1.,
                    StageStats {
                        elapsed_ms,
                        ..Default::default()
                    },
                );
            }
            Err(e) => {
                warn!(
                    query_id=%assignment.query_id,
                    stage_id=assignment.stage.stage_id,
                    error=%e,
                    "stage failed",
                );
                self.publish(
                    &assignment,
                    StageStatus::Failed,
                    1.,
                    StageStats {
                        elapsed_ms,
                        ..Default::default()
                    },
                );
            }
        }

        result.map_err(|e| {
            e.scope_query(assignment.query_id.clone())
                .scope_stage(assignment.stage.stage_id)
                .scope_worker(self.worker_id.clone())
        })
    }

    async fn execute_inner(
        &self,
        assignment: &StageAssignment,
        token: &CancellationToken,
        started: stratus_time::Time,
    ) -> Result<StageOutcome, EngineError> {
        self.publish(
            assignment,
            StageStatus::Running,
            0.,
            StageStats::default(),
        );

        let plan = StagePlan::decode(assignment.stage.serialized_plan.as_ref())
            .map_err(|e| EngineError::invalid_request(format!("undecodable stage plan: {}", e)))?;

        let inputs = self.resolve_inputs(assignment, token).await?;
        self.check_cancelled(token)?;

        // a non-scan assignment whose upstream share is entirely empty
        // succeeds with no output (its hash partitions had no rows)
        if assignment.stage.stage_type != StageType::Scan && inputs.batches.is_empty() {
            return Ok(StageOutcome {
                status: StageStatus::Succeeded,
                produced: vec![],
                stats: StageStats {
                    elapsed_ms: self
                        .time_provider
                        .now()
                        .checked_duration_since(started)
                        .unwrap_or_default()
                        .as_millis() as u64,
                    ..Default::default()
                },
            });
        }

        let input_rows: u64 = inputs.batches.iter().map(|b| b.num_rows() as u64).sum();
        let input_bytes: u64 = inputs
            .batches
            .iter()
            .flat_map(|b| b.columns())
            .map(|c| c.get_array_memory_size() as u64)
            .sum();
        let stats_at = |now: stratus_time::Time| StageStats {
            rows_processed: input_rows,
            bytes_processed: input_bytes,
            elapsed_ms: now
                .checked_duration_since(started)
                .unwrap_or_default()
                .as_millis() as u64,
        };
        self.publish(
            assignment,
            StageStatus::Running,
            0.4,
            stats_at(self.time_provider.now()),
        );

        let output = operators::run_operator(assignment.stage.stage_type, &plan, &inputs)?;
        self.check_cancelled(token)?;
        self.publish(
            assignment,
            StageStatus::Running,
            0.8,
            stats_at(self.time_provider.now()),
        );

        let produced = self.route_output(assignment, output, token).await?;

        Ok(StageOutcome {
            status: StageStatus::Succeeded,
            produced,
            stats: stats_at(self.time_provider.now()),
        })
    }

    async fn resolve_inputs(
        &self,
        assignment: &StageAssignment,
        token: &CancellationToken,
    ) -> Result<StageInputs, EngineError> {
        let mut inputs = StageInputs::default();

        if assignment.stage.stage_type == StageType::Scan {
            for partition in &assignment.stage.input_partitions {
                let batches = self
                    .with_cancel(token, self.table_source.read_partition(partition))
                    .await?;
                inputs.batches.extend(batches);
            }
            return Ok(inputs);
        }

        for upstream in &assignment.stage.depends_on {
            let locations = assignment.upstream_locations.get(upstream).ok_or_else(|| {
                EngineError::invalid_request(format!(
                    "no upstream locations for dependency stage {}",
                    upstream
                ))
            })?;

            let mut batches = Vec::new();
            for endpoint in locations {
                let available = self
                    .with_cancel(
                        token,
                        self.transport
                            .list_available(endpoint, &assignment.query_id, *upstream),
                    )
                    .await?;

                let wanted: Vec<u64> = available
                    .iter()
                    .map(|p| p.partition_id)
                    .filter(|id| {
                        assignment.assigned_partitions.is_empty()
                            || assignment.assigned_partitions.contains(id)
                    })
                    .collect();
                if wanted.is_empty() {
                    continue;
                }

                let fetched = self
                    .with_cancel(
                        token,
                        self.transport.request_partitions(
                            endpoint,
                            &assignment.query_id,
                            *upstream,
                            &wanted,
                        ),
                    )
                    .await?;
                batches.extend(fetched);
            }

            inputs.batches.extend(batches.iter().cloned());
            inputs.by_stage.insert(*upstream, batches);
        }

        Ok(inputs)
    }

    async fn route_output(
        &self,
        assignment: &StageAssignment,
        output: RecordBatch,
        token: &CancellationToken,
    ) -> Result<Vec<PartitionInfo>, EngineError> {
        let stage = &assignment.stage;

        match stage.stage_type {
            StageType::Final => {
                let coordinator = assignment.coordinator_endpoint.as_ref().ok_or_else(|| {
                    EngineError::invalid_request("final stage without coordinator endpoint")
                })?;
                let result = self
                    .with_cancel(
                        token,
                        self.transport.send_results(
                            coordinator,
                            &assignment.query_id,
                            stage.stage_id,
                            &output,
                        ),
                    )
                    .await?;
                Ok(vec![PartitionInfo {
                    partition_id: 0,
                    rows: result.rows,
                    bytes: result.bytes,
                }])
            }
            StageType::Exchange => {
                if assignment.exchange_targets.is_empty() {
                    return Err(EngineError::invalid_request(
                        "exchange stage without targets",
                    ));
                }
                match stage.output_partitioning.scheme {
                    PartitionScheme::Hash => {
                        self.with_cancel(
                            token,
                            self.transport.shuffle(
                                &assignment.query_id,
                                stage.stage_id,
                                &output,
                                &stage.output_partitioning.columns,
                                stage.output_partitioning.partition_count,
                                &assignment.exchange_targets,
                            ),
                        )
                        .await?;
                    }
                    PartitionScheme::Broadcast => {
                        self.with_cancel(
                            token,
                            self.transport.broadcast(
                                &assignment.query_id,
                                stage.stage_id,
                                &output,
                                &assignment.exchange_targets,
                            ),
                        )
                        .await?;
                    }
                    PartitionScheme::Single => {
                        // a distinct partition id per producer, so parallel
                        // gathers into one target never overwrite each other
                        let partition_id = uuid::Uuid::new_v4().as_u128() as u64;
                        self.with_cancel(
                            token,
                            self.transport.send_partition(
                                &assignment.exchange_targets[0],
                                &assignment.query_id,
                                stage.stage_id,
                                partition_id,
                                &output,
                            ),
                        )
                        .await
                        .map(|_| ())?;
                    }
                }
                // redistributed output lives on the receivers
                Ok(vec![])
            }
            _ => match stage.output_partitioning.scheme {
                PartitionScheme::Hash => {
                    let partitions = chunk_codec::hash_partition(
                        &output,
                        &stage.output_partitioning.columns,
                        stage.output_partitioning.partition_count,
                    )?;
                    let mut produced = Vec::with_capacity(partitions.len());
                    for (partition_id, part) in partitions {
                        let info = PartitionInfo {
                            partition_id,
                            rows: part.num_rows() as u64,
                            bytes: part
                                .columns()
                                .iter()
                                .map(|c| c.get_array_memory_size() as u64)
                                .sum(),
                        };
                        self.store
                            .put(&assignment.query_id, stage.stage_id, partition_id, part)?;
                        produced.push(info);
                    }
                    Ok(produced)
                }
                PartitionScheme::Single | PartitionScheme::Broadcast => {
                    let info = PartitionInfo {
                        partition_id: 0,
                        rows: output.num_rows() as u64,
                        bytes: output
                            .columns()
                            .iter()
                            .map(|c| c.get_array_memory_size() as u64)
                            .sum(),
                    };
                    self.store
                        .put(&assignment.query_id, stage.stage_id, 0, output)?;
                    Ok(vec![info])
                }
            },
        }
    }

    fn publish(
        &self,
        assignment: &StageAssignment,
        status: StageStatus,
        percent: f64,
        stats: StageStats,
    ) {
        self.progress.publish(ProgressUpdate {
            query_id: assignment.query_id.clone(),
            stage_id: assignment.stage.stage_id,
            worker_id: self.worker_id.clone(),
            status,
            percent,
            stats,
            trace_id: assignment.trace_id.clone(),
        });
    }

    fn check_cancelled(&self, token: &CancellationToken) -> Result<(), EngineError> {
        if token.is_cancelled() {
            Err(EngineError::cancelled("stage aborted by cancellation"))
        } else {
            Ok(())
        }
    }

    async fn with_cancel<T>(
        &self,
        token: &CancellationToken,
        fut: impl Future<Output = Result<T, EngineError>>,
    ) -> Result<T, EngineError> {
        tokio::select! {
            _ = token.cancelled() => Err(EngineError::cancelled("stage aborted by cancellation")),
            result = fut => result,
        }
    }
}

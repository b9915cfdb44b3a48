//! Shared data types for the Stratus distributed query engine.

#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use bytes::Bytes;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;
use stratus_time::Time;

pub mod error;

pub use error::{EngineError, ErrorKind};

/// Process-wide unique identifier of a query. Opaque string.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QueryId(Arc<str>);

impl QueryId {
    /// Wrap an externally supplied id.
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random id.
    pub fn new_random() -> Self {
        Self(uuid::Uuid::new_v4().to_string().into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for QueryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for QueryId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Opaque worker identifier. Uniqueness is enforced by the registry.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WorkerId(Arc<str>);

impl WorkerId {
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        Self(id.into())
    }

    /// The short random suffix used to disambiguate colliding registrations.
    pub fn short_suffix() -> String {
        let id = uuid::Uuid::new_v4().simple().to_string();
        id[..8].to_string()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for WorkerId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// `host:port` address a worker's RPC services listen on.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WorkerEndpoint(Arc<str>);

impl WorkerEndpoint {
    pub fn new(endpoint: impl Into<Arc<str>>) -> Self {
        Self(endpoint.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The endpoint as an http URI suitable for channel construction.
    pub fn http_uri(&self) -> String {
        if self.0.starts_with("http://") || self.0.starts_with("https://") {
            self.0.to_string()
        } else {
            format!("http://{}", self.0)
        }
    }
}

impl std::fmt::Display for WorkerEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for WorkerEndpoint {
    fn from(endpoint: &str) -> Self {
        Self::new(endpoint)
    }
}

/// Resource snapshot reported by a worker with every heartbeat.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WorkerResources {
    pub cpu_cores: u32,
    pub memory_mb: u64,
    pub disk_mb: u64,
    /// Number of queries with at least one assignment on this worker.
    pub active_queries: u32,
    /// CPU utilisation in `[0, 1]`.
    pub cpu_util: f64,
    /// Memory utilisation in `[0, 1]`.
    pub mem_util: f64,
}

impl WorkerResources {
    /// Clamp utilisation figures into `[0, 1]`.
    pub fn sanitized(mut self) -> Self {
        self.cpu_util = self.cpu_util.clamp(0., 1.);
        self.mem_util = self.mem_util.clamp(0., 1.);
        self
    }
}

impl Default for WorkerResources {
    fn default() -> Self {
        Self {
            cpu_cores: 0,
            memory_mb: 0,
            disk_mb: 0,
            active_queries: 0,
            cpu_util: 0.,
            mem_util: 0.,
        }
    }
}

/// Lifecycle status of a worker as tracked by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerStatus {
    /// Registered, no resource-carrying heartbeat seen yet.
    Starting,
    Healthy,
    /// Missed the liveness window; may come back.
    Unhealthy,
    /// Voluntary pre-removal: refuses new assignments, finishes in-flight work.
    Draining,
    /// Deregistered or reaped; terminal.
    Removed,
}

impl WorkerStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Removed)
    }

    /// Whether the worker may receive new stage assignments.
    pub fn accepts_assignments(&self) -> bool {
        matches!(self, Self::Healthy)
    }
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Starting => "starting",
            Self::Healthy => "healthy",
            Self::Unhealthy => "unhealthy",
            Self::Draining => "draining",
            Self::Removed => "removed",
        };
        f.write_str(s)
    }
}

/// Control-plane instruction piggybacked on a heartbeat acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerInstruction {
    Drain,
    Shutdown,
}

/// Heartbeat acknowledgement returned to the worker.
#[derive(Debug, Clone, Default)]
pub struct HeartbeatAck {
    pub instructions: Vec<WorkerInstruction>,
}

/// Everything the control plane knows about one worker.
#[derive(Debug, Clone)]
pub struct WorkerInfo {
    pub id: WorkerId,
    pub endpoint: WorkerEndpoint,
    pub status: WorkerStatus,
    pub resources: WorkerResources,
    pub last_heartbeat_at: Time,
    pub metadata: BTreeMap<String, String>,
}

/// The unit of distributed execution derived from a relational plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageType {
    Scan,
    Filter,
    Project,
    Aggregate,
    Join,
    Sort,
    Exchange,
    Final,
}

impl std::fmt::Display for StageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Scan => "scan",
            Self::Filter => "filter",
            Self::Project => "project",
            Self::Aggregate => "aggregate",
            Self::Join => "join",
            Self::Sort => "sort",
            Self::Exchange => "exchange",
            Self::Final => "final",
        };
        f.write_str(s)
    }
}

/// How a stage's output is split across downstream consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionScheme {
    /// One output partition (id 0).
    Single,
    /// Hash of the named columns modulo the partition count.
    Hash,
    /// Identical output delivered to every consumer.
    Broadcast,
}

/// Default hash partition fan-out when the plan does not specify one.
pub const DEFAULT_PARTITION_COUNT: u32 = 4;

/// Output partitioning of a stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partitioning {
    pub scheme: PartitionScheme,
    pub columns: Vec<String>,
    pub partition_count: u32,
}

impl Partitioning {
    pub fn single() -> Self {
        Self {
            scheme: PartitionScheme::Single,
            columns: vec![],
            partition_count: 1,
        }
    }

    pub fn hash(columns: Vec<String>, partition_count: u32) -> Self {
        Self {
            scheme: PartitionScheme::Hash,
            columns,
            partition_count: partition_count.max(1),
        }
    }

    pub fn broadcast() -> Self {
        Self {
            scheme: PartitionScheme::Broadcast,
            columns: vec![],
            partition_count: 1,
        }
    }
}

impl Default for Partitioning {
    fn default() -> Self {
        Self::single()
    }
}

/// One horizontal slice of input data. Opaque to the core; file references
/// are interpreted by the `TableSource` implementation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPartition {
    pub id: u64,
    pub file_refs: Vec<String>,
    pub est_rows: u64,
    pub est_bytes: u64,
}

/// A single stage of an execution plan.
#[derive(Debug, Clone)]
pub struct Stage {
    pub stage_id: u64,
    pub stage_type: StageType,
    /// Operator parameters, encoded by the external planner.
    pub serialized_plan: Bytes,
    pub input_partitions: Vec<DataPartition>,
    pub output_partitioning: Partitioning,
    pub depends_on: Vec<u64>,
}

/// A staged physical plan for one query. `depends_on` edges form a DAG with
/// a single terminal stage.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    pub query_id: QueryId,
    pub stages: Vec<Stage>,
}

impl ExecutionPlan {
    pub fn stage(&self, stage_id: u64) -> Option<&Stage> {
        self.stages.iter().find(|s| s.stage_id == stage_id)
    }
}

/// Query lifecycle status. `Completed`, `Failed` and `Cancelled` are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryStatus {
    Submitted,
    Planning,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl QueryStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for QueryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Submitted => "submitted",
            Self::Planning => "planning",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Lifecycle of one stage assignment on one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageStatus {
    Created,
    Dispatched,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl StageStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for StageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Dispatched => "dispatched",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Size and identity of one stored intermediate partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionInfo {
    pub partition_id: u64,
    pub rows: u64,
    pub bytes: u64,
}

/// Work counters attached to a progress update.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StageStats {
    pub rows_processed: u64,
    pub bytes_processed: u64,
    pub elapsed_ms: u64,
}

/// Progress report for one stage assignment, streamed worker -> coordinator.
#[derive(Debug, Clone)]
pub struct ProgressUpdate {
    pub query_id: QueryId,
    pub stage_id: u64,
    pub worker_id: WorkerId,
    pub status: StageStatus,
    /// Completion fraction in `[0, 1]`; monotone per (query, stage) as
    /// observed by the coordinator.
    pub percent: f64,
    pub stats: StageStats,
    pub trace_id: String,
}

/// Coordinator-visible state of one query.
#[derive(Debug, Clone)]
pub struct QueryState {
    pub query_id: QueryId,
    pub status: QueryStatus,
    pub submitted_at: Time,
    pub started_at: Option<Time>,
    pub completed_at: Option<Time>,
    pub error_msg: Option<String>,
    pub progress: f64,
    pub assignments: BTreeMap<u64, Vec<WorkerId>>,
    pub outputs: BTreeMap<u64, Vec<PartitionInfo>>,
}

impl QueryState {
    pub fn new(query_id: QueryId, submitted_at: Time) -> Self {
        Self {
            query_id,
            status: QueryStatus::Submitted,
            submitted_at,
            started_at: None,
            completed_at: None,
            error_msg: None,
            progress: 0.,
            assignments: BTreeMap::new(),
            outputs: BTreeMap::new(),
        }
    }
}

/// Aggregate registry counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub total: usize,
    pub healthy: usize,
    pub unhealthy: usize,
    pub draining: usize,
}

/// Cluster-wide load snapshot consumed by the autoscaler.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ClusterMetrics {
    pub total_workers: usize,
    pub healthy_workers: usize,
    pub total_active_queries: usize,
    pub avg_cpu_util: f64,
    pub avg_mem_util: f64,
    pub avg_queries_per_worker: f64,
}

/// Outcome of a completed chunk transfer, returned by the receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Ok,
    Error,
}

/// Receiver's summary of one partition transfer.
#[derive(Debug, Clone)]
pub struct TransferResult {
    pub status: TransferStatus,
    pub bytes: u64,
    pub rows: u64,
    pub chunks: u64,
    pub message: Option<String>,
}

/// Render a stage's dependency list for log output, e.g. `[1, 2]`.
pub fn format_depends_on(depends_on: &[u64]) -> String {
    let mut out = String::from("[");
    for (i, d) in depends_on.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        let _ = write!(out, "{}", d);
    }
    out.push(']');
    out
}

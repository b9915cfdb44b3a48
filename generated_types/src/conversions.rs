//! Conversions between protobuf and domain types.

use crate::stratus::{exchange, execution, management};
use data_types::{
    DataPartition, HeartbeatAck, PartitionInfo, PartitionScheme, Partitioning, ProgressUpdate,
    QueryId, Stage, StageStats, StageStatus, StageType, TransferResult, TransferStatus,
    WorkerEndpoint, WorkerId, WorkerInfo, WorkerInstruction, WorkerResources, WorkerStatus,
};
use std::collections::BTreeMap;
use stratus_time::Time;

/// A protobuf field that failed validation while crossing into the domain
/// model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldViolation {
    pub field: String,
    pub description: String,
}

impl FieldViolation {
    pub fn required(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            description: "field is required".to_string(),
        }
    }

    pub fn invalid(field: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            description: description.into(),
        }
    }
}

impl std::fmt::Display for FieldViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "violation in field \"{}\": {}", self.field, self.description)
    }
}

impl std::error::Error for FieldViolation {}

// ===== management =====

impl From<WorkerResources> for management::v1::WorkerResources {
    fn from(r: WorkerResources) -> Self {
        Self {
            cpu_cores: r.cpu_cores,
            memory_mb: r.memory_mb,
            disk_mb: r.disk_mb,
            active_queries: r.active_queries,
            cpu_util: r.cpu_util,
            mem_util: r.mem_util,
        }
    }
}

impl From<management::v1::WorkerResources> for WorkerResources {
    fn from(r: management::v1::WorkerResources) -> Self {
        Self {
            cpu_cores: r.cpu_cores,
            memory_mb: r.memory_mb,
            disk_mb: r.disk_mb,
            active_queries: r.active_queries,
            cpu_util: r.cpu_util,
            mem_util: r.mem_util,
        }
        .sanitized()
    }
}

impl From<WorkerStatus> for management::v1::WorkerStatus {
    fn from(s: WorkerStatus) -> Self {
        match s {
            WorkerStatus::Starting => Self::Starting,
            WorkerStatus::Healthy => Self::Healthy,
            WorkerStatus::Unhealthy => Self::Unhealthy,
            WorkerStatus::Draining => Self::Draining,
            WorkerStatus::Removed => Self::Removed,
        }
    }
}

impl TryFrom<management::v1::WorkerStatus> for WorkerStatus {
    type Error = FieldViolation;

    fn try_from(s: management::v1::WorkerStatus) -> Result<Self, Self::Error> {
        match s {
            management::v1::WorkerStatus::Unspecified => Err(FieldViolation::required("status")),
            management::v1::WorkerStatus::Starting => Ok(Self::Starting),
            management::v1::WorkerStatus::Healthy => Ok(Self::Healthy),
            management::v1::WorkerStatus::Unhealthy => Ok(Self::Unhealthy),
            management::v1::WorkerStatus::Draining => Ok(Self::Draining),
            management::v1::WorkerStatus::Removed => Ok(Self::Removed),
        }
    }
}

impl From<WorkerInstruction> for management::v1::WorkerInstruction {
    fn from(i: WorkerInstruction) -> Self {
        match i {
            WorkerInstruction::Drain => Self::Drain,
            WorkerInstruction::Shutdown => Self::Shutdown,
        }
    }
}

impl From<WorkerInfo> for management::v1::WorkerInfo {
    fn from(info: WorkerInfo) -> Self {
        Self {
            worker_id: info.id.to_string(),
            endpoint: info.endpoint.to_string(),
            status: management::v1::WorkerStatus::from(info.status) as i32,
            resources: Some(info.resources.into()),
            last_heartbeat_at_millis: info.last_heartbeat_at.timestamp_millis(),
            metadata: info.metadata.into_iter().collect(),
        }
    }
}

impl TryFrom<management::v1::WorkerInfo> for WorkerInfo {
    type Error = FieldViolation;

    fn try_from(info: management::v1::WorkerInfo) -> Result<Self, Self::Error> {
        let status = management::v1::WorkerStatus::from_i32(info.status)
            .ok_or_else(|| FieldViolation::invalid("status", "unknown enum value"))?
            .try_into()?;

        Ok(Self {
            id: WorkerId::new(info.worker_id),
            endpoint: WorkerEndpoint::new(info.endpoint),
            status,
            resources: info
                .resources
                .map(Into::into)
                .ok_or_else(|| FieldViolation::required("resources"))?,
            last_heartbeat_at: Time::from_timestamp_millis(info.last_heartbeat_at_millis),
            metadata: info.metadata.into_iter().collect::<BTreeMap<_, _>>(),
        })
    }
}

impl From<management::v1::HeartbeatResponse> for HeartbeatAck {
    fn from(resp: management::v1::HeartbeatResponse) -> Self {
        let instructions = resp
            .instructions
            .iter()
            .filter_map(|i| management::v1::WorkerInstruction::from_i32(*i))
            .filter_map(|i| match i {
                management::v1::WorkerInstruction::Unspecified => None,
                management::v1::WorkerInstruction::Drain => Some(WorkerInstruction::Drain),
                management::v1::WorkerInstruction::Shutdown => Some(WorkerInstruction::Shutdown),
            })
            .collect();
        Self { instructions }
    }
}

impl From<HeartbeatAck> for management::v1::HeartbeatResponse {
    fn from(ack: HeartbeatAck) -> Self {
        Self {
            ack: true,
            instructions: ack
                .instructions
                .into_iter()
                .map(|i| management::v1::WorkerInstruction::from(i) as i32)
                .collect(),
        }
    }
}

// ===== execution =====

impl From<StageType> for execution::v1::StageType {
    fn from(t: StageType) -> Self {
        match t {
            StageType::Scan => Self::Scan,
            StageType::Filter => Self::Filter,
            StageType::Project => Self::Project,
            StageType::Aggregate => Self::Aggregate,
            StageType::Join => Self::Join,
            StageType::Sort => Self::Sort,
            StageType::Exchange => Self::Exchange,
            StageType::Final => Self::Final,
        }
    }
}

impl TryFrom<execution::v1::StageType> for StageType {
    type Error = FieldViolation;

    fn try_from(t: execution::v1::StageType) -> Result<Self, Self::Error> {
        match t {
            execution::v1::StageType::Unspecified => Err(FieldViolation::required("stage_type")),
            execution::v1::StageType::Scan => Ok(Self::Scan),
            execution::v1::StageType::Filter => Ok(Self::Filter),
            execution::v1::StageType::Project => Ok(Self::Project),
            execution::v1::StageType::Aggregate => Ok(Self::Aggregate),
            execution::v1::StageType::Join => Ok(Self::Join),
            execution::v1::StageType::Sort => Ok(Self::Sort),
            execution::v1::StageType::Exchange => Ok(Self::Exchange),
            execution::v1::StageType::Final => Ok(Self::Final),
        }
    }
}

impl From<Partitioning> for execution::v1::Partitioning {
    fn from(p: Partitioning) -> Self {
        let scheme = match p.scheme {
            PartitionScheme::Single => execution::v1::PartitionScheme::Single,
            PartitionScheme::Hash => execution::v1::PartitionScheme::Hash,
            PartitionScheme::Broadcast => execution::v1::PartitionScheme::Broadcast,
        };
        Self {
            scheme: scheme as i32,
            columns: p.columns,
            partition_count: p.partition_count,
        }
    }
}

impl TryFrom<execution::v1::Partitioning> for Partitioning {
    type Error = FieldViolation;

    fn try_from(p: execution::v1::Partitioning) -> Result<Self, Self::Error> {
        let scheme = match execution::v1::PartitionScheme::from_i32(p.scheme)
            .ok_or_else(|| FieldViolation::invalid("scheme", "unknown enum value"))?
        {
            execution::v1::PartitionScheme::Unspecified => {
                return Err(FieldViolation::required("scheme"))
            }
            execution::v1::PartitionScheme::Single => PartitionScheme::Single,
            execution::v1::PartitionScheme::Hash => PartitionScheme::Hash,
            execution::v1::PartitionScheme::Broadcast => PartitionScheme::Broadcast,
        };
        Ok(Self {
            scheme,
            columns: p.columns,
            partition_count: p.partition_count.max(1),
        })
    }
}

impl From<DataPartition> for execution::v1::DataPartition {
    fn from(p: DataPartition) -> Self {
        Self {
            id: p.id,
            file_refs: p.file_refs,
            est_rows: p.est_rows,
            est_bytes: p.est_bytes,
        }
    }
}

impl From<execution::v1::DataPartition> for DataPartition {
    fn from(p: execution::v1::DataPartition) -> Self {
        Self {
            id: p.id,
            file_refs: p.file_refs,
            est_rows: p.est_rows,
            est_bytes: p.est_bytes,
        }
    }
}

impl From<Stage> for execution::v1::Stage {
    fn from(s: Stage) -> Self {
        Self {
            stage_id: s.stage_id,
            stage_type: execution::v1::StageType::from(s.stage_type) as i32,
            serialized_plan: s.serialized_plan.to_vec(),
            input_partitions: s.input_partitions.into_iter().map(Into::into).collect(),
            output_partitioning: Some(s.output_partitioning.into()),
            depends_on: s.depends_on,
        }
    }
}

impl TryFrom<execution::v1::Stage> for Stage {
    type Error = FieldViolation;

    fn try_from(s: execution::v1::Stage) -> Result<Self, Self::Error> {
        let stage_type = execution::v1::StageType::from_i32(s.stage_type)
            .ok_or_else(|| FieldViolation::invalid("stage_type", "unknown enum value"))?
            .try_into()?;

        Ok(Self {
            stage_id: s.stage_id,
            stage_type,
            serialized_plan: s.serialized_plan.into(),
            input_partitions: s.input_partitions.into_iter().map(Into::into).collect(),
            output_partitioning: s
                .output_partitioning
                .ok_or_else(|| FieldViolation::required("output_partitioning"))?
                .try_into()?,
            depends_on: s.depends_on,
        })
    }
}

impl From<StageStatus> for execution::v1::StageStatus {
    fn from(s: StageStatus) -> Self {
        match s {
            StageStatus::Created => Self::Created,
            StageStatus::Dispatched => Self::Dispatched,
            StageStatus::Running => Self::Running,
            StageStatus::Succeeded => Self::Succeeded,
            StageStatus::Failed => Self::Failed,
            StageStatus::Cancelled => Self::Cancelled,
        }
    }
}

impl TryFrom<execution::v1::StageStatus> for StageStatus {
    type Error = FieldViolation;

    fn try_from(s: execution::v1::StageStatus) -> Result<Self, Self::Error> {
        match s {
            execution::v1::StageStatus::Unspecified => Err(FieldViolation::required("status")),
            execution::v1::StageStatus::Created => Ok(Self::Created),
            execution::v1::StageStatus::Dispatched => Ok(Self::Dispatched),
            execution::v1::StageStatus::Running => Ok(Self::Running),
            execution::v1::StageStatus::Succeeded => Ok(Self::Succeeded),
            execution::v1::StageStatus::Failed => Ok(Self::Failed),
            execution::v1::StageStatus::Cancelled => Ok(Self::Cancelled),
        }
    }
}

impl From<StageStats> for execution::v1::StageStats {
    fn from(s: StageStats) -> Self {
        Self {
            rows_processed: s.rows_processed,
            bytes_processed: s.bytes_processed,
            elapsed_ms: s.elapsed_ms,
        }
    }
}

impl From<execution::v1::StageStats> for StageStats {
    fn from(s: execution::v1::StageStats) -> Self {
        Self {
            rows_processed: s.rows_processed,
            bytes_processed: s.bytes_processed,
            elapsed_ms: s.elapsed_ms,
        }
    }
}

impl From<PartitionInfo> for execution::v1::PartitionInfo {
    fn from(p: PartitionInfo) -> Self {
        Self {
            partition_id: p.partition_id,
            rows: p.rows,
            bytes: p.bytes,
        }
    }
}

impl From<execution::v1::PartitionInfo> for PartitionInfo {
    fn from(p: execution::v1::PartitionInfo) -> Self {
        Self {
            partition_id: p.partition_id,
            rows: p.rows,
            bytes: p.bytes,
        }
    }
}

impl From<ProgressUpdate> for execution::v1::ProgressUpdate {
    fn from(p: ProgressUpdate) -> Self {
        Self {
            query_id: p.query_id.to_string(),
            stage_id: p.stage_id,
            worker_id: p.worker_id.to_string(),
            status: execution::v1::StageStatus::from(p.status) as i32,
            percent: p.percent,
            stats: Some(p.stats.into()),
            trace_id: p.trace_id,
        }
    }
}

impl TryFrom<execution::v1::ProgressUpdate> for ProgressUpdate {
    type Error = FieldViolation;

    fn try_from(p: execution::v1::ProgressUpdate) -> Result<Self, Self::Error> {
        let status = execution::v1::StageStatus::from_i32(p.status)
            .ok_or_else(|| FieldViolation::invalid("status", "unknown enum value"))?
            .try_into()?;

        Ok(Self {
            query_id: QueryId::new(p.query_id),
            stage_id: p.stage_id,
            worker_id: WorkerId::new(p.worker_id),
            status,
            percent: p.percent.clamp(0., 1.),
            stats: p.stats.map(Into::into).unwrap_or_default(),
            trace_id: p.trace_id,
        })
    }
}

// ===== exchange =====

impl From<PartitionInfo> for exchange::v1::PartitionInfo {
    fn from(p: PartitionInfo) -> Self {
        Self {
            partition_id: p.partition_id,
            rows: p.rows,
            bytes: p.bytes,
        }
    }
}

impl From<exchange::v1::PartitionInfo> for PartitionInfo {
    fn from(p: exchange::v1::PartitionInfo) -> Self {
        Self {
            partition_id: p.partition_id,
            rows: p.rows,
            bytes: p.bytes,
        }
    }
}

impl From<TransferResult> for exchange::v1::TransferResult {
    fn from(r: TransferResult) -> Self {
        let status = match r.status {
            TransferStatus::Ok => exchange::v1::TransferStatus::Ok,
            TransferStatus::Error => exchange::v1::TransferStatus::Error,
        };
        Self {
            status: status as i32,
            bytes: r.bytes,
            rows: r.rows,
            chunks: r.chunks,
            message: r.message.unwrap_or_default(),
            transfer_id: String::new(),
        }
    }
}

impl TryFrom<exchange::v1::TransferResult> for TransferResult {
    type Error = FieldViolation;

    fn try_from(r: exchange::v1::TransferResult) -> Result<Self, Self::Error> {
        let status = match exchange::v1::TransferStatus::from_i32(r.status)
            .ok_or_else(|| FieldViolation::invalid("status", "unknown enum value"))?
        {
            exchange::v1::TransferStatus::Unspecified => {
                return Err(FieldViolation::required("status"))
            }
            exchange::v1::TransferStatus::Ok => TransferStatus::Ok,
            exchange::v1::TransferStatus::Error => TransferStatus::Error,
        };
        Ok(Self {
            status,
            bytes: r.bytes,
            rows: r.rows,
            chunks: r.chunks,
            message: (!r.message.is_empty()).then(|| r.message),
        })
    }
}

//! Registration and heartbeating towards the control plane.

use crate::tracker::QueryTracker;
use backoff::BackoffConfig;
use client_util::connection::Builder;
use data_types::{
    EngineError, HeartbeatAck, WorkerEndpoint, WorkerId, WorkerInstruction, WorkerResources,
};
use generated_types::engine_error_from_status;
use generated_types::stratus::management::v1::{
    worker_management_service_client::WorkerManagementServiceClient, HeartbeatRequest,
    RegisterWorkerRequest,
};
use observability_deps::tracing::{info, warn};
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tonic::Request;

/// Live resource usage of this worker process, minus the engine-owned
/// `active_queries` counter. Host metrics collection is outside the engine;
/// embedders plug in whatever sampling they have.
pub trait ResourceMonitor: Send + Sync + Debug + 'static {
    fn snapshot(&self) -> WorkerResources;
}

/// Fixed resources, for tests and development.
#[derive(Debug, Clone, Copy)]
pub struct StaticResourceMonitor {
    resources: WorkerResources,
}

impl StaticResourceMonitor {
    pub fn new(resources: WorkerResources) -> Self {
        Self { resources }
    }
}

impl ResourceMonitor for StaticResourceMonitor {
    fn snapshot(&self) -> WorkerResources {
        self.resources
    }
}

/// Heartbeat cadence and per-RPC deadline.
#[derive(Debug, Clone, Copy)]
pub struct HeartbeatConfig {
    pub interval: Duration,
    pub rpc_timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            rpc_timeout: Duration::from_secs(5),
        }
    }
}

/// Register this worker, returning the id the registry actually assigned
/// (the requested id may come back suffixed).
pub async fn register_with_control_plane(
    control_plane: &WorkerEndpoint,
    requested_id: &str,
    endpoint: &WorkerEndpoint,
    resources: WorkerResources,
    metadata: BTreeMap<String, String>,
    rpc_timeout: Duration,
) -> Result<WorkerId, EngineError> {
    let connection = Builder::new()
        .timeout(rpc_timeout)
        .build(control_plane.http_uri())
        .await
        .map_err(|e| EngineError::unavailable(e.to_string()))?;
    let mut client = WorkerManagementServiceClient::new(connection);

    let response = client
        .register_worker(Request::new(RegisterWorkerRequest {
            requested_id: requested_id.to_string(),
            endpoint: endpoint.to_string(),
            resources: Some(resources.into()),
            metadata: metadata.into_iter().collect(),
            trace_id: String::new(),
        }))
        .await
        .map_err(engine_error_from_status)?
        .into_inner();

    let assigned = WorkerId::new(response.assigned_id);
    info!(worker_id=%assigned, endpoint=%endpoint, "registered with control plane");
    Ok(assigned)
}

/// Periodic heartbeat loop.
///
/// Failed heartbeats are logged and retried on the next tick; the registry's
/// liveness sweeper decides when silence becomes UNHEALTHY. Control-plane
/// instructions piggybacked on the acknowledgement are applied here: DRAIN
/// flips the tracker into draining mode, SHUTDOWN additionally trips the
/// process shutdown token. The loop runs under a watchdog: a panic restarts
/// it with backoff rather than leaving the worker silently lapsing.
#[derive(Debug)]
pub struct HeartbeatTask {
    control_plane: WorkerEndpoint,
    worker_id: WorkerId,
    monitor: Arc<dyn ResourceMonitor>,
    tracker: Arc<QueryTracker>,
    config: HeartbeatConfig,
    shutdown: CancellationToken,
}

impl HeartbeatTask {
    pub fn new(
        control_plane: WorkerEndpoint,
        worker_id: WorkerId,
        monitor: Arc<dyn ResourceMonitor>,
        tracker: Arc<QueryTracker>,
        config: HeartbeatConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            control_plane,
            worker_id,
            monitor,
            tracker,
            config,
            shutdown,
        }
    }

    pub async fn run(self) {
        let task = Arc::new(self);
        backoff::supervise("heartbeat", &BackoffConfig::default(), move || {
            let task = Arc::clone(&task);
            async move { task.heartbeat_loop().await }
        })
        .await;
    }

    async fn heartbeat_loop(&self) {
        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!(worker_id=%self.worker_id, "heartbeat task stopping");
                    return;
                }
                _ = interval.tick() => {}
            }

            match self.beat().await {
                Ok(ack) => self.apply_instructions(&ack),
                Err(e) => {
                    warn!(worker_id=%self.worker_id, error=%e, "heartbeat failed");
                }
            }
        }
    }

    /// Send one heartbeat and return the acknowledgement.
    pub async fn beat(&self) -> Result<HeartbeatAck, EngineError> {
        let mut resources = self.monitor.snapshot().sanitized();
        resources.active_queries = self.tracker.active_queries();

        let connection = Builder::new()
            .timeout(self.config.rpc_timeout)
            .build(self.control_plane.http_uri())
            .await
            .map_err(|e| EngineError::unavailable(e.to_string()))?;
        let mut client = WorkerManagementServiceClient::new(connection);

        let response = client
            .heartbeat(Request::new(HeartbeatRequest {
                worker_id: self.worker_id.to_string(),
                resources: Some(resources.into()),
                status_metadata: Default::default(),
                trace_id: String::new(),
            }))
            .await
            .map_err(engine_error_from_status)?
            .into_inner();

        Ok(response.into())
    }

    fn apply_instructions(&self, ack: &HeartbeatAck) {
        for instruction in &ack.instructions {
            match instruction {
                WorkerInstruction::Drain => {
                    info!(worker_id=%self.worker_id, "control plane requested drain");
                    self.tracker.set_draining();
                }
                WorkerInstruction::Shutdown => {
                    info!(worker_id=%self.worker_id, "control plane requested shutdown");
                    self.tracker.set_draining();
                    self.shutdown.cancel();
                }
            }
        }
    }
}

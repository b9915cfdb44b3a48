//! The worker management RPC service.

use crate::registry::WorkerRegistry;
use data_types::{WorkerEndpoint, WorkerId};
use generated_types::status_from_engine_error;
use generated_types::stratus::management::v1::{
    worker_management_service_server::WorkerManagementService, DeregisterWorkerRequest,
    DeregisterWorkerResponse, HeartbeatRequest, HeartbeatResponse, RegisterWorkerRequest,
    RegisterWorkerResponse,
};
use observability_deps::tracing::debug;
use std::sync::Arc;
use tonic::{Request, Response, Status};

/// Callback invoked with the endpoint of every deregistered worker so
/// pooled channels can be evicted; a worker must not be kept alive by its
/// channel.
pub type EndpointEvictor = Arc<dyn Fn(&WorkerEndpoint) + Send + Sync>;

/// tonic server for `RegisterWorker`, `DeregisterWorker` and `Heartbeat`.
pub struct ManagementRpcService {
    registry: Arc<WorkerRegistry>,
    evictor: Option<EndpointEvictor>,
}

impl std::fmt::Debug for ManagementRpcService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagementRpcService")
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl ManagementRpcService {
    pub fn new(registry: Arc<WorkerRegistry>) -> Self {
        Self {
            registry,
            evictor: None,
        }
    }

    /// Attach an endpoint evictor (typically the exchange connection pool).
    pub fn with_evictor(registry: Arc<WorkerRegistry>, evictor: EndpointEvictor) -> Self {
        Self {
            registry,
            evictor: Some(evictor),
        }
    }
}

#[tonic::async_trait]
impl WorkerManagementService for ManagementRpcService {
    async fn register_worker(
        &self,
        request: Request<RegisterWorkerRequest>,
    ) -> Result<Response<RegisterWorkerResponse>, Status> {
        let req = request.into_inner();
        let resources = req
            .resources
            .map(Into::into)
            .ok_or_else(|| Status::invalid_argument("missing resources"))?;

        let assigned = self.registry.register(
            &req.requested_id,
            WorkerEndpoint::new(req.endpoint),
            resources,
            req.metadata.into_iter().collect(),
        );

        Ok(Response::new(RegisterWorkerResponse {
            assigned_id: assigned.to_string(),
        }))
    }

    async fn deregister_worker(
        &self,
        request: Request<DeregisterWorkerRequest>,
    ) -> Result<Response<DeregisterWorkerResponse>, Status> {
        let req = request.into_inner();
        let endpoint = self
            .registry
            .deregister(&WorkerId::new(req.worker_id), &req.reason)
            .map_err(|e| status_from_engine_error(&e))?;

        if let Some(evictor) = &self.evictor {
            evictor(&endpoint);
        }

        Ok(Response::new(DeregisterWorkerResponse {}))
    }

    async fn heartbeat(
        &self,
        request: Request<HeartbeatRequest>,
    ) -> Result<Response<HeartbeatResponse>, Status> {
        let req = request.into_inner();
        let worker_id = WorkerId::new(req.worker_id);
        let resources = req
            .resources
            .map(Into::into)
            .ok_or_else(|| Status::invalid_argument("missing resources"))?;

        debug!(worker_id=%worker_id, trace_id=%req.trace_id, "heartbeat");
        let ack = self
            .registry
            .heartbeat(&worker_id, resources)
            .map_err(|e| status_from_engine_error(&e))?;

        Ok(Response::new(ack.into()))
    }
}

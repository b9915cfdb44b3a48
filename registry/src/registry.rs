//! The worker registry proper.

use data_types::{
    ClusterMetrics, EngineError, HeartbeatAck, RegistryStats, WorkerEndpoint, WorkerId,
    WorkerInfo, WorkerInstruction, WorkerResources, WorkerStatus,
};
use observability_deps::tracing::{info, warn};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use stratus_time::TimeProvider;

/// Liveness windows for the sweeper.
#[derive(Debug, Clone, Copy)]
pub struct RegistryConfig {
    /// A healthy worker silent for longer than this turns UNHEALTHY.
    pub unhealthy_after: Duration,
    /// A worker silent for longer than this is reaped.
    pub remove_after: Duration,
    /// Sweeper cadence.
    pub sweep_interval: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            unhealthy_after: Duration::from_secs(45),
            remove_after: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(10),
        }
    }
}

#[derive(Debug)]
struct WorkerEntry {
    info: WorkerInfo,
    /// Instructions delivered with the next heartbeat acknowledgement.
    pending_instructions: Vec<WorkerInstruction>,
}

/// Tracks every worker known to the control plane.
///
/// Status transitions are serialized per worker through the single write
/// lock; readers get consistent snapshots. The registry is the only
/// mutator of worker status.
#[derive(Debug)]
pub struct WorkerRegistry {
    workers: RwLock<BTreeMap<WorkerId, WorkerEntry>>,
    config: RegistryConfig,
    time_provider: Arc<dyn TimeProvider>,
}

impl WorkerRegistry {
    pub fn new(config: RegistryConfig, time_provider: Arc<dyn TimeProvider>) -> Self {
        Self {
            workers: RwLock::new(BTreeMap::new()),
            config,
            time_provider,
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Register a worker under `requested_id`, suffixing the id if it is
    /// already taken. The worker starts in STARTING until its first
    /// heartbeat carries resources.
    pub fn register(
        &self,
        requested_id: &str,
        endpoint: WorkerEndpoint,
        resources: WorkerResources,
        metadata: BTreeMap<String, String>,
    ) -> WorkerId {
        let mut workers = self.workers.write();

        let requested_id = if requested_id.is_empty() {
            format!("worker-{}", WorkerId::short_suffix())
        } else {
            requested_id.to_string()
        };

        let mut id = WorkerId::new(requested_id.as_str());
        while workers.contains_key(&id) {
            id = WorkerId::new(format!("{}-{}", requested_id, WorkerId::short_suffix()));
        }

        let info = WorkerInfo {
            id: id.clone(),
            endpoint,
            status: WorkerStatus::Starting,
            resources: resources.sanitized(),
            last_heartbeat_at: self.time_provider.now(),
            metadata,
        };
        info!(worker_id=%id, endpoint=%info.endpoint, "worker registered");
        workers.insert(
            id.clone(),
            WorkerEntry {
                info,
                pending_instructions: vec![],
            },
        );
        id
    }

    /// Record a heartbeat, promoting the worker to HEALTHY and returning
    /// any pending control-plane instructions.
    pub fn heartbeat(
        &self,
        id: &WorkerId,
        resources: WorkerResources,
    ) -> Result<HeartbeatAck, EngineError> {
        let mut workers = self.workers.write();
        let entry = workers.get_mut(id).ok_or_else(|| {
            EngineError::not_found(format!("worker {} is not registered", id))
                .scope_worker(id.clone())
        })?;

        if entry.info.status == WorkerStatus::Removed {
            return Err(
                EngineError::not_found(format!("worker {} was removed", id))
                    .scope_worker(id.clone()),
            );
        }

        entry.info.resources = resources.sanitized();
        entry.info.last_heartbeat_at = self.time_provider.now();

        match entry.info.status {
            WorkerStatus::Starting | WorkerStatus::Unhealthy => {
                info!(worker_id=%id, from=%entry.info.status, "worker is now healthy");
                entry.info.status = WorkerStatus::Healthy;
            }
            WorkerStatus::Healthy | WorkerStatus::Draining => {}
            WorkerStatus::Removed => unreachable!("checked above"),
        }

        Ok(HeartbeatAck {
            instructions: std::mem::take(&mut entry.pending_instructions),
        })
    }

    /// Remove a worker. Returns its endpoint so the caller can evict any
    /// pooled channels.
    pub fn deregister(&self, id: &WorkerId, reason: &str) -> Result<WorkerEndpoint, EngineError> {
        let mut workers = self.workers.write();
        let entry = workers.get_mut(id).ok_or_else(|| {
            EngineError::not_found(format!("worker {} is not registered", id))
                .scope_worker(id.clone())
        })?;

        info!(worker_id=%id, reason, "worker deregistered");
        entry.info.status = WorkerStatus::Removed;
        Ok(entry.info.endpoint.clone())
    }

    /// Ask a worker to drain: it refuses new assignments and finishes
    /// in-flight stages. Delivered with its next heartbeat.
    pub fn drain(&self, id: &WorkerId) -> Result<(), EngineError> {
        self.instruct(id, WorkerInstruction::Drain, WorkerStatus::Draining)
    }

    /// Ask a worker to shut down after draining.
    pub fn request_shutdown(&self, id: &WorkerId) -> Result<(), EngineError> {
        self.instruct(id, WorkerInstruction::Shutdown, WorkerStatus::Draining)
    }

    fn instruct(
        &self,
        id: &WorkerId,
        instruction: WorkerInstruction,
        status: WorkerStatus,
    ) -> Result<(), EngineError> {
        let mut workers = self.workers.write();
        let entry = workers.get_mut(id).ok_or_else(|| {
            EngineError::not_found(format!("worker {} is not registered", id))
                .scope_worker(id.clone())
        })?;
        if entry.info.status == WorkerStatus::Removed {
            return Err(EngineError::not_found(format!("worker {} was removed", id)));
        }
        info!(worker_id=%id, ?instruction, "queueing worker instruction");
        entry.pending_instructions.push(instruction);
        entry.info.status = status;
        Ok(())
    }

    pub fn get(&self, id: &WorkerId) -> Option<WorkerInfo> {
        self.workers.read().get(id).map(|e| e.info.clone())
    }

    pub fn list(&self, status_filter: Option<WorkerStatus>) -> Vec<WorkerInfo> {
        self.workers
            .read()
            .values()
            .filter(|e| status_filter.map_or(true, |s| e.info.status == s))
            .map(|e| e.info.clone())
            .collect()
    }

    pub fn healthy(&self) -> Vec<WorkerInfo> {
        self.list(Some(WorkerStatus::Healthy))
    }

    pub fn stats(&self) -> RegistryStats {
        let workers = self.workers.read();
        let mut stats = RegistryStats {
            total: 0,
            ..Default::default()
        };
        for entry in workers.values() {
            match entry.info.status {
                WorkerStatus::Removed => continue,
                WorkerStatus::Healthy => stats.healthy += 1,
                WorkerStatus::Unhealthy => stats.unhealthy += 1,
                WorkerStatus::Draining => stats.draining += 1,
                WorkerStatus::Starting => {}
            }
            stats.total += 1;
        }
        stats
    }

    /// Apply liveness transitions; called by the sweeper. Returns the
    /// transitions performed.
    pub fn sweep(&self) -> Vec<(WorkerId, WorkerStatus)> {
        let now = self.time_provider.now();
        let mut transitions = Vec::new();
        let mut workers = self.workers.write();

        for (id, entry) in workers.iter_mut() {
            if entry.info.status == WorkerStatus::Removed {
                continue;
            }
            let silent_for = now
                .checked_duration_since(entry.info.last_heartbeat_at)
                .unwrap_or_default();

            if silent_for > self.config.remove_after {
                warn!(
                    worker_id=%id,
                    silent_secs=silent_for.as_secs(),
                    "worker silent past removal window, reaping",
                );
                entry.info.status = WorkerStatus::Removed;
                transitions.push((id.clone(), WorkerStatus::Removed));
            } else if silent_for > self.config.unhealthy_after
                && entry.info.status != WorkerStatus::Unhealthy
            {
                warn!(
                    worker_id=%id,
                    silent_secs=silent_for.as_secs(),
                    "worker missed liveness window",
                );
                entry.info.status = WorkerStatus::Unhealthy;
                transitions.push((id.clone(), WorkerStatus::Unhealthy));
            }
        }

        transitions
    }

    /// The `n` healthy workers with the fewest active queries, ties broken
    /// by oldest heartbeat.
    pub fn pick_least_loaded(&self, n: usize) -> Vec<WorkerInfo> {
        let mut candidates = self.healthy();
        candidates.sort_by(|a, b| {
            a.resources
                .active_queries
                .cmp(&b.resources.active_queries)
                .then(a.last_heartbeat_at.cmp(&b.last_heartbeat_at))
        });
        candidates.truncate(n);
        candidates
    }

    /// Up to `n` healthy workers whose metadata carries `key=value`.
    pub fn pick_by_tag(&self, key: &str, value: &str, n: usize) -> Vec<WorkerInfo> {
        let mut matches: Vec<WorkerInfo> = self
            .healthy()
            .into_iter()
            .filter(|w| w.metadata.get(key).map(String::as_str) == Some(value))
            .collect();
        matches.truncate(n);
        matches
    }

    /// Aggregate load over healthy workers; `total_active_queries` comes
    /// from the coordinator's admission bookkeeping.
    pub fn cluster_metrics(&self, total_active_queries: usize) -> ClusterMetrics {
        let workers = self.workers.read();
        let alive: Vec<&WorkerInfo> = workers
            .values()
            .map(|e| &e.info)
            .filter(|w| w.status != WorkerStatus::Removed)
            .collect();
        let healthy: Vec<&&WorkerInfo> = alive
            .iter()
            .filter(|w| w.status == WorkerStatus::Healthy)
            .collect();

        let healthy_workers = healthy.len();
        let (mut cpu, mut mem, mut queries) = (0., 0., 0u64);
        for w in &healthy {
            cpu += w.resources.cpu_util;
            mem += w.resources.mem_util;
            queries += w.resources.active_queries as u64;
        }
        let denominator = healthy_workers.max(1) as f64;

        ClusterMetrics {
            total_workers: alive.len(),
            healthy_workers,
            total_active_queries,
            avg_cpu_util: cpu / denominator,
            avg_mem_util: mem / denominator,
            avg_queries_per_worker: queries as f64 / denominator,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stratus_time::{MockProvider, Time};

    fn fixture() -> (Arc<MockProvider>, WorkerRegistry) {
        let clock = Arc::new(MockProvider::new(Time::from_timestamp_millis(0)));
        let registry = WorkerRegistry::new(
            RegistryConfig::default(),
            Arc::clone(&clock) as Arc<dyn TimeProvider>,
        );
        (clock, registry)
    }

    fn resources(active_queries: u32, cpu_util: f64) -> WorkerResources {
        WorkerResources {
            cpu_cores: 4,
            memory_mb: 8192,
            disk_mb: 10_000,
            active_queries,
            cpu_util,
            mem_util: cpu_util,
        }
    }

    fn register(registry: &WorkerRegistry, id: &str) -> WorkerId {
        registry.register(
            id,
            WorkerEndpoint::new(format!("{}:8082", id)),
            resources(0, 0.),
            BTreeMap::new(),
        )
    }

    #[test]
    fn registration_starts_in_starting() {
        let (_clock, registry) = fixture();
        let id = register(&registry, "w-1");

        let info = registry.get(&id).unwrap();
        assert_eq!(info.status, WorkerStatus::Starting);
        assert_eq!(registry.stats().total, 1);
        assert_eq!(registry.stats().healthy, 0);
    }

    #[test]
    fn duplicate_ids_are_suffixed() {
        let (_clock, registry) = fixture();
        let first = register(&registry, "w-1");
        let second = register(&registry, "w-1");

        assert_eq!(first.as_str(), "w-1");
        assert_ne!(second, first);
        assert!(second.as_str().starts_with("w-1-"));
        assert_eq!(registry.list(None).len(), 2);
    }

    #[test]
    fn empty_requested_id_gets_generated() {
        let (_clock, registry) = fixture();
        let id = register(&registry, "");
        assert!(id.as_str().starts_with("worker-"));
    }

    #[test]
    fn heartbeat_promotes_to_healthy() {
        let (_clock, registry) = fixture();
        let id = register(&registry, "w-1");

        registry.heartbeat(&id, resources(2, 0.5)).unwrap();
        let info = registry.get(&id).unwrap();
        assert_eq!(info.status, WorkerStatus::Healthy);
        assert_eq!(info.resources.active_queries, 2);
    }

    #[test]
    fn heartbeat_for_unknown_worker_is_not_found() {
        let (_clock, registry) = fixture();
        let err = registry
            .heartbeat(&WorkerId::new("ghost"), resources(0, 0.))
            .unwrap_err();
        assert_eq!(err.kind(), data_types::ErrorKind::NotFound);
    }

    #[test]
    fn liveness_transitions() {
        let (clock, registry) = fixture();
        let id = register(&registry, "w-1");
        registry.heartbeat(&id, resources(0, 0.1)).unwrap();

        // within the window: nothing happens
        clock.inc(Duration::from_secs(30));
        assert!(registry.sweep().is_empty());
        assert_eq!(registry.get(&id).unwrap().status, WorkerStatus::Healthy);

        // past unhealthy_after
        clock.inc(Duration::from_secs(30));
        let transitions = registry.sweep();
        assert_eq!(transitions, vec![(id.clone(), WorkerStatus::Unhealthy)]);

        // a heartbeat brings it back
        registry.heartbeat(&id, resources(0, 0.1)).unwrap();
        assert_eq!(registry.get(&id).unwrap().status, WorkerStatus::Healthy);

        // silent past remove_after: reaped
        clock.inc(Duration::from_secs(301));
        let transitions = registry.sweep();
        assert_eq!(transitions, vec![(id.clone(), WorkerStatus::Removed)]);

        // removed workers must re-register
        let err = registry.heartbeat(&id, resources(0, 0.1)).unwrap_err();
        assert_eq!(err.kind(), data_types::ErrorKind::NotFound);
    }

    #[test]
    fn drain_queues_an_instruction_for_the_next_heartbeat() {
        let (_clock, registry) = fixture();
        let id = register(&registry, "w-1");
        registry.heartbeat(&id, resources(1, 0.1)).unwrap();

        registry.drain(&id).unwrap();
        assert_eq!(registry.get(&id).unwrap().status, WorkerStatus::Draining);

        let ack = registry.heartbeat(&id, resources(1, 0.1)).unwrap();
        assert_eq!(ack.instructions, vec![WorkerInstruction::Drain]);
        // draining survives the heartbeat
        assert_eq!(registry.get(&id).unwrap().status, WorkerStatus::Draining);

        // instructions are delivered exactly once
        let ack = registry.heartbeat(&id, resources(1, 0.1)).unwrap();
        assert!(ack.instructions.is_empty());
    }

    #[test]
    fn deregister_is_terminal_and_returns_endpoint() {
        let (_clock, registry) = fixture();
        let id = register(&registry, "w-1");

        let endpoint = registry.deregister(&id, "scale down").unwrap();
        assert_eq!(endpoint.as_str(), "w-1:8082");
        assert_eq!(registry.get(&id).unwrap().status, WorkerStatus::Removed);
        assert_eq!(registry.stats().total, 0);

        let err = registry.heartbeat(&id, resources(0, 0.)).unwrap_err();
        assert_eq!(err.kind(), data_types::ErrorKind::NotFound);
    }

    #[test]
    fn pick_least_loaded_orders_by_load_then_age() {
        let (clock, registry) = fixture();

        let busy = register(&registry, "busy");
        registry.heartbeat(&busy, resources(5, 0.9)).unwrap();

        clock.inc(Duration::from_secs(1));
        let idle_old = register(&registry, "idle-old");
        registry.heartbeat(&idle_old, resources(0, 0.1)).unwrap();

        clock.inc(Duration::from_secs(1));
        let idle_new = register(&registry, "idle-new");
        registry.heartbeat(&idle_new, resources(0, 0.1)).unwrap();

        let picked = registry.pick_least_loaded(2);
        assert_eq!(picked.len(), 2);
        assert_eq!(picked[0].id, idle_old);
        assert_eq!(picked[1].id, idle_new);

        // unhealthy workers are never placed
        let all = registry.pick_least_loaded(10);
        assert_eq!(all.len(), 3);
        assert_eq!(all[2].id, busy);
    }

    #[test]
    fn pick_by_tag_filters_metadata() {
        let (_clock, registry) = fixture();
        let id = registry.register(
            "tagged",
            WorkerEndpoint::new("tagged:8082"),
            resources(0, 0.),
            [("zone".to_string(), "eu-1".to_string())].into_iter().collect(),
        );
        registry.heartbeat(&id, resources(0, 0.)).unwrap();
        let other = register(&registry, "untagged");
        registry.heartbeat(&other, resources(0, 0.)).unwrap();

        let picked = registry.pick_by_tag("zone", "eu-1", 5);
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].id, id);
    }

    #[test]
    fn cluster_metrics_average_over_healthy() {
        let (_clock, registry) = fixture();
        let a = register(&registry, "a");
        registry.heartbeat(&a, resources(2, 0.4)).unwrap();
        let b = register(&registry, "b");
        registry.heartbeat(&b, resources(4, 0.8)).unwrap();
        // still starting, not part of the averages
        register(&registry, "c");

        let metrics = registry.cluster_metrics(3);
        assert_eq!(metrics.total_workers, 3);
        assert_eq!(metrics.healthy_workers, 2);
        assert_eq!(metrics.total_active_queries, 3);
        assert!((metrics.avg_cpu_util - 0.6).abs() < 1e-9);
        assert!((metrics.avg_queries_per_worker - 3.).abs() < 1e-9);
    }
}

//! Periodic liveness sweeping.

use crate::registry::WorkerRegistry;
use backoff::BackoffConfig;
use observability_deps::tracing::{debug, info};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Drives [`WorkerRegistry::sweep`] on the configured interval until shut
/// down. The loop runs under a watchdog: a panicking sweep is restarted
/// with backoff instead of silently ending liveness tracking.
#[derive(Debug)]
pub struct LivenessSweeper {
    registry: Arc<WorkerRegistry>,
}

impl LivenessSweeper {
    pub fn new(registry: Arc<WorkerRegistry>) -> Self {
        Self { registry }
    }

    pub async fn run(self, shutdown: CancellationToken) {
        let registry = self.registry;
        backoff::supervise("liveness_sweeper", &BackoffConfig::default(), move || {
            let registry = Arc::clone(&registry);
            let shutdown = shutdown.clone();
            async move { sweep_loop(registry, shutdown).await }
        })
        .await;
    }
}

async fn sweep_loop(registry: Arc<WorkerRegistry>, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(registry.config().sweep_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("liveness sweeper stopping");
                return;
            }
            _ = interval.tick() => {}
        }

        let transitions = registry.sweep();
        if !transitions.is_empty() {
            debug!(transitions = transitions.len(), "liveness sweep applied transitions");
        }
    }
}

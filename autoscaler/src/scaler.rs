//! The scaling loop around the pure policy.

use crate::policy::{evaluate, AutoscalerConfig, Decision};
use async_trait::async_trait;
use backoff::BackoffConfig;
use data_types::{EngineError, WorkerId, WorkerStatus};
use observability_deps::tracing::{info, warn};
use registry::WorkerRegistry;
use std::fmt::Debug;
use std::sync::Arc;
use stratus_time::{Time, TimeProvider};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Process/container lifecycle boundary. The launcher spawns a worker that
/// registers itself under the hinted id and terminates workers on request.
#[async_trait]
pub trait WorkerLauncher: Send + Sync + Debug + 'static {
    async fn launch(&self, id_hint: &str) -> Result<LaunchedWorker, EngineError>;
    async fn terminate(&self, worker_id: &WorkerId) -> Result<(), EngineError>;
}

/// Handle for a spawned worker process.
#[derive(Debug, Clone)]
pub struct LaunchedWorker {
    pub worker_id: WorkerId,
}

/// Source of the control plane's own query load (the coordinator).
pub trait QueryLoad: Send + Sync + Debug + 'static {
    fn running_queries(&self) -> usize;
}

/// What one evaluation tick actually did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AutoscaleOutcome {
    ScaledUp(WorkerId),
    ScaledDown(WorkerId),
    /// Policy wanted to act but the launcher failed; no cooldown consumed.
    LaunchFailed(String),
    Cooldown,
    NoAction,
}

#[derive(Debug)]
struct PendingLaunch {
    worker_id: WorkerId,
    launched_at: Time,
}

#[derive(Debug, Default)]
struct ScalerState {
    last_action_at: Option<Time>,
    pending: Vec<PendingLaunch>,
}

/// Periodic scaling evaluator.
///
/// The state mutex serializes evaluation with any in-flight scale action,
/// so two ticks can never race a launch.
#[derive(Debug)]
pub struct Autoscaler {
    registry: Arc<WorkerRegistry>,
    launcher: Arc<dyn WorkerLauncher>,
    load: Arc<dyn QueryLoad>,
    config: AutoscalerConfig,
    time_provider: Arc<dyn TimeProvider>,
    state: Mutex<ScalerState>,
}

impl Autoscaler {
    pub fn new(
        registry: Arc<WorkerRegistry>,
        launcher: Arc<dyn WorkerLauncher>,
        load: Arc<dyn QueryLoad>,
        config: AutoscalerConfig,
        time_provider: Arc<dyn TimeProvider>,
    ) -> Self {
        Self {
            registry,
            launcher,
            load,
            config,
            time_provider,
            state: Mutex::new(ScalerState::default()),
        }
    }

    pub fn config(&self) -> &AutoscalerConfig {
        &self.config
    }

    /// Launch workers until the healthy pool meets the configured floor.
    /// Floor launches do not consume cooldown.
    pub async fn ensure_floor(&self) {
        let mut state = self.state.lock().await;
        let current = self.registry.stats().healthy + state.pending.len();
        for i in current..self.config.min_workers {
            let hint = format!("worker-{}", i);
            match self.launcher.launch(&hint).await {
                Ok(launched) => {
                    info!(worker_id=%launched.worker_id, "launched worker for floor");
                    state.pending.push(PendingLaunch {
                        worker_id: launched.worker_id,
                        launched_at: self.time_provider.now(),
                    });
                }
                Err(e) => {
                    warn!(error=%e, "floor launch failed");
                }
            }
        }
    }

    /// One evaluation tick.
    pub async fn evaluate_once(&self) -> AutoscaleOutcome {
        let mut state = self.state.lock().await;
        let now = self.time_provider.now();

        self.supervise_pending(&mut state, now).await;

        if let Some(last) = state.last_action_at {
            let since = now.checked_duration_since(last).unwrap_or_default();
            if since < self.config.cooldown {
                return AutoscaleOutcome::Cooldown;
            }
        }

        let metrics = self
            .registry
            .cluster_metrics(self.load.running_queries());
        let effective_workers = metrics.healthy_workers + state.pending.len();

        match evaluate(&metrics, effective_workers, &self.config) {
            Decision::ScaleUp { reason } => {
                info!(reason, "scaling up by one worker");
                let hint = format!("worker-{}", WorkerId::short_suffix());
                match self.launcher.launch(&hint).await {
                    Ok(launched) => {
                        state.pending.push(PendingLaunch {
                            worker_id: launched.worker_id.clone(),
                            launched_at: now,
                        });
                        state.last_action_at = Some(now);
                        AutoscaleOutcome::ScaledUp(launched.worker_id)
                    }
                    Err(e) => {
                        warn!(error=%e, "scale-up launch failed");
                        AutoscaleOutcome::LaunchFailed(e.to_string())
                    }
                }
            }
            Decision::ScaleDown { reason } => {
                // victim: fewest active queries, ties by oldest heartbeat
                let victim = match self.registry.pick_least_loaded(1).into_iter().next() {
                    Some(victim) => victim,
                    None => return AutoscaleOutcome::NoAction,
                };
                info!(reason, worker_id=%victim.id, "scaling down by one worker");

                if let Err(e) = self.registry.request_shutdown(&victim.id) {
                    warn!(worker_id=%victim.id, error=%e, "drain request failed");
                    return AutoscaleOutcome::NoAction;
                }
                if let Err(e) = self.launcher.terminate(&victim.id).await {
                    warn!(worker_id=%victim.id, error=%e, "terminate failed");
                }
                if let Err(e) = self.registry.deregister(&victim.id, "scale down") {
                    warn!(worker_id=%victim.id, error=%e, "deregister failed");
                }

                state.last_action_at = Some(now);
                AutoscaleOutcome::ScaledDown(victim.id)
            }
            Decision::NoAction => AutoscaleOutcome::NoAction,
        }
    }

    /// Drop pending launches that became healthy; roll back the ones that
    /// blew the startup timeout.
    async fn supervise_pending(&self, state: &mut ScalerState, now: Time) {
        let mut kept = Vec::with_capacity(state.pending.len());
        for pending in state.pending.drain(..) {
            let healthy = self
                .registry
                .get(&pending.worker_id)
                .map(|info| info.status == WorkerStatus::Healthy)
                .unwrap_or(false);
            if healthy {
                continue;
            }

            let waited = now
                .checked_duration_since(pending.launched_at)
                .unwrap_or_default();
            if waited <= self.config.worker_startup_timeout {
                kept.push(pending);
                continue;
            }

            warn!(
                worker_id=%pending.worker_id,
                waited_secs=waited.as_secs(),
                "launched worker never became healthy, rolling back",
            );
            if let Err(e) = self.launcher.terminate(&pending.worker_id).await {
                warn!(worker_id=%pending.worker_id, error=%e, "rollback terminate failed");
            }
        }
        state.pending = kept;
    }

    /// Periodic loop: floor enforcement at startup, then one evaluation per
    /// interval until shutdown. The loop runs under a watchdog: a panicking
    /// evaluation is restarted with backoff (the floor check re-runs on
    /// restart, which is idempotent).
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let scaler = self;
        backoff::supervise("autoscaler", &BackoffConfig::default(), move || {
            let scaler = Arc::clone(&scaler);
            let shutdown = shutdown.clone();
            async move { scaler.evaluation_loop(shutdown).await }
        })
        .await;
    }

    async fn evaluation_loop(&self, shutdown: CancellationToken) {
        self.ensure_floor().await;

        let mut interval = tokio::time::interval(self.config.eval_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("autoscaler stopping");
                    return;
                }
                _ = interval.tick() => {}
            }
            self.evaluate_once().await;
        }
    }
}

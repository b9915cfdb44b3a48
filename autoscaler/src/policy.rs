//! The pure scaling decision.

use data_types::ClusterMetrics;
use std::time::Duration;

/// Bounds and thresholds for the scaling loop.
#[derive(Debug, Clone)]
pub struct AutoscalerConfig {
    pub min_workers: usize,
    pub max_workers: usize,
    pub scale_up_threshold: f64,
    pub scale_down_threshold: f64,
    pub cooldown: Duration,
    pub eval_interval: Duration,
    /// A launched worker must produce a healthy heartbeat within this
    /// window or the launch is rolled back.
    pub worker_startup_timeout: Duration,
}

impl Default for AutoscalerConfig {
    fn default() -> Self {
        Self {
            min_workers: 1,
            max_workers: 5,
            scale_up_threshold: 0.8,
            scale_down_threshold: 0.3,
            cooldown: Duration::from_secs(120),
            eval_interval: Duration::from_secs(30),
            worker_startup_timeout: Duration::from_secs(120),
        }
    }
}

/// What one evaluation tick decided. Steps are bounded to one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    ScaleUp { reason: String },
    ScaleDown { reason: String },
    NoAction,
}

/// Decide a bounded scaling step from the current cluster load.
///
/// `effective_workers` counts healthy workers plus launches still inside
/// their startup window, so a pending launch is never doubled up.
pub fn evaluate(
    metrics: &ClusterMetrics,
    effective_workers: usize,
    config: &AutoscalerConfig,
) -> Decision {
    let scale_up_load = metrics.avg_cpu_util > config.scale_up_threshold
        || metrics.avg_mem_util > config.scale_up_threshold
        || metrics.avg_queries_per_worker > 3.0;

    if effective_workers < config.max_workers && scale_up_load {
        let reason = format!(
            "load high: cpu={:.2} mem={:.2} queries/worker={:.2}",
            metrics.avg_cpu_util, metrics.avg_mem_util, metrics.avg_queries_per_worker
        );
        return Decision::ScaleUp { reason };
    }

    let idle = metrics.avg_cpu_util < config.scale_down_threshold
        && metrics.avg_mem_util < config.scale_down_threshold
        && metrics.avg_queries_per_worker < 1.0
        && metrics.total_active_queries == 0;

    if metrics.healthy_workers > config.min_workers && idle {
        let reason = format!(
            "cluster idle: cpu={:.2} mem={:.2} active_queries=0",
            metrics.avg_cpu_util, metrics.avg_mem_util
        );
        return Decision::ScaleDown { reason };
    }

    Decision::NoAction
}

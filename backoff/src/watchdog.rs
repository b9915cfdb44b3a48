//! Keeps long-lived periodic tasks alive across panics.

use crate::{Backoff, BackoffConfig};
use observability_deps::tracing::{error, info};
use std::future::Future;

/// Run `factory`'s future to completion, restarting it with backoff if it
/// panics. A normal return ends supervision; only panics are restarted.
pub async fn supervise<F, Fut>(task_name: &str, config: &BackoffConfig, mut factory: F)
where
    F: FnMut() -> Fut + Send,
    Fut: Future<Output = ()> + Send + 'static,
{
    let mut backoff = Backoff::new(config);
    loop {
        let handle = tokio::spawn(factory());
        match handle.await {
            Ok(()) => {
                info!(task_name, "supervised task completed");
                return;
            }
            Err(e) if e.is_panic() => {
                let delay = backoff.next();
                error!(
                    task_name,
                    backoff_ms = delay.as_millis() as u64,
                    "supervised task panicked, restarting",
                );
                tokio::time::sleep(delay).await;
            }
            Err(_) => {
                // cancelled from outside
                return;
            }
        }
    }
}

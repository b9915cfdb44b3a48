//! Backoff functionality.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_copy_implementations,
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::future_not_send,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]
use observability_deps::tracing::warn;
use rand::prelude::*;
use std::time::Duration;

mod watchdog;

pub use watchdog::supervise;

/// Exponential backoff with proportional jitter
///
/// See <https://aws.amazon.com/blogs/architecture/exponential-backoff-and-jitter/>
#[derive(Debug, Clone)]
#[allow(missing_copy_implementations)]
pub struct BackoffConfig {
    /// Initial backoff.
    pub init_backoff: Duration,

    /// Maximum backoff.
    pub max_backoff: Duration,

    /// Multiplier for each backoff round.
    pub base: f64,

    /// Fraction of the nominal delay used as symmetric jitter, e.g. `0.1`
    /// yields delays in `[0.9 * nominal, 1.1 * nominal]`.
    pub jitter: f64,

    /// Attempts before the last error is returned to the caller.
    pub max_attempts: usize,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            init_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            base: 2.,
            jitter: 0.1,
            max_attempts: 3,
        }
    }
}

/// [`Backoff`] can be created from a [`BackoffConfig`]
///
/// Consecutive calls to [`Backoff::next`] will return the next backoff interval.
pub struct Backoff {
    next_backoff_secs: f64,
    max_backoff_secs: f64,
    base: f64,
    jitter: f64,
    max_attempts: usize,
    rng: Option<Box<dyn RngCore + Sync + Send>>,
}

impl std::fmt::Debug for Backoff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backoff")
            .field("next_backoff_secs", &self.next_backoff_secs)
            .field("max_backoff_secs", &self.max_backoff_secs)
            .field("base", &self.base)
            .field("jitter", &self.jitter)
            .field("max_attempts", &self.max_attempts)
            .finish()
    }
}

impl Backoff {
    /// Create a new [`Backoff`] from the provided [`BackoffConfig`]
    pub fn new(config: &BackoffConfig) -> Self {
        Self::new_with_rng(config, None)
    }

    /// Creates a new `Backoff` with the optional `rng`
    ///
    /// Uses [`rand::thread_rng()`] if no rng provided
    pub fn new_with_rng(
        config: &BackoffConfig,
        rng: Option<Box<dyn RngCore + Sync + Send>>,
    ) -> Self {
        Self {
            next_backoff_secs: config.init_backoff.as_secs_f64(),
            max_backoff_secs: config.max_backoff.as_secs_f64(),
            base: config.base,
            jitter: config.jitter,
            max_attempts: config.max_attempts.max(1),
            rng,
        }
    }

    /// Returns the next backoff duration to wait for
    fn next(&mut self) -> Duration {
        let nominal = self.next_backoff_secs;
        self.next_backoff_secs = (nominal * self.base).min(self.max_backoff_secs);

        let unit: f64 = match self.rng.as_mut() {
            Some(rng) => rng.gen(),
            None => thread_rng().gen(),
        };
        let jittered = nominal * (1. - self.jitter + 2. * self.jitter * unit);

        Duration::from_secs_f64(jittered.min(self.max_backoff_secs))
    }

    /// Perform an async operation, retrying errors for which `is_retryable`
    /// returns `true` up to the configured attempt budget.
    ///
    /// The last error is returned unchanged once the budget is exhausted or a
    /// non-retryable error is observed.
    pub async fn retry<F, F1, T, E, P>(
        &mut self,
        task_name: &str,
        is_retryable: P,
        mut do_stuff: F,
    ) -> Result<T, E>
    where
        F: (FnMut() -> F1) + Send,
        F1: std::future::Future<Output = Result<T, E>> + Send,
        E: std::fmt::Display + Send,
        P: Fn(&E) -> bool + Send,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;

            // first execute `F` and then use it, so we can avoid `F: Sync`.
            let do_stuff = do_stuff();

            let e = match do_stuff.await {
                Ok(r) => break Ok(r),
                Err(e) => e,
            };

            if attempt >= self.max_attempts || !is_retryable(&e) {
                break Err(e);
            }

            let backoff = self.next();
            warn!(
                e=%e,
                task_name,
                attempt,
                backoff_ms = backoff.as_millis() as u64,
                "request encountered retryable error - backing off",
            );
            tokio::time::sleep(backoff).await;
        }
    }
}

#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use std::sync::Once;

#[cfg(feature = "future_timeout")]
pub mod timeout;

pub use tracing_subscriber;

/// Enables debug logging if the RUST_LOG environment variable is
/// set. Does nothing if RUST_LOG is not set.
pub fn maybe_start_logging() {
    if std::env::var("RUST_LOG").is_ok() {
        start_logging()
    }
}

static LOG_SETUP: Once = Once::new();

/// Enables debug logging regardless of the value of RUST_LOG
/// environment variable. If RUST_LOG isn't specified, defaults to
/// "debug".
pub fn start_logging() {
    // ensure the global has been initialized
    LOG_SETUP.call_once(|| {
        // honor any existing RUST_LOG level
        if std::env::var("RUST_LOG").is_err() {
            std::env::set_var("RUST_LOG", "debug");
        }

        // Configure the logger to write to stderr and install it
        let output_stream = std::io::stderr;

        use tracing_subscriber::{layer::SubscriberExt, EnvFilter};

        tracing_log::LogTracer::init().expect("tracing log init");

        let layer = tracing_subscriber::fmt::layer()
            .with_writer(output_stream)
            .with_target(false);

        let subscriber = tracing_subscriber::Registry::default()
            .with(EnvFilter::from_default_env())
            .with(layer);

        observability_deps::tracing::subscriber::set_global_default(subscriber)
            .expect("Could not set global default subscriber");
    })
}

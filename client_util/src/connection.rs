//! Building blocks for [`Connection`]s to Stratus processes.

use http::uri::InvalidUri;
use std::time::Duration;
use thiserror::Error;
use tonic::transport::{Channel, Endpoint};

/// The connection type used for clients. A tonic channel multiplexes all
/// request and chunk streams to one endpoint; it is cheap to clone and is
/// shared across services.
pub type Connection = Channel;

/// Errors returned by the ConnectionBuilder
#[derive(Debug, Error)]
pub enum Error {
    /// Server returned an invalid argument error
    #[error("Connection error: {}{}", source, details)]
    TransportError {
        /// underlying [`tonic::transport::Error`]
        source: tonic::transport::Error,
        /// stringified version of the tonic error's source
        details: String,
    },

    /// Client received an unexpected error from the server
    #[error("Invalid URI: {}", .0)]
    InvalidUri(#[from] InvalidUri),
}

// Custom impl to include underlying source (not included in tonic
// transport error)
impl From<tonic::transport::Error> for Error {
    fn from(source: tonic::transport::Error) -> Self {
        use std::error::Error;
        let details = source
            .source()
            .map(|e| format!(" ({})", e))
            .unwrap_or_else(|| "".to_string());

        Self::TransportError { source, details }
    }
}

/// Result type for the ConnectionBuilder
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A builder that produces a connection to a Stratus process.
///
/// ```no_run
/// #[tokio::main]
/// # async fn main() {
/// use client_util::connection::Builder;
/// use std::time::Duration;
///
/// let connection = Builder::new()
///     .timeout(Duration::from_secs(10))
///     .build("http://127.0.0.1:8082")
///     .await
///     .expect("connection must succeed");
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct Builder {
    connect_timeout: Duration,
    timeout: Duration,
}

impl Default for Builder {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            timeout: Duration::from_secs(30),
        }
    }
}

impl Builder {
    /// Create a new default builder
    pub fn new() -> Self {
        Default::default()
    }

    /// Sets the maximum duration of time the client will wait for the
    /// server to accept the TCP connection before aborting the request
    pub fn connect_timeout(self, connect_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            ..self
        }
    }

    /// Set the maximum duration of an individual request
    pub fn timeout(self, timeout: Duration) -> Self {
        Self { timeout, ..self }
    }

    /// Construct the [`Connection`] instance using the specified base URL.
    ///
    /// The connection is lazy: the first RPC drives the actual TCP
    /// connect, so an unreachable endpoint surfaces as `Unavailable` on
    /// use rather than at build time.
    pub async fn build(self, dst: impl AsRef<str> + Send) -> Result<Connection> {
        let endpoint = Endpoint::from_shared(dst.as_ref().to_string())?
            .connect_timeout(self.connect_timeout)
            .timeout(self.timeout);

        Ok(endpoint.connect_lazy())
    }
}

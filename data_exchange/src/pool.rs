//! Endpoint-keyed channel reuse.
//!
//! One tonic channel per endpoint, shared by every stream that talks to it.
//! Entries are evicted when the registry removes the worker; a channel does
//! not keep a worker alive.

use client_util::connection::{Builder, Connection};
use data_types::{EngineError, WorkerEndpoint};
use hashbrown::HashMap;
use observability_deps::tracing::debug;
use parking_lot::Mutex;
use std::time::Duration;

#[derive(Debug)]
pub struct ConnectionPool {
    connections: Mutex<HashMap<WorkerEndpoint, Connection>>,
    connect_timeout: Duration,
    request_timeout: Duration,
}

impl Default for ConnectionPool {
    fn default() -> Self {
        Self::new(Duration::from_secs(5), Duration::from_secs(30))
    }
}

impl ConnectionPool {
    pub fn new(connect_timeout: Duration, request_timeout: Duration) -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
            connect_timeout,
            request_timeout,
        }
    }

    /// Channel for `endpoint`, building a lazy one on first use.
    pub async fn get(&self, endpoint: &WorkerEndpoint) -> Result<Connection, EngineError> {
        if let Some(connection) = self.connections.lock().get(endpoint) {
            return Ok(connection.clone());
        }

        let connection = Builder::new()
            .connect_timeout(self.connect_timeout)
            .timeout(self.request_timeout)
            .build(endpoint.http_uri())
            .await
            .map_err(|e| EngineError::unavailable(e.to_string()))?;

        debug!(endpoint=%endpoint, "opened exchange channel");
        self.connections
            .lock()
            .entry(endpoint.clone())
            .or_insert(connection.clone());
        Ok(connection)
    }

    /// Drop the channel for `endpoint` (e.g. after deregistration).
    pub fn evict(&self, endpoint: &WorkerEndpoint) {
        if self.connections.lock().remove(endpoint).is_some() {
            debug!(endpoint=%endpoint, "evicted exchange channel");
        }
    }

    pub fn len(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn channels_are_reused_and_evictable() {
        let pool = ConnectionPool::default();
        let endpoint = WorkerEndpoint::new("127.0.0.1:19999");

        assert!(pool.is_empty());
        pool.get(&endpoint).await.unwrap();
        pool.get(&endpoint).await.unwrap();
        assert_eq!(pool.len(), 1);

        pool.evict(&endpoint);
        assert!(pool.is_empty());

        // evicting twice is a no-op
        pool.evict(&endpoint);
    }
}

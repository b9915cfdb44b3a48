//! Per-query execution bookkeeping on one worker.

use data_types::QueryId;
use hashbrown::HashMap;
use observability_deps::tracing::info;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
struct QueryEntry {
    token: CancellationToken,
    /// In-flight stage assignments for this query on this worker.
    assignments: usize,
}

/// Tracks which queries have in-flight assignments and owns their
/// cancellation tokens. `active_queries()` feeds the heartbeat resource
/// snapshot.
#[derive(Debug, Default)]
pub struct QueryTracker {
    queries: Mutex<HashMap<QueryId, QueryEntry>>,
    draining: Mutex<bool>,
}

impl QueryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one more assignment for `query_id`, returning the query's
    /// cancellation token. The token is shared by every assignment of the
    /// query so one cancel fans out to all of them.
    pub fn begin_assignment(&self, query_id: &QueryId) -> CancellationToken {
        let mut queries = self.queries.lock();
        let entry = queries.entry(query_id.clone()).or_insert_with(|| QueryEntry {
            token: CancellationToken::new(),
            assignments: 0,
        });
        entry.assignments += 1;
        entry.token.clone()
    }

    /// Mark one assignment finished; the query entry (and its token) is
    /// dropped with the last one.
    pub fn finish_assignment(&self, query_id: &QueryId) {
        let mut queries = self.queries.lock();
        if let Some(entry) = queries.get_mut(query_id) {
            entry.assignments = entry.assignments.saturating_sub(1);
            if entry.assignments == 0 {
                queries.remove(query_id);
            }
        }
    }

    /// Trip the query's cancellation token. Returns `false` when nothing is
    /// running for the query.
    pub fn cancel(&self, query_id: &QueryId) -> bool {
        let queries = self.queries.lock();
        match queries.get(query_id) {
            Some(entry) => {
                info!(query_id=%query_id, assignments=entry.assignments, "cancelling query");
                entry.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Whether any assignment of `query_id` is still in flight.
    pub fn is_active(&self, query_id: &QueryId) -> bool {
        self.queries.lock().contains_key(query_id)
    }

    /// Number of distinct queries with in-flight assignments.
    pub fn active_queries(&self) -> u32 {
        self.queries.lock().len() as u32
    }

    /// Put the worker into draining mode: no new assignments are accepted,
    /// in-flight ones complete.
    pub fn set_draining(&self) {
        *self.draining.lock() = true;
    }

    pub fn is_draining(&self) -> bool {
        *self.draining.lock()
    }
}

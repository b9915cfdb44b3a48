//! The engine-wide error taxonomy.
//!
//! Components wrap their failures into an [`EngineError`] before crossing a
//! crate or process boundary so that retry policy can be decided from the
//! [`ErrorKind`] alone, without inspecting message strings.

use crate::{QueryId, WorkerId};
use std::fmt::{Display, Formatter};

/// Generic boxed error with a classification attached.
///
/// The dynamic boxing makes it easier to deal with errors from different
/// component implementations.
#[derive(Debug)]
pub struct EngineError {
    inner: Box<dyn std::error::Error + Sync + Send>,
    kind: ErrorKind,
    query_id: Option<QueryId>,
    stage_id: Option<u64>,
    worker_id: Option<WorkerId>,
}

impl EngineError {
    pub fn new(
        kind: ErrorKind,
        e: impl Into<Box<dyn std::error::Error + Sync + Send>>,
    ) -> Self {
        Self {
            inner: e.into(),
            kind,
            query_id: None,
            stage_id: None,
            worker_id: None,
        }
    }

    /// Malformed SQL, unknown table, bad worker id.
    pub fn invalid_request(e: impl Into<Box<dyn std::error::Error + Sync + Send>>) -> Self {
        Self::new(ErrorKind::InvalidRequest, e)
    }

    /// Unknown query, worker or partition.
    pub fn not_found(e: impl Into<Box<dyn std::error::Error + Sync + Send>>) -> Self {
        Self::new(ErrorKind::NotFound, e)
    }

    /// Worker down or RPC unreachable.
    pub fn unavailable(e: impl Into<Box<dyn std::error::Error + Sync + Send>>) -> Self {
        Self::new(ErrorKind::Unavailable, e)
    }

    /// Deadline exceeded.
    pub fn timeout(e: impl Into<Box<dyn std::error::Error + Sync + Send>>) -> Self {
        Self::new(ErrorKind::Timeout, e)
    }

    /// Checksum or chunk sequence violation.
    pub fn corrupt_transfer(e: impl Into<Box<dyn std::error::Error + Sync + Send>>) -> Self {
        Self::new(ErrorKind::CorruptTransfer, e)
    }

    /// Memory ceiling or bounded queue full.
    pub fn resource_exhausted(e: impl Into<Box<dyn std::error::Error + Sync + Send>>) -> Self {
        Self::new(ErrorKind::ResourceExhausted, e)
    }

    /// Explicit cancellation.
    pub fn cancelled(e: impl Into<Box<dyn std::error::Error + Sync + Send>>) -> Self {
        Self::new(ErrorKind::Cancelled, e)
    }

    /// Unexpected invariant violation.
    pub fn internal(e: impl Into<Box<dyn std::error::Error + Sync + Send>>) -> Self {
        Self::new(ErrorKind::Internal, e)
    }

    /// Attach the query this error originated from.
    pub fn scope_query(mut self, query_id: QueryId) -> Self {
        self.query_id = Some(query_id);
        self
    }

    /// Attach the stage this error originated from.
    pub fn scope_stage(mut self, stage_id: u64) -> Self {
        self.stage_id = Some(stage_id);
        self
    }

    /// Attach the worker this error originated from.
    pub fn scope_worker(mut self, worker_id: WorkerId) -> Self {
        self.worker_id = Some(worker_id);
        self
    }

    /// Returns the kind of error this was
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns the inner error
    pub fn inner(&self) -> &dyn std::error::Error {
        self.inner.as_ref()
    }

    pub fn query_id(&self) -> Option<&QueryId> {
        self.query_id.as_ref()
    }

    pub fn stage_id(&self) -> Option<u64> {
        self.stage_id
    }

    pub fn worker_id(&self) -> Option<&WorkerId> {
        self.worker_id.as_ref()
    }
}

impl Display for EngineError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "EngineError({:?}): {}", self.kind, self.inner)?;
        if let Some(query_id) = &self.query_id {
            write!(f, " query={}", query_id)?;
        }
        if let Some(stage_id) = self.stage_id {
            write!(f, " stage={}", stage_id)?;
        }
        if let Some(worker_id) = &self.worker_id {
            write!(f, " worker={}", worker_id)?;
        }
        Ok(())
    }
}

impl std::error::Error for EngineError {}

impl From<String> for EngineError {
    fn from(e: String) -> Self {
        Self::new(ErrorKind::Internal, e)
    }
}

impl From<&'static str> for EngineError {
    fn from(e: &'static str) -> Self {
        Self::new(ErrorKind::Internal, e)
    }
}

/// Classification of an [`EngineError`], aligned with the transport retry
/// policy and the client-visible error surface.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed SQL, unknown table, bad worker id.
    InvalidRequest,

    /// Query, worker or partition does not exist.
    NotFound,

    /// Worker down / RPC unreachable. Retryable.
    Unavailable,

    /// Deadline exceeded. Retryable up to budget.
    Timeout,

    /// Checksum or chunk sequence violation. Non-retryable for the transfer;
    /// retried at stage level.
    CorruptTransfer,

    /// Memory cap hit or bounded queue full. Retryable with backoff.
    ResourceExhausted,

    /// Explicit cancellation; never retried.
    Cancelled,

    /// Unexpected invariant violation; surfaced, not retried.
    Internal,
}

impl ErrorKind {
    /// Whether the transport layer may retry an operation that failed with
    /// this kind.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Unavailable | Self::Timeout | Self::ResourceExhausted
        )
    }
}

/// Convenience alias used across the engine crates.
pub type Result<T, E = EngineError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_and_constructors() {
        assert_eq!(
            EngineError::invalid_request("bad sql").kind(),
            ErrorKind::InvalidRequest
        );
        assert_eq!(EngineError::not_found("nope").kind(), ErrorKind::NotFound);
        assert_eq!(
            EngineError::unavailable("conn refused").kind(),
            ErrorKind::Unavailable
        );
        assert_eq!(EngineError::timeout("deadline").kind(), ErrorKind::Timeout);
        assert_eq!(
            EngineError::corrupt_transfer("crc").kind(),
            ErrorKind::CorruptTransfer
        );
        assert_eq!(
            EngineError::resource_exhausted("oom").kind(),
            ErrorKind::ResourceExhausted
        );
        assert_eq!(
            EngineError::cancelled("user").kind(),
            ErrorKind::Cancelled
        );
        assert_eq!(EngineError::internal("bug").kind(), ErrorKind::Internal);
    }

    #[test]
    fn retryability() {
        assert!(ErrorKind::Unavailable.is_retryable());
        assert!(ErrorKind::Timeout.is_retryable());
        assert!(ErrorKind::ResourceExhausted.is_retryable());

        assert!(!ErrorKind::InvalidRequest.is_retryable());
        assert!(!ErrorKind::NotFound.is_retryable());
        assert!(!ErrorKind::CorruptTransfer.is_retryable());
        assert!(!ErrorKind::Cancelled.is_retryable());
        assert!(!ErrorKind::Internal.is_retryable());
    }

    #[test]
    fn display_includes_correlation_ids() {
        let e = EngineError::unavailable("connection reset")
            .scope_query(QueryId::new("q-1"))
            .scope_stage(3)
            .scope_worker(WorkerId::new("w-2"));

        let rendered = e.to_string();
        assert!(rendered.contains("Unavailable"), "{rendered}");
        assert!(rendered.contains("connection reset"), "{rendered}");
        assert!(rendered.contains("query=q-1"), "{rendered}");
        assert!(rendered.contains("stage=3"), "{rendered}");
        assert!(rendered.contains("worker=w-2"), "{rendered}");
    }
}

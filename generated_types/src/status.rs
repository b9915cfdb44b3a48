//! Mapping between the engine error taxonomy and gRPC status codes.
//!
//! The mapping is total in both directions so that an error kind survives a
//! process hop unchanged.

use data_types::{EngineError, ErrorKind};
use tonic::{Code, Status};

/// The gRPC status code used to transport an [`ErrorKind`].
pub fn code_for_kind(kind: ErrorKind) -> Code {
    match kind {
        ErrorKind::InvalidRequest => Code::InvalidArgument,
        ErrorKind::NotFound => Code::NotFound,
        ErrorKind::Unavailable => Code::Unavailable,
        ErrorKind::Timeout => Code::DeadlineExceeded,
        ErrorKind::CorruptTransfer => Code::DataLoss,
        ErrorKind::ResourceExhausted => Code::ResourceExhausted,
        ErrorKind::Cancelled => Code::Cancelled,
        ErrorKind::Internal => Code::Internal,
    }
}

/// The [`ErrorKind`] carried by a gRPC status code.
pub fn kind_for_code(code: Code) -> ErrorKind {
    match code {
        Code::InvalidArgument | Code::FailedPrecondition | Code::OutOfRange => {
            ErrorKind::InvalidRequest
        }
        Code::NotFound => ErrorKind::NotFound,
        Code::Unavailable | Code::Aborted => ErrorKind::Unavailable,
        Code::DeadlineExceeded => ErrorKind::Timeout,
        Code::DataLoss => ErrorKind::CorruptTransfer,
        Code::ResourceExhausted => ErrorKind::ResourceExhausted,
        Code::Cancelled => ErrorKind::Cancelled,
        _ => ErrorKind::Internal,
    }
}

/// Convert an [`EngineError`] into a [`Status`] for the wire.
pub fn status_from_engine_error(e: &EngineError) -> Status {
    Status::new(code_for_kind(e.kind()), e.to_string())
}

/// Convert a [`Status`] received from a peer back into an [`EngineError`].
///
/// Connection-level failures ("connection refused", "connection reset",
/// "transport error") arrive as `Unknown`; they are classified as
/// unavailable so the retry policy treats them as transient.
pub fn engine_error_from_status(status: Status) -> EngineError {
    let kind = match status.code() {
        Code::Unknown if is_connection_error(status.message()) => ErrorKind::Unavailable,
        code => kind_for_code(code),
    };
    EngineError::new(kind, status.message().to_string())
}

fn is_connection_error(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    ["connection refused", "connection reset", "transport error", "broken pipe"]
        .iter()
        .any(|needle| message.contains(needle))
}

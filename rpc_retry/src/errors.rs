use std::any::Any;
use tonic::{Code, Status};

/// The error an operation resolves to when it does not succeed.
///
/// Retryable failures that are followed by another attempt never show up
/// here; only the terminal classification of the whole operation does.
#[derive(Clone, Debug, thiserror::Error)]
pub enum Error {
    /// The operation was cancelled, either by the caller or because an
    /// attempt closed with a `CANCELLED` status. This is not a failure.
    #[error("operation cancelled: {reason}")]
    Cancelled { reason: String },

    /// An attempt failed in a way that must not be retried: the code isn't
    /// retryable, retries are disabled, or the request isn't idempotent and the
    /// server may have acted on it.
    #[error("rpc failed: {0}")]
    Failed(Status),

    /// Attempts kept failing with retryable statuses until the backoff budget
    /// ran out.
    #[error("exhausted retries after {attempts} attempts. last error: {last}")]
    RetriesExhausted {
        /// Counts every attempt dispatched, including the first.
        attempts: usize,
        last: Status,
    },
}

impl Error {
    /// Returns the gRPC code that best describes this error.
    pub fn code(&self) -> Code {
        match self {
            Self::Cancelled { .. } => Code::Cancelled,
            Self::Failed(status) => status.code(),
            Self::RetriesExhausted { last, .. } => last.code(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

/// Unwraps the error into the status a gRPC-facing caller would report.
impl From<Error> for Status {
    fn from(error: Error) -> Self {
        match error {
            Error::Cancelled { reason } => Status::cancelled(reason),
            Error::Failed(status) => status,
            Error::RetriesExhausted { attempts, last } => Status::new(
                last.code(),
                format!(
                    "exhausted retries after {attempts} attempts: {}",
                    last.message()
                ),
            ),
        }
    }
}

/// Extracts the message from a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown"
    }
}

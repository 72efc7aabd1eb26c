//! Retries for RPCs made through an asynchronous call-and-listener transport.
//!
//! A [`RetryingOperation`] turns one logical call into as many attempts as
//! needed. After each failed attempt it decides whether to retry, based on
//! the status code, whether the request is idempotent, and how much of the
//! exponential backoff budget is left. The whole operation resolves a single
//! [`CompletionHandle`], which is also how callers cancel it.
//!
//! Retryable failures never reach the caller. What does is described by
//! [`Error`].
//!
//! ```ignore
//! let result = RetryingOperation::new(
//!     transport,
//!     Unary::idempotent(),
//!     request,
//!     Arc::new(TokioScheduler::current()),
//! )
//! .with_retry_options(RetryOptions::default().with_retryable_codes([Code::Unavailable]))
//! .result()
//! .await;
//! ```

mod backoff;
mod completion;
mod errors;
mod instrumentation;
mod operation;
mod options;
mod policy;
mod scheduler;
mod strategy;
mod transport;

pub use backoff::ExponentialBackoff;
pub use completion::{CompletionHandle, USER_CANCELLED};
pub use errors::Error;
pub use instrumentation::{Instrumentation, NoInstrumentation, StatsdInstrumentation};
pub use operation::{RetryingOperation, INTERRUPTED, UNARY_DEADLINE};
pub use options::{parse_code, parse_duration, RetryArgs, RetryOptions, DEFAULT_RETRYABLE_CODES};
pub use policy::{decide, RetryDecision, NEVER_REACHED_SERVER};
pub use scheduler::{Scheduler, TokioScheduler};
pub use strategy::{FnStrategy, Finished, RequestStrategy, StreamingRead, Unary};
pub use transport::{AttemptOutcome, CallListener, CallOptions, ClientCall, Transport};

#[cfg(test)]
mod tests;

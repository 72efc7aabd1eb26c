use std::time::Duration;
use tonic::Code;
use tracing::trace;

use super::backoff::ExponentialBackoff;
use super::options::RetryOptions;

/// What to do after an attempt closed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RetryDecision {
    /// The attempt succeeded.
    Complete,
    /// The attempt was cancelled. This ends the operation but isn't a
    /// failure.
    Cancelled,
    /// The failure must not be retried.
    FatalFailure,
    /// Try again after the given backoff.
    RetryAfter(Duration),
    /// The failure could be retried, but the backoff budget is used up.
    RetriesExhausted,
}

/// Codes that guarantee the request never reached server-side processing.
/// Retrying these is safe even for requests that aren't idempotent.
pub const NEVER_REACHED_SERVER: [Code; 2] = [Code::Unauthenticated, Code::Unavailable];

/// Classifies the outcome of attempt number `attempt` (counting from 1).
///
/// The backoff state is only created, and only advanced, when the failure is
/// actually retryable.
pub fn decide(
    options: &RetryOptions,
    code: Code,
    attempt: usize,
    idempotent: bool,
    backoff: &mut Option<ExponentialBackoff>,
) -> RetryDecision {
    let decision = match code {
        Code::Ok => RetryDecision::Complete,
        Code::Cancelled => RetryDecision::Cancelled,
        _ if !options.enable_retries
            || !options.is_retryable(code)
            || !(idempotent || NEVER_REACHED_SERVER.contains(&code)) =>
        {
            RetryDecision::FatalFailure
        }
        _ => match backoff
            .get_or_insert_with(|| options.new_backoff())
            .next_backoff()
        {
            Some(delay) => RetryDecision::RetryAfter(delay),
            None => RetryDecision::RetriesExhausted,
        },
    };
    trace!(?code, attempt, idempotent, ?decision, "classified attempt outcome");
    decision
}

use observability::metrics;
use observability::metrics_tag as tag;
use std::time::Duration;
use tonic::Code;

/// Hooks the operation calls at each step of its lifecycle.
///
/// All hooks default to doing nothing. `method` is the transport's full
/// method name. Panics raised by a hook are caught and logged by the
/// operation, so a broken sink can't change an operation's outcome.
pub trait Instrumentation: Send + Sync + 'static {
    fn operation_started(&self, _method: &str) {}

    /// Called once per operation, with the code it resolved to.
    fn operation_finished(&self, _method: &str, _elapsed: Duration, _code: Code) {}

    /// `attempt` counts from 1.
    fn attempt_started(&self, _method: &str, _attempt: usize) {}

    fn attempt_finished(&self, _method: &str, _attempt: usize, _elapsed: Duration, _code: Code) {}

    /// A retryable failure is about to be retried after `backoff`.
    fn retry(&self, _method: &str, _backoff: Duration) {}

    /// The operation failed without retrying.
    fn failure(&self, _method: &str, _code: Code) {}

    fn retries_exhausted(&self, _method: &str, _attempts: usize) {}
}

/// Records nothing.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoInstrumentation;

impl Instrumentation for NoInstrumentation {}

/// Sends operation metrics to statsd.
///
/// Metric names are relative to `prefix`:
/// - `{prefix}.operation.time`: the whole operation, tagged with the code it
///   ended with.
/// - `{prefix}.rpc.time`: each attempt, tagged with its code.
/// - `{prefix}.retries`, `{prefix}.failures`, `{prefix}.retries_exhausted`:
///   counters.
///
/// Everything is tagged with the method name.
#[derive(Clone, Debug)]
pub struct StatsdInstrumentation {
    metrics: metrics::Client,
    prefix: String,
}

impl StatsdInstrumentation {
    pub fn new(metrics: metrics::Client, prefix: impl Into<String>) -> Self {
        Self {
            metrics,
            prefix: prefix.into(),
        }
    }
}

impl Instrumentation for StatsdInstrumentation {
    fn operation_finished(&self, method: &str, elapsed: Duration, code: Code) {
        self.metrics.timing(
            format!("{}.operation.time", self.prefix),
            elapsed,
            [tag!(method), tag!(?code)],
        );
    }

    fn attempt_finished(&self, method: &str, _attempt: usize, elapsed: Duration, code: Code) {
        self.metrics.timing(
            format!("{}.rpc.time", self.prefix),
            elapsed,
            [tag!(method), tag!(?code)],
        );
    }

    fn retry(&self, method: &str, _backoff: Duration) {
        self.metrics
            .incr(format!("{}.retries", self.prefix), [tag!(method)]);
    }

    fn failure(&self, method: &str, code: Code) {
        self.metrics.incr(
            format!("{}.failures", self.prefix),
            [tag!(method), tag!(?code)],
        );
    }

    fn retries_exhausted(&self, method: &str, _attempts: usize) {
        self.metrics
            .incr(format!("{}.retries_exhausted", self.prefix), [tag!(method)]);
    }
}

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tonic::metadata::MetadataMap;
use tonic::{Code, Status};
use tracing::{debug, field, span, trace, warn, Level, Span};

use super::backoff::ExponentialBackoff;
use super::completion::CompletionHandle;
use super::instrumentation::{Instrumentation, NoInstrumentation};
use super::options::RetryOptions;
use super::policy::{self, RetryDecision};
use super::scheduler::Scheduler;
use super::strategy::{Finished, RequestStrategy};
use super::transport::{AttemptOutcome, CallListener, CallOptions, ClientCall, Transport};
use super::errors::{panic_message, Error};

/// The deadline given to each attempt of a request that isn't a streaming
/// read, unless the caller set one. This keeps a hung call from blocking an
/// operation forever.
pub const UNARY_DEADLINE: Duration = Duration::from_secs(6 * 60);

/// The reason an operation is cancelled with when the future returned by
/// [`RetryingOperation::result`] is dropped before it resolves.
pub const INTERRUPTED: &str = "Request interrupted.";

/// Runs one logical RPC as a sequence of attempts against a [`Transport`],
/// retrying failed attempts according to [`RetryOptions`].
///
/// Build one per call and either [`start`](Self::start) it to get a
/// [`CompletionHandle`], or use [`result`](Self::result) or
/// [`blocking_result`](Self::blocking_result).
///
/// Only one attempt is ever in flight. Backoff between attempts is handed to
/// the [`Scheduler`], so no thread waits it out.
pub struct RetryingOperation<X, S>
where
    X: Transport,
    S: RequestStrategy<X::Request, X::Response>,
{
    transport: X,
    strategy: S,
    request: X::Request,
    retry_options: RetryOptions,
    call_options: CallOptions,
    metadata: MetadataMap,
    scheduler: Arc<dyn Scheduler>,
    instrumentation: Arc<dyn Instrumentation>,
    completion: CompletionHandle<S::Output>,
}

impl<X, S> RetryingOperation<X, S>
where
    X: Transport,
    S: RequestStrategy<X::Request, X::Response>,
{
    pub fn new(
        transport: X,
        strategy: S,
        request: X::Request,
        scheduler: Arc<dyn Scheduler>,
    ) -> Self {
        Self {
            transport,
            strategy,
            request,
            retry_options: RetryOptions::default(),
            call_options: CallOptions::default(),
            metadata: MetadataMap::new(),
            scheduler,
            instrumentation: Arc::new(NoInstrumentation),
            completion: CompletionHandle::new(),
        }
    }

    pub fn with_retry_options(self, retry_options: RetryOptions) -> Self {
        Self {
            retry_options,
            ..self
        }
    }

    /// Passed to the transport for every attempt. If no deadline is set, each
    /// attempt of a non-streaming request gets one [`UNARY_DEADLINE`] after
    /// it starts.
    pub fn with_call_options(self, call_options: CallOptions) -> Self {
        Self {
            call_options,
            ..self
        }
    }

    /// Headers sent with every attempt.
    pub fn with_metadata(self, metadata: MetadataMap) -> Self {
        Self { metadata, ..self }
    }

    pub fn with_instrumentation(self, instrumentation: Arc<dyn Instrumentation>) -> Self {
        Self {
            instrumentation,
            ..self
        }
    }

    /// Returns the handle that [`start`](Self::start) will return.
    pub fn completion(&self) -> CompletionHandle<S::Output> {
        self.completion.clone()
    }

    /// Cancels the operation before it starts. Once started, cancel through
    /// the [`CompletionHandle`] instead.
    pub fn cancel(&self) -> bool {
        self.completion.cancel()
    }

    pub fn cancel_with_reason(&self, reason: &str) -> bool {
        self.completion.cancel_with_reason(reason)
    }

    /// Dispatches the first attempt and returns the handle to the
    /// operation's outcome.
    pub fn start(self) -> CompletionHandle<S::Output> {
        let method = self.transport.method_name().to_owned();
        let span = span!(
            Level::TRACE,
            "Operation",
            otel.name = format!("Operation.{}", method.replace('/', ".")),
            attempts = field::Empty,
            code = field::Empty,
        );
        let inner = Arc::new(Inner {
            idempotent: self.strategy.is_idempotent(&self.request),
            streaming_read: self.strategy.is_streaming_read(&self.request),
            transport: self.transport,
            strategy: Mutex::new(self.strategy),
            request: self.request,
            retry_options: self.retry_options,
            call_options: self.call_options,
            metadata: self.metadata,
            scheduler: self.scheduler,
            instrumentation: self.instrumentation,
            completion: self.completion.clone(),
            method,
            call: Mutex::new(None),
            attempts: AtomicUsize::new(0),
            backoff: Mutex::new(None),
            finalized: AtomicBool::new(false),
            started: Instant::now(),
            span,
        });

        let weak = Arc::downgrade(&inner);
        self.completion.on_cancel(move |reason| {
            if let Some(inner) = weak.upgrade() {
                inner.cancel_attempt(reason);
            }
        });

        inner.instrument("operation_started", |i| i.operation_started(&inner.method));
        inner.run_attempt();
        self.completion
    }

    /// Starts the operation and waits for its outcome.
    ///
    /// Dropping the returned future before it resolves cancels the operation.
    pub async fn result(self) -> Result<S::Output, Error> {
        let handle = self.start();
        let interrupt = CancelOnDrop(&handle);
        let result = handle.wait().await;
        drop(interrupt);
        if result.is_err() {
            handle.cancel();
        }
        result
    }

    /// Starts the operation and blocks the current thread until it resolves.
    ///
    /// This must not be called from an async context.
    pub fn blocking_result(self) -> Result<S::Output, Error> {
        let handle = self.start();
        let result = handle.wait_blocking();
        if result.is_err() {
            handle.cancel();
        }
        result
    }
}

struct CancelOnDrop<'a, T: Clone>(&'a CompletionHandle<T>);

impl<'a, T: Clone> Drop for CancelOnDrop<'a, T> {
    fn drop(&mut self) {
        if self.0.cancel_with_reason(INTERRUPTED) {
            debug!("cancelled operation because its caller stopped waiting");
        }
    }
}

struct InFlight<C> {
    call: C,
    attempt: usize,
    started: Instant,
}

/// The state of a started operation, shared by the attempt listeners and the
/// scheduled retries.
struct Inner<X, S>
where
    X: Transport,
    S: RequestStrategy<X::Request, X::Response>,
{
    transport: X,
    strategy: Mutex<S>,
    request: X::Request,
    idempotent: bool,
    streaming_read: bool,
    retry_options: RetryOptions,
    call_options: CallOptions,
    metadata: MetadataMap,
    scheduler: Arc<dyn Scheduler>,
    instrumentation: Arc<dyn Instrumentation>,
    completion: CompletionHandle<S::Output>,
    method: String,
    // The attempt in flight, if any. Attempts are started and cancelled while
    // holding this lock.
    call: Mutex<Option<InFlight<X::Call>>>,
    attempts: AtomicUsize,
    // Created on the first retryable failure.
    backoff: Mutex<Option<ExponentialBackoff>>,
    finalized: AtomicBool,
    started: Instant,
    span: Span,
}

impl<X, S> Inner<X, S>
where
    X: Transport,
    S: RequestStrategy<X::Request, X::Response>,
{
    fn run_attempt(self: &Arc<Self>) {
        if self.completion.is_done() {
            // Cancelled while backing off.
            self.finalize();
            return;
        }

        let request = match self.strategy_hook("attempt_request", |strategy| {
            strategy.on_attempt_start();
            strategy.attempt_request(&self.request)
        }) {
            Ok(request) => request,
            Err(status) => {
                let attempt = self.attempts.load(Ordering::SeqCst);
                self.fail(attempt, status, &MetadataMap::new());
                return;
            }
        };
        let options = self.attempt_call_options();

        let (attempt, started) = {
            let mut slot = self.call.lock().unwrap();
            if self.completion.is_done() {
                drop(slot);
                self.finalize();
                return;
            }
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            let in_flight = slot.insert(InFlight {
                call: self.transport.new_call(&options),
                attempt,
                started: Instant::now(),
            });
            let listener = Arc::new(AttemptListener {
                operation: Arc::clone(self),
                attempt,
            });
            let started = self.transport.start(
                request,
                listener,
                self.metadata.clone(),
                &in_flight.call,
            );
            if started.is_err() {
                *slot = None;
            }
            (attempt, started)
        };

        self.instrument("attempt_started", |i| {
            i.attempt_started(&self.method, attempt)
        });
        match started {
            Ok(()) => {
                trace!(parent: &self.span, attempt, deadline = ?options.deadline, "started attempt");
            }
            Err(status) => {
                warn!(
                    parent: &self.span,
                    attempt,
                    code = ?status.code(),
                    error = status.message(),
                    "failed to start {}. giving up",
                    self.method
                );
                self.instrument("failure", |i| i.failure(&self.method, status.code()));
                self.completion.set_failure(Error::Failed(status));
                self.finalize();
            }
        }
    }

    fn attempt_call_options(&self) -> CallOptions {
        let options = self.call_options.clone();
        if options.deadline.is_some() || self.streaming_read {
            options
        } else {
            options.with_deadline_after(UNARY_DEADLINE)
        }
    }

    fn on_message(&self, attempt: usize, message: X::Response) {
        trace!(parent: &self.span, attempt, "received message");
        let Err(status) = self.strategy_hook("on_message", |s| s.on_message(message)) else {
            return;
        };
        warn!(
            parent: &self.span,
            attempt,
            error = status.message(),
            "failed {}. giving up",
            self.method
        );
        let code = status.code();
        // The close that follows the cancel finalizes the operation.
        if self.completion.set_failure(Error::Failed(status)) {
            self.instrument("failure", |i| i.failure(&self.method, code));
            self.cancel_attempt("response handling failed");
        }
    }

    fn on_close(self: &Arc<Self>, attempt: usize, status: Status, trailers: MetadataMap) {
        let Some(in_flight) = self.call.lock().unwrap().take() else {
            warn!(
                parent: &self.span,
                attempt,
                code = ?status.code(),
                "ignoring close of {} attempt that isn't in flight",
                self.method
            );
            return;
        };

        let outcome = AttemptOutcome::new(status, trailers);
        self.instrument("attempt_finished", |i| {
            i.attempt_finished(
                &self.method,
                in_flight.attempt,
                in_flight.started.elapsed(),
                outcome.code(),
            )
        });

        if self.completion.is_done() {
            debug!(
                parent: &self.span,
                attempt,
                code = ?outcome.code(),
                "attempt closed after the operation was resolved"
            );
            self.finalize();
            return;
        }

        match outcome {
            AttemptOutcome::Success { trailers } => {
                match self.strategy_hook("on_ok", |s| s.on_ok(&trailers)) {
                    Ok(Finished::Complete(value)) => {
                        debug!(parent: &self.span, attempt, "finished {}", self.method);
                        self.completion.set_result(value);
                        self.finalize();
                    }
                    Ok(Finished::Incomplete(status)) => {
                        self.on_failure(attempt, status, &trailers)
                    }
                    Ok(Finished::Failed(status)) | Err(status) => {
                        self.fail(attempt, status, &trailers)
                    }
                }
            }
            AttemptOutcome::Failure { status, trailers } => {
                self.on_failure(attempt, status, &trailers)
            }
        }
    }

    fn on_failure(self: &Arc<Self>, attempt: usize, status: Status, trailers: &MetadataMap) {
        let decision = {
            let mut backoff = self.backoff.lock().unwrap();
            policy::decide(
                &self.retry_options,
                status.code(),
                attempt,
                self.idempotent,
                &mut backoff,
            )
        };

        match decision {
            // The strategy called an OK close incomplete without saying why.
            RetryDecision::Complete => self.fail(
                attempt,
                Status::internal(format!("incomplete response: {}", status.message())),
                trailers,
            ),

            RetryDecision::Cancelled => {
                debug!(
                    parent: &self.span,
                    attempt,
                    reason = status.message(),
                    "{} was cancelled",
                    self.method
                );
                self.completion.set_failure(Error::Cancelled {
                    reason: status.message().to_owned(),
                });
                self.finalize();
            }

            RetryDecision::FatalFailure => self.fail(attempt, status, trailers),

            RetryDecision::RetriesExhausted => {
                warn!(
                    parent: &self.span,
                    attempt,
                    code = ?status.code(),
                    error = status.message(),
                    ?trailers,
                    "failed {}. exhausted retries",
                    self.method
                );
                self.instrument("retries_exhausted", |i| {
                    i.retries_exhausted(&self.method, attempt)
                });
                self.completion.set_failure(Error::RetriesExhausted {
                    attempts: attempt,
                    last: status,
                });
                self.finalize();
            }

            RetryDecision::RetryAfter(backoff) => {
                warn!(
                    parent: &self.span,
                    attempt,
                    code = ?status.code(),
                    error = status.message(),
                    ?trailers,
                    ?backoff,
                    "failed attempt at {}. will retry after backoff",
                    self.method
                );
                self.instrument("retry", |i| i.retry(&self.method, backoff));
                let this = Arc::clone(self);
                self.scheduler
                    .schedule(backoff, Box::new(move || this.run_attempt()));
            }
        }
    }

    fn fail(&self, attempt: usize, status: Status, trailers: &MetadataMap) {
        warn!(
            parent: &self.span,
            attempt,
            code = ?status.code(),
            error = status.message(),
            ?trailers,
            "failed {}. giving up",
            self.method
        );
        self.instrument("failure", |i| i.failure(&self.method, status.code()));
        self.completion.set_failure(Error::Failed(status));
        self.finalize();
    }

    fn cancel_attempt(&self, reason: &str) {
        let slot = self.call.lock().unwrap();
        if let Some(in_flight) = slot.as_ref() {
            debug!(
                parent: &self.span,
                attempt = in_flight.attempt,
                reason,
                "cancelling attempt"
            );
            in_flight.call.cancel(reason);
        }
    }

    fn finalize(&self) {
        if self.finalized.swap(true, Ordering::SeqCst) {
            return;
        }
        let code = match self.completion.try_get() {
            Some(Ok(_)) => Code::Ok,
            Some(Err(err)) => err.code(),
            None => Code::Unknown,
        };
        self.span
            .record("attempts", self.attempts.load(Ordering::SeqCst));
        self.span.record("code", format!("{code:?}"));
        let elapsed = self.started.elapsed();
        self.instrument("operation_finished", |i| {
            i.operation_finished(&self.method, elapsed, code)
        });
    }

    /// Runs a request strategy callback. A panic fails the operation with
    /// `INTERNAL` rather than unwinding into the transport.
    fn strategy_hook<R, F>(&self, hook: &str, f: F) -> Result<R, Status>
    where
        F: FnOnce(&mut S) -> R,
    {
        let mut strategy = self.strategy.lock().unwrap();
        catch_unwind(AssertUnwindSafe(|| f(&mut *strategy))).map_err(|panic| {
            Status::internal(format!(
                "request strategy panicked in {hook}: {}",
                panic_message(panic.as_ref())
            ))
        })
    }

    fn instrument<F>(&self, hook: &str, f: F)
    where
        F: FnOnce(&dyn Instrumentation),
    {
        if let Err(panic) = catch_unwind(AssertUnwindSafe(|| f(self.instrumentation.as_ref()))) {
            warn!(
                parent: &self.span,
                hook,
                panic = panic_message(panic.as_ref()),
                "instrumentation panicked"
            );
        }
    }
}

struct AttemptListener<X, S>
where
    X: Transport,
    S: RequestStrategy<X::Request, X::Response>,
{
    operation: Arc<Inner<X, S>>,
    attempt: usize,
}

impl<X, S> CallListener<X::Response> for AttemptListener<X, S>
where
    X: Transport,
    S: RequestStrategy<X::Request, X::Response>,
{
    fn on_headers(&self, _headers: MetadataMap) {
        trace!(parent: &self.operation.span, attempt = self.attempt, "received headers");
    }

    fn on_message(&self, message: X::Response) {
        self.operation.on_message(self.attempt, message);
    }

    fn on_close(&self, status: Status, trailers: MetadataMap) {
        self.operation.on_close(self.attempt, status, trailers);
    }
}

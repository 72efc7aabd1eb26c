// Most of these tests drive an operation by hand: `FakeTransport` records the
// calls it's asked to make and lets the test close them, and
// `ManualScheduler` holds on to retries until the test runs them. The tests
// at the end use real tokio tasks and timers (with paused time) instead.

use expect_test::expect;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::time::{sleep, Instant};
use tonic::metadata::MetadataMap;
use tonic::{Code, Status};

use super::*;

const METHOD: &str = "test.v1.Service/Method";

#[derive(Clone, Default)]
struct FakeTransport(Arc<Mutex<FakeState>>);

#[derive(Default)]
struct FakeState {
    calls: Vec<FakeCallState>,
    start_errors: VecDeque<Status>,
}

struct FakeCallState {
    options: CallOptions,
    request: Option<String>,
    metadata: Option<MetadataMap>,
    listener: Option<Arc<dyn CallListener<String>>>,
    cancels: Arc<Mutex<Vec<String>>>,
}

struct FakeCall {
    cancels: Arc<Mutex<Vec<String>>>,
}

impl ClientCall for FakeCall {
    fn cancel(&self, reason: &str) {
        self.cancels.lock().unwrap().push(reason.to_owned());
    }
}

impl Transport for FakeTransport {
    type Request = String;
    type Response = String;
    type Call = FakeCall;

    fn method_name(&self) -> &str {
        METHOD
    }

    fn new_call(&self, options: &CallOptions) -> FakeCall {
        let cancels = Arc::new(Mutex::new(Vec::new()));
        self.0.lock().unwrap().calls.push(FakeCallState {
            options: options.clone(),
            request: None,
            metadata: None,
            listener: None,
            cancels: cancels.clone(),
        });
        FakeCall { cancels }
    }

    fn start(
        &self,
        request: String,
        listener: Arc<dyn CallListener<String>>,
        metadata: MetadataMap,
        _call: &FakeCall,
    ) -> Result<(), Status> {
        let mut state = self.0.lock().unwrap();
        if let Some(status) = state.start_errors.pop_front() {
            return Err(status);
        }
        let call = state.calls.last_mut().unwrap();
        call.request = Some(request);
        call.metadata = Some(metadata);
        call.listener = Some(listener);
        Ok(())
    }
}

impl FakeTransport {
    fn fail_next_start(&self, status: Status) {
        self.0.lock().unwrap().start_errors.push_back(status);
    }

    fn listener(&self) -> Arc<dyn CallListener<String>> {
        self.0
            .lock()
            .unwrap()
            .calls
            .last()
            .and_then(|call| call.listener.clone())
            .expect("no call was started")
    }

    fn respond(&self, message: &str) {
        self.listener().on_message(message.to_owned());
    }

    fn close(&self, status: Status) {
        self.listener().on_close(status, MetadataMap::new());
    }

    /// Calls opened, including those that failed to start.
    fn calls(&self) -> usize {
        self.0.lock().unwrap().calls.len()
    }

    fn attempts(&self) -> usize {
        let state = self.0.lock().unwrap();
        state
            .calls
            .iter()
            .filter(|call| call.listener.is_some())
            .count()
    }

    fn cancels(&self) -> Vec<String> {
        let state = self.0.lock().unwrap();
        state
            .calls
            .iter()
            .flat_map(|call| call.cancels.lock().unwrap().clone())
            .collect()
    }

    fn call_options(&self) -> Vec<CallOptions> {
        let state = self.0.lock().unwrap();
        state.calls.iter().map(|call| call.options.clone()).collect()
    }

    fn deadlines(&self) -> Vec<Option<Instant>> {
        let state = self.0.lock().unwrap();
        state.calls.iter().map(|call| call.options.deadline).collect()
    }

    fn requests(&self) -> Vec<String> {
        let state = self.0.lock().unwrap();
        state
            .calls
            .iter()
            .filter_map(|call| call.request.clone())
            .collect()
    }

    fn metadata_values(&self, key: &str) -> Vec<String> {
        let state = self.0.lock().unwrap();
        state
            .calls
            .iter()
            .filter_map(|call| call.metadata.as_ref()?.get(key)?.to_str().ok())
            .map(str::to_owned)
            .collect()
    }
}

#[derive(Clone, Default)]
struct ManualScheduler(Arc<Mutex<ManualState>>);

#[derive(Default)]
struct ManualState {
    delays: Vec<Duration>,
    pending: VecDeque<Box<dyn FnOnce() + Send>>,
}

impl Scheduler for ManualScheduler {
    fn schedule(&self, delay: Duration, task: Box<dyn FnOnce() + Send>) {
        let mut state = self.0.lock().unwrap();
        state.delays.push(delay);
        state.pending.push_back(task);
    }
}

impl ManualScheduler {
    fn run_next(&self) {
        let task = self
            .0
            .lock()
            .unwrap()
            .pending
            .pop_front()
            .expect("nothing scheduled");
        task();
    }

    fn pending(&self) -> usize {
        self.0.lock().unwrap().pending.len()
    }

    fn delays(&self) -> Vec<Duration> {
        self.0.lock().unwrap().delays.clone()
    }
}

#[derive(Clone, Default)]
struct TestLog(Arc<Mutex<Vec<String>>>);

impl TestLog {
    fn push(&self, line: String) {
        self.0.lock().unwrap().push(line);
    }

    fn dump(&self) -> String {
        let mut lines = self.0.lock().unwrap().clone();
        lines.push(String::new());
        lines.join("\n")
    }
}

// serialization of deterministic hook arguments
impl Instrumentation for TestLog {
    fn operation_started(&self, method: &str) {
        self.push(format!("operation_started {method}"));
    }

    fn operation_finished(&self, _method: &str, _elapsed: Duration, code: Code) {
        self.push(format!("operation_finished {code:?}"));
    }

    fn attempt_started(&self, _method: &str, attempt: usize) {
        self.push(format!("attempt_started {attempt}"));
    }

    fn attempt_finished(&self, _method: &str, attempt: usize, _elapsed: Duration, code: Code) {
        self.push(format!("attempt_finished {attempt} {code:?}"));
    }

    fn retry(&self, _method: &str, backoff: Duration) {
        self.push(format!("retry {backoff:?}"));
    }

    fn failure(&self, _method: &str, code: Code) {
        self.push(format!("failure {code:?}"));
    }

    fn retries_exhausted(&self, _method: &str, attempts: usize) {
        self.push(format!("retries_exhausted {attempts}"));
    }
}

struct PanickingInstrumentation;

impl Instrumentation for PanickingInstrumentation {
    fn operation_started(&self, _method: &str) {
        panic!("operation_started");
    }

    fn operation_finished(&self, _method: &str, _elapsed: Duration, _code: Code) {
        panic!("operation_finished");
    }

    fn attempt_started(&self, _method: &str, _attempt: usize) {
        panic!("attempt_started");
    }

    fn attempt_finished(&self, _method: &str, _attempt: usize, _elapsed: Duration, _code: Code) {
        panic!("attempt_finished");
    }

    fn retry(&self, _method: &str, _backoff: Duration) {
        panic!("{}", String::from("retry"));
    }
}

/// 10ms, then 20ms, then the next 40ms would exceed the budget.
fn test_options() -> RetryOptions {
    RetryOptions::default().with_exponential_backoff(
        Duration::from_millis(10),
        2.0,
        Duration::from_millis(35),
    )
}

struct Harness {
    transport: FakeTransport,
    scheduler: ManualScheduler,
    log: TestLog,
}

impl Harness {
    fn new() -> Self {
        Self {
            transport: FakeTransport::default(),
            scheduler: ManualScheduler::default(),
            log: TestLog::default(),
        }
    }

    fn operation<S>(&self, strategy: S) -> RetryingOperation<FakeTransport, S>
    where
        S: RequestStrategy<String, String>,
    {
        RetryingOperation::new(
            self.transport.clone(),
            strategy,
            String::from("request"),
            Arc::new(self.scheduler.clone()),
        )
        .with_retry_options(test_options())
        .with_instrumentation(Arc::new(self.log.clone()))
    }
}

#[test]
fn test_success_first_attempt() {
    let h = Harness::new();
    let handle = h.operation(Unary::idempotent()).start();
    assert!(!handle.is_done());
    assert_eq!(h.transport.attempts(), 1);
    assert_eq!(h.transport.requests(), ["request"]);

    h.transport.respond("hello");
    h.transport.close(Status::ok(""));
    assert_eq!(handle.try_get().unwrap().unwrap(), "hello");
    assert_eq!(h.scheduler.pending(), 0);
    expect![[r#"
        operation_started test.v1.Service/Method
        attempt_started 1
        attempt_finished 1 Ok
        operation_finished Ok
    "#]]
    .assert_eq(&h.log.dump());
}

#[test]
fn test_retries_then_success() {
    let h = Harness::new();
    let mut metadata = MetadataMap::new();
    metadata.insert("x-request-params", "table=users".parse().unwrap());
    let handle = h
        .operation(Unary::idempotent())
        .with_metadata(metadata)
        .start();

    h.transport.close(Status::unavailable("down"));
    assert!(!handle.is_done());
    assert_eq!(h.transport.calls(), 1);
    h.scheduler.run_next();
    h.transport.close(Status::deadline_exceeded("slow"));
    h.scheduler.run_next();
    h.transport.respond("hello");
    h.transport.close(Status::ok(""));

    assert_eq!(handle.try_get().unwrap().unwrap(), "hello");
    assert_eq!(h.transport.attempts(), 3);
    assert_eq!(
        h.scheduler.delays(),
        [Duration::from_millis(10), Duration::from_millis(20)]
    );
    assert_eq!(
        h.transport.metadata_values("x-request-params"),
        ["table=users", "table=users", "table=users"]
    );
    expect![[r#"
        operation_started test.v1.Service/Method
        attempt_started 1
        attempt_finished 1 Unavailable
        retry 10ms
        attempt_started 2
        attempt_finished 2 DeadlineExceeded
        retry 20ms
        attempt_started 3
        attempt_finished 3 Ok
        operation_finished Ok
    "#]]
    .assert_eq(&h.log.dump());
}

#[test]
fn test_retries_exhausted() {
    let h = Harness::new();
    let handle = h.operation(Unary::idempotent()).start();
    h.transport.close(Status::unavailable("down 1"));
    h.scheduler.run_next();
    h.transport.close(Status::unavailable("down 2"));
    h.scheduler.run_next();
    h.transport.close(Status::unavailable("down 3"));

    assert_eq!(h.scheduler.pending(), 0);
    assert_eq!(h.transport.attempts(), 3);
    match handle.try_get() {
        Some(Err(Error::RetriesExhausted { attempts, last })) => {
            assert_eq!(attempts, 3);
            assert_eq!(last.code(), Code::Unavailable);
            assert_eq!(last.message(), "down 3");
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    expect![[r#"
        operation_started test.v1.Service/Method
        attempt_started 1
        attempt_finished 1 Unavailable
        retry 10ms
        attempt_started 2
        attempt_finished 2 Unavailable
        retry 20ms
        attempt_started 3
        attempt_finished 3 Unavailable
        retries_exhausted 3
        operation_finished Unavailable
    "#]]
    .assert_eq(&h.log.dump());
}

#[test]
fn test_retries_disabled() {
    let h = Harness::new();
    let handle = h
        .operation(Unary::idempotent())
        .with_retry_options(test_options().with_retries_enabled(false))
        .start();
    h.transport.close(Status::unavailable("down"));

    assert!(matches!(
        handle.try_get(),
        Some(Err(Error::Failed(status))) if status.code() == Code::Unavailable
    ));
    assert_eq!(h.transport.attempts(), 1);
    assert!(h.scheduler.delays().is_empty());
    expect![[r#"
        operation_started test.v1.Service/Method
        attempt_started 1
        attempt_finished 1 Unavailable
        failure Unavailable
        operation_finished Unavailable
    "#]]
    .assert_eq(&h.log.dump());
}

#[test]
fn test_non_retryable_code() {
    let h = Harness::new();
    let handle = h.operation(Unary::idempotent()).start();
    h.transport.close(Status::invalid_argument("bad row key"));

    assert!(matches!(
        handle.try_get(),
        Some(Err(Error::Failed(status))) if status.code() == Code::InvalidArgument
    ));
    assert_eq!(h.transport.attempts(), 1);
    assert_eq!(h.scheduler.pending(), 0);
}

#[test]
fn test_non_idempotent_ambiguous_failure() {
    let h = Harness::new();
    let handle = h.operation(Unary::non_idempotent()).start();
    h.transport.close(Status::aborted("conflict"));

    assert!(matches!(
        handle.try_get(),
        Some(Err(Error::Failed(status))) if status.code() == Code::Aborted
    ));
    assert_eq!(h.transport.attempts(), 1);
    assert_eq!(h.scheduler.pending(), 0);
}

#[test]
fn test_non_idempotent_never_reached_server() {
    let h = Harness::new();
    let handle = h.operation(Unary::non_idempotent()).start();
    h.transport.close(Status::unauthenticated("token expired"));
    h.scheduler.run_next();
    h.transport.close(Status::unavailable("no backend"));
    h.scheduler.run_next();
    h.transport.respond("appended");
    h.transport.close(Status::ok(""));

    assert_eq!(handle.try_get().unwrap().unwrap(), "appended");
    assert_eq!(h.transport.attempts(), 3);
}

#[test]
fn test_cancel_in_flight() {
    let h = Harness::new();
    let handle = h.operation(Unary::idempotent()).start();

    assert!(handle.cancel());
    assert!(handle.is_cancelled());
    assert_eq!(h.transport.cancels(), [USER_CANCELLED]);
    assert!(!handle.cancel());
    assert!(!handle.cancel_with_reason("again"));
    assert_eq!(h.transport.cancels(), [USER_CANCELLED]);

    // The transport then reports the call as cancelled.
    h.transport.close(Status::cancelled(USER_CANCELLED));
    assert_eq!(h.scheduler.pending(), 0);
    assert_eq!(h.transport.attempts(), 1);
    assert!(matches!(
        handle.try_get(),
        Some(Err(Error::Cancelled { reason })) if reason == USER_CANCELLED
    ));
    expect![[r#"
        operation_started test.v1.Service/Method
        attempt_started 1
        attempt_finished 1 Cancelled
        operation_finished Cancelled
    "#]]
    .assert_eq(&h.log.dump());
}

#[test]
fn test_cancel_then_retryable_close() {
    let h = Harness::new();
    let handle = h.operation(Unary::idempotent()).start();
    handle.cancel();
    // The attempt failed before the transport noticed the cancellation.
    h.transport.close(Status::unavailable("down"));

    assert_eq!(h.scheduler.pending(), 0);
    assert!(handle.is_cancelled());
    expect![[r#"
        operation_started test.v1.Service/Method
        attempt_started 1
        attempt_finished 1 Unavailable
        operation_finished Cancelled
    "#]]
    .assert_eq(&h.log.dump());
}

#[test]
fn test_cancel_during_backoff() {
    let h = Harness::new();
    let handle = h.operation(Unary::idempotent()).start();
    h.transport.close(Status::unavailable("down"));
    assert_eq!(h.scheduler.pending(), 1);

    assert!(handle.cancel_with_reason("shutting down"));
    // Nothing is in flight to cancel.
    assert!(h.transport.cancels().is_empty());

    h.scheduler.run_next();
    assert_eq!(h.transport.calls(), 1);
    assert!(matches!(
        handle.try_get(),
        Some(Err(Error::Cancelled { reason })) if reason == "shutting down"
    ));
    expect![[r#"
        operation_started test.v1.Service/Method
        attempt_started 1
        attempt_finished 1 Unavailable
        retry 10ms
        operation_finished Cancelled
    "#]]
    .assert_eq(&h.log.dump());
}

#[test]
fn test_cancel_before_start() {
    let h = Harness::new();
    let operation = h.operation(Unary::<String>::idempotent());
    assert!(operation.cancel());
    let handle = operation.start();

    assert_eq!(h.transport.calls(), 0);
    assert!(handle.is_cancelled());
    expect![[r#"
        operation_started test.v1.Service/Method
        operation_finished Cancelled
    "#]]
    .assert_eq(&h.log.dump());
}

#[test]
fn test_cancel_after_completion() {
    let h = Harness::new();
    let handle = h.operation(Unary::idempotent()).start();
    h.transport.respond("hello");
    h.transport.close(Status::ok(""));

    assert!(!handle.cancel());
    assert!(h.transport.cancels().is_empty());
    assert_eq!(handle.try_get().unwrap().unwrap(), "hello");
}

#[test]
fn test_server_cancelled() {
    let h = Harness::new();
    let handle = h.operation(Unary::<String>::idempotent()).start();
    h.transport.close(Status::cancelled("server went away"));

    assert!(matches!(
        handle.try_get(),
        Some(Err(Error::Cancelled { reason })) if reason == "server went away"
    ));
    assert_eq!(h.scheduler.pending(), 0);
    expect![[r#"
        operation_started test.v1.Service/Method
        attempt_started 1
        attempt_finished 1 Cancelled
        operation_finished Cancelled
    "#]]
    .assert_eq(&h.log.dump());
}

#[test]
fn test_stale_close_is_ignored() {
    let h = Harness::new();
    let handle = h.operation(Unary::idempotent()).start();
    h.transport.respond("hello");
    h.transport.close(Status::ok(""));
    h.transport.close(Status::unavailable("late"));

    assert_eq!(handle.try_get().unwrap().unwrap(), "hello");
    assert_eq!(h.scheduler.pending(), 0);
    expect![[r#"
        operation_started test.v1.Service/Method
        attempt_started 1
        attempt_finished 1 Ok
        operation_finished Ok
    "#]]
    .assert_eq(&h.log.dump());
}

#[test]
fn test_ok_without_response() {
    let h = Harness::new();
    let handle = h.operation(Unary::<String>::idempotent()).start();
    h.transport.close(Status::ok(""));

    assert!(matches!(
        handle.try_get(),
        Some(Err(Error::Failed(status))) if status.code() == Code::Internal
    ));
    assert_eq!(h.scheduler.pending(), 0);
}

#[test]
fn test_incomplete_response_is_retried() {
    let h = Harness::new();
    let strategy = FnStrategy::new(
        |_: &String| true,
        |messages: &[String], _: &MetadataMap| match messages {
            [] => Finished::Incomplete(Status::unavailable("stream ended early")),
            _ => Finished::Complete(messages.join(",")),
        },
    );
    let handle = h.operation(strategy).start();
    h.transport.close(Status::ok(""));
    assert_eq!(h.scheduler.delays(), [Duration::from_millis(10)]);
    h.scheduler.run_next();
    h.transport.respond("a");
    h.transport.respond("b");
    h.transport.close(Status::ok(""));

    assert_eq!(handle.try_get().unwrap().unwrap(), "a,b");
    assert_eq!(h.transport.attempts(), 2);
}

#[test]
fn test_incomplete_with_ok_status_fails() {
    let h = Harness::new();
    let strategy = FnStrategy::new(
        |_: &String| true,
        |_: &[String], _: &MetadataMap| Finished::<()>::Incomplete(Status::ok("")),
    );
    let handle = h.operation(strategy).start();
    h.transport.close(Status::ok(""));

    assert!(matches!(
        handle.try_get(),
        Some(Err(Error::Failed(status))) if status.code() == Code::Internal
    ));
    assert_eq!(h.scheduler.pending(), 0);
}

#[test]
fn test_streaming_read_drops_partial_output() {
    let h = Harness::new();
    let handle = h.operation(StreamingRead::scan()).start();
    h.transport.respond("row 1");
    h.transport.respond("row 2");
    h.transport.close(Status::unavailable("connection reset"));
    h.scheduler.run_next();
    h.transport.respond("row 1");
    h.transport.respond("row 2");
    h.transport.respond("row 3");
    h.transport.close(Status::ok(""));

    assert_eq!(
        handle.try_get().unwrap().unwrap(),
        ["row 1", "row 2", "row 3"]
    );
}

#[test]
fn test_start_failure() {
    let h = Harness::new();
    h.transport.fail_next_start(Status::unavailable("no connection"));
    let handle = h.operation(Unary::<String>::idempotent()).start();

    assert!(matches!(
        handle.try_get(),
        Some(Err(Error::Failed(status))) if status.code() == Code::Unavailable
    ));
    assert_eq!(h.transport.calls(), 1);
    assert_eq!(h.transport.attempts(), 0);
    assert_eq!(h.scheduler.pending(), 0);

    // The failed call isn't left in flight.
    assert!(!handle.cancel());
    assert!(h.transport.cancels().is_empty());
    expect![[r#"
        operation_started test.v1.Service/Method
        attempt_started 1
        failure Unavailable
        operation_finished Unavailable
    "#]]
    .assert_eq(&h.log.dump());
}

#[test]
fn test_panicking_instrumentation() {
    let h = Harness::new();
    let handle = h
        .operation(Unary::idempotent())
        .with_instrumentation(Arc::new(PanickingInstrumentation))
        .start();
    h.transport.close(Status::unavailable("down"));
    h.scheduler.run_next();
    h.transport.respond("hello");
    h.transport.close(Status::ok(""));

    assert_eq!(handle.try_get().unwrap().unwrap(), "hello");
    assert_eq!(h.transport.attempts(), 2);
}

/// Panics from whichever callback is named.
struct Misbehaving(&'static str);

impl RequestStrategy<String, String> for Misbehaving {
    type Output = ();

    fn is_idempotent(&self, _request: &String) -> bool {
        true
    }

    fn attempt_request(&mut self, original: &String) -> String {
        if self.0 == "attempt_request" {
            panic!("no request");
        }
        original.clone()
    }

    fn on_message(&mut self, _message: String) {
        if self.0 == "on_message" {
            panic!("cannot decode");
        }
    }

    fn on_ok(&mut self, _trailers: &MetadataMap) -> Finished<()> {
        Finished::Complete(())
    }
}

fn assert_internal<T: std::fmt::Debug>(outcome: Option<Result<T, Error>>, message: &str) {
    match outcome {
        Some(Err(Error::Failed(status))) => {
            assert_eq!(status.code(), Code::Internal);
            assert_eq!(status.message(), message);
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
}

#[test]
fn test_panicking_on_ok_fails_operation() {
    let h = Harness::new();
    let strategy = FnStrategy::new(
        |_: &String| true,
        |_: &[String], _: &MetadataMap| -> Finished<String> { panic!("malformed row") },
    );
    let handle = h.operation(strategy).start();
    h.transport.respond("row");
    h.transport.close(Status::ok(""));

    assert_internal(
        handle.try_get(),
        "request strategy panicked in on_ok: malformed row",
    );
    assert_eq!(h.scheduler.pending(), 0);
    expect![[r#"
        operation_started test.v1.Service/Method
        attempt_started 1
        attempt_finished 1 Ok
        failure Internal
        operation_finished Internal
    "#]]
    .assert_eq(&h.log.dump());
}

#[test]
fn test_panicking_on_message_cancels_attempt() {
    let h = Harness::new();
    let handle = h.operation(Misbehaving("on_message")).start();
    h.transport.respond("row");

    assert_internal(
        handle.try_get(),
        "request strategy panicked in on_message: cannot decode",
    );
    assert_eq!(h.transport.cancels(), ["response handling failed"]);

    h.transport.close(Status::cancelled("response handling failed"));
    assert_eq!(h.scheduler.pending(), 0);
    assert_eq!(h.transport.attempts(), 1);
    expect![[r#"
        operation_started test.v1.Service/Method
        attempt_started 1
        failure Internal
        attempt_finished 1 Cancelled
        operation_finished Internal
    "#]]
    .assert_eq(&h.log.dump());
}

#[test]
fn test_panicking_attempt_request_fails_operation() {
    let h = Harness::new();
    let handle = h.operation(Misbehaving("attempt_request")).start();

    assert_internal(
        handle.try_get(),
        "request strategy panicked in attempt_request: no request",
    );
    assert_eq!(h.transport.calls(), 0);
    expect![[r#"
        operation_started test.v1.Service/Method
        failure Internal
        operation_finished Internal
    "#]]
    .assert_eq(&h.log.dump());
}

#[test]
fn test_panicking_listener_still_cancels_attempt() {
    let h = Harness::new();
    let handle = h.operation(Unary::<String>::idempotent()).start();
    handle.add_listener(|_| panic!("listener"));

    assert!(handle.cancel());
    assert!(handle.is_cancelled());
    assert_eq!(h.transport.cancels(), [USER_CANCELLED]);

    h.transport.close(Status::cancelled(USER_CANCELLED));
    expect![[r#"
        operation_started test.v1.Service/Method
        attempt_started 1
        attempt_finished 1 Cancelled
        operation_finished Cancelled
    "#]]
    .assert_eq(&h.log.dump());
}

#[test]
fn test_listeners_see_outcome() {
    let h = Harness::new();
    let handle = h.operation(Unary::idempotent()).start();
    let seen = Arc::new(Mutex::new(None));
    let s = seen.clone();
    handle.add_listener(move |outcome: &Result<String, Error>| {
        *s.lock().unwrap() = Some(outcome.as_ref().map(String::clone).map_err(Error::code));
    });
    h.transport.respond("hello");
    h.transport.close(Status::ok(""));

    assert_eq!(*seen.lock().unwrap(), Some(Ok(String::from("hello"))));
}

#[tokio::test(start_paused = true)]
async fn test_unary_deadline_is_fresh_per_attempt() {
    let h = Harness::new();
    let start = Instant::now();
    let _handle = h.operation(Unary::<String>::idempotent()).start();
    tokio::time::advance(Duration::from_millis(10)).await;
    h.transport.close(Status::unavailable("down"));
    h.scheduler.run_next();

    assert_eq!(
        h.transport.deadlines(),
        [
            Some(start + UNARY_DEADLINE),
            Some(start + Duration::from_millis(10) + UNARY_DEADLINE)
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_explicit_deadline_is_reused() {
    let h = Harness::new();
    let deadline = Instant::now() + Duration::from_secs(5);
    let options = CallOptions {
        wait_for_ready: true,
        authority: Some(String::from("kv.example.com")),
        ..CallOptions::default()
    };
    let _handle = h
        .operation(Unary::<String>::idempotent())
        .with_call_options(options.with_deadline(deadline))
        .start();
    tokio::time::advance(Duration::from_millis(10)).await;
    h.transport.close(Status::unavailable("down"));
    h.scheduler.run_next();

    assert_eq!(h.transport.deadlines(), [Some(deadline), Some(deadline)]);
    let calls = h.transport.call_options();
    assert_eq!(calls.len(), 2);
    for options in calls {
        assert!(options.wait_for_ready);
        assert_eq!(options.authority.as_deref(), Some("kv.example.com"));
    }
}

#[tokio::test(start_paused = true)]
async fn test_streaming_read_deadlines() {
    let h = Harness::new();
    let start = Instant::now();
    let _scan = h.operation(StreamingRead::<String>::scan()).start();
    let _point_read = h.operation(StreamingRead::<String>::point_read()).start();

    assert_eq!(
        h.transport.deadlines(),
        [None, Some(start + UNARY_DEADLINE)]
    );
}

/// Closes each started call from a tokio task according to a script. Once
/// the script runs out, calls stay open until cancelled.
#[derive(Clone)]
struct ScriptedTransport {
    runtime: Handle,
    script: Arc<Mutex<VecDeque<(Duration, Status)>>>,
    starts: Arc<Mutex<Vec<Instant>>>,
    cancels: Arc<Mutex<Vec<String>>>,
}

struct ScriptedCall {
    cancels: Arc<Mutex<Vec<String>>>,
    cancel_tx: Mutex<Option<oneshot::Sender<String>>>,
    cancel_rx: Mutex<Option<oneshot::Receiver<String>>>,
}

impl ScriptedTransport {
    fn new<I>(runtime: Handle, script: I) -> Self
    where
        I: IntoIterator<Item = (Duration, Status)>,
    {
        Self {
            runtime,
            script: Arc::new(Mutex::new(script.into_iter().collect())),
            starts: Arc::new(Mutex::new(Vec::new())),
            cancels: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn start_offsets(&self, from: Instant) -> Vec<u128> {
        let starts = self.starts.lock().unwrap();
        starts.iter().map(|t| (*t - from).as_millis()).collect()
    }
}

impl ClientCall for ScriptedCall {
    fn cancel(&self, reason: &str) {
        self.cancels.lock().unwrap().push(reason.to_owned());
        if let Some(tx) = self.cancel_tx.lock().unwrap().take() {
            let _ = tx.send(reason.to_owned());
        }
    }
}

impl Transport for ScriptedTransport {
    type Request = String;
    type Response = String;
    type Call = ScriptedCall;

    fn method_name(&self) -> &str {
        METHOD
    }

    fn new_call(&self, _options: &CallOptions) -> ScriptedCall {
        let (tx, rx) = oneshot::channel();
        ScriptedCall {
            cancels: self.cancels.clone(),
            cancel_tx: Mutex::new(Some(tx)),
            cancel_rx: Mutex::new(Some(rx)),
        }
    }

    fn start(
        &self,
        _request: String,
        listener: Arc<dyn CallListener<String>>,
        _metadata: MetadataMap,
        call: &ScriptedCall,
    ) -> Result<(), Status> {
        let Some(cancelled) = call.cancel_rx.lock().unwrap().take() else {
            return Err(Status::internal("call started twice"));
        };
        let step = self.script.lock().unwrap().pop_front();
        self.starts.lock().unwrap().push(Instant::now());
        self.runtime.spawn(async move {
            let scripted = async move {
                match step {
                    Some((latency, status)) => {
                        sleep(latency).await;
                        status
                    }
                    None => std::future::pending().await,
                }
            };
            let status = tokio::select! {
                status = scripted => status,
                Ok(reason) = cancelled => Status::cancelled(reason),
            };
            if status.code() == Code::Ok {
                listener.on_message(String::from("done"));
            }
            listener.on_close(status, MetadataMap::new());
        });
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn test_retry_timing_until_exhausted() {
    let transport = ScriptedTransport::new(
        Handle::current(),
        vec![(Duration::ZERO, Status::unavailable("down")); 4],
    );
    let t0 = Instant::now();
    let result = RetryingOperation::new(
        transport.clone(),
        Unary::<String>::idempotent(),
        String::from("request"),
        Arc::new(TokioScheduler::current()),
    )
    .with_retry_options(test_options())
    .result()
    .await;

    assert!(matches!(
        result,
        Err(Error::RetriesExhausted { attempts: 3, last }) if last.code() == Code::Unavailable
    ));
    assert_eq!(transport.start_offsets(t0), [0, 10, 30]);
}

#[tokio::test(start_paused = true)]
async fn test_result_after_retry() {
    let transport = ScriptedTransport::new(
        Handle::current(),
        [
            (Duration::from_millis(3), Status::aborted("contention")),
            (Duration::from_millis(3), Status::ok("")),
        ],
    );
    let t0 = Instant::now();
    let result = RetryingOperation::new(
        transport.clone(),
        Unary::<String>::idempotent(),
        String::from("request"),
        Arc::new(TokioScheduler::current()),
    )
    .with_retry_options(test_options())
    .result()
    .await;

    assert_eq!(result.unwrap(), "done");
    assert_eq!(transport.start_offsets(t0), [0, 13]);
}

#[tokio::test(start_paused = true)]
async fn test_dropping_result_cancels() {
    let transport = ScriptedTransport::new(Handle::current(), Vec::new());
    let operation = RetryingOperation::new(
        transport.clone(),
        Unary::<String>::idempotent(),
        String::from("request"),
        Arc::new(TokioScheduler::current()),
    );
    let handle = operation.completion();

    let timed_out = tokio::time::timeout(Duration::from_secs(1), operation.result()).await;
    assert!(timed_out.is_err());
    assert!(matches!(
        handle.try_get(),
        Some(Err(Error::Cancelled { reason })) if reason == INTERRUPTED
    ));
    assert_eq!(*transport.cancels.lock().unwrap(), [INTERRUPTED]);
}

#[test]
fn test_blocking_result() {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let transport = ScriptedTransport::new(
        runtime.handle().clone(),
        [
            (Duration::from_millis(1), Status::unavailable("down")),
            (Duration::from_millis(1), Status::ok("")),
        ],
    );
    let result = RetryingOperation::new(
        transport.clone(),
        Unary::<String>::idempotent(),
        String::from("request"),
        Arc::new(TokioScheduler::new(runtime.handle().clone())),
    )
    .with_retry_options(test_options())
    .blocking_result();

    assert_eq!(result.unwrap(), "done");
    assert_eq!(transport.starts.lock().unwrap().len(), 2);
}

//! Per-request-kind behavior plugged into a [`crate::RetryingOperation`].
use std::marker::PhantomData;
use tonic::metadata::MetadataMap;
use tonic::Status;

/// What a strategy makes of an attempt that closed with `OK`.
#[derive(Debug)]
pub enum Finished<T> {
    /// The operation succeeded with this value.
    Complete(T),
    /// The attempt ended early. The status is treated like a failed attempt,
    /// so it's retried if the status and request allow it.
    Incomplete(Status),
    /// The response is unusable. Fails the operation without retrying.
    Failed(Status),
}

/// Decides how a kind of request is retried and how the responses of an
/// attempt turn into the operation's result.
///
/// The operation calls these from whatever thread is driving the attempt,
/// one at a time.
pub trait RequestStrategy<Req, Resp>: Send + 'static {
    type Output: Clone + Send + 'static;

    /// Whether executing the request more than once is harmless.
    fn is_idempotent(&self, request: &Req) -> bool;

    /// Streaming reads may legitimately run for a long time, so they get no
    /// default deadline.
    fn is_streaming_read(&self, _request: &Req) -> bool {
        false
    }

    /// Returns the request to send for the next attempt. This lets a strategy
    /// narrow the request based on what earlier attempts already returned.
    fn attempt_request(&mut self, original: &Req) -> Req
    where
        Req: Clone,
    {
        original.clone()
    }

    /// Called right before each attempt is dispatched.
    fn on_attempt_start(&mut self) {}

    fn on_message(&mut self, message: Resp);

    fn on_ok(&mut self, trailers: &MetadataMap) -> Finished<Self::Output>;
}

/// A request with exactly one response message.
pub struct Unary<Resp> {
    idempotent: bool,
    response: Option<Resp>,
}

impl<Resp> Unary<Resp> {
    pub fn idempotent() -> Self {
        Self {
            idempotent: true,
            response: None,
        }
    }

    /// Only retried on codes that guarantee the server never saw the request.
    pub fn non_idempotent() -> Self {
        Self {
            idempotent: false,
            response: None,
        }
    }
}

impl<Req, Resp> RequestStrategy<Req, Resp> for Unary<Resp>
where
    Resp: Clone + Send + 'static,
{
    type Output = Resp;

    fn is_idempotent(&self, _request: &Req) -> bool {
        self.idempotent
    }

    fn on_attempt_start(&mut self) {
        self.response = None;
    }

    fn on_message(&mut self, message: Resp) {
        self.response = Some(message);
    }

    fn on_ok(&mut self, _trailers: &MetadataMap) -> Finished<Resp> {
        match self.response.take() {
            Some(response) => Finished::Complete(response),
            None => Finished::Failed(Status::internal(
                "call closed with OK but no response message",
            )),
        }
    }
}

/// A read that streams back any number of messages and is always safe to
/// repeat. Only the messages of the successful attempt are returned.
pub struct StreamingRead<Resp> {
    streaming: bool,
    messages: Vec<Resp>,
}

impl<Resp> StreamingRead<Resp> {
    /// A scan over a range. No deadline is applied by default.
    pub fn scan() -> Self {
        Self {
            streaming: true,
            messages: Vec::new(),
        }
    }

    /// A read of a single key. It's expected to be quick, so it gets the
    /// same default deadline as a unary request.
    pub fn point_read() -> Self {
        Self {
            streaming: false,
            messages: Vec::new(),
        }
    }
}

impl<Req, Resp> RequestStrategy<Req, Resp> for StreamingRead<Resp>
where
    Resp: Clone + Send + 'static,
{
    type Output = Vec<Resp>;

    fn is_idempotent(&self, _request: &Req) -> bool {
        true
    }

    fn is_streaming_read(&self, _request: &Req) -> bool {
        self.streaming
    }

    fn on_attempt_start(&mut self) {
        self.messages.clear();
    }

    fn on_message(&mut self, message: Resp) {
        self.messages.push(message);
    }

    fn on_ok(&mut self, _trailers: &MetadataMap) -> Finished<Vec<Resp>> {
        Finished::Complete(std::mem::take(&mut self.messages))
    }
}

/// Builds a strategy from closures, for one-off request kinds.
///
/// `on_ok` sees every message of the current attempt.
pub struct FnStrategy<Req, Resp, I, F> {
    idempotent: I,
    on_ok: F,
    messages: Vec<Resp>,
    _request: PhantomData<fn(&Req)>,
}

impl<Req, Resp, I, F> FnStrategy<Req, Resp, I, F> {
    pub fn new(idempotent: I, on_ok: F) -> Self {
        Self {
            idempotent,
            on_ok,
            messages: Vec::new(),
            _request: PhantomData,
        }
    }
}

impl<Req, Resp, I, F, T> RequestStrategy<Req, Resp> for FnStrategy<Req, Resp, I, F>
where
    Req: 'static,
    Resp: Send + 'static,
    I: Fn(&Req) -> bool + Send + 'static,
    F: FnMut(&[Resp], &MetadataMap) -> Finished<T> + Send + 'static,
    T: Clone + Send + 'static,
{
    type Output = T;

    fn is_idempotent(&self, request: &Req) -> bool {
        (self.idempotent)(request)
    }

    fn on_attempt_start(&mut self) {
        self.messages.clear();
    }

    fn on_message(&mut self, message: Resp) {
        self.messages.push(message);
    }

    fn on_ok(&mut self, trailers: &MetadataMap) -> Finished<T> {
        (self.on_ok)(&self.messages, trailers)
    }
}

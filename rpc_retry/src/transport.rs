//! The narrow interface to the RPC transport that carries each attempt.
//!
//! The shapes here follow gRPC's client call model: open a call with some
//! call options, start it with a request and a listener, and receive
//! lifecycle callbacks until exactly one close.
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tonic::metadata::MetadataMap;
use tonic::{Code, Status};

/// Per-call configuration handed to the [`Transport`] for each attempt.
///
/// The operation passes these through unchanged, except that it may fill in
/// [`Self::deadline`] for an attempt.
#[derive(Clone, Debug, Default)]
pub struct CallOptions {
    /// The point at which the transport should give up on the call.
    pub deadline: Option<Instant>,
    pub wait_for_ready: bool,
    pub authority: Option<String>,
}

impl CallOptions {
    pub fn with_deadline(self, deadline: Instant) -> Self {
        Self {
            deadline: Some(deadline),
            ..self
        }
    }

    /// Sets the deadline relative to now.
    pub fn with_deadline_after(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }
}

/// A handle to one opened call.
pub trait ClientCall: Send + 'static {
    /// Asks the transport to abort the call.
    ///
    /// This doesn't close the call by itself: the transport still delivers
    /// [`CallListener::on_close`], normally with a `CANCELLED` status.
    fn cancel(&self, reason: &str);
}

/// Receives the lifecycle callbacks of a started call.
pub trait CallListener<Resp>: Send + Sync {
    fn on_headers(&self, _headers: MetadataMap) {}

    fn on_message(&self, message: Resp);

    /// Called exactly once per started call. `status` has code `OK` when the
    /// call succeeded.
    fn on_close(&self, status: Status, trailers: MetadataMap);
}

/// Opens and starts calls for one RPC method.
///
/// Implementations must deliver listener callbacks from their own tasks or
/// threads: never synchronously from inside [`Transport::start`] or
/// [`ClientCall::cancel`]. A call whose `start` returned an error must not
/// deliver any callbacks.
pub trait Transport: Send + Sync + 'static {
    type Request: Clone + Send + Sync + 'static;
    type Response: Send + 'static;
    type Call: ClientCall;

    /// The full method name, like `google.bigtable.v2.Bigtable/MutateRow`.
    fn method_name(&self) -> &str;

    fn new_call(&self, options: &CallOptions) -> Self::Call;

    fn start(
        &self,
        request: Self::Request,
        listener: Arc<dyn CallListener<Self::Response>>,
        metadata: MetadataMap,
        call: &Self::Call,
    ) -> Result<(), Status>;
}

/// How a single attempt ended, as reported by the transport's close callback.
#[derive(Debug)]
pub enum AttemptOutcome {
    Success { trailers: MetadataMap },
    Failure { status: Status, trailers: MetadataMap },
}

impl AttemptOutcome {
    pub fn new(status: Status, trailers: MetadataMap) -> Self {
        if status.code() == Code::Ok {
            Self::Success { trailers }
        } else {
            Self::Failure { status, trailers }
        }
    }

    pub fn code(&self) -> Code {
        match self {
            Self::Success { .. } => Code::Ok,
            Self::Failure { status, .. } => status.code(),
        }
    }
}

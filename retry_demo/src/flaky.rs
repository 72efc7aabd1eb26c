//! An in-process key-value "server" that fails a set number of attempts
//! before answering.
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::time::{sleep_until, Instant};
use tonic::metadata::MetadataMap;
use tonic::{Code, Status};
use tracing::debug;

use rpc_retry::{CallListener, CallOptions, ClientCall, Transport};

#[derive(Clone, Debug)]
pub struct ReadRequest {
    pub key: String,
}

pub struct Config {
    pub failures: usize,
    pub failure_code: Code,
    pub latency: Duration,
    /// Rows returned by a scan. `None` serves unary reads.
    pub scan_rows: Option<usize>,
}

#[derive(Clone)]
pub struct FlakyTransport(Arc<Server>);

struct Server {
    failures_left: AtomicUsize,
    failure_code: Code,
    latency: Duration,
    scan_rows: Option<usize>,
    runtime: Handle,
}

impl FlakyTransport {
    pub fn new(config: Config, runtime: Handle) -> Self {
        Self(Arc::new(Server {
            failures_left: AtomicUsize::new(config.failures),
            failure_code: config.failure_code,
            latency: config.latency,
            scan_rows: config.scan_rows,
            runtime,
        }))
    }
}

impl Server {
    /// Returns true while there are failures left to inject.
    fn take_failure(&self) -> bool {
        self.failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn respond(&self, key: &str, listener: &dyn CallListener<String>) -> Status {
        if self.take_failure() {
            return Status::new(self.failure_code, "injected failure");
        }
        match self.scan_rows {
            None => listener.on_message(format!("value of {key}")),
            Some(rows) => {
                for i in 0..rows {
                    listener.on_message(format!("{key}/{i:04}"));
                }
            }
        }
        Status::ok("")
    }
}

pub struct FlakyCall {
    deadline: Option<Instant>,
    cancel_tx: Mutex<Option<oneshot::Sender<String>>>,
    cancel_rx: Mutex<Option<oneshot::Receiver<String>>>,
}

impl ClientCall for FlakyCall {
    fn cancel(&self, reason: &str) {
        if let Some(tx) = self.cancel_tx.lock().unwrap().take() {
            let _ = tx.send(reason.to_owned());
        }
    }
}

impl Transport for FlakyTransport {
    type Request = ReadRequest;
    type Response = String;
    type Call = FlakyCall;

    fn method_name(&self) -> &str {
        match self.0.scan_rows {
            None => "demo.v1.KeyValue/Read",
            Some(_) => "demo.v1.KeyValue/Scan",
        }
    }

    fn new_call(&self, options: &CallOptions) -> FlakyCall {
        let (tx, rx) = oneshot::channel();
        FlakyCall {
            deadline: options.deadline,
            cancel_tx: Mutex::new(Some(tx)),
            cancel_rx: Mutex::new(Some(rx)),
        }
    }

    fn start(
        &self,
        request: ReadRequest,
        listener: Arc<dyn CallListener<String>>,
        _metadata: MetadataMap,
        call: &FlakyCall,
    ) -> Result<(), Status> {
        let Some(cancelled) = call.cancel_rx.lock().unwrap().take() else {
            return Err(Status::failed_precondition("call already started"));
        };
        let server = self.0.clone();
        let answer_at = Instant::now() + server.latency;
        let deadline = call.deadline;
        self.0.runtime.spawn(async move {
            let status = tokio::select! {
                _ = sleep_until(answer_at), if deadline.map_or(true, |d| answer_at <= d) => {
                    server.respond(&request.key, listener.as_ref())
                }
                _ = sleep_until(deadline.unwrap_or(answer_at)), if deadline.is_some_and(|d| d < answer_at) => {
                    Status::deadline_exceeded("deadline exceeded before the server answered")
                }
                Ok(reason) = cancelled => Status::cancelled(reason),
            };
            debug!(key = request.key, code = ?status.code(), "server closing call");
            listener.on_close(status, MetadataMap::new());
        });
        Ok(())
    }
}

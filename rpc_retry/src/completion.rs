use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::warn;

use super::errors::{panic_message, Error};

/// The reason used when a caller cancels without giving one.
pub const USER_CANCELLED: &str = "User requested cancelation.";

type Listener<T> = Box<dyn FnOnce(&Result<T, Error>) + Send>;
type CancelHook = Box<dyn Fn(&str) + Send + Sync>;

/// A single-assignment slot for the outcome of an operation.
///
/// The slot is written at most once: whichever of [`Self::set_result`],
/// [`Self::set_failure`] or [`Self::cancel`] runs first wins, and the others
/// become no-ops that return `false`. Cloning the handle yields another
/// reference to the same slot.
///
/// Cancelling resolves the slot to [`Error::Cancelled`] and then runs the
/// owning operation's cancellation hook, which tells an in-flight attempt (if
/// any) to stop. Listeners run after the hook.
pub struct CompletionHandle<T> {
    shared: Arc<Shared<T>>,
}

struct Shared<T> {
    state: Mutex<State<T>>,
    // Wakes blocked `get` callers.
    ready: Condvar,
    // Wakes async `wait` callers.
    notify: Notify,
    on_cancel: OnceLock<CancelHook>,
}

struct State<T> {
    outcome: Option<Result<T, Error>>,
    listeners: Vec<Listener<T>>,
}

impl<T> Clone for CompletionHandle<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: Clone> Default for CompletionHandle<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> CompletionHandle<T> {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    outcome: None,
                    listeners: Vec::new(),
                }),
                ready: Condvar::new(),
                notify: Notify::new(),
                on_cancel: OnceLock::new(),
            }),
        }
    }

    /// Registers the function [`Self::cancel`] runs after resolving the slot.
    /// Only the first registration takes effect.
    pub(crate) fn on_cancel<F>(&self, hook: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        let _ = self.shared.on_cancel.set(Box::new(hook));
    }

    /// Returns true if this call resolved the slot.
    pub fn set_result(&self, value: T) -> bool {
        self.complete(Ok(value), || {})
    }

    /// Returns true if this call resolved the slot.
    pub fn set_failure(&self, error: Error) -> bool {
        self.complete(Err(error), || {})
    }

    /// Cancels with a generic reason. See [`Self::cancel_with_reason`].
    pub fn cancel(&self) -> bool {
        self.cancel_with_reason(USER_CANCELLED)
    }

    /// Resolves the slot to [`Error::Cancelled`] and, if that took effect,
    /// cancels the in-flight attempt. Does nothing if the slot is already
    /// resolved.
    pub fn cancel_with_reason(&self, reason: &str) -> bool {
        let outcome = Err(Error::Cancelled {
            reason: reason.to_owned(),
        });
        self.complete(outcome, || {
            if let Some(hook) = self.shared.on_cancel.get() {
                hook(reason);
            }
        })
    }

    // `resolved` runs after the slot is written and before any listener.
    fn complete<F>(&self, outcome: Result<T, Error>, resolved: F) -> bool
    where
        F: FnOnce(),
    {
        let listeners = {
            let mut state = self.shared.state.lock().unwrap();
            if state.outcome.is_some() {
                return false;
            }
            state.outcome = Some(outcome.clone());
            std::mem::take(&mut state.listeners)
        };
        self.shared.ready.notify_all();
        self.shared.notify.notify_waiters();
        resolved();
        for listener in listeners {
            run_listener(listener, &outcome);
        }
        true
    }

    pub fn is_done(&self) -> bool {
        self.shared.state.lock().unwrap().outcome.is_some()
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(
            self.shared.state.lock().unwrap().outcome,
            Some(Err(Error::Cancelled { .. }))
        )
    }

    /// Returns the outcome without waiting, if there is one.
    pub fn try_get(&self) -> Option<Result<T, Error>> {
        self.shared.state.lock().unwrap().outcome.clone()
    }

    /// Blocks the current thread until the slot is resolved or the timeout
    /// elapses. Returns `None` on timeout. A `None` timeout waits forever.
    ///
    /// Don't call this from async code; use [`Self::wait`] instead.
    pub fn get(&self, timeout: Option<Duration>) -> Option<Result<T, Error>> {
        let state = self.shared.state.lock().unwrap();
        let state = match timeout {
            None => self
                .shared
                .ready
                .wait_while(state, |state| state.outcome.is_none())
                .unwrap(),
            Some(timeout) => {
                self.shared
                    .ready
                    .wait_timeout_while(state, timeout, |state| state.outcome.is_none())
                    .unwrap()
                    .0
            }
        };
        state.outcome.clone()
    }

    /// Blocks the current thread until the slot is resolved.
    pub fn wait_blocking(&self) -> Result<T, Error> {
        let mut state = self.shared.state.lock().unwrap();
        loop {
            if let Some(outcome) = &state.outcome {
                return outcome.clone();
            }
            state = self.shared.ready.wait(state).unwrap();
        }
    }

    /// Waits asynchronously until the slot is resolved.
    pub async fn wait(&self) -> Result<T, Error> {
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            // Register interest before checking, so a completion between the
            // check and the await isn't missed.
            notified.as_mut().enable();
            if let Some(outcome) = self.try_get() {
                return outcome;
            }
            notified.await;
        }
    }

    /// Runs `listener` once with the outcome: immediately if the slot is
    /// already resolved, otherwise on the thread that resolves it.
    pub fn add_listener<F>(&self, listener: F)
    where
        F: FnOnce(&Result<T, Error>) + Send + 'static,
    {
        let mut state = self.shared.state.lock().unwrap();
        if let Some(outcome) = state.outcome.clone() {
            drop(state);
            run_listener(Box::new(listener), &outcome);
            return;
        }
        state.listeners.push(Box::new(listener));
    }
}

// A panicking listener is logged and skipped so it can't keep the others, or
// the caller resolving the slot, from running.
fn run_listener<T>(listener: Listener<T>, outcome: &Result<T, Error>) {
    if let Err(panic) = catch_unwind(AssertUnwindSafe(|| listener(outcome))) {
        warn!(
            panic = panic_message(panic.as_ref()),
            "completion listener panicked"
        );
    }
}

impl<T: Clone> fmt::Debug for CompletionHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionHandle")
            .field("done", &self.is_done())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

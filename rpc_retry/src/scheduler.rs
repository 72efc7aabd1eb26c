use std::time::Duration;
use tokio::runtime::Handle;
use tokio::time::sleep;

/// Runs a task after a delay, without blocking the caller.
pub trait Scheduler: Send + Sync + 'static {
    fn schedule(&self, delay: Duration, task: Box<dyn FnOnce() + Send>);
}

/// A [`Scheduler`] that spawns a sleeping task onto a tokio runtime.
#[derive(Clone, Debug)]
pub struct TokioScheduler {
    handle: Handle,
}

impl TokioScheduler {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Uses the runtime the caller is running on.
    ///
    /// # Panics
    ///
    /// Panics if called outside the context of a tokio runtime.
    pub fn current() -> Self {
        Self::new(Handle::current())
    }
}

impl Scheduler for TokioScheduler {
    fn schedule(&self, delay: Duration, task: Box<dyn FnOnce() + Send>) {
        self.handle.spawn(async move {
            sleep(delay).await;
            task();
        });
    }
}

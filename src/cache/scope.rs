//! Background task scope
//!
//! Fire-and-forget work (stale-while-revalidate refreshes, prefetches) runs
//! on a scope owned by the client instead of detached global tasks.
//! Cancelling the scope drops every child future at its next await point.
//! Work that is already past its last await checks [`TaskScope::is_cancelled`]
//! itself before writing anything.
//!
//! Spawning needs a Tokio runtime. Outside one, [`TaskScope::spawn`] refuses
//! the work and returns false.

use std::future::Future;
use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Decrements the running-task count when a task ends, however it ends
struct Running(Arc<watch::Sender<usize>>);

impl Running {
    fn start(active: &Arc<watch::Sender<usize>>) -> Self {
        active.send_modify(|n| *n += 1);
        Self(Arc::clone(active))
    }
}

impl Drop for Running {
    fn drop(&mut self) {
        self.0.send_modify(|n| *n = n.saturating_sub(1));
    }
}

/// Cancellable group of background tasks
#[derive(Debug, Clone)]
pub struct TaskScope {
    token: CancellationToken,
    active: Arc<watch::Sender<usize>>,
}

impl Default for TaskScope {
    fn default() -> Self {
        Self::with_token(CancellationToken::new())
    }
}

impl TaskScope {
    /// Create a new, live scope
    pub fn new() -> Self {
        Self::default()
    }

    fn with_token(token: CancellationToken) -> Self {
        let (active, _) = watch::channel(0);
        Self {
            token,
            active: Arc::new(active),
        }
    }

    /// A scope cancelled together with this one (but cancellable on its own)
    pub fn child(&self) -> Self {
        Self::with_token(self.token.child_token())
    }

    /// Spawn a task on the current Tokio runtime
    ///
    /// Returns false (and drops `fut`) if the scope is already cancelled or
    /// no runtime is running on this thread.
    pub fn spawn<F>(&self, name: &'static str, fut: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.token.is_cancelled() {
            debug!(task = name, "scope cancelled, not spawning");
            return false;
        }

        let Ok(handle) = Handle::try_current() else {
            warn!(task = name, "no Tokio runtime, background task dropped");
            return false;
        };

        let token = self.token.clone();
        let running = Running::start(&self.active);
        handle.spawn(async move {
            let _running = running;
            tokio::select! {
                biased;
                _ = token.cancelled() => debug!(task = name, "background task cancelled"),
                _ = fut => {}
            }
        });
        true
    }

    /// Cancel every outstanding and future task. Idempotent.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// True once [`TaskScope::cancel`] ran (here or on a parent)
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Number of tasks still running
    pub fn active(&self) -> usize {
        *self.active.borrow()
    }

    /// Wait until no task on this scope is running
    ///
    /// Any number of callers may wait at once.
    pub async fn wait_idle(&self) {
        let mut idle = self.active.subscribe();
        // The sender lives in `self`, so the channel cannot close here
        let _ = idle.wait_for(|n| *n == 0).await;
    }
}

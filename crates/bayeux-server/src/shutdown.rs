//! Graceful shutdown: one `CancellationToken` plus the background tasks that
//! must finish before the process exits.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Stops the listener, the session sweeper and WebSocket connections.
#[derive(Debug, Default)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ShutdownCoordinator {
    /// Create a new shutdown coordinator.
    pub fn new() -> Self {
        Self::default()
    }

    /// A clone of the cancellation token.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Initiate shutdown.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    /// Whether a shutdown has been initiated.
    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Wait for `handle` in [`drain`](Self::drain).
    pub fn track(&self, handle: JoinHandle<()>) {
        self.tasks.lock().push(handle);
    }

    /// Tracked tasks not yet drained.
    pub fn tracked(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Cancel the token, give tracked tasks `timeout` to finish and abort
    /// the rest. Returns how many were aborted.
    pub async fn drain(&self, timeout: Duration) -> usize {
        self.shutdown();
        let tasks = std::mem::take(&mut *self.tasks.lock());
        if tasks.is_empty() {
            return 0;
        }
        info!(tasks = tasks.len(), ?timeout, "waiting for background tasks");

        let aborts: Vec<_> = tasks.iter().map(JoinHandle::abort_handle).collect();
        if tokio::time::timeout(timeout, futures::future::join_all(tasks))
            .await
            .is_ok()
        {
            return 0;
        }
        let stragglers = aborts.iter().filter(|a| !a.is_finished()).count();
        warn!(stragglers, ?timeout, "shutdown timed out, aborting");
        for abort in aborts {
            abort.abort();
        }
        stragglers
    }
}

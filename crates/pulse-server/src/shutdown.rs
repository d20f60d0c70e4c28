//! Draining the server.
//!
//! One cancellation reaches the listener, the idle reaper and every device
//! session; the coordinator then waits a bounded time for the background
//! tasks it tracks and aborts whatever is still running.

use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Wait applied when the caller gives no drain timeout.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// How a drain ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    /// Tracked tasks that finished on their own.
    pub finished: usize,
    /// Tracked tasks aborted at the deadline.
    pub aborted: usize,
}

/// Owns the server-wide cancellation token and the background tasks that
/// must stop with it.
pub struct ShutdownCoordinator {
    token: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ShutdownCoordinator {
    /// Coordinator with nothing tracked.
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// The root token, for the listener.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// A token cancelled by the drain but also cancellable on its own. Each
    /// device session and the reaper hold one.
    pub fn child_token(&self) -> CancellationToken {
        self.token.child_token()
    }

    /// Wait for `task` when draining.
    pub fn track(&self, task: JoinHandle<()>) {
        self.tasks.lock().push(task);
    }

    /// Stop admitting and signal everything to wind down. Idempotent.
    pub fn begin_drain(&self) {
        self.token.cancel();
    }

    /// Whether a drain has started.
    pub fn is_draining(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Begin draining, then wait up to `timeout` for every tracked task.
    /// Tasks still running at the deadline are aborted.
    pub async fn drain(&self, timeout: Option<Duration>) -> DrainReport {
        let timeout = timeout.unwrap_or(DEFAULT_DRAIN_TIMEOUT);
        self.begin_drain();

        let tasks = std::mem::take(&mut *self.tasks.lock());
        let total = tasks.len();
        info!(tasks = total, timeout_secs = timeout.as_secs(), "draining");

        let aborts: Vec<_> = tasks.iter().map(JoinHandle::abort_handle).collect();
        if tokio::time::timeout(timeout, join_all(tasks)).await.is_ok() {
            return DrainReport {
                finished: total,
                aborted: 0,
            };
        }

        let mut aborted = 0;
        for task in aborts.iter().filter(|a| !a.is_finished()) {
            task.abort();
            aborted += 1;
        }
        warn!(aborted, ?timeout, "drain deadline passed, aborted remaining tasks");
        DrainReport {
            finished: total - aborted,
            aborted,
        }
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

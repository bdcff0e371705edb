use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::task::AbortHandle;
use tracing::{debug, info};

/// Default delay before re-running a failed instance discovery step.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(5000);

/// Bootstrap queries that may be retried on a timer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RetryKind {
    ActivityInstances,
    ActivityDatabases,
}

/// One timer slot per [`RetryKind`]. Scheduling into an occupied slot is a
/// no-op, so at most one retry per kind is ever outstanding.
///
/// TODO: replace the fixed delay with exponential backoff.
#[derive(Clone, Default)]
pub struct RetryScheduler {
    slots: Arc<Mutex<HashMap<RetryKind, AbortHandle>>>,
}

impl RetryScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<RetryKind, AbortHandle>> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Runs `task` once after `delay`. Returns `false` and drops `task` if a
    /// retry of the same kind is already pending.
    pub fn schedule<F>(&self, kind: RetryKind, delay: Duration, task: F) -> bool
    where
        F: FnOnce() -> BoxFuture<'static, ()> + Send + 'static,
    {
        let mut slots = self.slots();
        if slots.contains_key(&kind) {
            debug!(?kind, "retry already scheduled, dropping");
            return false;
        }
        info!(?kind, ?delay, "scheduling retry");
        let owner = self.slots.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            owner.lock().unwrap_or_else(|e| e.into_inner()).remove(&kind);
            task().await;
        });
        slots.insert(kind, handle.abort_handle());
        true
    }

    pub fn is_scheduled(&self, kind: RetryKind) -> bool {
        self.slots().contains_key(&kind)
    }

    pub fn cancel_all(&self) {
        for (_, handle) in self.slots().drain() {
            handle.abort();
        }
    }
}

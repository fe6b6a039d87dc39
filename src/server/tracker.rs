//! Live client connection tracking
//!
//! The shutdown choreography needs to know when the last client session has
//! ended: the main task blocks on [`ConnectionTracker::wait_idle`] after the
//! shutdown signals have been dispatched.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

/// Counts live client sessions and wakes waiters when the count changes.
#[derive(Debug, Default)]
pub struct ConnectionTracker {
    active: AtomicUsize,
    changed: Notify,
}

impl ConnectionTracker {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Current number of live client sessions.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Register a session. The returned guard decrements the count on drop.
    pub fn guard(self: &Arc<Self>) -> ConnectionGuard {
        self.active.fetch_add(1, Ordering::SeqCst);
        ConnectionGuard(Arc::clone(self))
    }

    /// Resolve once the live count reaches zero.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.changed.notified();
            if self.active() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// RAII registration of one live session.
pub struct ConnectionGuard(Arc<ConnectionTracker>);

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
        self.0.changed.notify_waiters();
    }
}

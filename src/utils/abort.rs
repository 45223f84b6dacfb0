//! Session-wide abort flag: cooperative cancellation for transfers.
//!
//! The flag is cloned into every task that must stop on user abort or
//! teardown. The send loop checks it at each chunk boundary, so
//! cancellation takes effect at the next checkpoint rather than
//! immediately, and never retracts bytes already enqueued.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// A cloneable, async-aware cancellation flag.
///
/// Clones share the same underlying state: aborting any clone is
/// visible to, and wakes, all of them.
#[derive(Debug, Clone, Default)]
pub struct AbortFlag {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    aborted: AtomicBool,
    notify: Notify,
}

impl AbortFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the flag and wake all waiters. Idempotent.
    pub fn abort(&self) {
        self.inner.aborted.store(true, Ordering::Release);
        self.inner.notify.notify_waiters();
    }

    pub fn is_aborted(&self) -> bool {
        self.inner.aborted.load(Ordering::Acquire)
    }

    /// Wait until the flag is set. Returns immediately if it already is.
    pub async fn aborted(&self) {
        while !self.is_aborted() {
            self.inner.notify.notified().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn abort_is_visible_across_clones() {
        let flag = AbortFlag::new();
        let clone = flag.clone();
        assert!(!clone.is_aborted());
        flag.abort();
        assert!(clone.is_aborted());
        // Completes without hanging once set.
        clone.aborted().await;
    }

    #[tokio::test]
    async fn aborted_wakes_pending_waiter() {
        let flag = AbortFlag::new();
        let waiter = flag.clone();
        let handle = tokio::spawn(async move { waiter.aborted().await });
        tokio::task::yield_now().await;
        flag.abort();
        handle.await.unwrap();
    }
}

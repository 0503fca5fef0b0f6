//! Shared cancellation signal for a batch of tasks
//!
//! Tripped when continuing is pointless (circuit open against the only proxy,
//! browser gone). Tasks that have not started yet observe it and skip;
//! in-flight tasks stop at their next suspension point.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct Inner {
    flag: AtomicBool,
    notify: Notify,
    reason: parking_lot::Mutex<Option<String>>,
}

/// Cloneable cancellation handle; all clones share one state
#[derive(Debug, Clone, Default)]
pub struct CancellationSignal {
    inner: Arc<Inner>,
}

impl CancellationSignal {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Trip the signal. Idempotent; the first reason wins.
    pub fn cancel(&self, reason: impl Into<String>) {
        {
            let mut slot = self.inner.reason.lock();
            if slot.is_none() {
                *slot = Some(reason.into());
            }
        }
        if !self.inner.flag.swap(true, Ordering::SeqCst) {
            tracing::warn!(
                "Cancellation requested: {}",
                self.reason().unwrap_or_default()
            );
        }
        self.inner.notify.notify_waiters();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn reason(&self) -> Option<String> {
        self.inner.reason.lock().clone()
    }

    /// Resolves once [`cancel`](Self::cancel) has been called on any clone
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

//! Cooperative Cancellation
//!
//! One token per execution, shared by the caller, the driver loop and
//! every module body.
//!
//! ## Design
//!
//! Cancellation here is level-triggered and awaitable, not polled: the
//! token pairs an atomic flag with a `tokio::sync::Notify`. An observer
//! either sees the flag already set or parks on the notify and is woken
//! the moment it flips. Module tasks select on [`CancelHandle::cancelled`]
//! next to their body future, and the driver folds the same future into
//! its event loop, so a cancel request preempts both without waiting out
//! a scheduler tick.
//!
//! The global execution deadline is not a second mechanism: the driver
//! owns the deadline instant and turns its expiry into a `cancel()` on
//! this token. A cancelled module's partial outputs are never published,
//! so an observer that checks late cannot corrupt the data table.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

struct Shared {
    cancelled: AtomicBool,
    notify: Notify,
}

/// Shared cancellation token.
///
/// Cloning is cheap and every clone observes the same state; once
/// cancelled, a token stays cancelled.
#[derive(Clone)]
pub struct CancelHandle {
    shared: Arc<Shared>,
}

impl CancelHandle {
    pub fn new() -> Self {
        CancelHandle {
            shared: Arc::new(Shared {
                cancelled: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    /// Request cancellation and wake every parked observer.
    pub fn cancel(&self) {
        // Only the flag's first flip notifies; later calls are no-ops.
        if !self.shared.cancelled.swap(true, Ordering::SeqCst) {
            self.shared.notify.notify_waiters();
        }
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.shared.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once cancellation is requested; immediately if it already
    /// was.
    ///
    /// Interest in the notify registers before the flag is re-read, which
    /// closes the race against a concurrent `cancel()` landing between
    /// the check and the park: either the re-read sees the flag, or the
    /// registered waiter receives the wakeup.
    pub async fn cancelled(&self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

impl Default for CancelHandle {
    fn default() -> Self {
        CancelHandle::new()
    }
}

impl std::fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelHandle")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

//! Cancellation of in-progress builds and mutations.

use std::fmt;
use std::sync::{Arc, OnceLock};
use tokio::sync::Notify;

/// Signals an in-progress flow build that it should stop and tear down.
///
/// The first reason recorded sticks; later calls to [`cancel`](Self::cancel)
/// are ignored. Builders check [`is_cancelled`](Self::is_cancelled) between
/// steps and race health polling against [`cancelled`](Self::cancelled).
#[derive(Default)]
pub struct CancellationToken {
    reason: OnceLock<String>,
    notify: Notify,
}

impl CancellationToken {
    /// Creates a live token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancels with `reason` and wakes every waiter. No-op once cancelled.
    pub fn cancel(&self, reason: impl Into<String>) {
        if self.reason.set(reason.into()).is_ok() {
            self.notify.notify_waiters();
        }
    }

    /// Returns true once [`cancel`](Self::cancel) has been called.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.reason.get().is_some()
    }

    /// The reason given to the first [`cancel`](Self::cancel).
    #[must_use]
    pub fn reason(&self) -> Option<String> {
        self.reason.get().cloned()
    }

    /// Resolves when the token is cancelled.
    pub async fn cancelled(&self) {
        loop {
            // Register before checking so a concurrent cancel cannot be missed.
            let notified = self.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

impl fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.reason.get() {
            Some(reason) => write!(f, "CancellationToken(cancelled: {reason})"),
            None => write!(f, "CancellationToken(live)"),
        }
    }
}

/// Cancels a shared token when dropped, unless disarmed first.
///
/// Held by the caller of a build so that abandoning the call aborts the
/// build running on its own task.
#[derive(Debug)]
pub struct CancelOnDrop {
    token: Arc<CancellationToken>,
    reason: &'static str,
    armed: bool,
}

impl CancelOnDrop {
    /// Arms a guard over `token`.
    #[must_use]
    pub fn new(token: Arc<CancellationToken>, reason: &'static str) -> Self {
        Self {
            token,
            reason,
            armed: true,
        }
    }

    /// The call completed; dropping the guard no longer cancels.
    pub fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if self.armed {
            self.token.cancel(self.reason);
        }
    }
}

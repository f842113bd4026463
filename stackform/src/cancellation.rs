//! Cooperative cancellation for runs.

use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::Notify;
use tracing::debug;

#[derive(Default)]
struct TokenState {
    cancelled: AtomicBool,
    reason: RwLock<Option<String>>,
    notify: Notify,
    children: Mutex<Vec<Weak<TokenState>>>,
}

/// A token for cooperative cancellation.
///
/// Cheap to clone; clones observe the same state. Cancelling is idempotent
/// and only the first reason is kept. Cancelling a token also cancels every
/// token derived from it with [`child_token`](Self::child_token).
#[derive(Clone, Default)]
pub struct CancellationToken {
    state: Arc<TokenState>,
}

impl CancellationToken {
    /// Creates a new cancellation token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a token that is cancelled whenever this one is.
    ///
    /// Cancelling the child leaves the parent untouched.
    #[must_use]
    pub fn child_token(&self) -> Self {
        let child = Self::new();
        {
            let mut children = self.state.children.lock();
            children.retain(|weak| weak.strong_count() > 0);
            children.push(Arc::downgrade(&child.state));
        }
        if let Some(reason) = self.reason() {
            child.cancel(reason);
        }
        child
    }

    /// Requests cancellation with a reason.
    pub fn cancel(&self, reason: impl Into<String>) {
        cancel_state(&self.state, reason.into());
    }

    /// Returns whether cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::SeqCst)
    }

    /// Returns the cancellation reason, if any.
    #[must_use]
    pub fn reason(&self) -> Option<String> {
        self.state.reason.read().clone()
    }

    /// Completes once the token is cancelled.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.state.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

fn cancel_state(state: &TokenState, reason: String) {
    if state
        .cancelled
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        return;
    }

    debug!(reason = %reason, "Cancellation requested");
    *state.reason.write() = Some(reason.clone());
    state.notify.notify_waiters();

    let children: Vec<Arc<TokenState>> = state
        .children
        .lock()
        .iter()
        .filter_map(Weak::upgrade)
        .collect();
    for child in children {
        cancel_state(&child, reason.clone());
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .field("reason", &self.reason())
            .finish()
    }
}

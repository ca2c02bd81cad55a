//! Cooperative cancellation tokens
//!
//! One-way transition: live -> cancelled, never back. Tokens can be linked
//! so that cancelling an outer token cancels all nested calls transitively.
//! Cancellation is cooperative - handlers already executing are expected to
//! observe the token, nothing is preempted.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

struct Inner {
    cancelled: AtomicBool,
    notify: Notify,
    /// Downstream tokens cancelled together with this one
    children: Mutex<Vec<CancellationToken>>,
}

/// Cooperative cancellation token
///
/// Cloning produces another handle to the same flag.
#[derive(Clone)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

impl CancellationToken {
    /// Create a live token
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                notify: Notify::new(),
                children: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Whether this token has been cancelled
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Cancel this token and every token linked beneath it
    ///
    /// Idempotent and irreversible. Linked tokens are walked iteratively
    /// (bounded by the number of live tokens, no recursion).
    pub fn cancel(&self) {
        let mut pending = vec![self.clone()];
        while let Some(token) = pending.pop() {
            if token.inner.cancelled.swap(true, Ordering::AcqRel) {
                continue;
            }
            token.inner.notify.notify_waiters();
            let mut children = token.inner.children.lock().expect("children lock poisoned");
            pending.append(&mut children);
        }
    }

    /// Link a downstream token
    ///
    /// Cancelling `self` cancels `child` (transitively through the child's
    /// own links). If `self` is already cancelled the child is cancelled
    /// immediately.
    pub fn link_child(&self, child: &CancellationToken) {
        if self.is_cancelled() {
            child.cancel();
            return;
        }
        {
            let mut children = self.inner.children.lock().expect("children lock poisoned");
            children.push(child.clone());
        }
        // Re-check: cancel() may have drained the list before the push landed.
        if self.is_cancelled() {
            child.cancel();
        }
    }

    /// Create a new token already linked beneath this one
    pub fn child_token(&self) -> CancellationToken {
        let child = CancellationToken::new();
        self.link_child(&child);
        child
    }

    /// Wait until this token is cancelled
    pub async fn cancelled(&self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_is_idempotent() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());
        token.cancel();
        assert!(token.is_cancelled());
        token.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_clone_shares_flag() {
        let token = CancellationToken::new();
        let other = token.clone();
        token.cancel();
        assert!(other.is_cancelled());
    }

    #[test]
    fn test_linked_tokens_cancel_transitively() {
        let outer = CancellationToken::new();
        let mid = outer.child_token();
        let inner = mid.child_token();

        outer.cancel();
        assert!(mid.is_cancelled());
        assert!(inner.is_cancelled());
    }

    #[test]
    fn test_link_to_already_cancelled() {
        let outer = CancellationToken::new();
        outer.cancel();

        let child = CancellationToken::new();
        outer.link_child(&child);
        assert!(child.is_cancelled());
    }

    #[test]
    fn test_child_cancel_does_not_cancel_parent() {
        let outer = CancellationToken::new();
        let child = outer.child_token();
        child.cancel();
        assert!(!outer.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancelled_wakes_waiter() {
        let token = CancellationToken::new();
        let waiter = token.clone();

        let task = tokio::spawn(async move {
            waiter.cancelled().await;
            true
        });

        token.cancel();
        assert!(task.await.unwrap());
    }

    #[tokio::test]
    async fn test_cancelled_returns_immediately_when_cancelled() {
        let token = CancellationToken::new();
        token.cancel();
        token.cancelled().await;
    }
}

//! Scheduler intake and idle tracking
//!
//! Every runtime mutation travels as a `Command` on one bounded intake
//! channel, so the scheduler task owns its tables without locks. The
//! `IdleTracker` counts outstanding units of work (queued envelopes and
//! in-flight deliveries); idleness is the observation that the count is
//! zero.

use selkie_core::{
    AgentFactory, AgentId, CancellationToken, Message, Result, Subscription, TopicId,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{oneshot, Notify};

/// One envelope on the intake queue
pub(crate) enum Command {
    /// Point-to-point call awaiting exactly one reply
    Send {
        message: Message,
        recipient: AgentId,
        sender: Option<AgentId>,
        cancellation: CancellationToken,
        reply_tx: oneshot::Sender<Result<Option<Message>>>,
        work: WorkGuard,
    },
    /// Fire-and-forget broadcast
    Publish {
        message: Message,
        topic: TopicId,
        sender: Option<AgentId>,
        cancellation: CancellationToken,
        work: WorkGuard,
    },
    /// Register an agent type and its subscriptions
    Register {
        agent_type: String,
        factory: Box<dyn AgentFactory>,
        subscriptions: Vec<Box<dyn Subscription>>,
        ack_tx: oneshot::Sender<Result<()>>,
    },
    /// Ensure the instance for (type, key) exists
    ResolveOrCreate {
        agent_type: String,
        key: String,
        ack_tx: oneshot::Sender<Result<AgentId>>,
    },
    /// Drain queued envelopes, then exit the scheduler
    Stop { ack_tx: oneshot::Sender<()> },
}

struct IdleInner {
    outstanding: AtomicUsize,
    changed: Notify,
}

/// Outstanding-work counter backing the Idle observation
#[derive(Clone)]
pub(crate) struct IdleTracker {
    inner: Arc<IdleInner>,
}

impl IdleTracker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(IdleInner {
                outstanding: AtomicUsize::new(0),
                changed: Notify::new(),
            }),
        }
    }

    /// Claim one unit of work; released when the guard drops
    pub fn begin(&self) -> WorkGuard {
        self.inner.outstanding.fetch_add(1, Ordering::AcqRel);
        WorkGuard {
            inner: Arc::clone(&self.inner),
        }
    }

    pub fn outstanding(&self) -> usize {
        self.inner.outstanding.load(Ordering::Acquire)
    }

    pub fn is_idle(&self) -> bool {
        self.outstanding() == 0
    }

    /// Wait until no work is outstanding
    pub async fn wait_idle(&self) {
        loop {
            if self.is_idle() {
                return;
            }
            let notified = self.inner.changed.notified();
            if self.is_idle() {
                return;
            }
            notified.await;
        }
    }
}

/// Releases one unit of outstanding work on drop
pub(crate) struct WorkGuard {
    inner: Arc<IdleInner>,
}

impl Drop for WorkGuard {
    fn drop(&mut self) {
        if self.inner.outstanding.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.inner.changed.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idle_tracker_counts_guards() {
        let tracker = IdleTracker::new();
        assert!(tracker.is_idle());

        let a = tracker.begin();
        let b = tracker.begin();
        assert_eq!(tracker.outstanding(), 2);
        assert!(!tracker.is_idle());

        drop(a);
        assert_eq!(tracker.outstanding(), 1);
        drop(b);
        assert!(tracker.is_idle());
    }

    #[tokio::test]
    async fn test_wait_idle_returns_immediately_when_idle() {
        let tracker = IdleTracker::new();
        tracker.wait_idle().await;
    }

    #[tokio::test]
    async fn test_wait_idle_wakes_on_last_guard() {
        let tracker = IdleTracker::new();
        let guard = tracker.begin();

        let waiter = tracker.clone();
        let task = tokio::spawn(async move {
            waiter.wait_idle().await;
            true
        });

        drop(guard);
        assert!(task.await.unwrap());
    }
}

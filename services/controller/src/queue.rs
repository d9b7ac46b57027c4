//! Work queue and per-identity locking for the reconcile worker pool.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use faultline_store::ObjectKey;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::trace;

/// Which resource a work item refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Machine,
    Task,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::Machine => f.write_str("machine"),
            ResourceKind::Task => f.write_str("task"),
        }
    }
}

/// Why the item was enqueued. Reconciliation is level-triggered, so the
/// reason only matters for logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reason {
    /// A store watch event fired.
    Changed,
    /// The periodic full resync.
    Resync,
    /// A previous pass asked to be retried.
    Retry,
    /// A timer elapsed (duration expiry, health probe).
    Timer,
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reason::Changed => f.write_str("changed"),
            Reason::Resync => f.write_str("resync"),
            Reason::Retry => f.write_str("retry"),
            Reason::Timer => f.write_str("timer"),
        }
    }
}

/// One unit of reconcile work.
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub kind: ResourceKind,
    pub key: ObjectKey,
    pub reason: Reason,
}

impl WorkItem {
    #[must_use]
    pub fn machine(key: ObjectKey, reason: Reason) -> Self {
        Self {
            kind: ResourceKind::Machine,
            key,
            reason,
        }
    }

    #[must_use]
    pub fn task(key: ObjectKey, reason: Reason) -> Self {
        Self {
            kind: ResourceKind::Task,
            key,
            reason,
        }
    }

    fn identity(&self) -> (ResourceKind, ObjectKey) {
        (self.kind, self.key.clone())
    }
}

/// Sending half of the work queue. Cheap to clone.
#[derive(Clone)]
pub struct WorkQueue {
    tx: UnboundedSender<WorkItem>,
}

impl WorkQueue {
    #[must_use]
    pub fn new() -> (Self, UnboundedReceiver<WorkItem>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Enqueues an item immediately. Send failure means the controller is
    /// shutting down; the item is dropped.
    pub fn enqueue(&self, item: WorkItem) {
        trace!(kind = %item.kind, key = %item.key, reason = %item.reason, "Enqueue");
        let _ = self.tx.send(item);
    }

    /// Re-enqueues an item after a delay without blocking the caller.
    pub fn requeue_after(&self, item: WorkItem, delay: Duration) {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(item);
        });
    }
}

/// Per-identity async locks.
///
/// Workers hold the identity's lock while reconciling it, so no two workers
/// ever reconcile the same object concurrently while distinct objects
/// proceed in parallel.
pub struct KeyedLocks<K> {
    locks: Mutex<HashMap<K, Arc<Mutex<()>>>>,
}

impl<K> KeyedLocks<K>
where
    K: Eq + Hash + Clone,
{
    #[must_use]
    pub fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Locks the identity, waiting if another holder has it.
    pub async fn lock(&self, key: K) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            Arc::clone(locks.entry(key).or_insert_with(|| Arc::new(Mutex::new(()))))
        };
        lock.lock_owned().await
    }

    /// Drops lock entries nobody holds. Called from the resync tick so the
    /// map does not grow with every identity ever seen.
    pub async fn prune(&self) {
        let mut locks = self.locks.lock().await;
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.locks.lock().await.len()
    }
}

impl<K> Default for KeyedLocks<K>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

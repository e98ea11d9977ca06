//! Shared gxid bookkeeping and the checkpoint interlock
//!
//! gxid generation uses its own narrow mutex, never the general lock
//! manager: generation must be atomic with the in-flight/latest-completed
//! bookkeeping so a concurrent snapshot can never see an in-flight
//! transaction as already finished. The checkpoint interlock blocks
//! checkpoint creation while any commit-record window is open.

use meridian_common::{DistributedSnapshot, DistributedTransactionId, Gxid};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{Notify, RwLock, RwLockReadGuard};

struct GxidShared {
    next: Gxid,
    latest_completed: Gxid,
    in_flight: Vec<Gxid>,
}

/// Process-wide gxid counter and completion tracking.
pub struct GxidBookkeeping {
    start_timestamp: u64,
    inner: Mutex<GxidShared>,
    completion: Notify,
}

impl GxidBookkeeping {
    pub fn new(start_timestamp: u64) -> Self {
        Self {
            start_timestamp,
            inner: Mutex::new(GxidShared {
                next: Gxid::FIRST_NORMAL,
                latest_completed: Gxid::INVALID,
                in_flight: Vec::new(),
            }),
            completion: Notify::new(),
        }
    }

    pub fn start_timestamp(&self) -> u64 {
        self.start_timestamp
    }

    /// Generate the next gxid. Insertion into the in-flight set happens
    /// under the same lock acquisition, so no snapshot taken before this
    /// call returns can miss the new transaction.
    pub fn generate(&self) -> DistributedTransactionId {
        let mut inner = self.inner.lock();
        let gxid = inner.next;
        inner.next = inner.next.next();
        inner.in_flight.push(gxid);
        DistributedTransactionId::new(self.start_timestamp, gxid)
    }

    /// Mark a distributed transaction finished and wake any fence
    /// waiters.
    pub fn complete(&self, gxid: Gxid) {
        {
            let mut inner = self.inner.lock();
            inner.in_flight.retain(|g| *g != gxid);
            if gxid > inner.latest_completed {
                inner.latest_completed = gxid;
            }
        }
        self.completion.notify_waiters();
    }

    pub fn latest_completed(&self) -> Gxid {
        self.inner.lock().latest_completed
    }

    pub fn is_in_flight(&self, gxid: Gxid) -> bool {
        self.inner.lock().in_flight.contains(&gxid)
    }

    /// Snapshot of in-flight distributed transactions.
    pub fn snapshot(&self) -> DistributedSnapshot {
        let inner = self.inner.lock();
        let xmin = inner
            .in_flight
            .iter()
            .copied()
            .min()
            .unwrap_or(inner.next);
        DistributedSnapshot::new(xmin, inner.next, inner.in_flight.clone())
    }

    /// Block until the given gxid is no longer in flight. This is the
    /// cross-transaction fence participants request through wait-gxids.
    pub async fn wait_for_completion(&self, gxid: Gxid) {
        loop {
            let notified = self.completion.notified();
            if !self.is_in_flight(gxid) {
                return;
            }
            notified.await;
        }
    }
}

/// Blocks checkpoint creation while any commit-record window is open.
///
/// Commit paths hold the shared side plus a delay counter; the
/// checkpointer takes the exclusive side, so it can never observe a
/// half-finished distributed commit.
pub struct CheckpointInterlock {
    window: RwLock<()>,
    delayed: AtomicUsize,
}

impl CheckpointInterlock {
    pub fn new() -> Self {
        Self {
            window: RwLock::new(()),
            delayed: AtomicUsize::new(0),
        }
    }

    /// Open a commit-record window. Held from inserting-committed
    /// through inserting-forget.
    pub async fn begin_commit_window(&self) -> CommitWindowGuard<'_> {
        let guard = self.window.read().await;
        self.delayed.fetch_add(1, Ordering::SeqCst);
        CommitWindowGuard {
            _guard: guard,
            interlock: self,
        }
    }

    /// Run a checkpoint once no commit window is open.
    pub async fn checkpoint<T>(&self, body: impl FnOnce() -> T) -> T {
        let _exclusive = self.window.write().await;
        body()
    }

    /// Sessions currently delaying checkpoints.
    pub fn commits_in_flight(&self) -> usize {
        self.delayed.load(Ordering::SeqCst)
    }
}

impl Default for CheckpointInterlock {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared-mode hold on the checkpoint interlock; dropping it ends the
/// commit-record window.
pub struct CommitWindowGuard<'a> {
    _guard: RwLockReadGuard<'a, ()>,
    interlock: &'a CheckpointInterlock,
}

impl Drop for CommitWindowGuard<'_> {
    fn drop(&mut self) {
        self.interlock.delayed.fetch_sub(1, Ordering::SeqCst);
    }
}

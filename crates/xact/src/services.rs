//! External collaborator traits
//!
//! The lock manager, durability log, and catalog layer are opaque
//! services to this core. Each trait carries an in-memory implementation
//! used by tests and by single-process deployments.

use meridian_common::{DistributedTransactionId, Xid};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Owner of locks and other releasable resources; one per stack level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceOwnerId(u64);

impl ResourceOwnerId {
    pub const fn new(raw: u64) -> Self {
        ResourceOwnerId(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ResourceOwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "owner{}", self.0)
    }
}

/// Position in the append-only durability log.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub struct LogPosition(u64);

impl LogPosition {
    pub const fn new(raw: u64) -> Self {
        LogPosition(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }
}

/// Records this core appends to the durability log. Physical layout is
/// the log's concern; these are the logical payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum XactRecord {
    /// Batch of newly assigned sub-XIDs under one top-level XID.
    Assignment { top: Xid, subxids: Vec<Xid> },
    /// Local commit, optionally stamped with the distributed identity.
    Commit {
        xid: Xid,
        children: Vec<Xid>,
        distributed_id: Option<DistributedTransactionId>,
    },
    /// Local abort.
    Abort { xid: Xid, children: Vec<Xid> },
    /// Durable prepare of a local transaction under a GID.
    Prepare { xid: Xid, gid: String },
    /// Every participant acknowledged the distributed commit.
    DistributedForget { gid: String },
}

/// Lock manager interface. The deadlock detector behind it is opaque;
/// this core only acquires, transfers, releases, and waits.
pub trait LockManager: Send + Sync {
    /// Take the exclusive lock that advertises a newly assigned XID.
    fn acquire_xid_lock(&self, xid: Xid, owner: ResourceOwnerId);

    /// Move everything an owner holds to its parent owner.
    fn transfer(&self, from: ResourceOwnerId, to: ResourceOwnerId);

    /// Release everything an owner holds.
    fn release_all(&self, owner: ResourceOwnerId);

    /// Block until the transaction holding `xid`'s lock finishes.
    fn wait_for_xid(&self, xid: Xid);
}

/// Append-only durability log interface. Monotonically ordered; flush
/// and replica acknowledgement are separate waits.
pub trait DurabilityLog: Send + Sync {
    fn append(&self, record: XactRecord) -> LogPosition;
    fn flush(&self, upto: LogPosition);
    fn wait_replica_ack(&self, upto: LogPosition);
}

/// Catalog/invalidation interface.
pub trait CatalogSync: Send + Sync {
    /// Make pending catalog changes locally visible at a command boundary.
    fn accept_local_invalidations(&self);
    /// Broadcast accumulated invalidations at commit.
    fn broadcast_invalidations(&self);
}

/// Lock manager that tracks held locks per owner in process memory.
#[derive(Default)]
pub struct InMemoryLockManager {
    held: Mutex<HashMap<ResourceOwnerId, Vec<Xid>>>,
}

impl InMemoryLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Locks currently held by an owner, for assertions in tests.
    pub fn held_by(&self, owner: ResourceOwnerId) -> Vec<Xid> {
        self.held.lock().get(&owner).cloned().unwrap_or_default()
    }

    pub fn total_held(&self) -> usize {
        self.held.lock().values().map(|v| v.len()).sum()
    }
}

impl LockManager for InMemoryLockManager {
    fn acquire_xid_lock(&self, xid: Xid, owner: ResourceOwnerId) {
        self.held.lock().entry(owner).or_default().push(xid);
    }

    fn transfer(&self, from: ResourceOwnerId, to: ResourceOwnerId) {
        let mut held = self.held.lock();
        if let Some(moved) = held.remove(&from) {
            held.entry(to).or_default().extend(moved);
        }
    }

    fn release_all(&self, owner: ResourceOwnerId) {
        self.held.lock().remove(&owner);
    }

    fn wait_for_xid(&self, _xid: Xid) {
        // Single-process build: the holder always finishes before the
        // waiter runs, so there is nothing to block on.
    }
}

/// Durability log kept in a vector, with flush/ack watermarks.
#[derive(Default)]
pub struct InMemoryLog {
    inner: Mutex<LogInner>,
}

#[derive(Default)]
struct LogInner {
    records: Vec<XactRecord>,
    flushed: LogPosition,
    replica_acked: LogPosition,
}

impl InMemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<XactRecord> {
        self.inner.lock().records.clone()
    }

    pub fn flushed_to(&self) -> LogPosition {
        self.inner.lock().flushed
    }
}

impl DurabilityLog for InMemoryLog {
    fn append(&self, record: XactRecord) -> LogPosition {
        let mut inner = self.inner.lock();
        inner.records.push(record);
        LogPosition::new(inner.records.len() as u64)
    }

    fn flush(&self, upto: LogPosition) {
        let mut inner = self.inner.lock();
        if upto > inner.flushed {
            inner.flushed = upto;
        }
    }

    fn wait_replica_ack(&self, upto: LogPosition) {
        let mut inner = self.inner.lock();
        if upto > inner.replica_acked {
            inner.replica_acked = upto;
        }
    }
}

/// Catalog stub that counts boundary and commit notifications.
#[derive(Default)]
pub struct InMemoryCatalog {
    counters: Mutex<CatalogCounters>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CatalogCounters {
    pub local_accepts: u64,
    pub broadcasts: u64,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counters(&self) -> CatalogCounters {
        *self.counters.lock()
    }
}

impl CatalogSync for InMemoryCatalog {
    fn accept_local_invalidations(&self) {
        self.counters.lock().local_accepts += 1;
    }

    fn broadcast_invalidations(&self) {
        self.counters.lock().broadcasts += 1;
    }
}

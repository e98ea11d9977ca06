//! Cross-session shared transaction bookkeeping
//!
//! These structures are shared by every session in the process, in place
//! of the shared-memory segments a multi-process deployment would map.
//! Each one guards a single O(1)-ish critical section with its own
//! narrow lock; none of them ever goes through the general lock manager.

use meridian_common::{FullTransactionId, Xid};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashMap};

/// Source of local transaction ids. Hands out strictly increasing
/// [`FullTransactionId`]s, skipping the reserved low range on wrap.
pub struct XidAllocator {
    next: Mutex<FullTransactionId>,
}

impl XidAllocator {
    pub fn new() -> Self {
        Self {
            next: Mutex::new(FullTransactionId::from_parts(0, Xid::FIRST_NORMAL)),
        }
    }

    /// Start allocation at a specific id, for tests that need known
    /// values.
    pub fn starting_at(first: FullTransactionId) -> Self {
        Self {
            next: Mutex::new(first),
        }
    }

    pub fn allocate(&self) -> FullTransactionId {
        let mut next = self.next.lock();
        let assigned = *next;
        *next = next.advance();
        assigned
    }
}

impl Default for XidAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Persistent child-to-parent map for subtransactions.
///
/// A sub-XID must be recorded here before it is advertised anywhere
/// else, so a concurrent reader can never observe an XID with no
/// recorded parent.
#[derive(Default)]
pub struct SubtransMap {
    parents: RwLock<HashMap<Xid, Xid>>,
}

impl SubtransMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, child: Xid, parent: Xid) {
        self.parents.write().insert(child, parent);
    }

    pub fn parent_of(&self, xid: Xid) -> Option<Xid> {
        self.parents.read().get(&xid).copied()
    }

    /// Follow parent links to the top-level ancestor.
    pub fn top_ancestor(&self, xid: Xid) -> Xid {
        let parents = self.parents.read();
        let mut current = xid;
        while let Some(&parent) = parents.get(&current) {
            current = parent;
        }
        current
    }

    /// Drop entries for a finished transaction tree.
    pub fn forget(&self, xids: &[Xid]) {
        let mut parents = self.parents.write();
        for xid in xids {
            parents.remove(xid);
        }
    }

    pub fn len(&self) -> usize {
        self.parents.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.parents.read().is_empty()
    }
}

/// Shared table of in-progress transaction ids, ordered by assignment.
///
/// An XID appears here from assignment until commit/abort cleanup; the
/// oldest entry bounds what any reader can still consider current.
#[derive(Default)]
pub struct ActiveXidTable {
    active: RwLock<BTreeSet<FullTransactionId>>,
}

impl ActiveXidTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advertise(&self, xid: FullTransactionId) {
        self.active.write().insert(xid);
    }

    pub fn retire(&self, xid: FullTransactionId) {
        self.active.write().remove(&xid);
    }

    pub fn retire_many(&self, xids: &[FullTransactionId]) {
        let mut active = self.active.write();
        for xid in xids {
            active.remove(xid);
        }
    }

    pub fn is_in_progress(&self, xid: FullTransactionId) -> bool {
        self.active.read().contains(&xid)
    }

    pub fn oldest_in_progress(&self) -> Option<FullTransactionId> {
        self.active.read().iter().next().copied()
    }

    pub fn len(&self) -> usize {
        self.active.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.read().is_empty()
    }
}

/// Bundle of the shared structures one process hosts.
pub struct SharedXactState {
    pub allocator: XidAllocator,
    pub subtrans: SubtransMap,
    pub active: ActiveXidTable,
}

impl SharedXactState {
    pub fn new() -> Self {
        Self {
            allocator: XidAllocator::new(),
            subtrans: SubtransMap::new(),
            active: ActiveXidTable::new(),
        }
    }
}

impl Default for SharedXactState {
    fn default() -> Self {
        Self::new()
    }
}

//! Reader-participant view of a writer's transaction state
//!
//! A read-only participant shares the writer's snapshot instead of
//! maintaining its own stack: the writer publishes its top XID and
//! sub-XID list into a [`WriterXidCache`] under a lightweight lock, and
//! readers consult it through a [`ReaderXidView`]. When the cache
//! overflows its slot capacity, readers fall back to the persistent
//! subtransaction map.

use crate::shared::SharedXactState;
use meridian_common::{FullTransactionId, Xid};
use parking_lot::RwLock;
use std::sync::Arc;

#[derive(Debug, Default, Clone)]
struct WriterSnapshot {
    top_xid: Option<FullTransactionId>,
    /// Sorted by raw id; meaningless once `overflowed` is set.
    subxids: Vec<Xid>,
    overflowed: bool,
    nesting_level: u32,
}

/// Writer-side publication point for the current transaction's XIDs.
pub struct WriterXidCache {
    slots: usize,
    inner: RwLock<WriterSnapshot>,
}

impl WriterXidCache {
    pub fn new(slots: usize) -> Self {
        Self {
            slots,
            inner: RwLock::new(WriterSnapshot::default()),
        }
    }

    pub fn publish_top(&self, top: FullTransactionId, nesting_level: u32) {
        let mut snap = self.inner.write();
        snap.top_xid = Some(top);
        snap.nesting_level = nesting_level;
    }

    pub fn add_subxid(&self, xid: Xid) {
        let mut snap = self.inner.write();
        if snap.overflowed {
            return;
        }
        if snap.subxids.len() >= self.slots {
            snap.overflowed = true;
            snap.subxids.clear();
            return;
        }
        if let Err(pos) = snap.subxids.binary_search_by_key(&xid.raw(), |x| x.raw()) {
            snap.subxids.insert(pos, xid);
        }
    }

    /// Drop sub-XIDs that rolled back. A cache that already overflowed
    /// stays overflowed; the persistent map is authoritative there.
    pub fn remove_subxids(&self, xids: &[Xid]) {
        let mut snap = self.inner.write();
        if snap.overflowed {
            return;
        }
        snap.subxids.retain(|x| !xids.contains(x));
    }

    pub fn set_nesting_level(&self, nesting_level: u32) {
        self.inner.write().nesting_level = nesting_level;
    }

    pub fn reset(&self) {
        *self.inner.write() = WriterSnapshot::default();
    }

    pub fn is_overflowed(&self) -> bool {
        self.inner.read().overflowed
    }

    pub fn top_xid(&self) -> Option<FullTransactionId> {
        self.inner.read().top_xid
    }
}

/// Reader-side lookup against a writer's published state.
#[derive(Clone)]
pub struct ReaderXidView {
    cache: Arc<WriterXidCache>,
    shared: Arc<SharedXactState>,
}

impl ReaderXidView {
    pub fn new(cache: Arc<WriterXidCache>, shared: Arc<SharedXactState>) -> Self {
        Self { cache, shared }
    }

    /// Is `xid` part of the writer's current transaction?
    pub fn is_current_xid(&self, xid: Xid) -> bool {
        let top = {
            let snap = self.cache.inner.read();
            let Some(top) = snap.top_xid else {
                return false;
            };
            if top.xid() == xid {
                return true;
            }
            if !snap.overflowed {
                return snap
                    .subxids
                    .binary_search_by_key(&xid.raw(), |x| x.raw())
                    .is_ok();
            }
            top
        };

        // Cache overflowed: resolve through the persistent map. Anything
        // older than the oldest in-progress transaction cannot be current,
        // which avoids a pointless ancestor walk for ancient ids.
        match self.shared.active.oldest_in_progress() {
            Some(oldest) if !xid.precedes(oldest.xid()) => {}
            _ => return false,
        }

        let mut current = xid;
        loop {
            if current == top.xid() {
                return true;
            }
            match self.shared.subtrans.parent_of(current) {
                Some(parent) => current = parent,
                None => return false,
            }
        }
    }
}

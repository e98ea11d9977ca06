//! Nested transaction stack and XID assignment
//!
//! One [`LocalTransactionManager`] per session owns a contiguous stack of
//! [`TransactionState`] nodes, one per nesting level, with the top level
//! alive for the session's lifetime. XIDs are assigned lazily, oldest
//! ancestor first, and registered in the shared subtransaction map before
//! they become visible anywhere else.

use crate::block::TBlockState;
use crate::config::XactConfig;
use crate::error::{Result, XactError};
use crate::reader::{ReaderXidView, WriterXidCache};
use crate::services::{
    CatalogSync, DurabilityLog, LockManager, LogPosition, ResourceOwnerId, XactRecord,
};
use crate::shared::SharedXactState;
use meridian_common::{
    CommandId, DistributedTransactionId, FullTransactionId, SubTransactionId, Xid,
};
use std::collections::HashMap;
use std::sync::Arc;

/// Low-level transaction state of one nesting level.
///
/// `Default` is both the initial and the terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransState {
    Default,
    Start,
    InProgress,
    Commit,
    Abort,
    Prepare,
}

impl TransState {
    pub fn name(&self) -> &'static str {
        match self {
            TransState::Default => "Default",
            TransState::Start => "Start",
            TransState::InProgress => "InProgress",
            TransState::Commit => "Commit",
            TransState::Abort => "Abort",
            TransState::Prepare => "Prepare",
        }
    }
}

/// One nesting level of the transaction stack.
#[derive(Debug, Clone)]
pub struct TransactionState {
    /// Assigned lazily; a child's id always follows its parent's.
    pub full_xid: Option<FullTransactionId>,
    pub subtransaction_id: SubTransactionId,
    /// Savepoint name, when this level was created by one.
    pub name: Option<String>,
    pub savepoint_level: u32,
    pub trans_state: TransState,
    pub block_state: TBlockState,
    /// 1 at the top level.
    pub nesting_level: u32,
    pub guc_nest_level: u32,
    pub resource_owner: ResourceOwnerId,
    /// Committed child XIDs, sorted ascending by raw id.
    pub child_xids: Vec<Xid>,
}

/// A locally prepared transaction awaiting its second phase.
#[derive(Debug, Clone)]
pub struct PreparedTransaction {
    pub full_xid: FullTransactionId,
    pub children: Vec<Xid>,
    pub resource_owner: ResourceOwnerId,
}

/// Per-session manager of the nested transaction stack.
pub struct LocalTransactionManager {
    session: String,
    stack: Vec<TransactionState>,
    /// Stack indices of every `skip_stride`-th level, ascending. Lets the
    /// current-xid walk leap whole strides whose ids are all too young.
    skip_index: Vec<usize>,
    command_id: CommandId,
    next_subtransaction_id: SubTransactionId,
    next_resource_owner: u64,
    /// Assigned sub-XIDs not yet covered by a durable assignment record.
    unreported_subxids: Vec<Xid>,
    /// Reserved at session start so abort cleanup can proceed even when
    /// allocation fails mid-error.
    emergency_scratch: Vec<u8>,
    snapshot_exported: bool,
    pub(crate) prepared_gid: Option<String>,
    pub(crate) chain_pending: bool,
    prepared: HashMap<String, PreparedTransaction>,
    config: XactConfig,
    shared: Arc<SharedXactState>,
    locks: Arc<dyn LockManager>,
    log: Arc<dyn DurabilityLog>,
    catalog: Arc<dyn CatalogSync>,
    writer_cache: Arc<WriterXidCache>,
}

const EMERGENCY_SCRATCH_BYTES: usize = 8192;

impl LocalTransactionManager {
    pub fn new(
        session: impl Into<String>,
        config: XactConfig,
        shared: Arc<SharedXactState>,
        locks: Arc<dyn LockManager>,
        log: Arc<dyn DurabilityLog>,
        catalog: Arc<dyn CatalogSync>,
    ) -> Self {
        let writer_cache = Arc::new(WriterXidCache::new(config.reader_cache_slots));
        let top = TransactionState {
            full_xid: None,
            subtransaction_id: SubTransactionId::TOP,
            name: None,
            savepoint_level: 0,
            trans_state: TransState::Default,
            block_state: TBlockState::Default,
            nesting_level: 1,
            guc_nest_level: 1,
            resource_owner: ResourceOwnerId::new(1),
            child_xids: Vec::new(),
        };
        Self {
            session: session.into(),
            stack: vec![top],
            skip_index: Vec::new(),
            command_id: CommandId::FIRST,
            next_subtransaction_id: SubTransactionId::TOP.next(),
            next_resource_owner: 2,
            unreported_subxids: Vec::new(),
            emergency_scratch: Vec::with_capacity(EMERGENCY_SCRATCH_BYTES),
            snapshot_exported: false,
            prepared_gid: None,
            chain_pending: false,
            prepared: HashMap::new(),
            config,
            shared,
            locks,
            log,
            catalog,
            writer_cache,
        }
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    pub fn current(&self) -> &TransactionState {
        self.stack.last().expect("stack is never empty")
    }

    pub(crate) fn current_mut(&mut self) -> &mut TransactionState {
        self.stack.last_mut().expect("stack is never empty")
    }

    pub(crate) fn level_mut(&mut self, idx: usize) -> &mut TransactionState {
        &mut self.stack[idx]
    }

    pub(crate) fn levels(&self) -> &[TransactionState] {
        &self.stack
    }

    pub fn nesting_depth(&self) -> usize {
        self.stack.len()
    }

    pub fn command_id(&self) -> CommandId {
        self.command_id
    }

    pub(crate) fn bump_command_id(&mut self) -> CommandId {
        self.command_id = self.command_id.next();
        self.command_id
    }

    pub fn top_full_xid(&self) -> Option<FullTransactionId> {
        self.stack[0].full_xid
    }

    /// Committed child XIDs recorded at the top level, sorted ascending.
    pub fn committed_children(&self) -> Vec<Xid> {
        self.stack[0].child_xids.clone()
    }

    pub fn current_block_state(&self) -> TBlockState {
        self.current().block_state
    }

    pub fn current_trans_state(&self) -> TransState {
        self.current().trans_state
    }

    pub fn has_local_xid(&self) -> bool {
        self.top_full_xid().is_some()
    }

    pub fn catalog(&self) -> &Arc<dyn CatalogSync> {
        &self.catalog
    }

    pub fn writer_cache(&self) -> Arc<WriterXidCache> {
        self.writer_cache.clone()
    }

    pub fn reader_view(&self) -> ReaderXidView {
        ReaderXidView::new(self.writer_cache.clone(), self.shared.clone())
    }

    pub fn mark_snapshot_exported(&mut self) {
        self.snapshot_exported = true;
    }

    pub(crate) fn snapshot_exported(&self) -> bool {
        self.snapshot_exported
    }

    fn fresh_resource_owner(&mut self) -> ResourceOwnerId {
        let owner = ResourceOwnerId::new(self.next_resource_owner);
        self.next_resource_owner += 1;
        owner
    }

    // ---- stack primitives ----

    /// Push a new nesting level. The new node starts in `Default` with
    /// the caller's chosen block state; `start_subtransaction` brings it
    /// live at the next dispatch.
    pub(crate) fn push(&mut self, name: Option<String>, block_state: TBlockState) {
        let owner = self.fresh_resource_owner();
        let parent = self.current();
        let node = TransactionState {
            full_xid: None,
            subtransaction_id: self.next_subtransaction_id,
            name,
            savepoint_level: parent.savepoint_level,
            trans_state: TransState::Default,
            block_state,
            nesting_level: parent.nesting_level + 1,
            guc_nest_level: parent.guc_nest_level + 1,
            resource_owner: owner,
            child_xids: Vec::new(),
        };
        self.next_subtransaction_id = self.next_subtransaction_id.next();
        self.stack.push(node);

        if self.stack.len() % self.config.skip_stride == 0 {
            self.skip_index.push(self.stack.len() - 1);
        }
        self.writer_cache
            .set_nesting_level(self.current().nesting_level);
    }

    /// Pop the current level, handing its resources back to the parent.
    /// The node must already be back in `Default`.
    pub(crate) fn pop(&mut self) -> Result<TransactionState> {
        if self.stack.len() == 1 {
            return Err(XactError::StackUnderflow);
        }
        let current = self.current();
        if current.trans_state != TransState::Default {
            return Err(XactError::PopInBadState(current.trans_state.name()));
        }

        let node = self.stack.pop().expect("checked length above");
        while self
            .skip_index
            .last()
            .is_some_and(|&idx| idx >= self.stack.len())
        {
            self.skip_index.pop();
        }
        self.locks
            .transfer(node.resource_owner, self.current().resource_owner);
        self.writer_cache
            .set_nesting_level(self.current().nesting_level);
        Ok(node)
    }

    // ---- top-level lifecycle ----

    /// Bring the top level live: `Default -> Start -> InProgress`.
    pub(crate) fn start_top(&mut self) {
        let owner = self.fresh_resource_owner();
        let top = &mut self.stack[0];
        debug_assert_eq!(top.trans_state, TransState::Default);
        top.trans_state = TransState::Start;
        top.resource_owner = owner;
        top.subtransaction_id = SubTransactionId::TOP;
        top.trans_state = TransState::InProgress;
        self.command_id = CommandId::FIRST;
        self.next_subtransaction_id = SubTransactionId::TOP.next();
        self.snapshot_exported = false;
        tracing::debug!("[{}] transaction started", self.session);
    }

    /// Write the durable commit record for the top level, if it needs
    /// one. Must happen strictly before any distributed commit
    /// broadcast.
    pub(crate) fn write_commit_record(
        &mut self,
        distributed_id: Option<DistributedTransactionId>,
    ) -> Option<LogPosition> {
        self.flush_assignment_record();
        let top = &mut self.stack[0];
        top.trans_state = TransState::Commit;
        let full = top.full_xid?;

        let position = self.log.append(XactRecord::Commit {
            xid: full.xid(),
            children: top.child_xids.clone(),
            distributed_id,
        });
        self.log.flush(position);
        self.log.wait_replica_ack(position);
        Some(position)
    }

    /// Release everything the committed top level held and return the
    /// stack to idle.
    pub(crate) fn finish_commit(&mut self) {
        debug_assert_eq!(self.stack.len(), 1);
        debug_assert_eq!(self.stack[0].trans_state, TransState::Commit);
        self.retire_top_tree();
        self.catalog.broadcast_invalidations();
        let owner = self.stack[0].resource_owner;
        self.locks.release_all(owner);
        self.reset_top();
        tracing::debug!("[{}] transaction committed", self.session);
    }

    /// Abort the top level. Safe to call again on an already-aborted
    /// level; the second call does nothing.
    pub(crate) fn abort_top(&mut self) {
        // Cleanup must not allocate on the failure path.
        self.emergency_scratch.clear();

        if self.stack[0].trans_state == TransState::Abort {
            return;
        }
        self.flush_assignment_record();
        let top = &mut self.stack[0];
        top.trans_state = TransState::Abort;
        if let Some(full) = top.full_xid {
            let position = self.log.append(XactRecord::Abort {
                xid: full.xid(),
                children: top.child_xids.clone(),
            });
            self.log.flush(position);
        }
        self.retire_top_tree();
        let owner = self.stack[0].resource_owner;
        self.locks.release_all(owner);
        tracing::debug!("[{}] transaction aborted", self.session);
    }

    /// Final cleanup after commit or abort: back to `Default`.
    pub(crate) fn cleanup_top(&mut self) {
        debug_assert!(matches!(
            self.stack[0].trans_state,
            TransState::Commit | TransState::Abort
        ));
        self.reset_top();
    }

    fn retire_top_tree(&mut self) {
        let top = &self.stack[0];
        if let Some(full) = top.full_xid {
            let mut retired = vec![full];
            for child in &top.child_xids {
                retired.push(FullTransactionId::from_parts(full.epoch(), *child));
            }
            self.shared.active.retire_many(&retired);
            self.shared.subtrans.forget(&top.child_xids);
        }
    }

    fn reset_top(&mut self) {
        let top = &mut self.stack[0];
        top.full_xid = None;
        top.child_xids = Vec::new();
        top.trans_state = TransState::Default;
        top.name = None;
        self.command_id = CommandId::FIRST;
        self.next_subtransaction_id = SubTransactionId::TOP.next();
        self.unreported_subxids.clear();
        self.snapshot_exported = false;
        self.writer_cache.reset();
    }

    // ---- subtransaction lifecycle ----

    /// Bring the just-pushed level live.
    pub(crate) fn start_subtransaction(&mut self) {
        let node = self.current_mut();
        debug_assert_eq!(node.trans_state, TransState::Default);
        node.trans_state = TransState::Start;
        node.trans_state = TransState::InProgress;
    }

    /// Commit the current subtransaction and pop it, merging its XIDs
    /// into the parent's sorted child array.
    pub(crate) fn commit_subtransaction(&mut self) -> Result<()> {
        debug_assert!(self.stack.len() > 1);
        let node = self.current_mut();
        debug_assert_eq!(node.trans_state, TransState::InProgress);
        node.trans_state = TransState::Commit;
        node.trans_state = TransState::Default;

        let node = self.pop()?;
        if let Some(full) = node.full_xid {
            let parent = self.current_mut();
            debug_assert!(
                parent.full_xid.is_some(),
                "child held an XID but parent does not"
            );
            insert_sorted(&mut parent.child_xids, full.xid());
            for child in node.child_xids {
                insert_sorted(&mut parent.child_xids, child);
            }
        }
        Ok(())
    }

    /// Abort the current subtransaction in place. The level stays on the
    /// stack until `cleanup_subtransaction` pops it.
    pub(crate) fn abort_subtransaction(&mut self) {
        self.emergency_scratch.clear();

        let node = self.current_mut();
        if node.trans_state == TransState::Abort {
            return;
        }
        node.trans_state = TransState::Abort;

        let full = node.full_xid;
        let children = std::mem::take(&mut node.child_xids);
        let owner = node.resource_owner;
        if let Some(full) = full {
            let position = self.log.append(XactRecord::Abort {
                xid: full.xid(),
                children: children.clone(),
            });
            self.log.flush(position);

            let mut retired = vec![full];
            let mut forgotten = vec![full.xid()];
            for child in &children {
                retired.push(FullTransactionId::from_parts(full.epoch(), *child));
                forgotten.push(*child);
            }
            self.shared.active.retire_many(&retired);
            self.shared.subtrans.forget(&forgotten);
            self.writer_cache.remove_subxids(&forgotten);
            self.unreported_subxids.retain(|x| !forgotten.contains(x));
        }
        self.locks.release_all(owner);
    }

    /// Pop an aborted (or never-started) subtransaction.
    pub(crate) fn cleanup_subtransaction(&mut self) -> Result<TransactionState> {
        let node = self.current_mut();
        debug_assert!(matches!(
            node.trans_state,
            TransState::Abort | TransState::Default
        ));
        node.trans_state = TransState::Default;
        self.pop()
    }

    // ---- distributed commit seam ----

    /// First half of a distributed coordinator commit: commit any
    /// savepoint levels the COMMIT left open, then write the durable
    /// local commit record, stamped with the distributed identity, while
    /// the commit broadcast is still pending. Returns `Ok(None)` when
    /// the coordinator had no local XID and therefore nothing durable to
    /// write.
    pub fn commit_record_for_distributed(
        &mut self,
        distributed_id: DistributedTransactionId,
    ) -> Result<Option<LogPosition>> {
        while self.current().block_state == TBlockState::SubCommit {
            self.commit_subtransaction()?;
        }
        Ok(self.write_commit_record(Some(distributed_id)))
    }

    /// Second half: after every participant acknowledged, release local
    /// resources and return the session to idle.
    pub fn finish_distributed_commit(&mut self) {
        self.finish_commit();
        self.current_mut().block_state = TBlockState::Default;
    }

    // ---- XID assignment ----

    /// Assign an XID to the current level, assigning any unassigned
    /// ancestors first so a child id never precedes its parent's.
    pub fn assign_xid(&mut self) -> FullTransactionId {
        if let Some(full) = self.current().full_xid {
            return full;
        }

        // Ancestors lacking an XID form a contiguous run ending at the
        // current level; collect it iteratively so stack depth stays
        // bounded.
        let mut first_unassigned = self.stack.len();
        while first_unassigned > 0 && self.stack[first_unassigned - 1].full_xid.is_none() {
            first_unassigned -= 1;
        }
        let run_len = self.stack.len() - first_unassigned;

        for idx in first_unassigned..self.stack.len() {
            let full = self.shared.allocator.allocate();
            let parent_xid = if idx > 0 {
                Some(
                    self.stack[idx - 1]
                        .full_xid
                        .expect("ancestors are assigned oldest-first")
                        .xid(),
                )
            } else {
                None
            };

            // Parent linkage must be recorded before the id is visible
            // anywhere else.
            if let Some(parent) = parent_xid {
                self.shared.subtrans.record(full.xid(), parent);
            }
            self.shared.active.advertise(full);
            self.locks
                .acquire_xid_lock(full.xid(), self.stack[idx].resource_owner);
            self.stack[idx].full_xid = Some(full);

            if idx == 0 {
                self.writer_cache
                    .publish_top(full, self.current().nesting_level);
            } else {
                self.unreported_subxids.push(full.xid());
                self.writer_cache.add_subxid(full.xid());
            }
            tracing::trace!(
                "[{}] assigned xid {} at nesting level {}",
                self.session,
                full,
                self.stack[idx].nesting_level
            );
        }

        if self.unreported_subxids.len() >= self.config.subxid_flush_batch || run_len > 1 {
            self.flush_assignment_record();
        }

        self.current().full_xid.expect("just assigned")
    }

    /// Flush the pending batch of assigned sub-XIDs as one durable
    /// assignment record.
    pub(crate) fn flush_assignment_record(&mut self) {
        if self.unreported_subxids.is_empty() {
            return;
        }
        let Some(top) = self.stack[0].full_xid else {
            return;
        };
        let subxids = std::mem::take(&mut self.unreported_subxids);
        self.log.append(XactRecord::Assignment {
            top: top.xid(),
            subxids,
        });
    }

    // ---- current-xid checks ----

    /// Is `xid` the id of this session's transaction or any live
    /// subtransaction or committed child of one?
    ///
    /// Walks the stack deepest-first: per level, checks the level's own
    /// id, binary-searches the sorted child array, and stops early once
    /// `xid` is younger than the level's own id, since everything
    /// shallower is older still. The skip index leaps whole strides
    /// whose base id is already younger than `xid`.
    pub fn is_current_xid(&self, xid: Xid) -> bool {
        let mut idx = self.stack.len();
        while idx > 0 {
            idx -= 1;
            let node = &self.stack[idx];
            if node.trans_state == TransState::Abort {
                continue;
            }
            let Some(full) = node.full_xid else {
                continue;
            };
            let own = full.xid();
            if xid == own {
                return true;
            }
            if node
                .child_xids
                .binary_search_by_key(&xid.raw(), |x| x.raw())
                .is_ok()
            {
                return true;
            }
            if own.precedes(xid) {
                return false;
            }
            for &skip in self.skip_index.iter().rev() {
                if skip >= idx {
                    continue;
                }
                match self.stack[skip].full_xid {
                    Some(f) if xid.precedes(f.xid()) => idx = skip,
                    _ => break,
                }
            }
        }
        false
    }

    /// Linear-scan oracle for `is_current_xid`; used by tests to check
    /// the optimized walk.
    pub fn is_current_xid_linear(&self, xid: Xid) -> bool {
        self.stack.iter().any(|node| {
            node.trans_state != TransState::Abort
                && (node.full_xid.is_some_and(|f| f.xid() == xid)
                    || node.child_xids.contains(&xid))
        })
    }

    // ---- prepare/finish of two-phase locals ----

    /// Durably prepare the current top-level transaction under a GID and
    /// return the stack to idle. Locks stay held by the prepared
    /// transaction until [`finish_prepared`](Self::finish_prepared).
    pub fn prepare_current_transaction(&mut self, gid: &str) -> Result<LogPosition> {
        debug_assert_eq!(self.stack.len(), 1, "subtransactions committed before prepare");
        let full = self.assign_xid();
        self.flush_assignment_record();

        let top = &mut self.stack[0];
        top.trans_state = TransState::Prepare;
        let position = self.log.append(XactRecord::Prepare {
            xid: full.xid(),
            gid: gid.to_string(),
        });
        self.log.flush(position);
        self.log.wait_replica_ack(position);

        self.prepared.insert(
            gid.to_string(),
            PreparedTransaction {
                full_xid: full,
                children: top.child_xids.clone(),
                resource_owner: top.resource_owner,
            },
        );

        // The prepared transaction keeps its active-table entries and
        // locks; only the session stack goes back to idle.
        self.reset_top();
        self.current_mut().block_state = TBlockState::Default;
        tracing::info!("[{}] prepared transaction {}", self.session, gid);
        Ok(position)
    }

    /// Second phase for a prepared transaction: commit or abort it.
    pub fn finish_prepared(
        &mut self,
        gid: &str,
        commit: bool,
        distributed_id: Option<DistributedTransactionId>,
    ) -> Result<()> {
        let prepared = self
            .prepared
            .remove(gid)
            .ok_or_else(|| XactError::UnknownPreparedTransaction(gid.to_string()))?;

        let record = if commit {
            XactRecord::Commit {
                xid: prepared.full_xid.xid(),
                children: prepared.children.clone(),
                distributed_id,
            }
        } else {
            XactRecord::Abort {
                xid: prepared.full_xid.xid(),
                children: prepared.children.clone(),
            }
        };
        let position = self.log.append(record);
        self.log.flush(position);
        if commit {
            self.log.wait_replica_ack(position);
        }

        let mut retired = vec![prepared.full_xid];
        for child in &prepared.children {
            retired.push(FullTransactionId::from_parts(
                prepared.full_xid.epoch(),
                *child,
            ));
        }
        self.shared.active.retire_many(&retired);
        self.shared.subtrans.forget(&prepared.children);
        self.locks.release_all(prepared.resource_owner);
        if commit {
            self.catalog.broadcast_invalidations();
        }
        tracing::info!(
            "[{}] finished prepared transaction {} ({})",
            self.session,
            gid,
            if commit { "commit" } else { "abort" }
        );
        Ok(())
    }

    pub fn prepared_gids(&self) -> Vec<String> {
        self.prepared.keys().cloned().collect()
    }
}

fn insert_sorted(xids: &mut Vec<Xid>, xid: Xid) {
    if let Err(pos) = xids.binary_search_by_key(&xid.raw(), |x| x.raw()) {
        xids.insert(pos, xid);
    }
}

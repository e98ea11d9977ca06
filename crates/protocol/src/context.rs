//! Per-statement distributed context copied to participants

use meridian_common::{
    CommandId, DistributedSnapshot, DistributedTransactionId, TransactionOptions,
};
use serde::{Deserialize, Serialize};

/// Immutable value shipped with every statement the coordinator
/// dispatches: everything a participant needs to join the statement's
/// distributed transaction. Built once per statement and copied by value
/// to each participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DtxContextInfo {
    /// Identity of the distributed transaction, if one is open.
    pub distributed_id: Option<DistributedTransactionId>,
    /// Packed transaction option word; see [`TransactionOptions`].
    pub options_word: u32,
    /// Coordinator's command counter at dispatch time.
    pub command_id: CommandId,
    /// Coordinator's transaction nesting level at dispatch time.
    pub nesting_level: u32,
    /// Distributed snapshot for the statement, when one was taken.
    pub snapshot: Option<DistributedSnapshot>,
}

impl DtxContextInfo {
    /// Context for purely local execution: no distributed transaction.
    pub fn local_only() -> Self {
        Self {
            distributed_id: None,
            options_word: TransactionOptions::default().pack(),
            command_id: CommandId::FIRST,
            nesting_level: 1,
            snapshot: None,
        }
    }

    pub fn options(&self) -> TransactionOptions {
        TransactionOptions::unpack(self.options_word)
    }

    /// GID of the distributed transaction, if one is open.
    pub fn gid(&self) -> Option<String> {
        self.distributed_id.map(|id| id.gid())
    }
}

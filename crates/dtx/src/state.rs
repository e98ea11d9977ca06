//! Coordinator-side distributed transaction state machine
//!
//! States advance monotonically along exactly one of the commit or abort
//! paths; [`DtxState::transition`] validates every step and rejects
//! anything else. The unconditional reset at local transaction end is
//! the only way back to `None` outside these paths.

use crate::error::DtxError;

/// State of the coordinator's current distributed transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DtxState {
    /// No distributed transaction.
    None,
    /// Open and accepting work.
    ActiveDistributed,

    // one-phase fast path
    OnePhaseCommit,
    NotifyingOnePhaseCommit,

    // two-phase happy path
    Preparing,
    Prepared,
    NotifyingCommitPrepared,
    InsertingCommitted,
    InsertedCommitted,
    InsertingForgetCommitted,
    InsertedForgetCommitted,

    // abort paths
    NotifyingAbortNoPrepared,
    NotifyingAbortSomePrepared,
    NotifyingAbortPrepared,
    NotifyingOnePhaseAbort,

    // bounded phase-2 retry
    RetryCommitPrepared,
    RetryAbortPrepared,

    /// Discovered committed during crash recovery; phase 2 still owed.
    CrashCommitted,
}

impl DtxState {
    pub fn name(&self) -> &'static str {
        match self {
            DtxState::None => "None",
            DtxState::ActiveDistributed => "ActiveDistributed",
            DtxState::OnePhaseCommit => "OnePhaseCommit",
            DtxState::NotifyingOnePhaseCommit => "NotifyingOnePhaseCommit",
            DtxState::Preparing => "Preparing",
            DtxState::Prepared => "Prepared",
            DtxState::NotifyingCommitPrepared => "NotifyingCommitPrepared",
            DtxState::InsertingCommitted => "InsertingCommitted",
            DtxState::InsertedCommitted => "InsertedCommitted",
            DtxState::InsertingForgetCommitted => "InsertingForgetCommitted",
            DtxState::InsertedForgetCommitted => "InsertedForgetCommitted",
            DtxState::NotifyingAbortNoPrepared => "NotifyingAbortNoPrepared",
            DtxState::NotifyingAbortSomePrepared => "NotifyingAbortSomePrepared",
            DtxState::NotifyingAbortPrepared => "NotifyingAbortPrepared",
            DtxState::NotifyingOnePhaseAbort => "NotifyingOnePhaseAbort",
            DtxState::RetryCommitPrepared => "RetryCommitPrepared",
            DtxState::RetryAbortPrepared => "RetryAbortPrepared",
            DtxState::CrashCommitted => "CrashCommitted",
        }
    }

    /// Validate one step; returns the new state or an error naming the
    /// rejected edge.
    pub fn transition(self, to: DtxState) -> Result<DtxState, DtxError> {
        use DtxState::*;
        let valid = matches!(
            (self, to),
            (None, ActiveDistributed)
                | (None, CrashCommitted)
                | (ActiveDistributed, Preparing)
                | (ActiveDistributed, OnePhaseCommit)
                | (ActiveDistributed, NotifyingAbortNoPrepared)
                | (OnePhaseCommit, NotifyingOnePhaseCommit)
                | (OnePhaseCommit, NotifyingAbortNoPrepared)
                | (OnePhaseCommit, NotifyingOnePhaseAbort)
                | (NotifyingOnePhaseCommit, None)
                | (NotifyingOnePhaseCommit, NotifyingOnePhaseAbort)
                | (Preparing, Prepared)
                | (Preparing, NotifyingAbortSomePrepared)
                | (Prepared, NotifyingCommitPrepared)
                | (Prepared, NotifyingAbortPrepared)
                | (NotifyingCommitPrepared, InsertingCommitted)
                | (InsertingCommitted, InsertedCommitted)
                | (InsertedCommitted, InsertingForgetCommitted)
                | (InsertedCommitted, RetryCommitPrepared)
                | (RetryCommitPrepared, InsertingForgetCommitted)
                | (InsertingForgetCommitted, InsertedForgetCommitted)
                | (InsertedForgetCommitted, None)
                | (NotifyingAbortNoPrepared, None)
                | (NotifyingAbortSomePrepared, None)
                | (NotifyingAbortSomePrepared, RetryAbortPrepared)
                | (NotifyingAbortPrepared, None)
                | (NotifyingAbortPrepared, RetryAbortPrepared)
                | (NotifyingOnePhaseAbort, None)
                | (RetryAbortPrepared, None)
                | (CrashCommitted, NotifyingCommitPrepared)
                | (CrashCommitted, None)
        );
        if valid {
            Ok(to)
        } else {
            Err(DtxError::InvalidTransition {
                from: self.name(),
                to: to.name(),
            })
        }
    }

    pub fn is_active(&self) -> bool {
        *self != DtxState::None
    }

    pub fn is_retry(&self) -> bool {
        matches!(
            self,
            DtxState::RetryCommitPrepared | DtxState::RetryAbortPrepared
        )
    }

    /// States in which at least one participant may hold a prepared
    /// transaction.
    pub fn some_participant_prepared(&self) -> bool {
        !matches!(
            self,
            DtxState::None
                | DtxState::ActiveDistributed
                | DtxState::OnePhaseCommit
                | DtxState::NotifyingOnePhaseCommit
                | DtxState::NotifyingAbortNoPrepared
                | DtxState::NotifyingOnePhaseAbort
        )
    }
}

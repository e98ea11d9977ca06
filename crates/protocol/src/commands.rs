//! Distributed transaction protocol commands

use serde::{Deserialize, Serialize};
use std::fmt;

/// Commands the coordinator sends to participants to drive a distributed
/// transaction through two-phase commit, plus the subtransaction commands
/// that keep writer nesting aligned with the coordinator's stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DtxProtocolCommand {
    /// Carried with ordinary statements: the participant stays in (or
    /// enters) implicit-writer mode for this distributed transaction.
    StayAtOrBecomeImplicitWriter,
    /// Phase 1: durably prepare.
    Prepare,
    /// Single-participant fast path: commit without a prepare round.
    CommitOnePhase,
    /// Phase 2: commit a prepared participant.
    CommitPrepared,
    /// Abort when nothing was prepared anywhere.
    AbortNoPrepared,
    /// Abort when some participants prepared and some did not.
    AbortSomePrepared,
    /// Abort when every participant prepared.
    AbortPrepared,
    /// Phase 2 retry after a reconnect; idempotent on the participant.
    RetryCommitPrepared,
    /// Abort retry after a reconnect; idempotent on the participant.
    RetryAbortPrepared,
    /// Issued by the recovery process for an in-doubt prepared transaction.
    RecoveryCommitPrepared,
    /// Issued by the recovery process for an orphaned prepared transaction.
    RecoveryAbortPrepared,
    /// Mirror a coordinator savepoint onto the writer participant.
    SubtransactionBegin,
    /// Mirror a RELEASE SAVEPOINT.
    SubtransactionRelease,
    /// Mirror a ROLLBACK TO SAVEPOINT.
    SubtransactionRollback,
}

impl DtxProtocolCommand {
    /// Convert to the wire header value.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StayAtOrBecomeImplicitWriter => "implicit_writer",
            Self::Prepare => "prepare",
            Self::CommitOnePhase => "commit_onephase",
            Self::CommitPrepared => "commit_prepared",
            Self::AbortNoPrepared => "abort_no_prepared",
            Self::AbortSomePrepared => "abort_some_prepared",
            Self::AbortPrepared => "abort_prepared",
            Self::RetryCommitPrepared => "retry_commit_prepared",
            Self::RetryAbortPrepared => "retry_abort_prepared",
            Self::RecoveryCommitPrepared => "recovery_commit_prepared",
            Self::RecoveryAbortPrepared => "recovery_abort_prepared",
            Self::SubtransactionBegin => "subtransaction_begin",
            Self::SubtransactionRelease => "subtransaction_release",
            Self::SubtransactionRollback => "subtransaction_rollback",
        }
    }

    /// Parse from the wire header value.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "implicit_writer" => Some(Self::StayAtOrBecomeImplicitWriter),
            "prepare" => Some(Self::Prepare),
            "commit_onephase" => Some(Self::CommitOnePhase),
            "commit_prepared" => Some(Self::CommitPrepared),
            "abort_no_prepared" => Some(Self::AbortNoPrepared),
            "abort_some_prepared" => Some(Self::AbortSomePrepared),
            "abort_prepared" => Some(Self::AbortPrepared),
            "retry_commit_prepared" => Some(Self::RetryCommitPrepared),
            "retry_abort_prepared" => Some(Self::RetryAbortPrepared),
            "recovery_commit_prepared" => Some(Self::RecoveryCommitPrepared),
            "recovery_abort_prepared" => Some(Self::RecoveryAbortPrepared),
            "subtransaction_begin" => Some(Self::SubtransactionBegin),
            "subtransaction_release" => Some(Self::SubtransactionRelease),
            "subtransaction_rollback" => Some(Self::SubtransactionRollback),
            _ => None,
        }
    }

    /// Commands that finalize phase 2 of a commit; these are broadcast
    /// with interrupts held off and drive the retry machinery on failure.
    pub fn is_commit_phase_two(&self) -> bool {
        matches!(
            self,
            Self::CommitPrepared | Self::RetryCommitPrepared | Self::RecoveryCommitPrepared
        )
    }

    /// Commands that abort some shape of the distributed transaction.
    pub fn is_abort(&self) -> bool {
        matches!(
            self,
            Self::AbortNoPrepared
                | Self::AbortSomePrepared
                | Self::AbortPrepared
                | Self::RetryAbortPrepared
                | Self::RecoveryAbortPrepared
        )
    }
}

impl fmt::Display for DtxProtocolCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

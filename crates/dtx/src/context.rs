//! Distributed context classifier
//!
//! Once per inbound statement, the process decides what role it plays in
//! that statement's transaction: coordinator, plain local, participant
//! writer, or participant reader. Everything downstream gates on the
//! resulting [`DistributedTransactionContext`], and it resets to
//! `LocalOnly` when the unit of work ends.

use meridian_protocol::DtxContextInfo;

/// What kind of process is classifying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessRole {
    /// Accepts client connections and dispatches to participants.
    Coordinator,
    /// Executes dispatched statements.
    Worker,
    /// Maintenance process; never joins distributed transactions.
    Utility,
}

/// Role of this process for one statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DistributedTransactionContext {
    /// Purely local execution.
    #[default]
    LocalOnly,
    /// Coordinator able to open distributed transactions.
    CoordinatorDistributedCapable,
    /// Coordinator re-driving phase 2 after a broadcast failure.
    CoordinatorRetryPhaseTwo,
    /// Catalog-only singleton statement on the coordinator's own
    /// executor.
    ParticipantEntrySingleton,
    /// Participant running an auto-commit statement outside two-phase
    /// commit.
    ParticipantAutoCommitImplicit,
    /// Participant writer in an explicitly begun transaction.
    ParticipantTwoPhaseExplicitWriter,
    /// Participant writer in an implicit (statement-scoped) transaction.
    ParticipantTwoPhaseImplicitWriter,
    /// Read-only participant piggybacking on a writer's snapshot.
    ParticipantReader,
    /// Participant holding a prepared transaction awaiting phase 2.
    ParticipantPrepared,
    /// Utility process; always local.
    UtilityLocal,
}

impl DistributedTransactionContext {
    pub fn name(&self) -> &'static str {
        match self {
            Self::LocalOnly => "LocalOnly",
            Self::CoordinatorDistributedCapable => "CoordinatorDistributedCapable",
            Self::CoordinatorRetryPhaseTwo => "CoordinatorRetryPhaseTwo",
            Self::ParticipantEntrySingleton => "ParticipantEntrySingleton",
            Self::ParticipantAutoCommitImplicit => "ParticipantAutoCommitImplicit",
            Self::ParticipantTwoPhaseExplicitWriter => "ParticipantTwoPhaseExplicitWriter",
            Self::ParticipantTwoPhaseImplicitWriter => "ParticipantTwoPhaseImplicitWriter",
            Self::ParticipantReader => "ParticipantReader",
            Self::ParticipantPrepared => "ParticipantPrepared",
            Self::UtilityLocal => "UtilityLocal",
        }
    }

    /// Does this context require the participant to join two-phase
    /// commit as a writer?
    pub fn is_two_phase_writer(&self) -> bool {
        matches!(
            self,
            Self::ParticipantTwoPhaseExplicitWriter | Self::ParticipantTwoPhaseImplicitWriter
        )
    }
}

/// Inputs the classifier sees for one statement.
#[derive(Debug, Clone, Copy)]
pub struct ClassifyInput<'a> {
    pub role: ProcessRole,
    /// Whether the distributed transaction subsystem is initialized in
    /// this process.
    pub dtx_initialized: bool,
    /// A phase-2 broadcast failed and the coordinator is re-driving it;
    /// no new distributed work may start until it resolves.
    pub retry_phase_two: bool,
    /// Statement targets the coordinator's own entry executor rather
    /// than a real worker.
    pub entry_db: bool,
    pub context: &'a DtxContextInfo,
}

/// Classify this process's role for one statement.
pub fn classify_context(input: &ClassifyInput<'_>) -> DistributedTransactionContext {
    match input.role {
        ProcessRole::Utility => DistributedTransactionContext::UtilityLocal,
        ProcessRole::Coordinator => {
            if !input.dtx_initialized {
                DistributedTransactionContext::LocalOnly
            } else if input.retry_phase_two {
                DistributedTransactionContext::CoordinatorRetryPhaseTwo
            } else {
                DistributedTransactionContext::CoordinatorDistributedCapable
            }
        }
        ProcessRole::Worker => {
            if input.context.distributed_id.is_none() {
                return DistributedTransactionContext::LocalOnly;
            }
            let options = input.context.options();
            if input.entry_db {
                return DistributedTransactionContext::ParticipantEntrySingleton;
            }
            if options.read_only && !options.needs_two_phase {
                return DistributedTransactionContext::ParticipantReader;
            }
            if !options.needs_two_phase {
                return DistributedTransactionContext::ParticipantAutoCommitImplicit;
            }
            if options.explicit_begin {
                DistributedTransactionContext::ParticipantTwoPhaseExplicitWriter
            } else {
                DistributedTransactionContext::ParticipantTwoPhaseImplicitWriter
            }
        }
    }
}

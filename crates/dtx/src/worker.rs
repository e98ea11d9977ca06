//! Worker-side protocol executor
//!
//! A [`WorkerSession`] owns one participant's local transaction machine
//! and drives it from received protocol commands: statements enroll it
//! as an implicit or explicit writer, prepare/commit-prepared/abort run
//! the participant's half of two-phase commit, and the subtransaction
//! commands keep its savepoint nesting aligned with the coordinator's.

use crate::context::{
    classify_context, ClassifyInput, DistributedTransactionContext, ProcessRole,
};
use crate::error::{DtxError, Result};
use meridian_common::{parse_gid, Gxid, ParticipantId};
use meridian_protocol::{
    DtxContextInfo, DtxMessage, DtxProtocolCommand, DtxResponse, WireEnvelope,
};
use meridian_xact::{LocalTransactionManager, TBlockState, TransactionStatus, XactError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// One participant's session state.
pub struct WorkerSession {
    id: ParticipantId,
    local: LocalTransactionManager,
    context: DistributedTransactionContext,
    current_gid: Option<String>,
    /// Wait-gxids to attach to the next response; set when this worker
    /// knows of other in-flight distributed transactions the coordinator
    /// must see finished first.
    pending_wait_gxids: Vec<Gxid>,
}

impl WorkerSession {
    pub fn new(id: ParticipantId, local: LocalTransactionManager) -> Self {
        Self {
            id,
            local,
            context: DistributedTransactionContext::LocalOnly,
            current_gid: None,
            pending_wait_gxids: Vec::new(),
        }
    }

    pub fn participant_id(&self) -> ParticipantId {
        self.id
    }

    pub fn context(&self) -> DistributedTransactionContext {
        self.context
    }

    pub fn local(&self) -> &LocalTransactionManager {
        &self.local
    }

    pub fn local_mut(&mut self) -> &mut LocalTransactionManager {
        &mut self.local
    }

    pub fn set_wait_gxids(&mut self, gxids: Vec<Gxid>) {
        self.pending_wait_gxids = gxids;
    }

    /// Classify an inbound statement's context and open the local
    /// transaction for a fresh unit of work. An explicit-begin request
    /// replays the client's BEGIN before the triggering statement runs.
    pub fn begin_statement(
        &mut self,
        info: &DtxContextInfo,
    ) -> Result<DistributedTransactionContext> {
        let context = classify_context(&ClassifyInput {
            role: ProcessRole::Worker,
            dtx_initialized: true,
            retry_phase_two: false,
            entry_db: false,
            context: info,
        });

        let gid = info.gid();
        if gid != self.current_gid {
            // Fresh unit of work: finding the local machine mid-transaction
            // means coordinator and worker state have diverged.
            if self.local.transaction_status() != TransactionStatus::Idle {
                return Err(DtxError::MidTransactionStart);
            }
            self.current_gid = gid;

            if context.is_two_phase_writer() {
                self.local.start_statement()?;
                if info.options().explicit_begin {
                    self.local.begin_transaction_block()?;
                } else {
                    self.local.begin_implicit_transaction_block()?;
                }
                self.local.finish_statement()?;
            }
        }
        self.context = context;
        Ok(context)
    }

    /// Execute one dispatched write statement under the given context.
    pub fn run_write_statement(&mut self, info: &DtxContextInfo) -> Result<()> {
        self.begin_statement(info)?;
        self.local.start_statement()?;
        self.local.assign_xid();
        self.local.finish_statement()?;
        Ok(())
    }

    /// Entry point for the worker bootstrap: run one received protocol
    /// command against the local machine.
    pub fn execute_received_command(
        &mut self,
        command: DtxProtocolCommand,
        gid: &str,
        context: Option<&DtxContextInfo>,
        savepoint: Option<&str>,
    ) -> Result<()> {
        tracing::debug!("[{}] received {} for {}", self.id, command, gid);
        match command {
            DtxProtocolCommand::StayAtOrBecomeImplicitWriter => {
                let info = context.ok_or(DtxError::MissingContext)?;
                self.run_write_statement(info)
            }

            DtxProtocolCommand::Prepare => {
                let effective = match self.local.current_block_state() {
                    // Explicitly begun block, possibly with mirrored
                    // savepoints still open; the block layer commits
                    // those as part of the prepare.
                    TBlockState::InProgress | TBlockState::SubInProgress => {
                        self.local.start_statement()?;
                        let effective = self.local.prepare_transaction_block(gid)?;
                        self.local.finish_statement()?;
                        effective
                    }
                    // Implicit writers have no client to issue PREPARE
                    // TRANSACTION; prepare the statement-scoped
                    // transaction directly. Savepoints cannot exist here.
                    TBlockState::ImplicitInProgress => {
                        self.local.prepare_current_transaction(gid)?;
                        true
                    }
                    _ => false,
                };
                if !effective {
                    self.force_local_abort()?;
                    self.reset_unit_of_work();
                    return Err(DtxError::Local(XactError::InFailedTransaction));
                }
                self.context = DistributedTransactionContext::ParticipantPrepared;
                Ok(())
            }

            DtxProtocolCommand::CommitOnePhase => {
                if self.local.transaction_status() != TransactionStatus::Idle {
                    self.local.start_statement()?;
                    self.local.end_transaction_block(false)?;
                    self.local.finish_statement()?;
                }
                self.reset_unit_of_work();
                Ok(())
            }

            DtxProtocolCommand::CommitPrepared
            | DtxProtocolCommand::RetryCommitPrepared
            | DtxProtocolCommand::RecoveryCommitPrepared => {
                let distributed_id = parse_gid(gid).ok();
                match self.local.finish_prepared(gid, true, distributed_id) {
                    Ok(()) => {}
                    // Retries are idempotent: an earlier attempt may have
                    // finished this transaction before the reply was lost.
                    Err(XactError::UnknownPreparedTransaction(_))
                        if command != DtxProtocolCommand::CommitPrepared => {}
                    Err(e) => return Err(e.into()),
                }
                self.reset_unit_of_work();
                Ok(())
            }

            DtxProtocolCommand::AbortNoPrepared => {
                self.force_local_abort()?;
                self.reset_unit_of_work();
                Ok(())
            }

            DtxProtocolCommand::AbortSomePrepared => {
                if self.local.prepared_gids().iter().any(|g| g == gid) {
                    self.local.finish_prepared(gid, false, None)?;
                } else {
                    self.force_local_abort()?;
                }
                self.reset_unit_of_work();
                Ok(())
            }

            DtxProtocolCommand::AbortPrepared
            | DtxProtocolCommand::RetryAbortPrepared
            | DtxProtocolCommand::RecoveryAbortPrepared => {
                match self.local.finish_prepared(gid, false, None) {
                    Ok(()) => {}
                    Err(XactError::UnknownPreparedTransaction(_)) => {}
                    Err(e) => return Err(e.into()),
                }
                self.reset_unit_of_work();
                Ok(())
            }

            DtxProtocolCommand::SubtransactionBegin => {
                let name = savepoint.ok_or(DtxError::MissingSavepointName)?;
                self.local.start_statement()?;
                self.local.define_savepoint(name)?;
                self.local.finish_statement()?;
                Ok(())
            }

            DtxProtocolCommand::SubtransactionRelease => {
                let name = savepoint.ok_or(DtxError::MissingSavepointName)?;
                self.local.start_statement()?;
                self.local.release_savepoint(name)?;
                self.local.finish_statement()?;
                Ok(())
            }

            DtxProtocolCommand::SubtransactionRollback => {
                let name = savepoint.ok_or(DtxError::MissingSavepointName)?;
                self.local.start_statement()?;
                self.local.rollback_to_savepoint(name)?;
                self.local.finish_statement()?;
                Ok(())
            }
        }
    }

    /// Handle a typed message from the gang and build the reply.
    pub fn handle_message(&mut self, message: &DtxMessage) -> DtxResponse {
        let result = self.execute_received_command(
            message.command,
            &message.gid,
            message.context.as_ref(),
            message.savepoint_name.as_deref(),
        );
        match result {
            Ok(()) => {
                let waits = std::mem::take(&mut self.pending_wait_gxids);
                DtxResponse::succeeded(self.id).with_wait_gxids(waits)
            }
            Err(e) => {
                tracing::warn!("[{}] {} failed: {}", self.id, message.command, e);
                DtxResponse::failed(self.id, e.to_string())
            }
        }
    }

    fn force_local_abort(&mut self) -> Result<()> {
        self.local.abort_current_transaction();
        if self.local.transaction_status() == TransactionStatus::InFailedTransaction {
            // An explicit block holds its failed state for a client
            // ROLLBACK that will never come from a worker; replay it.
            self.local.start_statement()?;
            self.local.user_abort_transaction_block(false)?;
            self.local.finish_statement()?;
        }
        Ok(())
    }

    fn reset_unit_of_work(&mut self) {
        self.current_gid = None;
        self.context = DistributedTransactionContext::LocalOnly;
    }
}

/// Wire a worker session into a gang as a participant handler. The
/// session is shared with the factory so its state survives gang
/// reconnects.
pub fn worker_handler(
    session: Arc<Mutex<WorkerSession>>,
) -> impl FnMut(WireEnvelope) -> WireEnvelope + Send + 'static {
    move |envelope| {
        let response = match DtxMessage::from_envelope(envelope) {
            Ok(message) => session.lock().handle_message(&message),
            Err(e) => {
                let id = session.lock().participant_id();
                DtxResponse::failed(id, format!("unparseable message: {e}"))
            }
        };
        WireEnvelope::new(
            serde_json::to_vec(&response).expect("response serializes"),
            HashMap::new(),
        )
    }
}

//! Coordinator session: local machine plus distributed manager
//!
//! This is the surface the statement executor drives. Each method runs
//! one client statement through the local block layer and, when a
//! distributed transaction is open, the matching distributed protocol
//! work: statement fan-out, savepoint mirroring, and the commit/abort
//! wrapping of two-phase commit.

use crate::error::{DtxError, Result};
use crate::manager::DtxManager;
use meridian_common::{ParticipantId, TransactionOptions};
use meridian_dispatch::Gang;
use meridian_protocol::{DtxMessage, DtxProtocolCommand};
use meridian_xact::{
    ErrorSeverity, LocalTransactionManager, TBlockState, TransactionStatus,
};

/// One coordinator backend session.
pub struct CoordinatorSession<G: Gang> {
    local: LocalTransactionManager,
    dtx: DtxManager<G>,
}

impl<G: Gang> CoordinatorSession<G> {
    pub fn new(local: LocalTransactionManager, dtx: DtxManager<G>) -> Self {
        Self { local, dtx }
    }

    pub fn local(&self) -> &LocalTransactionManager {
        &self.local
    }

    pub fn local_mut(&mut self) -> &mut LocalTransactionManager {
        &mut self.local
    }

    pub fn dtx(&self) -> &DtxManager<G> {
        &self.dtx
    }

    pub fn transaction_status(&self) -> TransactionStatus {
        self.local.transaction_status()
    }

    /// Client BEGIN.
    pub fn begin(&mut self) -> Result<TransactionStatus> {
        self.local.start_statement()?;
        self.local.begin_transaction_block()?;
        let status = self.local.finish_statement()?;
        if !self.dtx.is_active() {
            self.dtx.begin()?;
        }
        Ok(status)
    }

    /// One write statement fanned out to the given participants.
    pub async fn execute_write_statement(
        &mut self,
        targets: &[ParticipantId],
    ) -> Result<TransactionStatus> {
        if !self.dtx.is_active() {
            self.dtx.begin()?;
        }
        self.local.start_statement()?;

        // A write outside any block runs in an implicit block, so the
        // commit that follows can still wrap it in two-phase commit.
        if self.local.current_block_state() == TBlockState::Started {
            self.local.begin_implicit_transaction_block()?;
        }

        let explicit_block = matches!(
            self.local.current_block_state(),
            TBlockState::InProgress | TBlockState::SubInProgress
        );
        let options = TransactionOptions {
            needs_two_phase: true,
            explicit_begin: explicit_block,
            ..Default::default()
        };
        let info = self.dtx.build_context_info(&self.local, options)?;
        let gid = info.gid().ok_or(DtxError::MissingContext)?;
        let message = DtxMessage::new(DtxProtocolCommand::StayAtOrBecomeImplicitWriter, gid)
            .with_context(info);

        match self.dtx.dispatch_statement(&message, targets).await {
            Ok(_) => {
                if explicit_block {
                    self.dtx.note_explicit_begin_remembered();
                }
                Ok(self.local.finish_statement()?)
            }
            Err(e) => {
                self.local.abort_current_transaction();
                Err(e)
            }
        }
    }

    /// Client COMMIT, wrapping local commit in two-phase commit when
    /// participants are enrolled.
    pub async fn commit(&mut self) -> Result<TransactionStatus> {
        self.local.start_statement()?;
        let committing = self.local.end_transaction_block(false)?;

        if !committing {
            // Failed or absent block: this COMMIT rolls back instead.
            if self.dtx.is_active() {
                self.dtx.abort().await?;
            }
            let status = self.local.finish_statement()?;
            self.dtx.reset();
            return Ok(status);
        }

        match self.dtx.commit(&mut self.local).await {
            Ok(()) => {
                let status = self.local.transaction_status();
                self.dtx.reset();
                Ok(status)
            }
            Err(e) => {
                if e.severity() == ErrorSeverity::Panic {
                    // Ambiguous distributed state; the host terminates and
                    // out-of-band recovery reconciles. Reset still runs:
                    // it is unconditional at local transaction end.
                    self.dtx.reset();
                    return Err(e);
                }
                // Commit never got past prepare: notify whoever already
                // prepared, then abort the local transaction.
                if self.dtx.is_active() {
                    if let Err(abort_err) = self.dtx.abort().await {
                        tracing::error!("abort after failed commit also failed: {}", abort_err);
                    }
                }
                self.local.abort_current_transaction();
                self.dtx.reset();
                Err(e)
            }
        }
    }

    /// Client ROLLBACK.
    pub async fn rollback(&mut self) -> Result<TransactionStatus> {
        self.local.start_statement()?;
        self.local.user_abort_transaction_block(false)?;
        if self.dtx.is_active() {
            self.dtx.abort().await?;
        }
        let status = self.local.finish_statement()?;
        self.dtx.reset();
        Ok(status)
    }

    /// Client SAVEPOINT, mirrored to writer participants.
    pub async fn savepoint(&mut self, name: &str) -> Result<TransactionStatus> {
        self.local.start_statement()?;
        self.local.define_savepoint(name)?;
        if self.dtx.is_active() {
            self.dtx
                .mirror_subtransaction(DtxProtocolCommand::SubtransactionBegin, name)
                .await?;
        }
        Ok(self.local.finish_statement()?)
    }

    /// Client RELEASE SAVEPOINT, mirrored to writer participants.
    pub async fn release_savepoint(&mut self, name: &str) -> Result<TransactionStatus> {
        self.local.start_statement()?;
        self.local.release_savepoint(name)?;
        if self.dtx.is_active() {
            self.dtx
                .mirror_subtransaction(DtxProtocolCommand::SubtransactionRelease, name)
                .await?;
        }
        Ok(self.local.finish_statement()?)
    }

    /// Client ROLLBACK TO SAVEPOINT, mirrored to writer participants.
    pub async fn rollback_to_savepoint(&mut self, name: &str) -> Result<TransactionStatus> {
        self.local.start_statement()?;
        self.local.rollback_to_savepoint(name)?;
        if self.dtx.is_active() {
            self.dtx
                .mirror_subtransaction(DtxProtocolCommand::SubtransactionRollback, name)
                .await?;
        }
        Ok(self.local.finish_statement()?)
    }
}

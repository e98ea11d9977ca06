//! Coordinator-side distributed transaction manager
//!
//! One [`DtxManager`] per coordinator session owns the current
//! distributed transaction: its lazily assigned gxid, participant set,
//! and [`DtxState`], and drives prepare/commit-prepared/abort-prepared
//! broadcasts with the retry policy the protocol requires. Local
//! durability ordering is enforced here: the coordinator's own commit
//! record is written strictly before the commit-prepared broadcast, and
//! the forget record strictly after every participant acknowledged.

use crate::bookkeeping::{CheckpointInterlock, GxidBookkeeping};
use crate::config::DtxConfig;
use crate::error::{DtxError, Result};
use crate::recovery::RecoveryService;
use crate::state::DtxState;
use meridian_common::{
    DistributedTransactionId, Gxid, ParticipantId, TransactionOptions,
};
use meridian_dispatch::{dispatch_dtx_command, DispatchOutcome, Gang};
use meridian_protocol::{DtxContextInfo, DtxMessage, DtxProtocolCommand};
use meridian_xact::{DurabilityLog, LocalTransactionManager, XactRecord};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

/// Flags carried by one distributed transaction.
#[derive(Debug, Clone, Copy, Default)]
pub struct DtxFlags {
    /// A prepare broadcast failed somewhere; abort must take the
    /// some-prepared path.
    pub bad_prepare_gang: bool,
    /// A writer connection failed at transport level.
    pub writer_gang_lost: bool,
    /// Committed through the one-phase fast path.
    pub one_phase: bool,
    /// The client's explicit BEGIN has been replayed to participants.
    pub explicit_begin_remembered: bool,
}

/// The coordinator's current distributed transaction.
#[derive(Debug)]
pub struct DtxTransaction {
    /// Assigned lazily, on first dispatch that needs it.
    pub id: Option<DistributedTransactionId>,
    /// Writer participants enrolled in two-phase commit.
    pub participants: BTreeSet<ParticipantId>,
    pub flags: DtxFlags,
    /// In-flight gxids participants require finished before this
    /// transaction's notify counts as complete.
    pub wait_gxids: Vec<Gxid>,
}

/// Per-session distributed transaction manager.
pub struct DtxManager<G: Gang> {
    session: String,
    config: DtxConfig,
    gang: Arc<G>,
    bookkeeping: Arc<GxidBookkeeping>,
    interlock: Arc<CheckpointInterlock>,
    recovery: Arc<dyn RecoveryService>,
    log: Arc<dyn DurabilityLog>,
    state: DtxState,
    history: Vec<DtxState>,
    current: Option<DtxTransaction>,
    interrupts_held: bool,
}

impl<G: Gang> DtxManager<G> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session: impl Into<String>,
        config: DtxConfig,
        gang: Arc<G>,
        bookkeeping: Arc<GxidBookkeeping>,
        interlock: Arc<CheckpointInterlock>,
        recovery: Arc<dyn RecoveryService>,
        log: Arc<dyn DurabilityLog>,
    ) -> Self {
        Self {
            session: session.into(),
            config,
            gang,
            bookkeeping,
            interlock,
            recovery,
            log,
            state: DtxState::None,
            history: Vec::new(),
            current: None,
            interrupts_held: false,
        }
    }

    pub fn state(&self) -> DtxState {
        self.state
    }

    /// Every state this manager has passed through, in order.
    pub fn state_history(&self) -> &[DtxState] {
        &self.history
    }

    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }

    /// Whether interrupt delivery is currently suppressed (phase-2
    /// broadcast in flight).
    pub fn interrupts_held(&self) -> bool {
        self.interrupts_held
    }

    pub fn current_transaction(&self) -> Option<&DtxTransaction> {
        self.current.as_ref()
    }

    pub fn participants(&self) -> Vec<ParticipantId> {
        self.current
            .as_ref()
            .map(|tx| tx.participants.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn gid(&self) -> Option<String> {
        self.current
            .as_ref()
            .and_then(|tx| tx.id)
            .map(|id| id.gid())
    }

    fn transition(&mut self, to: DtxState) -> Result<()> {
        self.state = self.state.transition(to)?;
        self.history.push(to);
        tracing::debug!("[{}] dtx state -> {}", self.session, to.name());
        Ok(())
    }

    /// Open a distributed transaction for this unit of work.
    pub fn begin(&mut self) -> Result<()> {
        self.transition(DtxState::ActiveDistributed)?;
        self.current = Some(DtxTransaction {
            id: None,
            participants: BTreeSet::new(),
            flags: DtxFlags::default(),
            wait_gxids: Vec::new(),
        });
        Ok(())
    }

    /// Assign the gxid if it has not been needed yet.
    pub fn ensure_gxid(&mut self) -> Result<DistributedTransactionId> {
        let tx = self
            .current
            .as_mut()
            .ok_or(DtxError::NoDistributedTransaction)?;
        if let Some(id) = tx.id {
            return Ok(id);
        }
        let id = self.bookkeeping.generate();
        tx.id = Some(id);
        tracing::debug!("[{}] assigned distributed transaction {}", self.session, id);
        Ok(id)
    }

    pub fn note_participant(&mut self, participant: ParticipantId) -> Result<()> {
        let tx = self
            .current
            .as_mut()
            .ok_or(DtxError::NoDistributedTransaction)?;
        tx.participants.insert(participant);
        Ok(())
    }

    pub fn note_explicit_begin_remembered(&mut self) {
        if let Some(tx) = &mut self.current {
            tx.flags.explicit_begin_remembered = true;
        }
    }

    /// Build the per-statement context copied to every participant.
    pub fn build_context_info(
        &mut self,
        local: &LocalTransactionManager,
        options: TransactionOptions,
    ) -> Result<DtxContextInfo> {
        let distributed_id = if options.needs_two_phase {
            Some(self.ensure_gxid()?)
        } else {
            self.current.as_ref().and_then(|tx| tx.id)
        };
        Ok(DtxContextInfo {
            distributed_id,
            options_word: options.pack(),
            command_id: local.command_id(),
            nesting_level: local.current().nesting_level,
            snapshot: Some(self.bookkeeping.snapshot()),
        })
    }

    /// Dispatch a statement-carrying message, enrolling its targets as
    /// participants.
    pub async fn dispatch_statement(
        &mut self,
        message: &DtxMessage,
        targets: &[ParticipantId],
    ) -> Result<DispatchOutcome> {
        for &target in targets {
            self.note_participant(target)?;
        }
        let outcome = dispatch_dtx_command(self.gang.as_ref(), message, targets).await?;
        self.collect_wait_gxids(&outcome);
        Ok(outcome)
    }

    /// Mirror a savepoint command onto every writer participant so their
    /// nesting matches the coordinator's.
    pub async fn mirror_subtransaction(
        &mut self,
        command: DtxProtocolCommand,
        name: &str,
    ) -> Result<()> {
        let targets = self.participants();
        if targets.is_empty() {
            return Ok(());
        }
        let gid = self.ensure_gxid()?.gid();
        let message = DtxMessage::new(command, gid).with_savepoint(name.to_string());
        let outcome = dispatch_dtx_command(self.gang.as_ref(), &message, &targets).await?;
        self.collect_wait_gxids(&outcome);
        Ok(())
    }

    /// The one-phase fast path applies to a single participant with no
    /// local durable work on the coordinator.
    pub fn one_phase_eligible(&self, local: &LocalTransactionManager) -> bool {
        self.current
            .as_ref()
            .is_some_and(|tx| tx.participants.len() == 1)
            && !local.has_local_xid()
    }

    /// Commit the current unit of work, choosing the local, one-phase,
    /// or two-phase path. The block layer must already be at its COMMIT
    /// dispatch point.
    pub async fn commit(&mut self, local: &mut LocalTransactionManager) -> Result<()> {
        if self.participants().is_empty() {
            local.finish_statement()?;
            return Ok(());
        }
        if self.one_phase_eligible(local) {
            self.commit_one_phase(local).await
        } else {
            self.commit_two_phase(local).await
        }
    }

    async fn commit_one_phase(&mut self, local: &mut LocalTransactionManager) -> Result<()> {
        let id = self.ensure_gxid()?;
        let gid = id.gid();
        let targets = self.participants();
        if let Some(tx) = &mut self.current {
            tx.flags.one_phase = true;
        }

        self.transition(DtxState::OnePhaseCommit)?;
        self.transition(DtxState::NotifyingOnePhaseCommit)?;

        let message = DtxMessage::new(DtxProtocolCommand::CommitOnePhase, gid);
        let outcome = dispatch_dtx_command(self.gang.as_ref(), &message, &targets).await?;
        self.collect_wait_gxids(&outcome);
        self.await_wait_gxids().await;

        local.finish_statement()?;
        self.transition(DtxState::None)?;
        self.clear_current();
        tracing::info!("[{}] one-phase commit complete", self.session);
        Ok(())
    }

    async fn commit_two_phase(&mut self, local: &mut LocalTransactionManager) -> Result<()> {
        let id = self.ensure_gxid()?;
        let gid = id.gid();
        let targets = self.participants();

        // Phase 1: every participant must prepare.
        self.transition(DtxState::Preparing)?;
        let prepare = DtxMessage::new(DtxProtocolCommand::Prepare, gid.clone());
        match dispatch_dtx_command(self.gang.as_ref(), &prepare, &targets).await {
            Ok(outcome) => self.collect_wait_gxids(&outcome),
            Err(source) => {
                // The local transaction cannot proceed to commit; the
                // eventual abort must take the some-prepared path.
                if let Some(tx) = &mut self.current {
                    tx.flags.bad_prepare_gang = true;
                    if source.gang_unusable {
                        tx.flags.writer_gang_lost = true;
                    }
                }
                return Err(DtxError::PrepareFailed { gid, source });
            }
        }
        self.transition(DtxState::Prepared)?;

        // Commit decided.
        self.transition(DtxState::NotifyingCommitPrepared)?;

        // The coordinator's own durable commit record goes in before any
        // participant hears commit-prepared. Checkpoints are blocked
        // from here until the forget record is in.
        let interlock = self.interlock.clone();
        let window = interlock.begin_commit_window().await;
        self.transition(DtxState::InsertingCommitted)?;
        local.commit_record_for_distributed(id)?;
        self.transition(DtxState::InsertedCommitted)?;

        // Phase 2 broadcast, bounded retries, interrupts held off.
        self.broadcast_commit_prepared(&gid, &targets).await?;

        // Participants may have named other in-flight transactions to
        // fence on before this notify counts as complete.
        self.await_wait_gxids().await;

        self.transition(DtxState::InsertingForgetCommitted)?;
        let position = self.log.append(XactRecord::DistributedForget { gid: gid.clone() });
        self.log.flush(position);
        self.transition(DtxState::InsertedForgetCommitted)?;
        drop(window);

        local.finish_distributed_commit();
        self.transition(DtxState::None)?;
        self.clear_current();
        tracing::info!("[{}] two-phase commit of {} complete", self.session, gid);
        Ok(())
    }

    async fn broadcast_commit_prepared(
        &mut self,
        gid: &str,
        targets: &[ParticipantId],
    ) -> Result<()> {
        self.interrupts_held = true;

        let first = DtxMessage::new(DtxProtocolCommand::CommitPrepared, gid.to_string());
        let mut failure = match dispatch_dtx_command(self.gang.as_ref(), &first, targets).await {
            Ok(outcome) => {
                self.collect_wait_gxids(&outcome);
                self.interrupts_held = false;
                return Ok(());
            }
            Err(e) => e,
        };

        self.transition(DtxState::RetryCommitPrepared)?;
        for attempt in 1..=self.config.phase2_retry_count {
            tracing::warn!(
                "[{}] commit-prepared broadcast failed ({}); retry {}/{}",
                self.session,
                failure,
                attempt,
                self.config.phase2_retry_count
            );
            // A failed connection cannot be trusted to retry cleanly.
            self.gang.disconnect_and_reconnect().await;

            // Cancellation is honored only here, between attempts; a
            // canceled broadcast would leave participants ambiguous.
            self.interrupts_held = false;
            tokio::time::sleep(Duration::from_millis(self.config.retry_pause_ms)).await;
            self.interrupts_held = true;

            let retry =
                DtxMessage::new(DtxProtocolCommand::RetryCommitPrepared, gid.to_string());
            match dispatch_dtx_command(self.gang.as_ref(), &retry, targets).await {
                Ok(outcome) => {
                    self.collect_wait_gxids(&outcome);
                    self.interrupts_held = false;
                    return Ok(());
                }
                Err(e) => failure = e,
            }
        }

        self.interrupts_held = false;
        tracing::error!(
            "[{}] commit-prepared retries exhausted for {}: {}",
            self.session,
            gid,
            failure
        );
        Err(DtxError::CommitBroadcastExhausted {
            gid: gid.to_string(),
        })
    }

    /// Notify participants that the distributed transaction aborted,
    /// along whichever path matches how far commit processing got.
    pub async fn abort(&mut self) -> Result<()> {
        if !self.state.is_active() {
            return Ok(());
        }
        // Ordinary abort never coexists with a phase-2 retry in flight.
        if self.state.is_retry() {
            return Err(DtxError::AbortDuringRetry {
                state: self.state.name(),
            });
        }

        let (command, notify_state) = match self.state {
            DtxState::ActiveDistributed | DtxState::OnePhaseCommit => (
                DtxProtocolCommand::AbortNoPrepared,
                DtxState::NotifyingAbortNoPrepared,
            ),
            DtxState::NotifyingOnePhaseCommit => (
                DtxProtocolCommand::AbortNoPrepared,
                DtxState::NotifyingOnePhaseAbort,
            ),
            DtxState::Preparing => (
                DtxProtocolCommand::AbortSomePrepared,
                DtxState::NotifyingAbortSomePrepared,
            ),
            DtxState::Prepared => (
                DtxProtocolCommand::AbortPrepared,
                DtxState::NotifyingAbortPrepared,
            ),
            other => {
                return Err(DtxError::InvalidTransition {
                    from: other.name(),
                    to: "abort",
                });
            }
        };
        self.transition(notify_state)?;

        let targets = self.participants();
        if targets.is_empty() {
            self.transition(DtxState::None)?;
            self.clear_current();
            return Ok(());
        }
        let gid = self.ensure_gxid()?.gid();

        // A transport-level failure earlier in this transaction means the
        // connections cannot be trusted for the notification either.
        if self
            .current
            .as_ref()
            .is_some_and(|tx| tx.flags.writer_gang_lost)
        {
            self.gang.disconnect_and_reconnect().await;
        }

        let message = DtxMessage::new(command, gid.clone());
        let mut result = dispatch_dtx_command(self.gang.as_ref(), &message, &targets).await;

        let retryable = matches!(
            command,
            DtxProtocolCommand::AbortSomePrepared | DtxProtocolCommand::AbortPrepared
        );
        if result.is_err() && retryable {
            self.transition(DtxState::RetryAbortPrepared)?;
            for attempt in 1..=self.config.phase2_retry_count {
                tracing::warn!(
                    "[{}] abort broadcast failed; retry {}/{}",
                    self.session,
                    attempt,
                    self.config.phase2_retry_count
                );
                self.gang.disconnect_and_reconnect().await;
                tokio::time::sleep(Duration::from_millis(self.config.retry_pause_ms)).await;

                let retry =
                    DtxMessage::new(DtxProtocolCommand::RetryAbortPrepared, gid.clone());
                result = dispatch_dtx_command(self.gang.as_ref(), &retry, &targets).await;
                if result.is_ok() {
                    break;
                }
            }
        }

        match result {
            Ok(outcome) => {
                self.collect_wait_gxids(&outcome);
                self.await_wait_gxids().await;
            }
            Err(e) => {
                // An aborted-but-unconfirmed participant never exposed
                // data, so this is safe to leave to background recovery.
                tracing::warn!(
                    "[{}] abort notification incomplete for {}: {}",
                    self.session,
                    gid,
                    e
                );
                if self.state.some_participant_prepared() {
                    self.recovery.note_orphaned_prepared(&gid, &e.to_string());
                }
            }
        }

        self.transition(DtxState::None)?;
        self.clear_current();
        Ok(())
    }

    /// Unconditional reset at local transaction end, whatever the
    /// outcome. The only way back to `None` outside the state machine's
    /// own paths.
    pub fn reset(&mut self) {
        if self.state != DtxState::None {
            tracing::debug!(
                "[{}] dtx reset from {}",
                self.session,
                self.state.name()
            );
        }
        self.state = DtxState::None;
        self.clear_current();
        self.interrupts_held = false;
    }

    fn clear_current(&mut self) {
        if let Some(tx) = self.current.take() {
            if let Some(id) = tx.id {
                if self.bookkeeping.is_in_flight(id.gxid) {
                    self.bookkeeping.complete(id.gxid);
                }
            }
        }
    }

    fn collect_wait_gxids(&mut self, outcome: &DispatchOutcome) {
        if let Some(tx) = &mut self.current {
            tx.wait_gxids.extend(outcome.wait_gxids());
            tx.wait_gxids.sort_unstable();
            tx.wait_gxids.dedup();
        }
    }

    async fn await_wait_gxids(&mut self) {
        let own = self.current.as_ref().and_then(|tx| tx.id).map(|id| id.gxid);
        let waits = self
            .current
            .as_mut()
            .map(|tx| std::mem::take(&mut tx.wait_gxids))
            .unwrap_or_default();
        for gxid in waits {
            if Some(gxid) == own {
                continue;
            }
            tracing::debug!("[{}] fencing on gxid {}", self.session, gxid);
            self.bookkeeping.wait_for_completion(gxid).await;
        }
    }
}

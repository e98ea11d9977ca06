//! Integration tests driving two-phase commit end to end: a coordinator
//! session talking to real worker sessions hosted as in-process gang
//! participants, with injectable per-command failures.

use meridian_common::ParticipantId;
use meridian_dispatch::{HandlerFactory, LocalGang};
use meridian_dtx::{
    worker_handler, CheckpointInterlock, CoordinatorSession, DtxConfig, DtxError, DtxManager,
    DtxState, GxidBookkeeping, InMemoryRecovery, RecoveryService, WorkerSession,
};
use meridian_protocol::{DtxMessage, DtxProtocolCommand, DtxResponse, WireEnvelope};
use meridian_xact::{
    ErrorSeverity, InMemoryCatalog, InMemoryLockManager, InMemoryLog, LocalTransactionManager,
    SharedXactState, TransactionStatus, XactConfig, XactRecord,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Injectable failures: refuse the next N broadcasts of one command on
/// one participant. `usize::MAX` refuses forever.
#[derive(Default)]
struct FaultPlan {
    refusals: Mutex<HashMap<(ParticipantId, DtxProtocolCommand), usize>>,
}

impl FaultPlan {
    fn refuse(&self, participant: ParticipantId, command: DtxProtocolCommand, times: usize) {
        self.refusals.lock().insert((participant, command), times);
    }

    fn should_refuse(&self, participant: ParticipantId, command: DtxProtocolCommand) -> bool {
        let mut refusals = self.refusals.lock();
        match refusals.get_mut(&(participant, command)) {
            Some(0) | None => false,
            Some(remaining) => {
                if *remaining != usize::MAX {
                    *remaining -= 1;
                }
                true
            }
        }
    }
}

struct Cluster {
    session: CoordinatorSession<LocalGang>,
    workers: HashMap<ParticipantId, Arc<Mutex<WorkerSession>>>,
    worker_logs: HashMap<ParticipantId, Arc<InMemoryLog>>,
    coordinator_log: Arc<InMemoryLog>,
    recovery: Arc<InMemoryRecovery>,
    bookkeeping: Arc<GxidBookkeeping>,
}

fn cluster_with(members: &[u16], faults: Arc<FaultPlan>, config: DtxConfig) -> Cluster {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let bookkeeping = Arc::new(GxidBookkeeping::new(1234));
    let interlock = Arc::new(CheckpointInterlock::new());
    let recovery = Arc::new(InMemoryRecovery::new());

    let mut workers = HashMap::new();
    let mut worker_logs = HashMap::new();
    for &raw in members {
        let participant = ParticipantId::new(raw);
        let log = Arc::new(InMemoryLog::new());
        let local = LocalTransactionManager::new(
            participant.to_string(),
            XactConfig::default(),
            Arc::new(SharedXactState::new()),
            Arc::new(InMemoryLockManager::new()),
            log.clone(),
            Arc::new(InMemoryCatalog::new()),
        );
        workers.insert(
            participant,
            Arc::new(Mutex::new(WorkerSession::new(participant, local))),
        );
        worker_logs.insert(participant, log);
    }

    // Worker sessions are shared with the factory, so their state
    // survives gang reconnects; only the fault filter sits in front.
    let factory_workers = workers.clone();
    let factory: HandlerFactory = Arc::new(move |participant| {
        let session = factory_workers
            .get(&participant)
            .expect("gang connected to an unknown participant")
            .clone();
        let faults = faults.clone();
        let mut inner = worker_handler(session);
        Box::new(move |envelope: WireEnvelope| {
            if let Ok(message) = DtxMessage::from_envelope(envelope.clone()) {
                if faults.should_refuse(participant, message.command) {
                    let response = DtxResponse::failed(participant, "injected failure");
                    return WireEnvelope::new(
                        serde_json::to_vec(&response).unwrap(),
                        HashMap::new(),
                    );
                }
            }
            inner(envelope)
        })
    });

    let gang = Arc::new(LocalGang::new(
        members.iter().map(|&raw| ParticipantId::new(raw)).collect(),
        factory,
    ));

    let coordinator_log = Arc::new(InMemoryLog::new());
    let local = LocalTransactionManager::new(
        "coord",
        XactConfig::default(),
        Arc::new(SharedXactState::new()),
        Arc::new(InMemoryLockManager::new()),
        coordinator_log.clone(),
        Arc::new(InMemoryCatalog::new()),
    );
    let dtx = DtxManager::new(
        "coord",
        config,
        gang,
        bookkeeping.clone(),
        interlock,
        recovery.clone(),
        coordinator_log.clone(),
    );

    Cluster {
        session: CoordinatorSession::new(local, dtx),
        workers,
        worker_logs,
        coordinator_log,
        recovery,
        bookkeeping,
    }
}

fn cluster(members: &[u16]) -> Cluster {
    cluster_with(members, Arc::new(FaultPlan::default()), fast_config())
}

/// Default retry policy with pauses short enough for tests.
fn fast_config() -> DtxConfig {
    DtxConfig {
        phase2_retry_count: 10,
        retry_pause_ms: 5,
    }
}

/// Give the coordinator durable local work of its own, so commit owes a
/// local record.
fn coordinator_write(cluster: &mut Cluster) {
    let local = cluster.session.local_mut();
    local.start_statement().unwrap();
    local.assign_xid();
    local.finish_statement().unwrap();
}

#[tokio::test]
async fn test_two_participant_commit_walks_the_full_state_sequence() {
    let mut cluster = cluster(&[1, 2]);
    let targets = [ParticipantId::new(1), ParticipantId::new(2)];

    cluster.session.begin().unwrap();
    cluster
        .session
        .execute_write_statement(&targets)
        .await
        .unwrap();
    coordinator_write(&mut cluster);
    let gid = cluster.session.dtx().gid().unwrap();

    let status = cluster.session.commit().await.unwrap();
    assert_eq!(status, TransactionStatus::Idle);

    // The exact happy-path sequence, never backward.
    assert_eq!(
        cluster.session.dtx().state_history(),
        &[
            DtxState::ActiveDistributed,
            DtxState::Preparing,
            DtxState::Prepared,
            DtxState::NotifyingCommitPrepared,
            DtxState::InsertingCommitted,
            DtxState::InsertedCommitted,
            DtxState::InsertingForgetCommitted,
            DtxState::InsertedForgetCommitted,
            DtxState::None,
        ],
    );

    // The coordinator's commit record carries the distributed identity
    // and precedes the forget record.
    let records = cluster.coordinator_log.records();
    let commit_at = records
        .iter()
        .position(|r| {
            matches!(r, XactRecord::Commit { distributed_id: Some(id), .. } if id.gid() == gid)
        })
        .expect("coordinator wrote its commit record");
    let forget_at = records
        .iter()
        .position(|r| matches!(r, XactRecord::DistributedForget { gid: g } if *g == gid))
        .expect("coordinator wrote the forget record");
    assert!(commit_at < forget_at);

    // Every participant prepared, then committed under the same GID.
    for participant in &targets {
        let records = cluster.worker_logs[participant].records();
        assert!(records
            .iter()
            .any(|r| matches!(r, XactRecord::Prepare { gid: g, .. } if *g == gid)));
        assert!(records
            .iter()
            .any(|r| matches!(r, XactRecord::Commit { distributed_id: Some(id), .. }
                if id.gid() == gid)));
        let worker = cluster.workers[participant].lock();
        assert!(worker.local().prepared_gids().is_empty());
        assert_eq!(worker.local().transaction_status(), TransactionStatus::Idle);
    }

    // The gxid is no longer in flight once the transaction finished.
    let gxid = meridian_common::parse_gid(&gid).unwrap().gxid;
    assert!(!cluster.bookkeeping.is_in_flight(gxid));
    assert_eq!(cluster.bookkeeping.latest_completed(), gxid);
}

#[tokio::test]
async fn test_single_participant_takes_the_one_phase_path() {
    let mut cluster = cluster(&[1]);
    let targets = [ParticipantId::new(1)];

    cluster.session.begin().unwrap();
    cluster
        .session
        .execute_write_statement(&targets)
        .await
        .unwrap();

    let status = cluster.session.commit().await.unwrap();
    assert_eq!(status, TransactionStatus::Idle);

    let history = cluster.session.dtx().state_history();
    assert_eq!(
        history,
        &[
            DtxState::ActiveDistributed,
            DtxState::OnePhaseCommit,
            DtxState::NotifyingOnePhaseCommit,
            DtxState::None,
        ],
    );
    assert!(!history.contains(&DtxState::Preparing));
    assert!(!history.contains(&DtxState::Prepared));

    // The participant committed directly; no prepare record exists
    // anywhere.
    let records = cluster.worker_logs[&ParticipantId::new(1)].records();
    assert!(!records
        .iter()
        .any(|r| matches!(r, XactRecord::Prepare { .. })));
    assert!(records
        .iter()
        .any(|r| matches!(r, XactRecord::Commit { .. })));
}

#[tokio::test]
async fn test_prepare_failure_routes_to_some_prepared_abort() {
    let faults = Arc::new(FaultPlan::default());
    faults.refuse(ParticipantId::new(2), DtxProtocolCommand::Prepare, 1);
    let mut cluster = cluster_with(&[1, 2], faults, fast_config());
    let targets = [ParticipantId::new(1), ParticipantId::new(2)];

    cluster.session.begin().unwrap();
    cluster
        .session
        .execute_write_statement(&targets)
        .await
        .unwrap();
    let gid = cluster.session.dtx().gid().unwrap();

    let err = cluster.session.commit().await.unwrap_err();
    assert!(matches!(err, DtxError::PrepareFailed { .. }));
    assert_eq!(err.severity(), ErrorSeverity::Statement);

    // The machine never reached Prepared; abort took the some-prepared
    // path and the session came back to idle.
    let history = cluster.session.dtx().state_history();
    assert!(!history.contains(&DtxState::Prepared));
    assert!(history.contains(&DtxState::NotifyingAbortSomePrepared));
    assert_eq!(history.last(), Some(&DtxState::None));
    assert_eq!(cluster.session.transaction_status(), TransactionStatus::Idle);

    // Participant 1 prepared and was told to abort that prepared
    // transaction; participant 2 never prepared.
    let one = cluster.worker_logs[&ParticipantId::new(1)].records();
    assert!(one
        .iter()
        .any(|r| matches!(r, XactRecord::Prepare { gid: g, .. } if *g == gid)));
    assert!(one.iter().any(|r| matches!(r, XactRecord::Abort { .. })));
    let two = cluster.worker_logs[&ParticipantId::new(2)].records();
    assert!(!two.iter().any(|r| matches!(r, XactRecord::Prepare { .. })));
    for participant in &targets {
        let worker = cluster.workers[participant].lock();
        assert!(worker.local().prepared_gids().is_empty());
        assert_eq!(worker.local().transaction_status(), TransactionStatus::Idle);
    }
}

#[tokio::test]
async fn test_commit_prepared_retry_recovers_within_bound() {
    let faults = Arc::new(FaultPlan::default());
    faults.refuse(ParticipantId::new(2), DtxProtocolCommand::CommitPrepared, 1);
    let mut cluster = cluster_with(&[1, 2], faults, fast_config());
    let targets = [ParticipantId::new(1), ParticipantId::new(2)];

    cluster.session.begin().unwrap();
    cluster
        .session
        .execute_write_statement(&targets)
        .await
        .unwrap();
    let gid = cluster.session.dtx().gid().unwrap();

    // The client still sees success.
    let status = cluster.session.commit().await.unwrap();
    assert_eq!(status, TransactionStatus::Idle);

    let history = cluster.session.dtx().state_history();
    assert!(history.contains(&DtxState::RetryCommitPrepared));
    assert_eq!(
        &history[history.len() - 3..],
        &[
            DtxState::InsertingForgetCommitted,
            DtxState::InsertedForgetCommitted,
            DtxState::None,
        ],
    );

    // Both participants committed: one on the first broadcast, one on
    // the idempotent retry after the reconnect.
    for participant in &targets {
        let records = cluster.worker_logs[participant].records();
        assert!(records
            .iter()
            .any(|r| matches!(r, XactRecord::Commit { distributed_id: Some(id), .. }
                if id.gid() == gid)));
        assert!(cluster.workers[participant]
            .lock()
            .local()
            .prepared_gids()
            .is_empty());
    }
}

#[tokio::test]
async fn test_commit_prepared_exhaustion_is_panic_severity() {
    let faults = Arc::new(FaultPlan::default());
    faults.refuse(
        ParticipantId::new(2),
        DtxProtocolCommand::CommitPrepared,
        usize::MAX,
    );
    faults.refuse(
        ParticipantId::new(2),
        DtxProtocolCommand::RetryCommitPrepared,
        usize::MAX,
    );
    let config = DtxConfig {
        phase2_retry_count: 2,
        retry_pause_ms: 1,
    };
    let mut cluster = cluster_with(&[1, 2], faults, config);
    let targets = [ParticipantId::new(1), ParticipantId::new(2)];

    cluster.session.begin().unwrap();
    cluster
        .session
        .execute_write_statement(&targets)
        .await
        .unwrap();

    let err = cluster.session.commit().await.unwrap_err();
    assert!(matches!(err, DtxError::CommitBroadcastExhausted { .. }));
    // Participant 1 already committed, so only out-of-band recovery can
    // reconcile: the host must treat this as a PANIC.
    assert_eq!(err.severity(), ErrorSeverity::Panic);
    assert!(cluster.worker_logs[&ParticipantId::new(1)]
        .records()
        .iter()
        .any(|r| matches!(r, XactRecord::Commit { .. })));
    // Participant 2 still holds its prepared transaction.
    assert!(!cluster.workers[&ParticipantId::new(2)]
        .lock()
        .local()
        .prepared_gids()
        .is_empty());
}

#[tokio::test]
async fn test_abort_prepared_exhaustion_hands_off_to_recovery() {
    let faults = Arc::new(FaultPlan::default());
    faults.refuse(ParticipantId::new(2), DtxProtocolCommand::Prepare, 1);
    faults.refuse(
        ParticipantId::new(1),
        DtxProtocolCommand::AbortSomePrepared,
        usize::MAX,
    );
    faults.refuse(
        ParticipantId::new(1),
        DtxProtocolCommand::RetryAbortPrepared,
        usize::MAX,
    );
    let config = DtxConfig {
        phase2_retry_count: 2,
        retry_pause_ms: 1,
    };
    let mut cluster = cluster_with(&[1, 2], faults, config);
    let targets = [ParticipantId::new(1), ParticipantId::new(2)];

    cluster.session.begin().unwrap();
    cluster
        .session
        .execute_write_statement(&targets)
        .await
        .unwrap();
    let gid = cluster.session.dtx().gid().unwrap();

    // The commit fails on prepare; the abort notification then exhausts
    // its retries, which is non-fatal: recovery owns the GID from here.
    let err = cluster.session.commit().await.unwrap_err();
    assert!(matches!(err, DtxError::PrepareFailed { .. }));

    let history = cluster.session.dtx().state_history();
    assert!(history.contains(&DtxState::RetryAbortPrepared));
    assert_eq!(history.last(), Some(&DtxState::None));

    assert_eq!(cluster.recovery.in_doubt_gids(), vec![gid.clone()]);
    // Participant 1 never heard the abort; its prepared transaction is
    // exactly what recovery will find.
    assert_eq!(
        cluster.workers[&ParticipantId::new(1)].lock().local().prepared_gids(),
        vec![gid]
    );
    assert_eq!(cluster.session.transaction_status(), TransactionStatus::Idle);
}

#[tokio::test]
async fn test_rollback_aborts_on_every_participant() {
    let mut cluster = cluster(&[1, 2]);
    let targets = [ParticipantId::new(1), ParticipantId::new(2)];

    cluster.session.begin().unwrap();
    cluster
        .session
        .execute_write_statement(&targets)
        .await
        .unwrap();

    let status = cluster.session.rollback().await.unwrap();
    assert_eq!(status, TransactionStatus::Idle);
    assert_eq!(
        cluster.session.dtx().state_history(),
        &[
            DtxState::ActiveDistributed,
            DtxState::NotifyingAbortNoPrepared,
            DtxState::None,
        ],
    );

    for participant in &targets {
        let records = cluster.worker_logs[participant].records();
        assert!(records.iter().any(|r| matches!(r, XactRecord::Abort { .. })));
        assert!(!records.iter().any(|r| matches!(r, XactRecord::Commit { .. })));
        assert_eq!(
            cluster.workers[participant].lock().local().transaction_status(),
            TransactionStatus::Idle
        );
    }
}

#[tokio::test]
async fn test_savepoints_mirror_to_participants_through_commit() {
    let mut cluster = cluster(&[1, 2]);
    let targets = [ParticipantId::new(1), ParticipantId::new(2)];

    cluster.session.begin().unwrap();
    cluster
        .session
        .execute_write_statement(&targets)
        .await
        .unwrap();

    cluster.session.savepoint("a").await.unwrap();
    for participant in &targets {
        assert_eq!(
            cluster.workers[participant].lock().local().nesting_depth(),
            2
        );
    }

    cluster
        .session
        .execute_write_statement(&targets)
        .await
        .unwrap();

    // ROLLBACK TO replays the savepoint level everywhere.
    cluster.session.rollback_to_savepoint("a").await.unwrap();
    for participant in &targets {
        let worker = cluster.workers[participant].lock();
        assert_eq!(worker.local().nesting_depth(), 2);
        assert_eq!(worker.local().current().name.as_deref(), Some("a"));
    }

    cluster
        .session
        .execute_write_statement(&targets)
        .await
        .unwrap();
    cluster.session.release_savepoint("a").await.unwrap();
    for participant in &targets {
        assert_eq!(
            cluster.workers[participant].lock().local().nesting_depth(),
            1
        );
    }

    let status = cluster.session.commit().await.unwrap();
    assert_eq!(status, TransactionStatus::Idle);
    for participant in &targets {
        let records = cluster.worker_logs[participant].records();
        assert!(records.iter().any(|r| matches!(r, XactRecord::Commit { .. })));
        // The rolled-back savepoint left an abort record behind it.
        assert!(records.iter().any(|r| matches!(r, XactRecord::Abort { .. })));
    }
}

#[tokio::test]
async fn test_commit_with_open_savepoint_commits_it_everywhere() {
    let mut cluster = cluster(&[1, 2]);
    let targets = [ParticipantId::new(1), ParticipantId::new(2)];

    cluster.session.begin().unwrap();
    cluster
        .session
        .execute_write_statement(&targets)
        .await
        .unwrap();
    cluster.session.savepoint("a").await.unwrap();
    cluster
        .session
        .execute_write_statement(&targets)
        .await
        .unwrap();
    coordinator_write(&mut cluster);
    let gid = cluster.session.dtx().gid().unwrap();

    // COMMIT with the savepoint still open: its subtransaction commits
    // as part of the distributed commit on every node.
    let status = cluster.session.commit().await.unwrap();
    assert_eq!(status, TransactionStatus::Idle);
    assert_eq!(cluster.session.local().nesting_depth(), 1);

    let records = cluster.coordinator_log.records();
    assert!(records.iter().any(|r| matches!(
        r,
        XactRecord::Commit { children, distributed_id: Some(id), .. }
            if children.len() == 1 && id.gid() == gid
    )));
    for participant in &targets {
        let records = cluster.worker_logs[participant].records();
        assert!(records.iter().any(
            |r| matches!(r, XactRecord::Commit { children, .. } if children.len() == 1)
        ));
        assert_eq!(
            cluster.workers[participant].lock().local().nesting_depth(),
            1
        );
    }
}

#[tokio::test]
async fn test_autocommit_write_outside_block_still_joins_two_phase() {
    let mut cluster = cluster(&[1]);
    let targets = [ParticipantId::new(1)];

    // No BEGIN: the write opens an implicit block instead of
    // autocommitting only the coordinator's half.
    cluster
        .session
        .execute_write_statement(&targets)
        .await
        .unwrap();
    assert_eq!(
        cluster.session.transaction_status(),
        TransactionStatus::InTransaction
    );

    let status = cluster.session.commit().await.unwrap();
    assert_eq!(status, TransactionStatus::Idle);
    assert!(cluster
        .session
        .dtx()
        .state_history()
        .contains(&DtxState::NotifyingOnePhaseCommit));
    assert!(cluster.worker_logs[&ParticipantId::new(1)]
        .records()
        .iter()
        .any(|r| matches!(r, XactRecord::Commit { .. })));
}

#[tokio::test]
async fn test_commit_fences_on_participant_wait_gxids() {
    let Cluster {
        mut session,
        workers,
        bookkeeping,
        ..
    } = cluster(&[1]);
    let participant = ParticipantId::new(1);

    // Another distributed transaction is still in flight; the worker
    // names it in its next reply.
    let foreign = bookkeeping.generate();
    workers[&participant]
        .lock()
        .set_wait_gxids(vec![foreign.gxid]);

    let committer = tokio::spawn(async move {
        session.begin().unwrap();
        session
            .execute_write_statement(&[participant])
            .await
            .unwrap();
        session.commit().await.unwrap()
    });

    // The commit is fenced behind the foreign transaction.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!committer.is_finished());

    bookkeeping.complete(foreign.gxid);
    let status = tokio::time::timeout(Duration::from_secs(1), committer)
        .await
        .expect("commit completed once the fence lifted")
        .unwrap();
    assert_eq!(status, TransactionStatus::Idle);
}

#[tokio::test]
async fn test_gid_is_stable_across_the_whole_transaction() {
    let mut cluster = cluster(&[1, 2]);
    let targets = [ParticipantId::new(1), ParticipantId::new(2)];

    cluster.session.begin().unwrap();
    cluster
        .session
        .execute_write_statement(&targets)
        .await
        .unwrap();
    let before = cluster.session.dtx().gid().unwrap();
    cluster
        .session
        .execute_write_statement(&targets)
        .await
        .unwrap();
    let after = cluster.session.dtx().gid().unwrap();

    // One transaction, one correlation key, everywhere.
    assert_eq!(before, after);
    cluster.session.commit().await.unwrap();
    for participant in &targets {
        let records = cluster.worker_logs[participant].records();
        assert!(records
            .iter()
            .any(|r| matches!(r, XactRecord::Prepare { gid, .. } if *gid == before)));
    }
}

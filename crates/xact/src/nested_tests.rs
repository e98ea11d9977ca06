//! Randomized tests for the nested transaction stack
//!
//! Drives arbitrary savepoint/release/rollback/write workloads through
//! the block layer and checks the stack invariants after every step:
//! child XIDs follow their parents, child arrays stay sorted, and the
//! optimized current-xid walk agrees with a naive linear scan.

use crate::block::TBlockState;
use crate::config::XactConfig;
use crate::services::{InMemoryCatalog, InMemoryLockManager, InMemoryLog, XactRecord};
use crate::shared::SharedXactState;
use crate::state::LocalTransactionManager;
use meridian_common::Xid;
use proptest::prelude::*;
use std::sync::Arc;

fn manager_with(config: XactConfig) -> (LocalTransactionManager, Arc<InMemoryLog>) {
    let log = Arc::new(InMemoryLog::new());
    let mgr = LocalTransactionManager::new(
        "prop",
        config,
        Arc::new(SharedXactState::new()),
        Arc::new(InMemoryLockManager::new()),
        log.clone(),
        Arc::new(InMemoryCatalog::new()),
    );
    (mgr, log)
}

fn begin_block(mgr: &mut LocalTransactionManager) {
    mgr.start_statement().unwrap();
    mgr.begin_transaction_block().unwrap();
    mgr.finish_statement().unwrap();
}

#[derive(Debug, Clone)]
enum Op {
    Savepoint(u8),
    Release(u8),
    RollbackTo(u8),
    Write,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0u8..4).prop_map(Op::Savepoint),
        (0u8..4).prop_map(Op::Release),
        (0u8..4).prop_map(Op::RollbackTo),
        Just(Op::Write),
    ]
}

/// Run one statement carrying the given command; statement-level errors
/// (unknown savepoint names) are ignored, as a client would move on.
fn apply(mgr: &mut LocalTransactionManager, op: &Op) {
    mgr.start_statement().unwrap();
    match op {
        Op::Savepoint(n) => {
            mgr.define_savepoint(&format!("sp{n}")).unwrap();
        }
        Op::Release(n) => {
            let _ = mgr.release_savepoint(&format!("sp{n}"));
        }
        Op::RollbackTo(n) => {
            let _ = mgr.rollback_to_savepoint(&format!("sp{n}"));
        }
        Op::Write => {
            mgr.assign_xid();
        }
    }
    mgr.finish_statement().unwrap();
}

fn check_stack_invariants(mgr: &LocalTransactionManager) {
    let levels = mgr.levels();
    for (idx, node) in levels.iter().enumerate() {
        assert_eq!(node.nesting_level as usize, idx + 1, "one node per level");

        if let Some(own) = node.full_xid {
            if idx > 0 {
                let parent = levels[idx - 1]
                    .full_xid
                    .expect("a child with an XID implies an assigned parent");
                assert!(parent < own, "child XID must follow its parent's");
            }
            for child in &node.child_xids {
                assert!(own.xid().precedes(*child), "children follow their parent");
            }
        } else {
            assert!(node.child_xids.is_empty());
        }

        for pair in node.child_xids.windows(2) {
            assert!(pair[0].raw() < pair[1].raw(), "child array sorted ascending");
        }

        if idx + 1 < levels.len() {
            if let Some(deeper) = levels[idx + 1].full_xid {
                for child in &node.child_xids {
                    assert!(child.precedes(deeper.xid()));
                }
            }
        }
    }
}

fn check_current_xid_agreement(mgr: &LocalTransactionManager, max_raw: u32) {
    for raw in 1..=max_raw + 3 {
        let xid = Xid::new(raw);
        assert_eq!(
            mgr.is_current_xid(xid),
            mgr.is_current_xid_linear(xid),
            "optimized and linear walks disagree on xid {raw}"
        );
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_stack_invariants_hold_under_any_workload(
        ops in proptest::collection::vec(op_strategy(), 1..100),
    ) {
        let (mut mgr, _) = manager_with(XactConfig::default());
        begin_block(&mut mgr);

        let mut max_raw = Xid::FIRST_NORMAL.raw();
        for op in &ops {
            apply(&mut mgr, op);
            if let Some(full) = mgr.current().full_xid {
                max_raw = max_raw.max(full.xid().raw());
            }
            check_stack_invariants(&mgr);
        }
        check_current_xid_agreement(&mgr, max_raw + ops.len() as u32 * 2);
    }

    #[test]
    fn prop_skip_walk_agrees_with_linear_scan(
        depth in 1usize..200,
        writes in proptest::collection::vec(any::<bool>(), 1..200),
    ) {
        // A small stride makes the skip index dense enough to matter at
        // every tested depth.
        let config = XactConfig {
            skip_stride: 7,
            ..XactConfig::default()
        };
        let (mut mgr, _) = manager_with(config);
        begin_block(&mut mgr);

        for level in 0..depth {
            mgr.start_statement().unwrap();
            mgr.define_savepoint(&format!("s{level}")).unwrap();
            mgr.finish_statement().unwrap();

            if writes[level % writes.len()] {
                mgr.start_statement().unwrap();
                mgr.assign_xid();
                mgr.finish_statement().unwrap();
            }
        }

        let max_raw = Xid::FIRST_NORMAL.raw() + depth as u32 + 2;
        check_stack_invariants(&mgr);
        check_current_xid_agreement(&mgr, max_raw);
    }
}

#[test]
fn test_skip_walk_on_deep_stack_with_default_stride() {
    let (mut mgr, _) = manager_with(XactConfig::default());
    begin_block(&mut mgr);

    // Deep enough to cross the 100-level skip stride twice.
    for level in 0..250 {
        mgr.start_statement().unwrap();
        mgr.define_savepoint(&format!("s{level}")).unwrap();
        mgr.finish_statement().unwrap();

        mgr.start_statement().unwrap();
        mgr.assign_xid();
        mgr.finish_statement().unwrap();
    }

    check_stack_invariants(&mgr);
    for level in mgr.levels() {
        let xid = level.full_xid.expect("every level wrote").xid();
        assert!(mgr.is_current_xid(xid));
    }
    check_current_xid_agreement(&mgr, 600);
}

#[test]
fn test_rollback_to_erases_inner_savepoint_effects() {
    // BEGIN; SAVEPOINT a; write; SAVEPOINT b; write; ROLLBACK TO a;
    // write; COMMIT -- and the reference run without b.
    let (mut mgr, log) = manager_with(XactConfig::default());
    begin_block(&mut mgr);

    apply(&mut mgr, &Op::Savepoint(0));
    apply(&mut mgr, &Op::Write);
    let a_xid = mgr.current().full_xid.unwrap().xid();

    apply(&mut mgr, &Op::Savepoint(1));
    apply(&mut mgr, &Op::Write);
    let b_xid = mgr.current().full_xid.unwrap().xid();

    apply(&mut mgr, &Op::RollbackTo(0));
    assert_eq!(mgr.current_block_state(), TBlockState::SubInProgress);
    assert!(!mgr.is_current_xid(a_xid));
    assert!(!mgr.is_current_xid(b_xid));

    apply(&mut mgr, &Op::Write);

    mgr.start_statement().unwrap();
    mgr.end_transaction_block(false).unwrap();
    mgr.finish_statement().unwrap();

    let committed = commit_children(&log);

    // Reference: BEGIN; SAVEPOINT a; write; COMMIT.
    let (mut reference, reference_log) = manager_with(XactConfig::default());
    begin_block(&mut reference);
    apply(&mut reference, &Op::Savepoint(0));
    apply(&mut reference, &Op::Write);
    reference.start_statement().unwrap();
    reference.end_transaction_block(false).unwrap();
    reference.finish_statement().unwrap();

    let reference_committed = commit_children(&reference_log);

    // Savepoint b's effects are fully erased: both runs commit exactly
    // one child, and the rolled-back ids appear in no commit record.
    assert_eq!(committed.len(), reference_committed.len());
    assert_eq!(committed.len(), 1);
    assert!(!committed.contains(&a_xid));
    assert!(!committed.contains(&b_xid));
    assert!(log
        .records()
        .iter()
        .any(|r| matches!(r, XactRecord::Abort { xid, .. } if *xid == b_xid)));
}

fn commit_children(log: &InMemoryLog) -> Vec<Xid> {
    log.records()
        .iter()
        .find_map(|r| match r {
            XactRecord::Commit { children, .. } => Some(children.clone()),
            _ => None,
        })
        .expect("a commit record was written")
}

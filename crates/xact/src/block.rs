//! Block-state command layer
//!
//! Maps client-visible commands (BEGIN/COMMIT/ROLLBACK/SAVEPOINT/...)
//! onto the transaction stack. Every client statement is bracketed by
//! [`LocalTransactionManager::start_statement`] and
//! [`LocalTransactionManager::finish_statement`]; the latter is the
//! single dispatch point that advances whatever the statement's command
//! requested.

use crate::error::{Result, XactError};
use crate::state::{LocalTransactionManager, TransState};

/// Block-level state of one nesting level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TBlockState {
    // not in a transaction block
    Default,
    Started,
    // transaction block
    Begin,
    InProgress,
    ImplicitInProgress,
    ParallelInProgress,
    End,
    Abort,
    AbortEnd,
    AbortPending,
    Prepare,
    // subtransaction
    SubBegin,
    SubInProgress,
    SubRelease,
    SubCommit,
    SubAbort,
    SubAbortEnd,
    SubAbortPending,
    SubRestart,
    SubAbortRestart,
}

impl TBlockState {
    pub fn name(&self) -> &'static str {
        match self {
            TBlockState::Default => "Default",
            TBlockState::Started => "Started",
            TBlockState::Begin => "Begin",
            TBlockState::InProgress => "InProgress",
            TBlockState::ImplicitInProgress => "ImplicitInProgress",
            TBlockState::ParallelInProgress => "ParallelInProgress",
            TBlockState::End => "End",
            TBlockState::Abort => "Abort",
            TBlockState::AbortEnd => "AbortEnd",
            TBlockState::AbortPending => "AbortPending",
            TBlockState::Prepare => "Prepare",
            TBlockState::SubBegin => "SubBegin",
            TBlockState::SubInProgress => "SubInProgress",
            TBlockState::SubRelease => "SubRelease",
            TBlockState::SubCommit => "SubCommit",
            TBlockState::SubAbort => "SubAbort",
            TBlockState::SubAbortEnd => "SubAbortEnd",
            TBlockState::SubAbortPending => "SubAbortPending",
            TBlockState::SubRestart => "SubRestart",
            TBlockState::SubAbortRestart => "SubAbortRestart",
        }
    }
}

/// Terminal marker reported at every statement boundary, so a client
/// always knows whether ROLLBACK is required.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Idle,
    InTransaction,
    InFailedTransaction,
}

impl TransactionStatus {
    /// Protocol byte for the ready-for-query marker.
    pub fn as_byte(&self) -> u8 {
        match self {
            TransactionStatus::Idle => b'I',
            TransactionStatus::InTransaction => b'T',
            TransactionStatus::InFailedTransaction => b'E',
        }
    }
}

impl LocalTransactionManager {
    /// Entry side of the per-statement bracket.
    pub fn start_statement(&mut self) -> Result<()> {
        match self.current().block_state {
            TBlockState::Default => {
                self.start_top();
                self.current_mut().block_state = TBlockState::Started;
                Ok(())
            }
            TBlockState::Started
            | TBlockState::InProgress
            | TBlockState::ImplicitInProgress
            | TBlockState::ParallelInProgress
            | TBlockState::SubInProgress => {
                self.catalog().accept_local_invalidations();
                Ok(())
            }
            // Failed transaction: the statement will be rejected, but
            // starting it is not itself an error.
            TBlockState::Abort | TBlockState::SubAbort => Ok(()),
            state => Err(XactError::UnexpectedBlockState {
                op: "start_statement",
                state: state.name(),
            }),
        }
    }

    /// Exit side of the per-statement bracket: the single dispatch that
    /// advances whatever the statement's command requested.
    pub fn finish_statement(&mut self) -> Result<TransactionStatus> {
        loop {
            match self.current().block_state {
                TBlockState::Default => {
                    return Err(XactError::UnexpectedBlockState {
                        op: "finish_statement",
                        state: TBlockState::Default.name(),
                    });
                }

                // Single statement outside any block: commit it now.
                TBlockState::Started => {
                    let _ = self.write_commit_record(None);
                    self.finish_commit();
                    self.current_mut().block_state = TBlockState::Default;
                    break;
                }

                // BEGIN was this statement; the block is now open.
                TBlockState::Begin => {
                    self.current_mut().block_state = TBlockState::InProgress;
                    break;
                }

                // Ordinary statement inside a live transaction: command
                // boundary only.
                TBlockState::InProgress
                | TBlockState::ImplicitInProgress
                | TBlockState::ParallelInProgress
                | TBlockState::SubInProgress => {
                    self.bump_command_id();
                    self.catalog().accept_local_invalidations();
                    break;
                }

                // COMMIT was this statement.
                TBlockState::End => {
                    let _ = self.write_commit_record(None);
                    self.finish_commit();
                    self.current_mut().block_state = TBlockState::Default;
                    self.restart_if_chain_pending();
                    break;
                }

                // Failed block: hold state until the user rolls back.
                TBlockState::Abort | TBlockState::SubAbort => break,

                // ROLLBACK of an already-failed block.
                TBlockState::AbortEnd => {
                    self.cleanup_top();
                    self.current_mut().block_state = TBlockState::Default;
                    self.restart_if_chain_pending();
                    break;
                }

                // ROLLBACK of a live block.
                TBlockState::AbortPending => {
                    self.abort_top();
                    self.cleanup_top();
                    self.current_mut().block_state = TBlockState::Default;
                    self.restart_if_chain_pending();
                    break;
                }

                // PREPARE TRANSACTION was this statement.
                TBlockState::Prepare => {
                    let gid = self
                        .prepared_gid
                        .take()
                        .expect("Prepare block state always carries a gid");
                    self.prepare_current_transaction(&gid)?;
                    break;
                }

                // SAVEPOINT was this statement; bring the level live.
                TBlockState::SubBegin => {
                    self.start_subtransaction();
                    self.current_mut().block_state = TBlockState::SubInProgress;
                    break;
                }

                // RELEASE SAVEPOINT: commit every marked level.
                TBlockState::SubRelease => {
                    while self.current().block_state == TBlockState::SubRelease {
                        self.commit_subtransaction()?;
                    }
                    break;
                }

                // COMMIT with open savepoints: commit each level, then
                // fall through to the top-level End/Prepare.
                TBlockState::SubCommit => {
                    self.commit_subtransaction()?;
                    continue;
                }

                // ROLLBACK (or ROLLBACK TO) unwinding aborted levels.
                TBlockState::SubAbortEnd => {
                    self.cleanup_subtransaction()?;
                    continue;
                }
                TBlockState::SubAbortPending => {
                    self.abort_subtransaction();
                    self.cleanup_subtransaction()?;
                    continue;
                }

                // ROLLBACK TO SAVEPOINT target: abort, clean up, and
                // replay the push so the level looks freshly created.
                TBlockState::SubRestart => {
                    let name = self.current().name.clone();
                    self.abort_subtransaction();
                    self.cleanup_subtransaction()?;
                    self.push(name, TBlockState::SubBegin);
                    self.start_subtransaction();
                    self.current_mut().block_state = TBlockState::SubInProgress;
                    break;
                }
                TBlockState::SubAbortRestart => {
                    let name = self.current().name.clone();
                    self.cleanup_subtransaction()?;
                    self.push(name, TBlockState::SubBegin);
                    self.start_subtransaction();
                    self.current_mut().block_state = TBlockState::SubInProgress;
                    break;
                }
            }
        }
        Ok(self.transaction_status())
    }

    fn restart_if_chain_pending(&mut self) {
        if self.chain_pending {
            self.chain_pending = false;
            self.start_top();
            self.current_mut().block_state = TBlockState::InProgress;
        }
    }

    /// BEGIN. Returns whether a new block actually opened.
    pub fn begin_transaction_block(&mut self) -> Result<bool> {
        match self.current().block_state {
            TBlockState::Started | TBlockState::ImplicitInProgress => {
                self.current_mut().block_state = TBlockState::Begin;
                Ok(true)
            }
            TBlockState::InProgress
            | TBlockState::ParallelInProgress
            | TBlockState::SubInProgress
            | TBlockState::Abort
            | TBlockState::SubAbort => {
                tracing::warn!(
                    "[{}] there is already a transaction in progress",
                    self.session()
                );
                Ok(false)
            }
            state => Err(XactError::UnexpectedBlockState {
                op: "begin_transaction_block",
                state: state.name(),
            }),
        }
    }

    /// Open an implicit block for a multi-statement simple-query batch.
    pub fn begin_implicit_transaction_block(&mut self) -> Result<bool> {
        match self.current().block_state {
            TBlockState::Started => {
                self.current_mut().block_state = TBlockState::ImplicitInProgress;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Mark this session as a parallel worker sharing a leader's
    /// transaction.
    pub fn start_parallel_worker_block(&mut self) -> Result<bool> {
        match self.current().block_state {
            TBlockState::Started => {
                self.current_mut().block_state = TBlockState::ParallelInProgress;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// COMMIT [AND CHAIN]. Returns whether the block will actually
    /// commit; a failed block reports false and rolls back instead.
    pub fn end_transaction_block(&mut self, chain: bool) -> Result<bool> {
        let committed = match self.current().block_state {
            TBlockState::InProgress
            | TBlockState::ImplicitInProgress
            | TBlockState::ParallelInProgress => {
                self.current_mut().block_state = TBlockState::End;
                true
            }
            TBlockState::Started => {
                tracing::warn!("[{}] there is no transaction in progress", self.session());
                self.current_mut().block_state = TBlockState::End;
                false
            }
            TBlockState::Abort => {
                self.current_mut().block_state = TBlockState::AbortEnd;
                false
            }
            TBlockState::SubInProgress => {
                // Commit every open savepoint, then the whole block.
                let depth = self.nesting_depth();
                for idx in 1..depth {
                    self.level_mut(idx).block_state = TBlockState::SubCommit;
                }
                self.level_mut(0).block_state = TBlockState::End;
                true
            }
            TBlockState::SubAbort => {
                self.mark_abort_pending_all();
                false
            }
            state => {
                return Err(XactError::UnexpectedBlockState {
                    op: "end_transaction_block",
                    state: state.name(),
                });
            }
        };
        self.chain_pending = chain;
        Ok(committed)
    }

    /// ROLLBACK [AND CHAIN]. Returns whether there was a block to roll
    /// back.
    pub fn user_abort_transaction_block(&mut self, chain: bool) -> Result<bool> {
        let took_effect = match self.current().block_state {
            TBlockState::InProgress
            | TBlockState::ImplicitInProgress
            | TBlockState::ParallelInProgress => {
                self.current_mut().block_state = TBlockState::AbortPending;
                true
            }
            TBlockState::Started => {
                tracing::warn!("[{}] there is no transaction in progress", self.session());
                self.current_mut().block_state = TBlockState::AbortPending;
                false
            }
            TBlockState::Abort => {
                self.current_mut().block_state = TBlockState::AbortEnd;
                true
            }
            TBlockState::SubInProgress | TBlockState::SubAbort => {
                self.mark_abort_pending_all();
                true
            }
            state => {
                return Err(XactError::UnexpectedBlockState {
                    op: "user_abort_transaction_block",
                    state: state.name(),
                });
            }
        };
        self.chain_pending = chain;
        Ok(took_effect)
    }

    /// SAVEPOINT name.
    pub fn define_savepoint(&mut self, name: &str) -> Result<bool> {
        match self.current().block_state {
            TBlockState::InProgress | TBlockState::SubInProgress => {
                self.push(Some(name.to_string()), TBlockState::SubBegin);
                Ok(true)
            }
            TBlockState::Started
            | TBlockState::ImplicitInProgress
            | TBlockState::ParallelInProgress => {
                Err(XactError::OutsideTransactionBlock("SAVEPOINT"))
            }
            TBlockState::Abort | TBlockState::SubAbort => Err(XactError::InFailedTransaction),
            state => Err(XactError::UnexpectedBlockState {
                op: "define_savepoint",
                state: state.name(),
            }),
        }
    }

    /// RELEASE SAVEPOINT name. Releases the named savepoint and every
    /// savepoint nested inside it.
    pub fn release_savepoint(&mut self, name: &str) -> Result<bool> {
        match self.current().block_state {
            TBlockState::SubInProgress => {}
            TBlockState::InProgress => {
                return Err(XactError::NoSuchSavepoint(name.to_string()));
            }
            TBlockState::Abort | TBlockState::SubAbort => {
                return Err(XactError::InFailedTransaction);
            }
            TBlockState::Started
            | TBlockState::ImplicitInProgress
            | TBlockState::ParallelInProgress => {
                return Err(XactError::OutsideTransactionBlock("RELEASE SAVEPOINT"));
            }
            state => {
                return Err(XactError::UnexpectedBlockState {
                    op: "release_savepoint",
                    state: state.name(),
                });
            }
        }

        let target = self
            .levels()
            .iter()
            .rposition(|node| {
                node.name.as_deref() == Some(name)
                    && node.block_state == TBlockState::SubInProgress
            })
            .ok_or_else(|| XactError::NoSuchSavepoint(name.to_string()))?;

        let depth = self.nesting_depth();
        for idx in target..depth {
            self.level_mut(idx).block_state = TBlockState::SubRelease;
        }
        Ok(true)
    }

    /// ROLLBACK TO SAVEPOINT name. Marks every level between current and
    /// the target for abort; the next dispatch aborts and cleans each in
    /// turn, then replays push+start at the target level with the same
    /// name.
    pub fn rollback_to_savepoint(&mut self, name: &str) -> Result<bool> {
        match self.current().block_state {
            TBlockState::SubInProgress | TBlockState::SubAbort => {}
            TBlockState::InProgress | TBlockState::Abort => {
                return Err(XactError::NoSuchSavepoint(name.to_string()));
            }
            TBlockState::Started
            | TBlockState::ImplicitInProgress
            | TBlockState::ParallelInProgress => {
                return Err(XactError::OutsideTransactionBlock("ROLLBACK TO SAVEPOINT"));
            }
            state => {
                return Err(XactError::UnexpectedBlockState {
                    op: "rollback_to_savepoint",
                    state: state.name(),
                });
            }
        }

        let target = self
            .levels()
            .iter()
            .rposition(|node| {
                node.name.as_deref() == Some(name)
                    && matches!(
                        node.block_state,
                        TBlockState::SubInProgress | TBlockState::SubAbort
                    )
            })
            .ok_or_else(|| XactError::NoSuchSavepoint(name.to_string()))?;

        let depth = self.nesting_depth();
        for idx in target + 1..depth {
            let node = self.level_mut(idx);
            node.block_state = match node.block_state {
                TBlockState::SubInProgress => TBlockState::SubAbortPending,
                TBlockState::SubAbort => TBlockState::SubAbortEnd,
                other => other,
            };
        }
        let node = self.level_mut(target);
        node.block_state = match node.block_state {
            TBlockState::SubAbort => TBlockState::SubAbortRestart,
            _ => TBlockState::SubRestart,
        };
        Ok(true)
    }

    /// PREPARE TRANSACTION gid.
    pub fn prepare_transaction_block(&mut self, gid: &str) -> Result<bool> {
        match self.current().block_state {
            TBlockState::InProgress => {
                if self.snapshot_exported() {
                    return Err(XactError::SnapshotExported);
                }
                self.prepared_gid = Some(gid.to_string());
                self.current_mut().block_state = TBlockState::Prepare;
                Ok(true)
            }
            TBlockState::SubInProgress => {
                if self.snapshot_exported() {
                    return Err(XactError::SnapshotExported);
                }
                // Open savepoints commit as part of the prepare.
                let depth = self.nesting_depth();
                for idx in 1..depth {
                    self.level_mut(idx).block_state = TBlockState::SubCommit;
                }
                self.level_mut(0).block_state = TBlockState::Prepare;
                self.prepared_gid = Some(gid.to_string());
                Ok(true)
            }
            TBlockState::Started | TBlockState::ImplicitInProgress => {
                Err(XactError::OutsideTransactionBlock("PREPARE TRANSACTION"))
            }
            TBlockState::Abort => {
                self.current_mut().block_state = TBlockState::AbortEnd;
                Ok(false)
            }
            TBlockState::SubAbort => {
                self.mark_abort_pending_all();
                Ok(false)
            }
            state => Err(XactError::UnexpectedBlockState {
                op: "prepare_transaction_block",
                state: state.name(),
            }),
        }
    }

    /// Universal recovery entry, callable from any state. Performs at
    /// most one abort+cleanup per nesting level and leaves the session
    /// in a well-defined rest state: idle, or a failed block awaiting
    /// the user's ROLLBACK.
    pub fn abort_current_transaction(&mut self) {
        loop {
            match self.current().block_state {
                TBlockState::Default => {
                    match self.current().trans_state {
                        TransState::Default => {}
                        TransState::Abort => self.cleanup_top(),
                        _ => {
                            self.abort_top();
                            self.cleanup_top();
                        }
                    }
                    break;
                }

                TBlockState::Started
                | TBlockState::Begin
                | TBlockState::End
                | TBlockState::AbortPending
                | TBlockState::Prepare
                | TBlockState::ImplicitInProgress => {
                    self.abort_top();
                    self.cleanup_top();
                    self.current_mut().block_state = TBlockState::Default;
                    break;
                }

                // Explicit block: hold the failed state for the user.
                TBlockState::InProgress | TBlockState::ParallelInProgress => {
                    self.abort_top();
                    self.current_mut().block_state = TBlockState::Abort;
                    break;
                }

                TBlockState::Abort | TBlockState::SubAbort => break,

                TBlockState::AbortEnd => {
                    self.cleanup_top();
                    self.current_mut().block_state = TBlockState::Default;
                    break;
                }

                TBlockState::SubInProgress => {
                    self.abort_subtransaction();
                    self.current_mut().block_state = TBlockState::SubAbort;
                    break;
                }

                TBlockState::SubBegin
                | TBlockState::SubRelease
                | TBlockState::SubCommit
                | TBlockState::SubAbortPending
                | TBlockState::SubRestart => {
                    self.abort_subtransaction();
                    self.cleanup_subtransaction()
                        .expect("sub block state implies a subtransaction");
                    continue;
                }

                TBlockState::SubAbortEnd | TBlockState::SubAbortRestart => {
                    self.cleanup_subtransaction()
                        .expect("sub block state implies a subtransaction");
                    continue;
                }
            }
        }
    }

    fn mark_abort_pending_all(&mut self) {
        let depth = self.nesting_depth();
        for idx in 1..depth {
            let node = self.level_mut(idx);
            node.block_state = match node.block_state {
                TBlockState::SubInProgress => TBlockState::SubAbortPending,
                TBlockState::SubAbort => TBlockState::SubAbortEnd,
                other => other,
            };
        }
        let top = self.level_mut(0);
        top.block_state = match top.block_state {
            TBlockState::InProgress
            | TBlockState::ImplicitInProgress
            | TBlockState::ParallelInProgress => TBlockState::AbortPending,
            TBlockState::Abort => TBlockState::AbortEnd,
            other => other,
        };
    }

    /// Marker reported at every statement boundary.
    pub fn transaction_status(&self) -> TransactionStatus {
        match self.current().block_state {
            TBlockState::Default | TBlockState::Started => TransactionStatus::Idle,
            TBlockState::Abort
            | TBlockState::AbortEnd
            | TBlockState::AbortPending
            | TBlockState::SubAbort
            | TBlockState::SubAbortEnd
            | TBlockState::SubAbortPending
            | TBlockState::SubAbortRestart => TransactionStatus::InFailedTransaction,
            _ => TransactionStatus::InTransaction,
        }
    }
}

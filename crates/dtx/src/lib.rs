//! Distributed transaction manager
//!
//! Wraps the local commit/abort of [`meridian_xact`] in a two-phase
//! commit protocol across participants: gxid generation, the coordinator
//! side `DtxState` machine with its retry and recovery policy, the
//! per-statement context classifier, and the worker-side executor that
//! drives a participant's local machine from received protocol commands.

mod bookkeeping;
mod config;
mod context;
mod error;
mod manager;
mod recovery;
mod session;
mod state;
mod worker;

pub use bookkeeping::{CheckpointInterlock, CommitWindowGuard, GxidBookkeeping};
pub use config::DtxConfig;
pub use context::{classify_context, ClassifyInput, DistributedTransactionContext, ProcessRole};
pub use error::{DtxError, Result};
pub use manager::{DtxFlags, DtxManager, DtxTransaction};
pub use recovery::{InMemoryRecovery, RecoveryService};
pub use session::CoordinatorSession;
pub use state::DtxState;
pub use worker::{worker_handler, WorkerSession};

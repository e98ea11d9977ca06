//! Error types for the distributed transaction manager

use meridian_dispatch::BroadcastError;
use meridian_xact::{ErrorSeverity, XactError};
use thiserror::Error;

/// Distributed transaction errors
#[derive(Debug, Error)]
pub enum DtxError {
    #[error("invalid distributed transaction state transition: {from} -> {to}")]
    InvalidTransition {
        from: &'static str,
        to: &'static str,
    },

    #[error("process is already mid-transaction while being asked to start a fresh one")]
    MidTransactionStart,

    #[error("no distributed transaction is active")]
    NoDistributedTransaction,

    #[error("statement context carried no distributed transaction identity")]
    MissingContext,

    #[error("subtransaction command without a savepoint name")]
    MissingSavepointName,

    #[error("prepare broadcast failed for {gid}: {source}")]
    PrepareFailed {
        gid: String,
        source: BroadcastError,
    },

    #[error(
        "commit-prepared retries exhausted for {gid}; a participant may already have committed"
    )]
    CommitBroadcastExhausted { gid: String },

    #[error("cannot run an ordinary abort while phase-two retry is in progress ({state})")]
    AbortDuringRetry { state: &'static str },

    #[error("dispatch failed: {0}")]
    Dispatch(#[from] BroadcastError),

    #[error(transparent)]
    Local(#[from] XactError),
}

impl DtxError {
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            DtxError::InvalidTransition { .. }
            | DtxError::MidTransactionStart
            | DtxError::NoDistributedTransaction
            | DtxError::AbortDuringRetry { .. } => ErrorSeverity::Fatal,
            DtxError::MissingContext
            | DtxError::MissingSavepointName
            | DtxError::PrepareFailed { .. }
            | DtxError::Dispatch(_) => ErrorSeverity::Statement,
            // A participant may already believe it committed; only
            // out-of-band recovery can reconcile this.
            DtxError::CommitBroadcastExhausted { .. } => ErrorSeverity::Panic,
            DtxError::Local(e) => e.severity(),
        }
    }
}

/// Result type for distributed transaction operations
pub type Result<T> = std::result::Result<T, DtxError>;

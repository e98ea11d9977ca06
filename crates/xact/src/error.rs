//! Error types for the local transaction machine

use thiserror::Error;

/// How far an error must unwind.
///
/// `Statement` errors abort the current statement or subtransaction and
/// resume at the parent. `Fatal` means session state has diverged from
/// protocol and the hosting process must terminate the backend. `Panic`
/// marks an ambiguous distributed state that only out-of-band recovery
/// can reconcile. The library reports these as values; termination is the
/// host's job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    Statement,
    Fatal,
    Panic,
}

/// Local transaction errors
#[derive(Debug, Error)]
pub enum XactError {
    #[error("savepoint \"{0}\" does not exist")]
    NoSuchSavepoint(String),

    #[error("{0} can only be used in transaction blocks")]
    OutsideTransactionBlock(&'static str),

    #[error("current transaction is aborted, commands ignored until end of transaction block")]
    InFailedTransaction,

    #[error("cannot PREPARE a transaction that has exported snapshots")]
    SnapshotExported,

    #[error("prepared transaction with identifier \"{0}\" does not exist")]
    UnknownPreparedTransaction(String),

    #[error("cannot pop the top-level transaction off the stack")]
    StackUnderflow,

    #[error("subtransaction still in state {0} at pop")]
    PopInBadState(&'static str),

    #[error("{op}: unexpected block state {state}")]
    UnexpectedBlockState {
        op: &'static str,
        state: &'static str,
    },
}

impl XactError {
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            XactError::NoSuchSavepoint(_)
            | XactError::OutsideTransactionBlock(_)
            | XactError::InFailedTransaction
            | XactError::SnapshotExported
            | XactError::UnknownPreparedTransaction(_) => ErrorSeverity::Statement,
            XactError::StackUnderflow
            | XactError::PopInBadState(_)
            | XactError::UnexpectedBlockState { .. } => ErrorSeverity::Fatal,
        }
    }
}

/// Result type for local transaction operations
pub type Result<T> = std::result::Result<T, XactError>;

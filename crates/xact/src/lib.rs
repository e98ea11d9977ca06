//! Per-session local transaction state machine
//!
//! One [`LocalTransactionManager`] per backend session owns the nested
//! transaction stack, the block-state command layer that maps client
//! commands onto it, and the lazy XID assignment machinery. Cross-session
//! bookkeeping (id allocation, subtransaction parentage, the active-xid
//! table) lives in [`SharedXactState`] behind narrow locks. External
//! collaborators (lock manager, durability log, catalog sync) are traits
//! with in-memory implementations for tests.

mod block;
mod config;
mod error;
#[cfg(test)]
mod nested_tests;
mod reader;
mod services;
mod shared;
mod state;

pub use block::{TBlockState, TransactionStatus};
pub use config::XactConfig;
pub use error::{ErrorSeverity, Result, XactError};
pub use reader::{ReaderXidView, WriterXidCache};
pub use services::{
    CatalogSync, DurabilityLog, InMemoryCatalog, InMemoryLockManager, InMemoryLog, LockManager,
    LogPosition, ResourceOwnerId, XactRecord,
};
pub use shared::{ActiveXidTable, SharedXactState, SubtransMap, XidAllocator};
pub use state::{LocalTransactionManager, TransState, TransactionState};

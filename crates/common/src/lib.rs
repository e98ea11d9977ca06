//! Shared identifier and option types for the meridian transaction core
//!
//! Everything here is a small value type that crosses crate boundaries:
//! local and distributed transaction identifiers, the packed per-statement
//! option word, and the distributed snapshot carried to participants.

mod gid;
mod options;
mod participant;
mod snapshot;
mod xid;

pub use gid::{format_gid, parse_gid, DistributedTransactionId, GidParseError, Gxid};
pub use options::{IsolationLevel, TransactionOptions};
pub use participant::ParticipantId;
pub use snapshot::DistributedSnapshot;
pub use xid::{CommandId, FullTransactionId, SubTransactionId, Xid};

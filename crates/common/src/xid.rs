//! Local transaction identifiers
//!
//! A `Xid` is the 32-bit wrapping identifier used in shared bookkeeping
//! and lock keys. A `FullTransactionId` pairs it with an epoch so that
//! ordering is plain integer ordering for the lifetime of a cluster.

use serde::{Deserialize, Serialize};
use std::fmt;

/// 32-bit local transaction id. Wraps around; use `precedes`/`follows`
/// for age comparisons, never `<`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Xid(u32);

impl Xid {
    /// Id that is never assigned to any transaction.
    pub const INVALID: Xid = Xid(0);
    /// Reserved for bootstrap processing.
    pub const BOOTSTRAP: Xid = Xid(1);
    /// Reserved marker for permanently frozen rows.
    pub const FROZEN: Xid = Xid(2);
    /// First id handed out to a normal transaction.
    pub const FIRST_NORMAL: Xid = Xid(3);

    pub const fn new(raw: u32) -> Self {
        Xid(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }

    /// Normal ids are the assignable ones, past the reserved range.
    pub fn is_normal(self) -> bool {
        self.0 >= Self::FIRST_NORMAL.0
    }

    /// Modular age comparison. Valid only when both ids are within
    /// 2^31 of each other, which holds for any two ids that can be
    /// alive at the same time.
    pub fn precedes(self, other: Xid) -> bool {
        if !self.is_normal() || !other.is_normal() {
            return self.0 < other.0;
        }
        (self.0.wrapping_sub(other.0) as i32) < 0
    }

    pub fn follows(self, other: Xid) -> bool {
        other.precedes(self)
    }
}

impl fmt::Display for Xid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 64-bit (epoch, xid) pair, wrap-free within a cluster's lifetime.
///
/// The u64 packing makes the natural integer order the assignment order,
/// so parent/child ordering checks are plain comparisons.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct FullTransactionId(u64);

impl FullTransactionId {
    pub const INVALID: FullTransactionId = FullTransactionId(0);

    pub const fn from_u64(value: u64) -> Self {
        FullTransactionId(value)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }

    pub fn from_parts(epoch: u32, xid: Xid) -> Self {
        FullTransactionId(((epoch as u64) << 32) | xid.raw() as u64)
    }

    pub fn epoch(self) -> u32 {
        (self.0 >> 32) as u32
    }

    pub fn xid(self) -> Xid {
        Xid::new(self.0 as u32)
    }

    pub fn is_valid(self) -> bool {
        self.xid().is_valid()
    }

    /// The next assignable id, skipping the reserved low range when the
    /// 32-bit half wraps into a new epoch.
    pub fn advance(self) -> Self {
        let mut next = self.0.wrapping_add(1);
        if (next as u32) < Xid::FIRST_NORMAL.raw() {
            next = (next & !0xFFFF_FFFF) | Xid::FIRST_NORMAL.raw() as u64;
        }
        FullTransactionId(next)
    }
}

impl fmt::Display for FullTransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.epoch(), self.xid())
    }
}

/// Per-backend subtransaction counter. The top level is always 1.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct SubTransactionId(u32);

impl SubTransactionId {
    pub const INVALID: SubTransactionId = SubTransactionId(0);
    pub const TOP: SubTransactionId = SubTransactionId(1);

    pub const fn new(raw: u32) -> Self {
        SubTransactionId(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    pub fn next(self) -> Self {
        SubTransactionId(self.0 + 1)
    }
}

impl fmt::Display for SubTransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-transaction command counter, bumped once per command that needs a
/// new visibility horizon.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub struct CommandId(u32);

impl CommandId {
    pub const FIRST: CommandId = CommandId(0);

    pub const fn new(raw: u32) -> Self {
        CommandId(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    pub fn next(self) -> Self {
        CommandId(self.0 + 1)
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

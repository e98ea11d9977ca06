//! Packed per-statement transaction options
//!
//! The coordinator sends one 32-bit option word with every statement it
//! dispatches; participants unpack it to decide their role and local
//! transaction characteristics. Packing must round-trip exactly.

use serde::{Deserialize, Serialize};

const OPT_NEEDS_TWO_PHASE: u32 = 1 << 0;
const OPT_EXPLICIT_BEGIN: u32 = 1 << 1;
const OPT_READ_ONLY: u32 = 1 << 2;
const OPT_ISOLATION_SHIFT: u32 = 3;
const OPT_ISOLATION_MASK: u32 = 0b11 << OPT_ISOLATION_SHIFT;

/// Transaction isolation level carried in the option word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum IsolationLevel {
    ReadUncommitted,
    #[default]
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    fn to_bits(self) -> u32 {
        match self {
            IsolationLevel::ReadUncommitted => 0,
            IsolationLevel::ReadCommitted => 1,
            IsolationLevel::RepeatableRead => 2,
            IsolationLevel::Serializable => 3,
        }
    }

    fn from_bits(bits: u32) -> Self {
        match bits & 0b11 {
            0 => IsolationLevel::ReadUncommitted,
            1 => IsolationLevel::ReadCommitted,
            2 => IsolationLevel::RepeatableRead,
            _ => IsolationLevel::Serializable,
        }
    }
}

/// Unpacked view of the per-statement option word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TransactionOptions {
    /// Statement performs writes that must join two-phase commit.
    pub needs_two_phase: bool,
    /// Client issued an explicit BEGIN that the participant must replay
    /// before running the statement.
    pub explicit_begin: bool,
    /// Transaction declared READ ONLY.
    pub read_only: bool,
    pub isolation: IsolationLevel,
}

impl TransactionOptions {
    pub fn pack(&self) -> u32 {
        let mut word = 0;
        if self.needs_two_phase {
            word |= OPT_NEEDS_TWO_PHASE;
        }
        if self.explicit_begin {
            word |= OPT_EXPLICIT_BEGIN;
        }
        if self.read_only {
            word |= OPT_READ_ONLY;
        }
        word |= self.isolation.to_bits() << OPT_ISOLATION_SHIFT;
        word
    }

    pub fn unpack(word: u32) -> Self {
        Self {
            needs_two_phase: word & OPT_NEEDS_TWO_PHASE != 0,
            explicit_begin: word & OPT_EXPLICIT_BEGIN != 0,
            read_only: word & OPT_READ_ONLY != 0,
            isolation: IsolationLevel::from_bits((word & OPT_ISOLATION_MASK) >> OPT_ISOLATION_SHIFT),
        }
    }
}

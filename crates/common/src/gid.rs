//! Distributed transaction identifiers and the GID wire format
//!
//! A distributed transaction is identified by the pair (cluster start
//! timestamp, gxid). The GID string is the sole correlation key shared by
//! every participant's view of one distributed transaction, so its
//! construction must be deterministic: identical inputs always produce
//! the identical string.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// 32-bit monotonic distributed transaction id.
///
/// Only meaningful together with the cluster start timestamp that scopes
/// the counter; see [`DistributedTransactionId`].
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub struct Gxid(u32);

impl Gxid {
    pub const INVALID: Gxid = Gxid(0);
    pub const FIRST_NORMAL: Gxid = Gxid(1);

    pub const fn new(raw: u32) -> Self {
        Gxid(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }

    pub fn next(self) -> Self {
        Gxid(self.0 + 1)
    }
}

impl fmt::Display for Gxid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of one distributed transaction: the coordinator's cluster
/// start timestamp plus the gxid drawn from that incarnation's counter.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct DistributedTransactionId {
    /// Cluster start time, seconds since the Unix epoch. Distinguishes
    /// counter incarnations across coordinator restarts.
    pub start_timestamp: u64,
    /// Monotonic id within this incarnation.
    pub gxid: Gxid,
}

impl DistributedTransactionId {
    pub fn new(start_timestamp: u64, gxid: Gxid) -> Self {
        Self {
            start_timestamp,
            gxid,
        }
    }

    /// Render the GID wire string for this transaction.
    pub fn gid(&self) -> String {
        format_gid(self.start_timestamp, self.gxid)
    }
}

impl fmt::Display for DistributedTransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.gid())
    }
}

/// Build the GID wire string from its two components.
///
/// Pure function of its inputs; the zero-padded gxid keeps the string
/// length fixed for any one timestamp.
pub fn format_gid(start_timestamp: u64, gxid: Gxid) -> String {
    format!("{}-{:010}", start_timestamp, gxid.raw())
}

/// Errors from [`parse_gid`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GidParseError {
    #[error("GID missing '-' separator: {0}")]
    MissingSeparator(String),

    #[error("invalid timestamp component in GID: {0}")]
    InvalidTimestamp(String),

    #[error("invalid gxid component in GID: {0}")]
    InvalidGxid(String),
}

/// Parse a GID wire string back into its components. Inverse of
/// [`format_gid`].
pub fn parse_gid(gid: &str) -> Result<DistributedTransactionId, GidParseError> {
    let (ts, gx) = gid
        .split_once('-')
        .ok_or_else(|| GidParseError::MissingSeparator(gid.to_string()))?;

    let start_timestamp: u64 = ts
        .parse()
        .map_err(|_| GidParseError::InvalidTimestamp(ts.to_string()))?;
    let gxid: u32 = gx
        .parse()
        .map_err(|_| GidParseError::InvalidGxid(gx.to_string()))?;

    Ok(DistributedTransactionId::new(start_timestamp, Gxid::new(gxid)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_gid_deterministic() {
        let a = format_gid(1234, Gxid::new(56));
        let b = format_gid(1234, Gxid::new(56));
        assert_eq!(a, b);
        assert_eq!(a, "1234-0000000056");
    }

    #[test]
    fn test_gid_roundtrip() {
        let id = DistributedTransactionId::new(1_700_000_000, Gxid::new(987_654));
        let parsed = parse_gid(&id.gid()).unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(matches!(
            parse_gid("17000000000000000056"),
            Err(GidParseError::MissingSeparator(_))
        ));
        assert!(matches!(
            parse_gid("abc-0000000056"),
            Err(GidParseError::InvalidTimestamp(_))
        ));
        assert!(matches!(
            parse_gid("1234-notanumber"),
            Err(GidParseError::InvalidGxid(_))
        ));
    }

    #[test]
    fn test_gxid_ordering() {
        let g1 = Gxid::FIRST_NORMAL;
        let g2 = g1.next();
        assert!(g1 < g2);
        assert!(g1.is_valid());
        assert!(!Gxid::INVALID.is_valid());
    }
}

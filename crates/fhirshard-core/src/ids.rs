//! Fixed-width composite identifiers for deterministic shard routing.
//!
//! A [`SmartId`] packs a logical partition ([`ShardletId`], top 11 bits) and a
//! monotonic sequence (bottom 53 bits) into a single 64-bit value, so routing
//! an already-known id never needs a lookup. Arbitrary entities (resource ids,
//! GUIDs) are assigned to shardlets through a deterministic multiplicative
//! hash folded through the same encoding.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Errors produced by identifier construction and parsing.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdError {
    /// Shardlet id outside the `[0, 2047]` range.
    #[error("Shardlet id {0} is outside the valid range [0, 2047]")]
    ShardletOutOfRange(i16),

    /// Sequence outside the `[0, MAX_SEQUENCE]` range for a non-zero shardlet.
    #[error("Sequence {0} is outside the valid range [0, 9007199254740991]")]
    SequenceOutOfRange(i64),

    /// A textual identifier failed to parse.
    #[error("Malformed identifier: {0:?}")]
    Malformed(String),
}

/// Identifies a physical shard (one database).
///
/// Assigned by the shard topology map at load time and immutable afterwards.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ShardId(i16);

impl ShardId {
    /// Creates a new `ShardId` from a raw shard number.
    #[must_use]
    pub const fn new(id: i16) -> Self {
        Self(id)
    }

    /// Returns the raw shard number.
    #[must_use]
    pub const fn value(&self) -> i16 {
        self.0
    }
}

impl From<i16> for ShardId {
    fn from(value: i16) -> Self {
        Self(value)
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies a logical partition smaller than a shard.
///
/// Valid values are `[0, 2047]`. The lower half `[0, 1023]` is reserved;
/// hashed assignments always land in the usable `[1024, 2047]` range.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(try_from = "i16", into = "i16")]
pub struct ShardletId(i16);

impl ShardletId {
    /// Smallest valid shardlet id.
    pub const MIN: i16 = 0;
    /// Largest valid shardlet id.
    pub const MAX: i16 = 2047;
    /// Largest reserved shardlet id; `[0, RESERVED_MAX]` is never hashed to.
    pub const RESERVED_MAX: i16 = 1023;
    /// Smallest usable (hash-assignable) shardlet id.
    pub const USABLE_MIN: i16 = 1024;

    /// Creates a new `ShardletId`, validating the `[0, 2047]` range.
    ///
    /// # Errors
    ///
    /// Returns [`IdError::ShardletOutOfRange`] for values outside the range.
    pub const fn new(id: i16) -> Result<Self, IdError> {
        if id < Self::MIN || id > Self::MAX {
            Err(IdError::ShardletOutOfRange(id))
        } else {
            Ok(Self(id))
        }
    }

    /// Constructs from bits already known to be in range (SmartId unpacking).
    const fn from_bits(bits: i16) -> Self {
        debug_assert!(bits >= Self::MIN && bits <= Self::MAX);
        Self(bits)
    }

    /// Returns the raw shardlet number.
    #[must_use]
    pub const fn value(&self) -> i16 {
        self.0
    }

    /// Returns `true` if this id lies in the reserved `[0, 1023]` range.
    #[must_use]
    pub const fn is_reserved(&self) -> bool {
        self.0 <= Self::RESERVED_MAX
    }

    /// Deterministically assigns a shardlet to an arbitrary string key.
    ///
    /// The multiplicative hash (`h = h * 251 + byte`) folds the key's bytes in
    /// order; the result is passed through the [`SmartId`] encoding and forced
    /// into the usable range. The byte iteration order is load-bearing for
    /// compatibility with identifiers already persisted by earlier deployments.
    #[must_use]
    pub fn hashed_from_str(key: &str) -> Self {
        Self::from_hash(multiplicative_hash(key.as_bytes()))
    }

    /// Deterministically assigns a shardlet to a GUID key.
    ///
    /// Hashes the UUID's 16 bytes in order, same scheme as
    /// [`Self::hashed_from_str`].
    #[must_use]
    pub fn hashed_from_uuid(key: &Uuid) -> Self {
        Self::from_hash(multiplicative_hash(key.as_bytes()))
    }

    fn from_hash(hash: u64) -> Self {
        let folded = SmartId::from_raw(hash as i64).shardlet_id();
        // Hashed assignments never land in the reserved range.
        Self::from_bits(folded.value() | Self::USABLE_MIN)
    }
}

impl TryFrom<i16> for ShardletId {
    type Error = IdError;

    fn try_from(value: i16) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ShardletId> for i16 {
    fn from(id: ShardletId) -> Self {
        id.0
    }
}

impl fmt::Display for ShardletId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ShardletId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value: i16 = s.parse().map_err(|_| IdError::Malformed(s.to_string()))?;
        Self::new(value)
    }
}

/// Multiplicative byte-fold hash shared by string and GUID shardlet assignment.
fn multiplicative_hash(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0;
    for &byte in bytes {
        hash = hash.wrapping_mul(251).wrapping_add(u64::from(byte));
    }
    hash
}

/// A 64-bit composite identifier: shardlet id in the top 11 bits, monotonic
/// sequence in the bottom 53.
///
/// When the shardlet id is zero the full 64-bit value is treated as a raw
/// sequence, which keeps pre-sharding identifiers representable.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct SmartId(i64);

impl SmartId {
    /// Number of bits carrying the sequence.
    pub const SEQUENCE_BITS: u32 = 53;
    /// Largest sequence representable alongside a non-zero shardlet id.
    pub const MAX_SEQUENCE: i64 = (1 << Self::SEQUENCE_BITS) - 1;

    const SEQUENCE_MASK: u64 = (1 << Self::SEQUENCE_BITS) - 1;

    /// Creates a `SmartId` from an already-packed 64-bit value.
    #[must_use]
    pub const fn from_raw(value: i64) -> Self {
        Self(value)
    }

    /// Packs a `(shardlet, sequence)` pair.
    ///
    /// # Errors
    ///
    /// Returns [`IdError::SequenceOutOfRange`] if the shardlet id is non-zero
    /// and the sequence falls outside `[0, MAX_SEQUENCE]`.
    pub const fn new(shardlet_id: ShardletId, sequence: i64) -> Result<Self, IdError> {
        if shardlet_id.value() == 0 {
            return Ok(Self(sequence));
        }
        if sequence < 0 || sequence > Self::MAX_SEQUENCE {
            return Err(IdError::SequenceOutOfRange(sequence));
        }
        Ok(Self(
            ((shardlet_id.value() as u64) << Self::SEQUENCE_BITS | sequence as u64) as i64,
        ))
    }

    /// Returns the packed 64-bit value.
    #[must_use]
    pub const fn raw(&self) -> i64 {
        self.0
    }

    /// Inverts the packing: top 11 bits.
    #[must_use]
    pub const fn shardlet_id(&self) -> ShardletId {
        ShardletId::from_bits(((self.0 as u64) >> Self::SEQUENCE_BITS) as i16)
    }

    /// Inverts the packing: bottom 53 bits.
    #[must_use]
    pub const fn sequence(&self) -> i64 {
        ((self.0 as u64) & Self::SEQUENCE_MASK) as i64
    }
}

impl fmt::Display for SmartId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque monotonic identifier for a logical write transaction.
///
/// Comparable and orderable; the unit of cross-shard write-atomicity
/// bookkeeping. Every shard observes the transaction ids it was told about in
/// monotonically increasing order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct TransactionId(i64);

impl TransactionId {
    /// Creates a new `TransactionId`.
    #[must_use]
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    /// Returns the raw value.
    #[must_use]
    pub const fn value(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque monotonic identifier for a changeset within a transaction.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ChangeSetId(i64);

impl ChangeSetId {
    /// Creates a new `ChangeSetId`.
    #[must_use]
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    /// Returns the raw value.
    #[must_use]
    pub const fn value(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for ChangeSetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shardlet_id_range_validation() {
        assert!(ShardletId::new(-1).is_err());
        assert!(ShardletId::new(2048).is_err());
        assert_eq!(
            ShardletId::new(5000),
            Err(IdError::ShardletOutOfRange(5000))
        );

        for id in [0, 1023, 1024, 2047] {
            let shardlet = ShardletId::new(id).expect("in-range id");
            assert_eq!(shardlet.value(), id);
        }
    }

    #[test]
    fn test_shardlet_id_string_round_trip() {
        let shardlet = ShardletId::new(1536).unwrap();
        let text = shardlet.to_string();
        assert_eq!(text, "1536");
        assert_eq!(text.parse::<ShardletId>().unwrap(), shardlet);

        assert!("garbage".parse::<ShardletId>().is_err());
        assert!("9999".parse::<ShardletId>().is_err());
    }

    #[test]
    fn test_shardlet_id_reserved_range() {
        assert!(ShardletId::new(0).unwrap().is_reserved());
        assert!(ShardletId::new(1023).unwrap().is_reserved());
        assert!(!ShardletId::new(1024).unwrap().is_reserved());
        assert!(!ShardletId::new(2047).unwrap().is_reserved());
    }

    #[test]
    fn test_smart_id_round_trip() {
        let sequences = [0, 1, 42, SmartId::MAX_SEQUENCE - 1, SmartId::MAX_SEQUENCE];
        for shardlet in [1, 7, 1024, 1999, 2047] {
            let shardlet = ShardletId::new(shardlet).unwrap();
            for &sequence in &sequences {
                let id = SmartId::new(shardlet, sequence).unwrap();
                assert_eq!(id.shardlet_id(), shardlet);
                assert_eq!(id.sequence(), sequence);
                // Raw value survives a second trip through from_raw.
                let reparsed = SmartId::from_raw(id.raw());
                assert_eq!(reparsed.shardlet_id(), shardlet);
                assert_eq!(reparsed.sequence(), sequence);
            }
        }
    }

    #[test]
    fn test_smart_id_sequence_range_rejection() {
        let shardlet = ShardletId::new(1024).unwrap();
        assert_eq!(
            SmartId::new(shardlet, -1),
            Err(IdError::SequenceOutOfRange(-1))
        );
        assert_eq!(
            SmartId::new(shardlet, SmartId::MAX_SEQUENCE + 1),
            Err(IdError::SequenceOutOfRange(SmartId::MAX_SEQUENCE + 1))
        );
    }

    #[test]
    fn test_smart_id_zero_shardlet_is_raw_sequence() {
        let zero = ShardletId::new(0).unwrap();
        let id = SmartId::new(zero, SmartId::MAX_SEQUENCE + 17).unwrap();
        assert_eq!(id.raw(), SmartId::MAX_SEQUENCE + 17);
    }

    #[test]
    fn test_hashed_shardlet_determinism() {
        let a = ShardletId::hashed_from_str("Patient/abc-123");
        let b = ShardletId::hashed_from_str("Patient/abc-123");
        assert_eq!(a, b);

        let uuid = Uuid::parse_str("6ba7b810-9dad-11d1-80b4-00c04fd430c8").unwrap();
        assert_eq!(
            ShardletId::hashed_from_uuid(&uuid),
            ShardletId::hashed_from_uuid(&uuid)
        );

        // Distinct keys should usually land on distinct shardlets.
        let c = ShardletId::hashed_from_str("Observation/abc-124");
        assert_ne!(a, c);
    }

    #[test]
    fn test_hashed_shardlet_lands_in_usable_range() {
        for key in ["", "a", "Patient/1", "a-much-longer-resource-identifier"] {
            let shardlet = ShardletId::hashed_from_str(key);
            assert!(!shardlet.is_reserved(), "hashed shardlet for {key:?} was reserved");
            assert!(shardlet.value() >= ShardletId::USABLE_MIN);
            assert!(shardlet.value() <= ShardletId::MAX);
        }
    }

    #[test]
    fn test_hash_is_byte_order_sensitive() {
        assert_ne!(
            multiplicative_hash(b"ab"),
            multiplicative_hash(b"ba"),
        );
    }

    #[test]
    fn test_transaction_id_ordering() {
        let earlier = TransactionId::new(100);
        let later = TransactionId::new(101);
        assert!(earlier < later);
        assert_eq!(earlier, TransactionId::new(100));
        assert_eq!(later.to_string(), "101");
    }

    #[test]
    fn test_change_set_id_ordering() {
        assert!(ChangeSetId::new(1) < ChangeSetId::new(2));
        assert_eq!(ChangeSetId::new(7).value(), 7);
    }

    #[test]
    fn test_shardlet_id_serde_rejects_out_of_range() {
        let ok: ShardletId = serde_json::from_str("1500").unwrap();
        assert_eq!(ok.value(), 1500);
        assert!(serde_json::from_str::<ShardletId>("4000").is_err());
    }
}

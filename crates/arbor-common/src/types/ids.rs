//! Core identifier types for the arbor tree engine.
//!
//! These types provide type-safe wrappers around numeric identifiers,
//! preventing accidental misuse of area ids, version ids and node references.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{ArborError, ArborResult};

/// Area identifier - addresses one independently allocated area in a backing store.
///
/// # Example
///
/// ```rust
/// use arbor_common::types::AreaId;
///
/// let area = AreaId::new(42);
/// assert_eq!(area.as_u64(), 42);
/// ```
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct AreaId(u64);

impl AreaId {
    /// Largest area id that still fits the store-id encoding of [`NodeId`].
    pub const MAX: Self = Self((1 << 62) - 1);

    /// Creates a new `AreaId` from a raw u64 value.
    #[inline]
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw u64 value.
    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the next area id.
    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl fmt::Debug for AreaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AreaId({})", self.0)
    }
}

impl fmt::Display for AreaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for AreaId {
    #[inline]
    fn from(id: u64) -> Self {
        Self::new(id)
    }
}

/// Version identifier - names one immutable snapshot of the whole tree.
///
/// Version ids are strictly sequential: every commit produces `tip + 1`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct VersionId(u64);

impl VersionId {
    /// The version of a freshly created tree.
    pub const INITIAL: Self = Self(0);

    /// Creates a new `VersionId` from a raw u64 value.
    #[inline]
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw u64 value.
    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the version that directly follows this one.
    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl fmt::Debug for VersionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VersionId({})", self.0)
    }
}

impl fmt::Display for VersionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

const TAG_SHIFT: u32 = 62;
const TAG_STORED: u64 = 0b00;
const TAG_SPARSE: u64 = 0b10;
const TAG_HEAP: u64 = 0b11;
const PAYLOAD_MASK: u64 = (1 << TAG_SHIFT) - 1;

/// A reference to a tree node.
///
/// - `Heap` ids name mutable nodes living in one transaction's node heap.
///   They are negative and minted in decreasing order.
/// - `Stored` ids name immutable nodes persisted in a backing-store area.
/// - `Sparse` ids name a virtual leaf of `len` copies of `fill` that has no
///   storage at all.
///
/// Stored and sparse nodes are *frozen*: they must be copied into the heap
/// before they can be edited.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeId {
    /// Transaction-local mutable node.
    Heap(i64),
    /// Persisted immutable node.
    Stored(AreaId),
    /// Virtual single-byte-run leaf.
    Sparse {
        /// The repeated byte.
        fill: u8,
        /// Run length in bytes.
        len: u32,
    },
}

impl NodeId {
    /// Creates a sparse leaf reference.
    #[inline]
    #[must_use]
    pub const fn sparse(fill: u8, len: u32) -> Self {
        Self::Sparse { fill, len }
    }

    /// Returns true for heap ids.
    #[inline]
    #[must_use]
    pub const fn is_heap(&self) -> bool {
        matches!(self, Self::Heap(_))
    }

    /// Returns true for stored and sparse ids, which may not be mutated in place.
    #[inline]
    #[must_use]
    pub const fn is_frozen(&self) -> bool {
        !self.is_heap()
    }

    /// Returns true for sparse ids.
    #[inline]
    #[must_use]
    pub const fn is_sparse(&self) -> bool {
        matches!(self, Self::Sparse { .. })
    }

    /// Returns the backing area of a stored id.
    #[inline]
    #[must_use]
    pub const fn area(&self) -> Option<AreaId> {
        match self {
            Self::Stored(area) => Some(*area),
            _ => None,
        }
    }

    /// Encodes the id as the `i64` used inside branch areas and version records.
    ///
    /// The top two bits carry the tag: `00` stored, `10` sparse, `11` heap.
    #[must_use]
    pub const fn to_raw(&self) -> i64 {
        let raw = match *self {
            Self::Stored(area) => (TAG_STORED << TAG_SHIFT) | (area.as_u64() & PAYLOAD_MASK),
            Self::Sparse { fill, len } => {
                (TAG_SPARSE << TAG_SHIFT) | ((fill as u64) << 32) | len as u64
            }
            Self::Heap(id) => (TAG_HEAP << TAG_SHIFT) | (id.unsigned_abs() & PAYLOAD_MASK),
        };
        raw as i64
    }

    /// Decodes an id previously produced by [`NodeId::to_raw`].
    pub fn from_raw(raw: i64) -> ArborResult<Self> {
        let raw = raw as u64;
        let payload = raw & PAYLOAD_MASK;
        match raw >> TAG_SHIFT {
            TAG_STORED => Ok(Self::Stored(AreaId::new(payload))),
            TAG_SPARSE => {
                if payload >> 40 != 0 {
                    return Err(ArborError::corruption(format!(
                        "malformed sparse node id {raw:#018x}"
                    )));
                }
                Ok(Self::Sparse {
                    fill: (payload >> 32) as u8,
                    len: payload as u32,
                })
            }
            TAG_HEAP => Ok(Self::Heap(-(payload as i64))),
            _ => Err(ArborError::corruption(format!(
                "unknown node id tag in {raw:#018x}"
            ))),
        }
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Heap(id) => write!(f, "Heap({id})"),
            Self::Stored(area) => write!(f, "Stored({area})"),
            Self::Sparse { fill, len } => write!(f, "Sparse({fill:#04x} x {len})"),
        }
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_encoding() {
        let ids = [
            NodeId::Stored(AreaId::new(0)),
            NodeId::Stored(AreaId::new(123_456)),
            NodeId::Stored(AreaId::MAX),
            NodeId::sparse(0, 1),
            NodeId::sparse(0xAB, u32::MAX),
            NodeId::Heap(-1),
            NodeId::Heap(-9_000_000),
        ];
        for id in ids {
            assert_eq!(NodeId::from_raw(id.to_raw()).unwrap(), id);
        }
    }

    #[test]
    fn test_stored_ids_are_non_negative() {
        assert!(NodeId::Stored(AreaId::new(77)).to_raw() >= 0);
        assert!(NodeId::sparse(1, 1).to_raw() < 0);
        assert!(NodeId::Heap(-3).to_raw() < 0);
    }

    #[test]
    fn test_frozen() {
        assert!(NodeId::Stored(AreaId::new(1)).is_frozen());
        assert!(NodeId::sparse(0, 4).is_frozen());
        assert!(!NodeId::Heap(-1).is_frozen());
    }

    #[test]
    fn test_unknown_tag_rejected() {
        let raw = (0b01u64 << 62) as i64;
        assert!(NodeId::from_raw(raw).is_err());
    }

    #[test]
    fn test_version_next() {
        assert_eq!(VersionId::INITIAL.next(), VersionId::new(1));
        assert_eq!(VersionId::new(7).to_string(), "v7");
    }
}

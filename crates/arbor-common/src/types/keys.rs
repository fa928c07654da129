//! Composite ordering keys.
//!
//! Every file in the tree is named by a [`Key`]. All files are stored
//! concatenated in key order, so the byte offset of a file's first byte is
//! the total length of every file that sorts before it.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

use crate::constants::RESERVED_KEY_TYPE_START;

/// A file key: `(key_type, secondary, primary)`.
///
/// Keys are ordered lexicographically by `(secondary, key_type, primary)`.
/// Two sentinels bound the address space: [`Key::HEAD`] sorts before every
/// other key and [`Key::TAIL`] after every other key.
///
/// # Example
///
/// ```rust
/// use arbor_common::types::Key;
///
/// let a = Key::new(5, 1, 100);
/// let b = Key::new(0, 2, 0);
/// // secondary is compared first
/// assert!(a < b);
/// ```
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Key {
    key_type: i16,
    secondary: i32,
    primary: i64,
}

impl Key {
    /// The minimal key. Owns the leftmost sentinel leaf of every tree.
    pub const HEAD: Self = Self {
        key_type: i16::MIN,
        secondary: i32::MIN,
        primary: i64::MIN,
    };

    /// The maximal key. Owns the rightmost sentinel leaf of every tree.
    pub const TAIL: Self = Self {
        key_type: i16::MAX,
        secondary: i32::MAX,
        primary: i64::MAX,
    };

    /// Creates a new key.
    #[inline]
    #[must_use]
    pub const fn new(key_type: i16, secondary: i32, primary: i64) -> Self {
        Self {
            key_type,
            secondary,
            primary,
        }
    }

    /// Returns the key type component.
    #[inline]
    #[must_use]
    pub const fn key_type(&self) -> i16 {
        self.key_type
    }

    /// Returns the secondary component (most significant for ordering).
    #[inline]
    #[must_use]
    pub const fn secondary(&self) -> i32 {
        self.secondary
    }

    /// Returns the primary component (least significant for ordering).
    #[inline]
    #[must_use]
    pub const fn primary(&self) -> i64 {
        self.primary
    }

    /// Returns true if the key uses a key type from the system range.
    #[inline]
    #[must_use]
    pub const fn is_reserved(&self) -> bool {
        self.key_type >= RESERVED_KEY_TYPE_START
    }

    /// Returns true for either sentinel.
    #[inline]
    #[must_use]
    pub fn is_sentinel(&self) -> bool {
        *self == Self::HEAD || *self == Self::TAIL
    }

    /// Encodes the key as the two `i64` parts stored in branch areas.
    ///
    /// The first part packs `secondary` in the high 32 bits and `key_type`
    /// in the low 16 bits; the second part is `primary`.
    #[must_use]
    pub const fn encode(&self) -> (i64, i64) {
        let part1 = ((self.secondary as u32 as u64) << 32) | (self.key_type as u16 as u64);
        (part1 as i64, self.primary)
    }

    /// Decodes a key from its two branch area parts.
    #[must_use]
    pub const fn decode(part1: i64, part2: i64) -> Self {
        let raw = part1 as u64;
        Self {
            key_type: (raw & 0xFFFF) as u16 as i16,
            secondary: (raw >> 32) as u32 as i32,
            primary: part2,
        }
    }
}

impl Ord for Key {
    fn cmp(&self, other: &Self) -> Ordering {
        self.secondary
            .cmp(&other.secondary)
            .then(self.key_type.cmp(&other.key_type))
            .then(self.primary.cmp(&other.primary))
    }
}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::HEAD {
            write!(f, "Key(HEAD)")
        } else if *self == Self::TAIL {
            write!(f, "Key(TAIL)")
        } else {
            write!(
                f,
                "Key({}, {}, {})",
                self.key_type, self.secondary, self.primary
            )
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.key_type, self.secondary, self.primary)
    }
}

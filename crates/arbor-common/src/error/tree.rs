//! Tree engine error types.
//!
//! Errors are split into two classes. *Fatal* errors (I/O failures, corrupt
//! areas, broken tree invariants, exhausted memory) poison the owning tree
//! store: once one is observed every later operation fails with
//! [`ArborError::Poisoned`]. *Local* errors (bounds violations, read-only
//! violations, API misuse) are reported to the caller and leave the store
//! usable.

use std::fmt;
use thiserror::Error;

use crate::types::{AreaId, Key, NodeId, VersionId};

/// Error codes for categorizing errors.
///
/// These codes can be used for programmatic error handling and
/// are stable across versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ErrorCode {
    // General errors (0x0000 - 0x00FF)
    /// Internal invariant violated (bug or corruption).
    Internal = 0x0001,
    /// Invalid argument provided.
    InvalidArgument = 0x0003,
    /// Invalid configuration.
    InvalidConfig = 0x0004,

    // I/O errors (0x0100 - 0x01FF)
    /// General I/O error.
    Io = 0x0100,
    /// Data corruption detected.
    Corruption = 0x0104,
    /// Allocation budget exhausted.
    OutOfMemory = 0x0105,

    // Storage errors (0x0200 - 0x02FF)
    /// Area not found in the backing store.
    AreaNotFound = 0x0200,
    /// Node reference could not be resolved.
    NodeNotFound = 0x0201,
    /// Position or length outside a file's extent.
    OutOfBounds = 0x0202,
    /// Key lies in the system range.
    ReservedKey = 0x0203,
    /// Tree store was poisoned by an earlier fatal error.
    Poisoned = 0x0204,

    // Transaction errors (0x0300 - 0x03FF)
    /// Write attempted through a read-only transaction or file.
    ReadOnly = 0x0300,
    /// Commit not based on the current tip version.
    VersionOutOfSequence = 0x0301,
    /// Transaction was already committed or disposed.
    TransactionFinished = 0x0302,
}

impl ErrorCode {
    /// Returns the numeric code.
    #[inline]
    #[must_use]
    pub const fn as_u16(self) -> u16 {
        self as u16
    }

    /// Returns the error category name.
    #[must_use]
    pub const fn category(&self) -> &'static str {
        match (*self as u16) >> 8 {
            0x00 => "General",
            0x01 => "I/O",
            0x02 => "Storage",
            0x03 => "Transaction",
            _ => "Unknown",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// The main error type for the arbor tree engine.
#[derive(Debug, Error)]
pub enum ArborError {
    // ==========================================================================
    // Fatal errors
    // ==========================================================================
    /// I/O error from the underlying system.
    #[error("I/O error: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// Persisted data does not decode.
    #[error("data corruption detected: {message}")]
    Corruption {
        /// Description of the corruption.
        message: String,
    },

    /// Area id unknown to the backing store.
    #[error("area {area} not found")]
    AreaNotFound {
        /// The missing area.
        area: AreaId,
    },

    /// A node id could not be resolved (stale heap id).
    #[error("node {node} not found")]
    NodeNotFound {
        /// The missing node.
        node: NodeId,
    },

    /// A tree-integrity assertion failed.
    #[error("tree integrity violated: {message}")]
    TreeIntegrity {
        /// Which invariant failed.
        message: String,
    },

    /// An allocation budget was exhausted.
    #[error("out of memory: {message}")]
    OutOfMemory {
        /// What could not be allocated.
        message: String,
    },

    /// The store latched an earlier fatal error and refuses all work.
    #[error("store is in an error state: {cause}")]
    Poisoned {
        /// Display text of the error that poisoned the store.
        cause: String,
    },

    // ==========================================================================
    // Local errors
    // ==========================================================================
    /// Access outside the current extent of a file.
    #[error("position {position} out of bounds for {key:?} (length {length})")]
    OutOfBounds {
        /// The file being accessed.
        key: Key,
        /// The offending position (relative to the file start).
        position: u64,
        /// The file length at the time of the call.
        length: u64,
    },

    /// Attempted to modify through a read-only transaction or file.
    #[error("write rejected: {what} is read-only")]
    ReadOnly {
        /// What was read-only.
        what: &'static str,
    },

    /// A user key fell in the reserved system range.
    #[error("key {key:?} uses a reserved key type")]
    ReservedKey {
        /// The rejected key.
        key: Key,
    },

    /// Commit was not based on the current tip.
    #[error("version {based_on} is not the tip {tip}, cannot commit")]
    VersionOutOfSequence {
        /// Version the transaction was created on.
        based_on: VersionId,
        /// Current tip version.
        tip: VersionId,
    },

    /// The transaction was already committed or disposed.
    #[error("transaction already finished")]
    TransactionFinished,

    /// Invalid argument provided.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// Error message.
        message: String,
    },

    /// Invalid configuration.
    #[error("invalid configuration: {message}")]
    InvalidConfig {
        /// Error message.
        message: String,
    },
}

impl ArborError {
    /// Returns the error code for this error.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Io { .. } => ErrorCode::Io,
            Self::Corruption { .. } => ErrorCode::Corruption,
            Self::AreaNotFound { .. } => ErrorCode::AreaNotFound,
            Self::NodeNotFound { .. } => ErrorCode::NodeNotFound,
            Self::TreeIntegrity { .. } => ErrorCode::Internal,
            Self::OutOfMemory { .. } => ErrorCode::OutOfMemory,
            Self::Poisoned { .. } => ErrorCode::Poisoned,
            Self::OutOfBounds { .. } => ErrorCode::OutOfBounds,
            Self::ReadOnly { .. } => ErrorCode::ReadOnly,
            Self::ReservedKey { .. } => ErrorCode::ReservedKey,
            Self::VersionOutOfSequence { .. } => ErrorCode::VersionOutOfSequence,
            Self::TransactionFinished => ErrorCode::TransactionFinished,
            Self::InvalidArgument { .. } => ErrorCode::InvalidArgument,
            Self::InvalidConfig { .. } => ErrorCode::InvalidConfig,
        }
    }

    /// Returns true if this error must poison the tree store.
    ///
    /// `Poisoned` itself is not fatal: it only reports an existing latch.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Io { .. }
                | Self::Corruption { .. }
                | Self::AreaNotFound { .. }
                | Self::NodeNotFound { .. }
                | Self::TreeIntegrity { .. }
                | Self::OutOfMemory { .. }
        )
    }

    /// Creates a corruption error.
    #[must_use]
    pub fn corruption(message: impl Into<String>) -> Self {
        Self::Corruption {
            message: message.into(),
        }
    }

    /// Creates a tree-integrity error.
    #[must_use]
    pub fn integrity(message: impl Into<String>) -> Self {
        Self::TreeIntegrity {
            message: message.into(),
        }
    }

    /// Creates an invalid argument error.
    #[must_use]
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Creates an invalid configuration error.
    #[must_use]
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }
}

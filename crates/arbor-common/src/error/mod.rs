//! Error handling for the arbor tree engine.
//!
//! This module provides a unified error type and result alias used
//! across all arbor components.

mod tree;

pub use tree::{ArborError, ErrorCode};

/// Result type alias for arbor operations.
pub type ArborResult<T> = std::result::Result<T, ArborError>;

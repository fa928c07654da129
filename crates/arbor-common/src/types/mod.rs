//! Type definitions for the arbor tree engine.
//!
//! This module contains the identifier and key types shared by every crate.

mod ids;
mod keys;

pub use ids::{AreaId, NodeId, VersionId};
pub use keys::Key;

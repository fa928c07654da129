//! # arbor-common
//!
//! Common types, errors, and configuration for the arbor tree engine.
//!
//! This crate provides the foundational types shared by every arbor crate:
//!
//! - **Types**: composite ordering [`Key`]s, tagged [`NodeId`]s, [`AreaId`] and [`VersionId`]
//! - **Errors**: unified error handling with [`ArborError`] and the fatal/local split
//! - **Config**: tree engine configuration ([`TreeConfig`])
//! - **Constants**: on-disk magic numbers and default limits
//!
//! ## Example
//!
//! ```rust
//! use arbor_common::types::{Key, NodeId};
//! use arbor_common::error::ArborResult;
//!
//! fn example() -> ArborResult<()> {
//!     let key = Key::new(0, 1, 100);
//!     assert!(Key::HEAD < key && key < Key::TAIL);
//!
//!     let sparse = NodeId::sparse(0, 128);
//!     assert!(sparse.is_frozen());
//!     assert_eq!(NodeId::from_raw(sparse.to_raw())?, sparse);
//!     Ok(())
//! }
//! # example().unwrap();
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod constants;
pub mod error;
pub mod types;

pub use config::TreeConfig;
pub use constants::*;
pub use error::{ArborError, ArborResult, ErrorCode};
pub use types::{AreaId, Key, NodeId, VersionId};

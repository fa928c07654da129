//! # arbor-storage
//!
//! Area-based backing stores for the arbor tree engine.
//!
//! An *area* is an independently allocated byte range addressed by an
//! [`AreaId`](arbor_common::AreaId). The tree engine persists every node in
//! its own area and never needs to know how areas are laid out on disk.
//!
//! This crate provides:
//! - [`AreaStore`]: the contract consumed by the tree engine
//! - [`AreaWriter`] / [`MutableArea`]: sequential-write and in-place update handles
//! - [`MemoryAreaStore`]: a heap-backed store with fault injection for tests
//! - [`FileAreaStore`]: a crash-consistent store backed by a checksummed area log
//!
//! ## Example
//!
//! ```rust
//! use arbor_storage::{AreaStore, AreaStoreExt, MemoryAreaStore};
//!
//! let store = MemoryAreaStore::new();
//! let mut writer = store.create_area(6).unwrap();
//! writer.put_u16(0xBEEF);
//! writer.put_u32(7);
//! let id = writer.finish().unwrap();
//!
//! let area = store.get_area(id).unwrap();
//! assert_eq!(&area[..2], &[0xBE, 0xEF]);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod area;
pub mod file;
pub mod memory;

pub use area::{AreaStore, AreaStoreExt, AreaWriter, MutableArea, WriteGuard};
pub use file::{FileAreaStore, StoreConfig};
pub use memory::MemoryAreaStore;

//! # arbor-tree
//!
//! A versioned, copy-on-write B+-tree that stores keyed byte files.
//!
//! Every file is a run of bytes named by a [`Key`](arbor_common::Key). All
//! files are laid end to end in key order, and the tree indexes that single
//! byte sequence by position: branches hold the byte count below each
//! child, leaves hold the bytes.
//!
//! ```text
//!                  root  counts [13 | 10]  keys [K2]
//!                     /                    \
//!    [1 | 8 | 4]  keys [K1 K1]       [9 | 1]  keys [TAIL]
//!          /    |    \                   /     \
//!      HEAD(1) K1(8) K1(4)            K2(9)   TAIL(1)
//!      pos 0   1     9               13       22
//! ```
//!
//! A [`Transaction`] edits a private copy of every node it touches and
//! leaves the version it started from untouched. Committing writes the
//! copies as a new version; older versions live until no transaction
//! pins them.
//!
//! Key modules:
//! - [`node`]: branch and leaf representations
//! - [`format`]: on-store layout of nodes, the header and version records
//! - [`heap`]: the per-transaction arena of mutable nodes
//! - [`store`]: area-backed persistence, versions and garbage collection
//! - [`TreeSystem`], [`Transaction`], [`DataFile`], [`DataRange`]: the API

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod format;
pub mod heap;
pub mod node;
pub mod store;

mod data_file;
mod data_range;
mod stack;
mod system;
mod transaction;

pub use data_file::DataFile;
pub use data_range::DataRange;
pub use store::{TreeStats, TreeStore, VersionInfo};
pub use system::TreeSystem;
pub use transaction::{AccessMode, Transaction};

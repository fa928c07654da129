//! Transactions over one version of the tree.
//!
//! A [`Transaction`] pins the tip version it started from and edits a
//! private copy of the path to every leaf it touches:
//!
//! ```text
//!   base version (frozen)          transaction heap
//!
//!        [root]                        [root']
//!        /    \          write K        /    \
//!     [b1]    [b2]      -------->   [b1]    [b2']
//!     / \     / \                           /  \
//!    l1  l2  l3  l4                        l3  l4'
//! ```
//!
//! Untouched subtrees stay shared with the base version. On commit the heap
//! is compacted and written to the store as a new version; on rollback it
//! is thrown away.

mod compact;
pub(crate) mod core;
mod flush;
mod ops;
pub(crate) mod rebalance;

use std::sync::Arc;

use tracing::{debug, info, warn};

use arbor_common::error::{ArborError, ArborResult};
use arbor_common::types::{Key, NodeId, VersionId};

use crate::data_file::DataFile;
use crate::data_range::DataRange;
use crate::stack::TreeStack;
use crate::store::TreeStore;

use self::core::TxCore;

/// How a [`DataFile`] may be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    /// Reads only.
    Read,
    /// Reads and writes.
    ReadWrite,
}

/// A run of content on its way into the tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Piece {
    Bytes(Vec<u8>),
    /// Zero bytes.
    Fill(u64),
    /// A whole frozen leaf, linked rather than copied.
    Leaf { node: NodeId, size: u64 },
}

impl Piece {
    pub(crate) fn len(&self) -> u64 {
        match self {
            Piece::Bytes(bytes) => bytes.len() as u64,
            Piece::Fill(count) => *count,
            Piece::Leaf { size, .. } => *size,
        }
    }
}

/// Rejects keys that name the sentinels or the reserved key space.
pub(crate) fn check_user_key(key: Key) -> ArborResult<()> {
    if key.is_reserved() || key.is_sentinel() {
        return Err(ArborError::ReservedKey { key });
    }
    Ok(())
}

/// An isolated view of one version, optionally writable.
///
/// Dropping a transaction that was neither committed nor disposed rolls it
/// back.
pub struct Transaction {
    core: TxCore,
    stack: TreeStack,
    finished: bool,
}

impl Transaction {
    pub(crate) fn begin(store: Arc<TreeStore>, read_only: bool) -> ArborResult<Self> {
        store.check_error_state()?;
        let (version, root) = store.lock_tip()?;
        debug!(%version, read_only, "began transaction");
        Ok(Self {
            core: TxCore::new(store, version, root, read_only),
            stack: TreeStack::new(),
            finished: false,
        })
    }

    /// The version this transaction is based on.
    pub fn version(&self) -> VersionId {
        self.core.version
    }

    /// Whether this is a snapshot.
    pub fn is_read_only(&self) -> bool {
        self.core.read_only
    }

    /// Estimated bytes held by this transaction's node heap.
    pub fn heap_memory(&self) -> usize {
        self.core.heap.memory_used()
    }

    pub(crate) fn store(&self) -> &Arc<TreeStore> {
        &self.core.store
    }

    /// Opens the file named `key`. The file need not exist yet.
    pub fn get_file(&mut self, key: Key, mode: AccessMode) -> ArborResult<DataFile<'_>> {
        check_user_key(key)?;
        self.check_usable()?;
        if mode == AccessMode::ReadWrite && self.core.read_only {
            return Err(ArborError::ReadOnly { what: "snapshot" });
        }
        Ok(DataFile::new(self, key, mode))
    }

    /// Whether `key` holds at least one byte.
    pub fn file_exists(&mut self, key: Key) -> ArborResult<bool> {
        check_user_key(key)?;
        self.run(false, |core, _| Ok(core.file_length(key)? > 0))
    }

    /// Length of the file named `key`; zero when it does not exist.
    pub fn file_length(&mut self, key: Key) -> ArborResult<u64> {
        check_user_key(key)?;
        self.run(false, |core, _| core.file_length(key))
    }

    /// The files with keys in `[min, max]`. The sentinels may be used as
    /// open ends.
    pub fn get_range(&mut self, min: Key, max: Key) -> ArborResult<DataRange<'_>> {
        for key in [min, max] {
            if !key.is_sentinel() {
                check_user_key(key)?;
            }
        }
        if min > max {
            return Err(ArborError::invalid_argument(format!(
                "range minimum {min:?} is above maximum {max:?}"
            )));
        }
        self.check_usable()?;
        Ok(DataRange::new(self, min, max))
    }

    /// Inserts `len` bytes of `src` starting at `src_pos` into `dst` at
    /// `dst_pos`. Whole stored leaves are shared instead of copied.
    pub fn copy_data(&mut self, src: Key, src_pos: u64, dst: Key, dst_pos: u64, len: u64) -> ArborResult<()> {
        check_user_key(src)?;
        check_user_key(dst)?;
        self.run(true, |core, stack| core.copy_data(stack, src, src_pos, dst, dst_pos, len))
    }

    /// Number of levels in this transaction's tree, leaves included.
    pub fn tree_height(&mut self) -> ArborResult<usize> {
        self.run(false, |core, _| core.tree_height())
    }

    /// Walks the whole tree and checks its structure. A failure poisons the
    /// store.
    pub fn check_integrity(&mut self) -> ArborResult<()> {
        self.run(false, |core, _| core.check_integrity())
    }

    /// Writes every change as a new version and returns its id.
    ///
    /// Committing a snapshot releases it and returns its base version.
    pub fn commit(mut self) -> ArborResult<VersionId> {
        let result = self.commit_inner();
        if result.is_err() && !self.finished {
            if let Err(err) = self.rollback() {
                warn!(error = %err, "rollback after failed commit failed");
            }
        }
        result
    }

    /// Throws away every change and releases the base version.
    pub fn dispose(mut self) -> ArborResult<()> {
        self.rollback()
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn check_usable(&self) -> ArborResult<()> {
        self.core.store.check_error_state()?;
        if self.finished {
            return Err(ArborError::TransactionFinished);
        }
        Ok(())
    }

    /// Runs one operation against the tree, flushing the heap after writes
    /// and latching fatal errors.
    pub(crate) fn run<T>(
        &mut self,
        write: bool,
        f: impl FnOnce(&mut TxCore, &mut TreeStack) -> ArborResult<T>,
    ) -> ArborResult<T> {
        self.check_usable()?;
        if write && self.core.read_only {
            return Err(ArborError::ReadOnly { what: "snapshot" });
        }
        let mut result = f(&mut self.core, &mut self.stack);
        if write && result.is_ok() {
            if let Err(err) = self.core.flush_heap_if_needed() {
                result = Err(err);
            }
        }
        if result.is_err() {
            self.stack.invalidate();
        }
        self.core.store.latch(result)
    }

    /// Replaces the content of every key in `keys` in `target` with this
    /// transaction's content.
    pub(crate) fn replicate_keys(&mut self, keys: &[Key], target: &mut Transaction) -> ArborResult<()> {
        if !Arc::ptr_eq(&self.core.store, &target.core.store) {
            return Err(ArborError::invalid_argument(
                "replication target belongs to a different store",
            ));
        }
        target.check_usable()?;
        if target.core.read_only {
            return Err(ArborError::ReadOnly { what: "replication target" });
        }
        for &key in keys {
            let mut links = Vec::new();
            let pieces = self.run(false, |core, stack| {
                let (start, end) = core.file_bounds(key)?;
                core.collect_pieces(stack, start, end, &mut links)
            });
            target.core.linked.extend(links);
            let pieces = pieces?;
            target.run(true, |core, stack| core.replace_file(stack, key, pieces))?;
        }
        debug!(keys = keys.len(), "replicated range");
        Ok(())
    }

    fn commit_inner(&mut self) -> ArborResult<VersionId> {
        self.check_usable()?;
        if self.core.read_only {
            self.rollback()?;
            return Ok(self.core.version);
        }
        let store = Arc::clone(&self.core.store);
        let tip = store.tip_version()?;
        if tip != self.core.version {
            return Err(ArborError::VersionOutOfSequence {
                based_on: self.core.version,
                tip,
            });
        }

        let flushed = self.flush_all();
        let root = store.latch(flushed)?;
        let deleted = std::mem::take(&mut self.core.deleted);
        let retired = deleted.len();
        let version = store.latch(store.commit_version(self.core.version, root, deleted))?;

        self.finished = true;
        self.core.created.clear();
        self.core.linked.clear();
        self.core.heap.clear();
        info!(%version, based_on = %self.core.version, retired, "committed transaction");
        Ok(version)
    }

    fn flush_all(&mut self) -> ArborResult<NodeId> {
        self.stack.invalidate();
        self.core.compact()?;
        self.core.write_nodes(&|_| true)?;
        if !self.core.root.is_frozen() {
            return Err(ArborError::integrity("root still on the heap after a full flush"));
        }
        Ok(self.core.root)
    }

    fn rollback(&mut self) -> ArborResult<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        self.stack.invalidate();
        self.core.heap.clear();
        self.core.deleted.clear();

        let store = Arc::clone(&self.core.store);
        if store.is_poisoned() {
            self.core.created.clear();
            self.core.linked.clear();
            return Ok(());
        }
        let mut result = Ok(());
        for area in self.core.created.drain(..).chain(self.core.linked.drain(..)) {
            if result.is_ok() {
                result = store.dispose_node(NodeId::Stored(area));
            }
        }
        let released = store.release_version(self.core.version);
        debug!(version = %self.core.version, "rolled back transaction");
        store.latch(result.and(released))
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(err) = self.rollback() {
                warn!(version = %self.core.version, error = %err, "rollback on drop failed");
            }
        }
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("version", &self.core.version)
            .field("read_only", &self.core.read_only)
            .field("heap_nodes", &self.core.heap.len())
            .field("finished", &self.finished)
            .finish()
    }
}

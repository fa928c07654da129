//! The entry point: one tree over one area store.

use std::sync::Arc;

use tracing::info;

use arbor_common::config::TreeConfig;
use arbor_common::error::{ArborError, ArborResult};
use arbor_common::types::VersionId;
use arbor_storage::AreaStore;

use crate::store::{TreeStats, TreeStore, VersionInfo};
use crate::transaction::Transaction;

/// A versioned tree of keyed byte files.
///
/// Transactions start from the tip version. Any number may be open at
/// once; only one based on the current tip can commit.
///
/// ```rust
/// use std::sync::Arc;
/// use arbor_common::{Key, TreeConfig};
/// use arbor_storage::MemoryAreaStore;
/// use arbor_tree::{AccessMode, TreeSystem};
///
/// let system = TreeSystem::create(Arc::new(MemoryAreaStore::new()), TreeConfig::for_testing()).unwrap();
/// let key = Key::new(1, 0, 7);
///
/// let mut tx = system.create_transaction().unwrap();
/// tx.get_file(key, AccessMode::ReadWrite).unwrap().write(b"hello").unwrap();
/// system.commit(tx).unwrap();
///
/// let mut snapshot = system.create_snapshot().unwrap();
/// assert_eq!(snapshot.get_file(key, AccessMode::Read).unwrap().read_vec(5).unwrap(), b"hello");
/// ```
#[derive(Debug, Clone)]
pub struct TreeSystem {
    store: Arc<TreeStore>,
}

impl TreeSystem {
    /// Initializes an empty tree in `areas`.
    pub fn create(areas: Arc<dyn AreaStore>, config: TreeConfig) -> ArborResult<Self> {
        let store = TreeStore::create(areas, config)?;
        info!("created tree");
        Ok(Self { store: Arc::new(store) })
    }

    /// Opens the tree persisted in `areas`.
    pub fn open(areas: Arc<dyn AreaStore>, config: TreeConfig) -> ArborResult<Self> {
        let store = TreeStore::open(areas, config)?;
        info!(tip = %store.tip_version()?, "opened tree");
        Ok(Self { store: Arc::new(store) })
    }

    /// Starts a writable transaction on the tip version.
    pub fn create_transaction(&self) -> ArborResult<Transaction> {
        Transaction::begin(Arc::clone(&self.store), false)
    }

    /// Starts a read-only transaction on the tip version.
    pub fn create_snapshot(&self) -> ArborResult<Transaction> {
        Transaction::begin(Arc::clone(&self.store), true)
    }

    /// Commits `tx` as the new tip.
    pub fn commit(&self, tx: Transaction) -> ArborResult<VersionId> {
        self.check_owner(&tx)?;
        tx.commit()
    }

    /// Rolls `tx` back.
    pub fn dispose(&self, tx: Transaction) -> ArborResult<()> {
        self.check_owner(&tx)?;
        tx.dispose()
    }

    /// Flushes pending store writes to durable storage.
    pub fn checkpoint(&self) -> ArborResult<()> {
        self.store.check_error_state()?;
        self.store.checkpoint()
    }

    /// The newest committed version.
    pub fn tip_version(&self) -> ArborResult<VersionId> {
        self.store.check_error_state()?;
        self.store.tip_version()
    }

    /// Number of versions still held.
    pub fn version_count(&self) -> usize {
        self.store.versions().len()
    }

    /// Versions still held, oldest first.
    pub fn versions(&self) -> Vec<VersionInfo> {
        self.store.versions()
    }

    /// Counters and gauges.
    pub fn stats(&self) -> ArborResult<TreeStats> {
        self.store.stats()
    }

    /// Whether a fatal error has disabled the tree.
    pub fn is_poisoned(&self) -> bool {
        self.store.is_poisoned()
    }

    /// The tree configuration.
    pub fn config(&self) -> &TreeConfig {
        self.store.config()
    }

    /// The underlying tree store.
    pub fn store(&self) -> &Arc<TreeStore> {
        &self.store
    }

    fn check_owner(&self, tx: &Transaction) -> ArborResult<()> {
        if !Arc::ptr_eq(tx.store(), &self.store) {
            return Err(ArborError::invalid_argument("transaction belongs to another tree"));
        }
        Ok(())
    }
}

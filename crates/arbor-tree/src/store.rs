//! Store-backed persistence and the version chain.
//!
//! [`TreeStore`] maps tree nodes onto backing-store areas and owns the
//! ordered list of versions:
//!
//! ```text
//!   oldest                                          tip
//!   ┌──────┐     ┌──────┐     ┌──────┐     ┌──────┐
//!   │ v3   │ ──► │ v4   │ ──► │ v5   │ ──► │ v6   │
//!   │ lk 0 │     │ lk 1 │     │ lk 0 │     │ lk 2 │
//!   │ del… │     │ del… │     │ del… │     │      │
//!   └──────┘     └──────┘     └──────┘     └──────┘
//!   reclaimable   pinned: GC stops here
//! ```
//!
//! A commit attaches its deleted-node list to the version it replaced.
//! Garbage collection walks from the oldest version and reclaims versions
//! until it meets one that is locked or is the tip.
//!
//! Fatal errors latch the store; every later operation fails with
//! [`ArborError::Poisoned`] until the store is reopened.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use arbor_cache::{CacheStats, SyncSizedLruCache};
use arbor_common::config::TreeConfig;
use arbor_common::constants::{HEADER_AREA_SIZE, LEAF_REF_COUNT_OFFSET};
use arbor_common::error::{ArborError, ArborResult};
use arbor_common::types::{AreaId, Key, NodeId, VersionId};
use arbor_storage::{AreaStore, AreaStoreExt};
use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, error, info, trace};

use crate::format::{self, VersionRecord};
use crate::node::{StoredNode, TreeBranch};

/// A child reference inside a [`WriteBatch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchChild {
    /// An already frozen node.
    Node(NodeId),
    /// The node at this index of the same batch.
    Pending(usize),
}

/// A node to persist.
#[derive(Debug, Clone)]
pub enum BatchNode {
    /// Leaf payload.
    Leaf(Bytes),
    /// Branch whose children may refer to earlier batch entries.
    Branch {
        /// Children in key order.
        children: Vec<BatchChild>,
        /// Element count per child.
        counts: Vec<u64>,
        /// Separator keys.
        keys: Vec<Key>,
    },
}

/// Topologically ordered nodes to persist: every `Pending` index points at
/// an earlier entry.
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    nodes: Vec<BatchNode>,
}

impl WriteBatch {
    /// Creates an empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a node and returns its batch index.
    pub fn push(&mut self, node: BatchNode) -> usize {
        self.nodes.push(node);
        self.nodes.len() - 1
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if the batch is empty.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Public view of one version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionInfo {
    /// Version id.
    pub id: VersionId,
    /// Root node.
    pub root: NodeId,
    /// Open transactions based on this version.
    pub locks: u32,
}

/// Store statistics.
#[derive(Debug, Clone, PartialEq)]
pub struct TreeStats {
    /// Current tip version.
    pub tip: VersionId,
    /// Versions still held.
    pub version_count: usize,
    /// Partial heap flushes performed.
    pub heap_flushes: u64,
    /// Versions committed since open.
    pub commits: u64,
    /// Decoded branches in the cache.
    pub cached_branches: usize,
    /// Branch cache counters.
    pub branch_cache: CacheStats,
    /// Live areas in the backing store.
    pub area_count: usize,
}

struct Version {
    id: VersionId,
    root: NodeId,
    locks: u32,
    deleted: Vec<NodeId>,
    record: AreaId,
}

struct VersionChain {
    versions: VecDeque<Version>,
    list_area: AreaId,
    header_area: AreaId,
}

impl VersionChain {
    fn tip(&self) -> ArborResult<&Version> {
        self.versions
            .back()
            .ok_or_else(|| ArborError::integrity("version chain is empty"))
    }

    fn tip_mut(&mut self) -> ArborResult<&mut Version> {
        self.versions
            .back_mut()
            .ok_or_else(|| ArborError::integrity("version chain is empty"))
    }

    /// Pops every leading version that is unlocked and not the tip.
    fn take_reclaimable(&mut self) -> Vec<Version> {
        let mut reclaimed = Vec::new();
        while self.versions.len() > 1 {
            match self.versions.front() {
                Some(v) if v.locks == 0 => {
                    if let Some(v) = self.versions.pop_front() {
                        reclaimed.push(v);
                    }
                }
                _ => break,
            }
        }
        reclaimed
    }

    fn record_areas(&self) -> Vec<AreaId> {
        self.versions.iter().map(|v| v.record).collect()
    }
}

/// Latched fatal error.
#[derive(Default)]
struct ErrorLatch {
    poisoned: AtomicBool,
    cause: Mutex<Option<String>>,
}

/// Maps tree nodes onto a backing store and manages versions.
pub struct TreeStore {
    areas: Arc<dyn AreaStore>,
    config: TreeConfig,
    branches: SyncSizedLruCache<AreaId, Arc<TreeBranch>>,
    refcount_lock: Mutex<()>,
    chain: Mutex<VersionChain>,
    latch: ErrorLatch,
    heap_flushes: AtomicU64,
    commits: AtomicU64,
}

impl TreeStore {
    /// Initializes an empty tree in `areas`.
    ///
    /// The initial version holds a root branch over the two sentinel leaves.
    pub fn create(areas: Arc<dyn AreaStore>, config: TreeConfig) -> ArborResult<Self> {
        config.validate()?;
        let mut batch = WriteBatch::new();
        let root = batch.push(BatchNode::Branch {
            children: vec![
                BatchChild::Node(NodeId::sparse(0, 1)),
                BatchChild::Node(NodeId::sparse(0, 1)),
            ],
            counts: vec![1, 1],
            keys: vec![Key::TAIL],
        });

        let header_area = {
            let mut writer = areas.create_area(HEADER_AREA_SIZE)?;
            writer.put_slice(&[0u8; HEADER_AREA_SIZE]);
            writer.finish()?
        };
        let store = Self::with_chain(
            areas,
            config,
            VersionChain {
                versions: VecDeque::new(),
                list_area: header_area,
                header_area,
            },
        );

        let ids = store.persist(&batch)?;
        let root = NodeId::Stored(ids[root]);
        let record = store.write_record(&VersionRecord {
            id: VersionId::INITIAL,
            root,
            deleted: Vec::new(),
        })?;
        let list_area = store.write_version_list(&[record])?;
        store.write_header(header_area, list_area)?;
        store.areas.set_header_area(header_area)?;
        {
            let mut chain = store.chain.lock();
            chain.list_area = list_area;
            chain.versions.push_back(Version {
                id: VersionId::INITIAL,
                root,
                locks: 0,
                deleted: Vec::new(),
                record,
            });
        }
        store.areas.checkpoint()?;
        info!(root = %root, "created tree store");
        Ok(store)
    }

    /// Reopens a tree previously created in `areas`.
    ///
    /// No transaction survives a reopen, so every version except the tip is
    /// reclaimed.
    pub fn open(areas: Arc<dyn AreaStore>, config: TreeConfig) -> ArborResult<Self> {
        config.validate()?;
        let header_area = areas
            .header_area()
            .ok_or_else(|| ArborError::corruption("backing store has no header area"))?;
        let list_area = format::decode_header(&areas.get_area(header_area)?)?;
        let records = format::decode_version_list(&areas.get_area(list_area)?)?;

        let mut versions = VecDeque::with_capacity(records.len());
        for record_area in records {
            let record = format::decode_version_record(&areas.get_area(record_area)?)?;
            versions.push_back(Version {
                id: record.id,
                root: record.root,
                locks: 0,
                deleted: record.deleted,
                record: record_area,
            });
        }
        if versions.is_empty() {
            return Err(ArborError::corruption("version list is empty"));
        }

        let store = Self::with_chain(
            areas,
            config,
            VersionChain {
                versions,
                list_area,
                header_area,
            },
        );
        {
            let mut chain = store.chain.lock();
            store.collect_garbage(&mut chain, Vec::new())?;
            let tip = chain.tip()?;
            info!(tip = %tip.id, root = %tip.root, "opened tree store");
        }
        Ok(store)
    }

    fn with_chain(areas: Arc<dyn AreaStore>, config: TreeConfig, chain: VersionChain) -> Self {
        Self {
            branches: SyncSizedLruCache::new(config.branch_cache_bytes),
            areas,
            config,
            refcount_lock: Mutex::new(()),
            chain: Mutex::new(chain),
            latch: ErrorLatch::default(),
            heap_flushes: AtomicU64::new(0),
            commits: AtomicU64::new(0),
        }
    }

    /// Tree configuration.
    pub fn config(&self) -> &TreeConfig {
        &self.config
    }

    /// The backing store.
    pub fn areas(&self) -> &Arc<dyn AreaStore> {
        &self.areas
    }

    // =========================================================================
    // Error latch
    // =========================================================================

    /// Fails if a fatal error has been latched.
    pub fn check_error_state(&self) -> ArborResult<()> {
        if self.latch.poisoned.load(Ordering::Acquire) {
            let cause = self
                .latch
                .cause
                .lock()
                .clone()
                .unwrap_or_else(|| "unknown".to_string());
            return Err(ArborError::Poisoned { cause });
        }
        Ok(())
    }

    /// Latches `err`. Only the first cause is kept.
    pub fn set_error_state(&self, err: &ArborError) {
        let mut cause = self.latch.cause.lock();
        if cause.is_none() {
            error!(error = %err, code = %err.code(), "tree store poisoned");
            *cause = Some(err.to_string());
        }
        self.latch.poisoned.store(true, Ordering::Release);
    }

    /// Returns true once a fatal error has been latched.
    pub fn is_poisoned(&self) -> bool {
        self.latch.poisoned.load(Ordering::Acquire)
    }

    /// Passes `result` through, latching it first if it is fatal.
    pub fn latch<T>(&self, result: ArborResult<T>) -> ArborResult<T> {
        if let Err(err) = &result {
            if err.is_fatal() {
                self.set_error_state(err);
            }
        }
        result
    }

    // =========================================================================
    // Nodes
    // =========================================================================

    /// Decodes the node stored in `area`.
    pub fn fetch_node(&self, area: AreaId) -> ArborResult<StoredNode> {
        if let Some(branch) = self.branches.get(&area) {
            return Ok(StoredNode::Branch(branch));
        }
        let node = format::decode_node(area, self.areas.get_area(area)?)?;
        if let StoredNode::Branch(branch) = &node {
            self.branches
                .insert(area, Arc::clone(branch), branch.memory_size());
        }
        Ok(node)
    }

    /// Decodes several nodes.
    pub fn fetch_nodes(&self, areas: &[AreaId]) -> ArborResult<Vec<StoredNode>> {
        areas.iter().map(|&area| self.fetch_node(area)).collect()
    }

    /// Decodes a branch, going through the branch cache.
    pub fn fetch_branch(&self, area: AreaId) -> ArborResult<Arc<TreeBranch>> {
        match self.fetch_node(area)? {
            StoredNode::Branch(branch) => Ok(branch),
            StoredNode::Leaf(_) => Err(ArborError::integrity(format!(
                "area {area} holds a leaf, expected a branch"
            ))),
        }
    }

    /// Persists `batch`, returning one area per node in batch order.
    pub fn persist(&self, batch: &WriteBatch) -> ArborResult<Vec<AreaId>> {
        let _guard = self.areas.lock_for_write();
        let mut ids: Vec<AreaId> = Vec::with_capacity(batch.len());
        for node in &batch.nodes {
            let id = match node {
                BatchNode::Leaf(payload) => {
                    let mut writer = self.areas.create_area(format::leaf_area_size(payload.len()))?;
                    format::write_leaf(&mut writer, payload);
                    writer.finish()?
                }
                BatchNode::Branch {
                    children,
                    counts,
                    keys,
                } => {
                    let resolved = children
                        .iter()
                        .map(|child| match *child {
                            BatchChild::Node(id) => Ok(id),
                            BatchChild::Pending(k) => ids
                                .get(k)
                                .map(|&area| NodeId::Stored(area))
                                .ok_or_else(|| {
                                    ArborError::integrity(format!(
                                        "batch entry refers forward to {k}"
                                    ))
                                }),
                        })
                        .collect::<ArborResult<Vec<_>>>()?;
                    let branch = TreeBranch::new(resolved, counts.clone(), keys.clone());
                    let mut writer = self.areas.create_area(format::branch_area_size(branch.len()))?;
                    format::write_branch(&mut writer, &branch)?;
                    let id = writer.finish()?;
                    let size = branch.memory_size();
                    self.branches.insert(id, Arc::new(branch), size);
                    id
                }
            };
            ids.push(id);
        }
        trace!(nodes = ids.len(), "persisted write batch");
        Ok(ids)
    }

    /// Adds a shadow link to a stored leaf.
    pub fn link_leaf(&self, area: AreaId) -> ArborResult<u32> {
        let _guard = self.refcount_lock.lock();
        let current = format::leaf_ref_count(area, &self.areas.get_area(area)?)?;
        let mut handle = self.areas.get_mutable_area(area)?;
        handle.put_u32(LEAF_REF_COUNT_OFFSET, current + 1)?;
        handle.check_out()?;
        trace!(%area, refs = current + 1, "linked leaf");
        Ok(current + 1)
    }

    /// Releases one reference to a node.
    ///
    /// Leaves are deleted once their reference count reaches zero; branches
    /// are deleted outright. Sparse nodes own nothing.
    pub fn dispose_node(&self, node: NodeId) -> ArborResult<()> {
        let area = match node {
            NodeId::Stored(area) => area,
            NodeId::Sparse { .. } => return Ok(()),
            NodeId::Heap(_) => {
                return Err(ArborError::integrity(format!(
                    "cannot dispose heap node {node}"
                )))
            }
        };
        let data = self.areas.get_area(area)?;
        if !format::is_leaf_area(&data) {
            self.branches.remove(&area);
            return self.areas.delete_area(area);
        }

        let _guard = self.refcount_lock.lock();
        let mut handle = self.areas.get_mutable_area(area)?;
        let refs = handle.get_u32(LEAF_REF_COUNT_OFFSET)?;
        if refs <= 1 {
            drop(handle);
            self.areas.delete_area(area)?;
            trace!(%area, "deleted leaf");
        } else {
            handle.put_u32(LEAF_REF_COUNT_OFFSET, refs - 1)?;
            handle.check_out()?;
        }
        Ok(())
    }

    /// Current reference count of a stored leaf.
    pub fn leaf_ref_count(&self, area: AreaId) -> ArborResult<u32> {
        format::leaf_ref_count(area, &self.areas.get_area(area)?)
    }

    // =========================================================================
    // Versions
    // =========================================================================

    /// Pins the tip version for a new transaction.
    pub fn lock_tip(&self) -> ArborResult<(VersionId, NodeId)> {
        let mut chain = self.chain.lock();
        let tip = chain.tip_mut()?;
        tip.locks += 1;
        Ok((tip.id, tip.root))
    }

    /// Releases a pin taken by [`TreeStore::lock_tip`] and reclaims what it
    /// was holding back.
    pub fn release_version(&self, id: VersionId) -> ArborResult<()> {
        let mut chain = self.chain.lock();
        let version = chain
            .versions
            .iter_mut()
            .find(|v| v.id == id)
            .ok_or_else(|| ArborError::integrity(format!("released unknown version {id}")))?;
        version.locks = version.locks.saturating_sub(1);
        self.collect_garbage(&mut chain, Vec::new())
    }

    /// Current tip version.
    pub fn tip_version(&self) -> ArborResult<VersionId> {
        Ok(self.chain.lock().tip()?.id)
    }

    /// Every held version, oldest first.
    pub fn versions(&self) -> Vec<VersionInfo> {
        self.chain
            .lock()
            .versions
            .iter()
            .map(|v| VersionInfo {
                id: v.id,
                root: v.root,
                locks: v.locks,
            })
            .collect()
    }

    /// Publishes `root` as the version after `based_on`.
    ///
    /// Consumes the committing transaction's pin on `based_on`. `deleted`
    /// lists every node of `based_on` the new version no longer references.
    pub fn commit_version(
        &self,
        based_on: VersionId,
        root: NodeId,
        deleted: Vec<NodeId>,
    ) -> ArborResult<VersionId> {
        if root.is_heap() {
            return Err(ArborError::integrity("commit with an unpersisted root"));
        }
        let mut chain = self.chain.lock();
        let tip = chain.tip()?;
        if tip.id != based_on {
            return Err(ArborError::VersionOutOfSequence {
                based_on,
                tip: tip.id,
            });
        }
        let new_id = tip.id.next();
        let (tip_root, old_record) = (tip.root, tip.record);

        let replaced = self.write_record(&VersionRecord {
            id: based_on,
            root: tip_root,
            deleted: deleted.clone(),
        })?;
        let created = self.write_record(&VersionRecord {
            id: new_id,
            root,
            deleted: Vec::new(),
        })?;
        {
            let tip = chain.tip_mut()?;
            tip.record = replaced;
            tip.deleted = deleted;
            tip.locks = tip.locks.saturating_sub(1);
        }
        chain.versions.push_back(Version {
            id: new_id,
            root,
            locks: 0,
            deleted: Vec::new(),
            record: created,
        });
        self.collect_garbage(&mut chain, vec![old_record])?;
        self.commits.fetch_add(1, Ordering::Relaxed);
        debug!(version = %new_id, root = %root, "committed version");
        Ok(new_id)
    }

    /// Reclaims leading versions nobody can observe and republishes the
    /// version list.
    ///
    /// Areas are only deleted once the header points at the new list;
    /// `retired` areas are deleted after the switch as well.
    fn collect_garbage(&self, chain: &mut VersionChain, retired: Vec<AreaId>) -> ArborResult<()> {
        let reclaimed = chain.take_reclaimable();
        if reclaimed.is_empty() && retired.is_empty() {
            return Ok(());
        }
        let list_area = self.write_version_list(&chain.record_areas())?;
        self.write_header(chain.header_area, list_area)?;
        let old_list = std::mem::replace(&mut chain.list_area, list_area);
        if old_list != chain.header_area {
            self.areas.delete_area(old_list)?;
        }
        for area in retired {
            self.areas.delete_area(area)?;
        }

        for version in reclaimed {
            for node in &version.deleted {
                self.dispose_node(*node)?;
            }
            self.areas.delete_area(version.record)?;
            debug!(
                version = %version.id,
                nodes = version.deleted.len(),
                "reclaimed version"
            );
        }
        Ok(())
    }

    fn write_record(&self, record: &VersionRecord) -> ArborResult<AreaId> {
        let data = format::encode_version_record(record);
        self.write_area(&data)
    }

    fn write_version_list(&self, records: &[AreaId]) -> ArborResult<AreaId> {
        let data = format::encode_version_list(records);
        self.write_area(&data)
    }

    fn write_area(&self, data: &[u8]) -> ArborResult<AreaId> {
        let _guard = self.areas.lock_for_write();
        let mut writer = self.areas.create_area(data.len())?;
        writer.put_slice(data);
        writer.finish()
    }

    fn write_header(&self, header: AreaId, list_area: AreaId) -> ArborResult<()> {
        let mut handle = self.areas.get_mutable_area(header)?;
        handle.put_slice(0, &format::encode_header(list_area))?;
        handle.check_out()
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Durability barrier.
    pub fn checkpoint(&self) -> ArborResult<()> {
        self.check_error_state()?;
        let result = self.areas.checkpoint();
        self.latch(result)
    }

    pub(crate) fn record_heap_flush(&self) {
        self.heap_flushes.fetch_add(1, Ordering::Relaxed);
    }

    /// Current statistics.
    pub fn stats(&self) -> ArborResult<TreeStats> {
        let chain = self.chain.lock();
        Ok(TreeStats {
            tip: chain.tip()?.id,
            version_count: chain.versions.len(),
            heap_flushes: self.heap_flushes.load(Ordering::Relaxed),
            commits: self.commits.load(Ordering::Relaxed),
            cached_branches: self.branches.len(),
            branch_cache: self.branches.stats(),
            area_count: self.areas.area_count(),
        })
    }
}

impl std::fmt::Debug for TreeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TreeStore")
            .field("poisoned", &self.is_poisoned())
            .field("versions", &self.chain.lock().versions.len())
            .finish()
    }
}

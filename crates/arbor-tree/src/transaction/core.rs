//! Transaction state and node access.

use std::sync::Arc;

use arbor_common::config::TreeConfig;
use arbor_common::error::{ArborError, ArborResult};
use arbor_common::types::{AreaId, Key, NodeId, VersionId};

use crate::heap::{HeapNode, NodeHeap};
use crate::node::{StoredNode, TreeBranch, TreeLeaf};
use crate::store::TreeStore;

/// A node resolved far enough to know its kind.
pub(crate) enum Loaded {
    Branch(Arc<TreeBranch>),
    Leaf,
}

/// Everything a transaction owns apart from its cursor.
pub(crate) struct TxCore {
    pub(crate) store: Arc<TreeStore>,
    pub(crate) config: TreeConfig,
    pub(crate) heap: NodeHeap,
    pub(crate) root: NodeId,
    pub(crate) version: VersionId,
    pub(crate) read_only: bool,
    /// Bumped by every structural change made outside the cursor.
    pub(crate) update_version: u64,
    /// Frozen nodes of the base version this transaction no longer references.
    pub(crate) deleted: Vec<NodeId>,
    /// Areas persisted by partial heap flushes.
    pub(crate) created: Vec<AreaId>,
    /// Shadow links taken by this transaction.
    pub(crate) linked: Vec<AreaId>,
    bounds: Option<(Key, u64, u64)>,
}

impl TxCore {
    pub(crate) fn new(store: Arc<TreeStore>, version: VersionId, root: NodeId, read_only: bool) -> Self {
        let config = store.config().clone();
        Self {
            store,
            config,
            heap: NodeHeap::new(),
            root,
            version,
            read_only,
            update_version: 0,
            deleted: Vec::new(),
            created: Vec::new(),
            linked: Vec::new(),
            bounds: None,
        }
    }

    pub(crate) fn bump(&mut self) {
        self.update_version += 1;
    }

    // =========================================================================
    // Node access
    // =========================================================================

    pub(crate) fn load(&mut self, id: NodeId) -> ArborResult<Loaded> {
        match id {
            NodeId::Heap(_) => match self.heap.fetch(id)? {
                HeapNode::Branch(branch) => Ok(Loaded::Branch(Arc::clone(branch))),
                HeapNode::Leaf(_) => Ok(Loaded::Leaf),
            },
            NodeId::Stored(area) => match self.store.fetch_node(area)? {
                StoredNode::Branch(branch) => Ok(Loaded::Branch(branch)),
                StoredNode::Leaf(_) => Ok(Loaded::Leaf),
            },
            NodeId::Sparse { .. } => Ok(Loaded::Leaf),
        }
    }

    pub(crate) fn branch(&mut self, id: NodeId) -> ArborResult<Arc<TreeBranch>> {
        match self.load(id)? {
            Loaded::Branch(branch) => Ok(branch),
            Loaded::Leaf => Err(ArborError::integrity(format!(
                "expected branch, {id} is a leaf"
            ))),
        }
    }

    pub(crate) fn is_leaf(&mut self, id: NodeId) -> ArborResult<bool> {
        Ok(matches!(self.load(id)?, Loaded::Leaf))
    }

    /// Length of a leaf, read from the leaf itself.
    pub(crate) fn leaf_len(&mut self, id: NodeId) -> ArborResult<usize> {
        match id {
            NodeId::Heap(_) => Ok(self.heap.leaf(id)?.len()),
            NodeId::Sparse { len, .. } => Ok(len as usize),
            NodeId::Stored(_) => Ok(self.frozen_leaf(id)?.len()),
        }
    }

    /// Decodes a stored or sparse leaf.
    pub(crate) fn frozen_leaf(&self, id: NodeId) -> ArborResult<TreeLeaf> {
        match id {
            NodeId::Sparse { fill, len } => Ok(TreeLeaf::Sparse { fill, len }),
            NodeId::Stored(area) => match self.store.fetch_node(area)? {
                StoredNode::Leaf(leaf) => Ok(leaf),
                StoredNode::Branch(_) => Err(ArborError::integrity(format!(
                    "expected leaf, area {area} is a branch"
                ))),
            },
            NodeId::Heap(_) => Err(ArborError::integrity(format!("{id} is not frozen"))),
        }
    }

    pub(crate) fn read_leaf(&mut self, id: NodeId, offset: usize, out: &mut [u8]) -> ArborResult<()> {
        match id {
            NodeId::Heap(_) => self.heap.leaf(id)?.read(offset, out),
            _ => self.frozen_leaf(id)?.read(offset, out),
        }
        Ok(())
    }

    /// Records that a frozen node is no longer referenced by this transaction.
    pub(crate) fn retire(&mut self, id: NodeId) {
        if let NodeId::Stored(_) = id {
            self.deleted.push(id);
        }
    }

    /// Drops a single node that has been unlinked from the tree.
    pub(crate) fn discard(&mut self, id: NodeId) -> ArborResult<()> {
        if id.is_heap() {
            self.heap.delete(id)?;
        } else {
            self.retire(id);
        }
        Ok(())
    }

    /// Drops a node and everything below it.
    pub(crate) fn discard_subtree(&mut self, id: NodeId) -> ArborResult<()> {
        match id {
            NodeId::Heap(_) => {
                if let HeapNode::Branch(branch) = self.heap.delete(id)? {
                    for &child in branch.children() {
                        self.discard_subtree(child)?;
                    }
                }
            }
            NodeId::Stored(area) => {
                self.retire(id);
                if let StoredNode::Branch(branch) = self.store.fetch_node(area)? {
                    let stored: Vec<AreaId> =
                        branch.children().iter().filter_map(|c| c.area()).collect();
                    let nodes = self.store.fetch_nodes(&stored)?;
                    for (area, node) in stored.into_iter().zip(nodes) {
                        match node {
                            StoredNode::Branch(_) => self.discard_subtree(NodeId::Stored(area))?,
                            StoredNode::Leaf(_) => self.retire(NodeId::Stored(area)),
                        }
                    }
                }
            }
            NodeId::Sparse { .. } => {}
        }
        Ok(())
    }

    /// Returns a heap node with the content of `id`. `key` names the owner
    /// of a leaf and is ignored for branches.
    pub(crate) fn unfreeze_node(&mut self, id: NodeId, key: Key) -> ArborResult<NodeId> {
        match id {
            NodeId::Heap(_) => Ok(id),
            NodeId::Sparse { fill, len } => {
                Ok(self.heap.copy_leaf(key, &TreeLeaf::Sparse { fill, len }))
            }
            NodeId::Stored(area) => {
                let copy = match self.store.fetch_node(area)? {
                    StoredNode::Branch(branch) => self.heap.copy_branch(&branch),
                    StoredNode::Leaf(leaf) => self.heap.copy_leaf(key, &leaf),
                };
                self.retire(id);
                Ok(copy)
            }
        }
    }

    /// Unfreezes child `index` of heap branch `parent` in place.
    pub(crate) fn unfreeze_child(&mut self, parent: NodeId, index: usize, key: Key) -> ArborResult<NodeId> {
        let child = self.heap.branch(parent)?.child(index);
        if child.is_heap() {
            return Ok(child);
        }
        let copy = self.unfreeze_node(child, key)?;
        self.heap
            .update_branch(parent, |b| b.children[index] = copy)?;
        Ok(copy)
    }

    /// Makes the root a heap node.
    pub(crate) fn unfreeze_root(&mut self) -> ArborResult<NodeId> {
        let root = self.unfreeze_node(self.root, Key::HEAD)?;
        self.root = root;
        Ok(root)
    }

    // =========================================================================
    // Bounds
    // =========================================================================

    /// Total bytes in the tree, sentinels included.
    pub(crate) fn total_size(&mut self) -> ArborResult<u64> {
        Ok(self.branch(self.root)?.total())
    }

    /// Absolute `[start, end)` of `key`'s bytes.
    pub(crate) fn file_bounds(&mut self, key: Key) -> ArborResult<(u64, u64)> {
        if let Some((cached, start, end)) = self.bounds {
            if cached == key {
                return Ok((start, end));
            }
        }
        let start = self.key_offset(&key, false)?;
        let end = self.key_offset(&key, true)?;
        if start > end {
            return Err(ArborError::integrity(format!(
                "bounds of {key:?}: start {start} > end {end}"
            )));
        }
        self.bounds = Some((key, start, end));
        Ok((start, end))
    }

    /// Bytes in leaves whose key sorts before `key` (or not after it).
    fn key_offset(&mut self, key: &Key, inclusive: bool) -> ArborResult<u64> {
        let mut id = self.root;
        let mut offset = 0;
        let mut node_key = Key::HEAD;
        let mut size = 0;
        loop {
            match self.load(id)? {
                Loaded::Leaf => {
                    if node_key < *key || (inclusive && node_key == *key) {
                        offset += size;
                    }
                    return Ok(offset);
                }
                Loaded::Branch(branch) => {
                    let i = branch.key_rank(key, inclusive);
                    offset += branch.counts[..i].iter().sum::<u64>();
                    node_key = branch.child_key(i, node_key);
                    size = branch.count(i);
                    id = branch.child(i);
                }
            }
        }
    }

    /// Forgets cached bounds that a size change of `key` may have moved.
    pub(crate) fn size_changed(&mut self, key: Key) {
        if let Some((cached, _, _)) = self.bounds {
            if cached >= key {
                self.bounds = None;
            }
        }
    }

    // =========================================================================
    // Diagnostics
    // =========================================================================

    /// Number of levels, leaves included.
    pub(crate) fn tree_height(&mut self) -> ArborResult<usize> {
        let mut height = 1;
        let mut id = self.root;
        while let Loaded::Branch(branch) = self.load(id)? {
            id = branch.child(0);
            height += 1;
        }
        Ok(height)
    }

    /// Walks the whole tree checking every structural invariant.
    pub(crate) fn check_integrity(&mut self) -> ArborResult<()> {
        let mut walk = IntegrityWalk {
            leaf_depth: None,
            last_key: Key::HEAD,
            leaves: 0,
        };
        let root = self.root;
        let total = self.total_size()?;
        self.check_node(root, Key::HEAD, total, 0, &mut walk)?;
        if walk.last_key != Key::TAIL {
            return Err(ArborError::integrity("last leaf is not the TAIL sentinel"));
        }
        Ok(())
    }

    fn check_node(
        &mut self,
        id: NodeId,
        key: Key,
        size: u64,
        depth: usize,
        walk: &mut IntegrityWalk,
    ) -> ArborResult<()> {
        let fail = |what: String| Err(ArborError::integrity(format!("{id} at depth {depth}: {what}")));
        match self.load(id)? {
            Loaded::Leaf => {
                match walk.leaf_depth {
                    None => walk.leaf_depth = Some(depth),
                    Some(d) if d != depth => return fail(format!("leaf depth differs from {d}")),
                    Some(_) => {}
                }
                if walk.leaves == 0 && key != Key::HEAD {
                    return fail("first leaf is not the HEAD sentinel".into());
                }
                if key < walk.last_key {
                    return fail(format!("key {key:?} after {:?}", walk.last_key));
                }
                let len = self.leaf_len(id)? as u64;
                if len != size || len == 0 {
                    return fail(format!("leaf holds {len} bytes, parent counts {size}"));
                }
                if len > self.config.max_leaf_byte_size as u64 {
                    return fail(format!("leaf of {len} bytes exceeds the maximum"));
                }
                if let NodeId::Heap(_) = id {
                    let owner = self.heap.leaf(id)?.key();
                    if owner != key {
                        return fail(format!("heap leaf of {owner:?} placed under {key:?}"));
                    }
                }
                walk.last_key = key;
                walk.leaves += 1;
                Ok(())
            }
            Loaded::Branch(branch) => {
                let n = branch.len();
                if n == 0 || branch.keys().len() + 1 != n || branch.counts.len() != n {
                    return fail("malformed child arrays".into());
                }
                if n > self.config.max_branch_size {
                    return fail(format!("{n} children exceed the maximum"));
                }
                let min = if depth == 0 { 2 } else { self.config.min_branch_children() };
                if n < min {
                    return fail(format!("{n} children below the minimum {min}"));
                }
                if branch.total() != size {
                    return fail(format!("children hold {}, parent counts {size}", branch.total()));
                }
                if branch.keys().windows(2).any(|w| w[0] > w[1]) || branch.keys()[0] < key {
                    return fail("separators out of order".into());
                }
                if id.is_frozen() && branch.children().iter().any(|c| c.is_heap()) {
                    return fail("frozen branch references a heap node".into());
                }
                for i in 0..n {
                    let child_key = branch.child_key(i, key);
                    let first_leaves = walk.leaves;
                    self.check_node(branch.child(i), child_key, branch.count(i), depth + 1, walk)?;
                    if walk.leaves == first_leaves {
                        return fail(format!("child {i} holds no leaves"));
                    }
                }
                Ok(())
            }
        }
    }
}

struct IntegrityWalk {
    leaf_depth: Option<usize>,
    last_key: Key,
    leaves: usize,
}

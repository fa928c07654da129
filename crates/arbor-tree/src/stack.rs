//! The descent cursor.
//!
//! A [`TreeStack`] keeps the root-to-leaf path of the last position it was
//! set up for. Sequential access reuses the current leaf, and a jump only
//! re-descends from the lowest frame that still covers the new position.
//!
//! ```text
//!   frame 0   root      offset 0      size 9000
//!   frame 1   branch    offset 4096   size 2048   child 2
//!   frame 2   leaf      offset 5120   size 512    child 3   key K
//! ```
//!
//! Every edit made through the stack keeps the frames and the ancestors'
//! element counts in step. Edits that reshape the tree (split, merge,
//! delete) clear the stack; the next setup descends again.

use arbor_common::error::{ArborError, ArborResult};
use arbor_common::types::{Key, NodeId};

use crate::node::TreeBranch;
use crate::transaction::core::{Loaded, TxCore};
use crate::transaction::rebalance::Balance;
use crate::transaction::Piece;

/// One level of the descent path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Frame {
    pub(crate) node: NodeId,
    /// Absolute position of the node's first byte.
    pub(crate) offset: u64,
    /// Bytes below the node.
    pub(crate) size: u64,
    /// Key of the node's first leaf.
    pub(crate) key: Key,
    /// Index of the node in its parent.
    pub(crate) child_index: usize,
}

impl Frame {
    fn covers(&self, pos: u64) -> bool {
        pos >= self.offset && pos < self.offset + self.size
    }
}

/// Root-to-leaf cursor of one transaction.
#[derive(Debug, Default)]
pub(crate) struct TreeStack {
    frames: Vec<Frame>,
    at_leaf: bool,
    update_version: u64,
}

impl TreeStack {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn invalidate(&mut self) {
        self.frames.clear();
        self.at_leaf = false;
    }

    /// The current leaf frame.
    pub(crate) fn leaf(&self) -> ArborResult<Frame> {
        match self.frames.last() {
            Some(frame) if self.at_leaf => Ok(*frame),
            _ => Err(ArborError::integrity("stack is not positioned on a leaf")),
        }
    }

    fn leaf_level(&self) -> ArborResult<usize> {
        self.leaf()?;
        Ok(self.frames.len() - 1)
    }

    /// Positions the stack on the leaf holding absolute position `pos`.
    pub(crate) fn setup_for_position(&mut self, core: &mut TxCore, pos: u64) -> ArborResult<Frame> {
        if self.update_version != core.update_version {
            self.invalidate();
            self.update_version = core.update_version;
        }
        if self.at_leaf {
            if let Some(top) = self.frames.last() {
                if top.covers(pos) {
                    return Ok(*top);
                }
            }
            self.frames.pop();
            self.at_leaf = false;
        }
        while let Some(top) = self.frames.last() {
            if top.covers(pos) {
                break;
            }
            self.frames.pop();
        }
        if self.frames.is_empty() {
            let root = core.branch(core.root)?;
            let size = root.total();
            if pos >= size {
                return Err(ArborError::integrity(format!(
                    "position {pos} beyond tree of {size} bytes"
                )));
            }
            self.frames.push(Frame {
                node: core.root,
                offset: 0,
                size,
                key: Key::HEAD,
                child_index: 0,
            });
        }

        loop {
            let top = *self.frames.last().ok_or_else(|| ArborError::integrity("empty stack"))?;
            match core.load(top.node)? {
                Loaded::Leaf => break,
                Loaded::Branch(branch) => {
                    let (i, rel) = branch.locate(pos - top.offset).ok_or_else(|| {
                        ArborError::integrity(format!(
                            "position {pos} not found below {} (size {})",
                            top.node, top.size
                        ))
                    })?;
                    self.frames.push(Frame {
                        node: branch.child(i),
                        offset: top.offset + rel,
                        size: branch.count(i),
                        key: branch.child_key(i, top.key),
                        child_index: i,
                    });
                }
            }
        }
        self.at_leaf = true;
        self.leaf()
    }

    // =========================================================================
    // Copy-on-write
    // =========================================================================

    fn unfreeze_levels(&mut self, core: &mut TxCore, end: usize) -> ArborResult<()> {
        let start = match self.frames[..end].iter().position(|f| f.node.is_frozen()) {
            Some(start) => start,
            None => return Ok(()),
        };
        for i in start..end {
            let frame = self.frames[i];
            let node = core.unfreeze_node(frame.node, frame.key)?;
            self.frames[i].node = node;
            if i == 0 {
                core.root = node;
            } else {
                let parent = self.frames[i - 1].node;
                core.heap
                    .update_branch(parent, |b| b.children[frame.child_index] = node)?;
            }
        }
        Ok(())
    }

    /// Copies every frozen node on the path, leaf included, into the heap.
    pub(crate) fn unfreeze(&mut self, core: &mut TxCore) -> ArborResult<()> {
        let end = self.leaf_level()? + 1;
        self.unfreeze_levels(core, end)
    }

    /// Copies every frozen branch on the path into the heap.
    pub(crate) fn unfreeze_parents(&mut self, core: &mut TxCore) -> ArborResult<()> {
        let end = self.leaf_level()?;
        self.unfreeze_levels(core, end)
    }

    /// Adds `delta` to the size of the node at `level` and all its ancestors.
    fn apply_size_delta(&mut self, core: &mut TxCore, level: usize, delta: i64) -> ArborResult<()> {
        for i in (0..=level).rev() {
            let frame = self.frames[i];
            self.frames[i].size = (frame.size as i64 + delta) as u64;
            if i > 0 {
                core.heap.update_branch(self.frames[i - 1].node, |b| {
                    b.adjust_count(frame.child_index, delta)
                })?;
            }
        }
        Ok(())
    }

    // =========================================================================
    // Leaf-local edits
    // =========================================================================

    /// Overwrites bytes of the current leaf.
    pub(crate) fn write_leaf(&mut self, core: &mut TxCore, local: usize, data: &[u8]) -> ArborResult<()> {
        self.unfreeze(core)?;
        let leaf = self.leaf()?;
        core.heap.update_leaf(leaf.node, |l| l.write(local, data))
    }

    /// Inserts byte and fill pieces into the current leaf at `local`.
    pub(crate) fn shift_leaf(&mut self, core: &mut TxCore, local: usize, pieces: &[Piece]) -> ArborResult<()> {
        let total: u64 = pieces.iter().map(Piece::len).sum();
        let leaf = self.leaf()?;
        if let NodeId::Sparse { fill: 0, len } = leaf.node {
            if pieces.iter().all(|p| matches!(p, Piece::Fill(_))) {
                return self.replace_leaf(core, NodeId::sparse(0, len + total as u32), total as i64);
            }
        }
        self.unfreeze(core)?;
        let leaf = self.leaf()?;
        core.heap.update_leaf(leaf.node, |l| {
            let mut at = local;
            for piece in pieces {
                match piece {
                    Piece::Bytes(bytes) => {
                        l.insert(at, bytes);
                        at += bytes.len();
                    }
                    Piece::Fill(count) => {
                        l.insert_fill(at, 0, *count as usize);
                        at += *count as usize;
                    }
                    Piece::Leaf { .. } => {}
                }
            }
        })?;
        let level = self.leaf_level()?;
        self.apply_size_delta(core, level, total as i64)
    }

    /// Removes `count` bytes at `local` from the current leaf, deleting the
    /// leaf when it empties.
    pub(crate) fn trim_leaf(&mut self, core: &mut TxCore, local: usize, count: usize) -> ArborResult<()> {
        let leaf = self.leaf()?;
        if count as u64 == leaf.size {
            return self.delete_leaf(core);
        }
        if let NodeId::Sparse { fill, len } = leaf.node {
            return self.replace_leaf(core, NodeId::sparse(fill, len - count as u32), -(count as i64));
        }
        self.unfreeze(core)?;
        let leaf = self.leaf()?;
        core.heap.update_leaf(leaf.node, |l| l.remove(local, count))?;
        let level = self.leaf_level()?;
        self.apply_size_delta(core, level, -(count as i64))
    }

    /// Cuts the current leaf at `local`, returning the bytes after it.
    pub(crate) fn split_leaf(&mut self, core: &mut TxCore, local: usize) -> ArborResult<Vec<u8>> {
        let leaf = self.leaf()?;
        if local as u64 >= leaf.size {
            return Ok(Vec::new());
        }
        self.unfreeze(core)?;
        let leaf = self.leaf()?;
        let tail = core.heap.update_leaf(leaf.node, |l| l.split_off(local))?;
        let level = self.leaf_level()?;
        self.apply_size_delta(core, level, -(tail.len() as i64))?;
        Ok(tail)
    }

    /// Replaces the current leaf with `node`, whose size differs by `delta`.
    pub(crate) fn replace_leaf(&mut self, core: &mut TxCore, node: NodeId, delta: i64) -> ArborResult<()> {
        self.unfreeze_parents(core)?;
        let level = self.leaf_level()?;
        if level == 0 {
            return Err(ArborError::integrity("root is a leaf"));
        }
        let leaf = self.frames[level];
        core.heap.update_branch(self.frames[level - 1].node, |b| {
            b.children[leaf.child_index] = node
        })?;
        core.discard(leaf.node)?;
        self.frames[level].node = node;
        self.apply_size_delta(core, level, delta)
    }

    // =========================================================================
    // Structural edits
    // =========================================================================

    /// Links a new leaf right after the current one and splits full
    /// branches on the way up.
    pub(crate) fn insert_leaf_after(&mut self, core: &mut TxCore, key: Key, node: NodeId, size: u64) -> ArborResult<()> {
        self.unfreeze_parents(core)?;
        let level = self.leaf_level()?;
        if level == 0 {
            return Err(ArborError::integrity("root is a leaf"));
        }
        let leaf = self.frames[level];
        let parent_level = level - 1;
        core.heap.update_branch(self.frames[parent_level].node, |b| {
            b.insert_child(leaf.child_index + 1, key, node, size)
        })?;
        self.frames.pop();
        self.at_leaf = false;
        self.apply_size_delta(core, parent_level, size as i64)?;
        self.split_upward(core, parent_level)?;
        self.invalidate();
        Ok(())
    }

    fn split_upward(&mut self, core: &mut TxCore, mut level: usize) -> ArborResult<()> {
        let max = core.config.max_branch_size;
        loop {
            let frame = self.frames[level];
            let len = core.heap.branch(frame.node)?.len();
            if len <= max {
                return Ok(());
            }
            let (separator, right) = core.heap.update_branch(frame.node, |b| b.split_off(len / 2))?;
            let right_size = right.total();
            let right_id = core.heap.create_branch(right);

            if level == 0 {
                let left_size = frame.size - right_size;
                core.root = core.heap.create_branch(TreeBranch::new(
                    vec![frame.node, right_id],
                    vec![left_size, right_size],
                    vec![separator],
                ));
                return Ok(());
            }
            let parent = self.frames[level - 1].node;
            core.heap.update_branch(parent, |p| {
                p.adjust_count(frame.child_index, -(right_size as i64));
                p.insert_child(frame.child_index + 1, separator, right_id, right_size);
            })?;
            level -= 1;
        }
    }

    /// Unlinks the current leaf and rebalances the path.
    pub(crate) fn delete_leaf(&mut self, core: &mut TxCore) -> ArborResult<()> {
        self.unfreeze_parents(core)?;
        let level = self.leaf_level()?;
        if level == 0 {
            return Err(ArborError::integrity("root is a leaf"));
        }
        let leaf = self.frames[level];
        let parent_level = level - 1;
        let parent = self.frames[parent_level].node;
        let (_, _, first_key) = core
            .heap
            .update_branch(parent, |b| b.remove_child(leaf.child_index))?;
        if core.heap.branch(parent)?.is_empty() {
            return Err(ArborError::integrity(format!("deleting {} emptied {parent}", leaf.node)));
        }
        core.discard(leaf.node)?;
        self.frames.pop();
        self.at_leaf = false;
        self.apply_size_delta(core, parent_level, -(leaf.size as i64))?;
        if let Some(key) = first_key {
            self.propagate_first_key(core, parent_level, key)?;
        }
        self.fix_underflow(core, parent_level)?;
        self.invalidate();
        Ok(())
    }

    /// Rewrites the separator naming the first leaf of the node at `level`.
    fn propagate_first_key(&mut self, core: &mut TxCore, mut level: usize, key: Key) -> ArborResult<()> {
        while level > 0 {
            let frame = self.frames[level];
            self.frames[level].key = key;
            if frame.child_index > 0 {
                return core.heap.update_branch(self.frames[level - 1].node, |b| {
                    b.keys[frame.child_index - 1] = key
                });
            }
            level -= 1;
        }
        Ok(())
    }

    /// Merges or redistributes under-full branches from `level` up to the
    /// root, then collapses single-child roots.
    ///
    /// Every frame from the root down to `level` must be a heap node.
    pub(crate) fn fix_underflow(&mut self, core: &mut TxCore, mut level: usize) -> ArborResult<bool> {
        let min = core.config.min_branch_children();
        let mut changed = false;
        while level > 0 {
            let frame = self.frames[level];
            if core.branch(frame.node)?.len() < min {
                let parent = self.frames[level - 1].node;
                if core.heap.branch(parent)?.len() >= 2 {
                    let left = frame.child_index.saturating_sub(1);
                    if core.balance_branches(parent, left, None)? != Balance::Unchanged {
                        changed = true;
                    }
                }
            }
            level -= 1;
        }
        if core.collapse_root()? {
            changed = true;
        }
        if changed {
            self.invalidate();
        }
        Ok(changed)
    }

    /// Rebalances the path to the current leaf after a bulk removal.
    pub(crate) fn fix_path(&mut self, core: &mut TxCore) -> ArborResult<bool> {
        self.unfreeze_parents(core)?;
        let level = self.leaf_level()?;
        if level == 0 {
            return Ok(false);
        }
        self.fix_underflow(core, level - 1)
    }
}

//! Pre-commit compaction of the heap.
//!
//! Walks every heap branch bottom-up and tightens sibling pairs that are
//! both on the heap: leaves of one file are merged or topped up, and
//! branches are merged or redistributed. A frozen branch is copied only
//! when its heap sibling fell below the minimum fan-out.

use tracing::debug;

use arbor_common::error::{ArborError, ArborResult};
use arbor_common::types::NodeId;

use super::core::TxCore;
use super::rebalance::Balance;
use crate::heap::HeapNode;

impl TxCore {
    pub(crate) fn compact(&mut self) -> ArborResult<()> {
        if !self.root.is_heap() {
            return Ok(());
        }
        let before = self.heap.len();
        let root = self.root;
        self.compact_node(root)?;
        self.collapse_root()?;
        self.bump();
        debug!(before, after = self.heap.len(), "compacted heap");
        Ok(())
    }

    fn compact_node(&mut self, id: NodeId) -> ArborResult<()> {
        let branch = self.heap.branch(id)?;
        for &child in branch.children() {
            if child.is_heap() && !self.heap.peek(child)?.is_leaf() {
                self.compact_node(child)?;
            }
        }

        let target = self.config.branch_compact_target();
        let min = self.config.min_branch_children();
        let mut i = 0;
        loop {
            let branch = self.heap.branch(id)?;
            if i + 1 >= branch.len() {
                return Ok(());
            }
            let (left, right) = (branch.child(i), branch.child(i + 1));
            let merged = match (left.is_heap(), right.is_heap()) {
                (true, true) => match (self.heap.peek(left)?.is_leaf(), self.heap.peek(right)?.is_leaf()) {
                    (true, true) => self.compact_leaves(id, i)?,
                    (false, false) => self.balance_branches(id, i, Some(target))? == Balance::Merged,
                    _ => {
                        return Err(ArborError::integrity(format!(
                            "children {left} and {right} of {id} are on different levels"
                        )))
                    }
                },
                (false, false) => false,
                // A heap branch next to a frozen one is only touched when
                // one of them fell below the minimum.
                _ => {
                    if self.is_leaf(left)? {
                        false
                    } else if self.branch(left)?.len() < min || self.branch(right)?.len() < min {
                        self.balance_branches(id, i, None)? == Balance::Merged
                    } else {
                        false
                    }
                }
            };
            if !merged {
                i += 1;
            }
        }
    }

    /// Tightens heap leaves `index` and `index + 1` of `parent` when they
    /// belong to one file and either is under the fill target. Returns
    /// whether they were merged.
    fn compact_leaves(&mut self, parent: NodeId, index: usize) -> ArborResult<bool> {
        let max = self.config.max_leaf_byte_size;
        let target = self.config.leaf_compact_target();
        let branch = self.heap.branch(parent)?;
        let (left, right) = (branch.child(index), branch.child(index + 1));
        let (left_key, ln) = {
            let leaf = self.heap.leaf(left)?;
            (leaf.key(), leaf.len())
        };
        let (right_key, rn) = {
            let leaf = self.heap.leaf(right)?;
            (leaf.key(), leaf.len())
        };
        if left_key != right_key || (ln >= target && rn >= target) {
            return Ok(false);
        }

        if ln + rn <= max {
            let removed = match self.heap.delete(right)? {
                HeapNode::Leaf(leaf) => leaf,
                HeapNode::Branch(_) => return Err(ArborError::integrity(format!("{right} is not a leaf"))),
            };
            self.heap.update_leaf(left, |l| l.append(removed.data()))?;
            self.heap.update_branch(parent, |p| {
                p.remove_child(index + 1);
                p.counts[index] = (ln + rn) as u64;
            })?;
            return Ok(true);
        }

        // The donor never drops below the target itself.
        if ln < target && rn > target {
            let count = (target - ln).min(rn - target);
            let moved = self.heap.update_leaf(right, |r| r.take_front(count))?;
            self.heap.update_leaf(left, |l| l.append(&moved))?;
        } else if rn < target && ln > target {
            let count = (target - rn).min(ln - target);
            let moved = self.heap.update_leaf(left, |l| l.split_off(ln - count))?;
            self.heap.update_leaf(right, |r| r.insert(0, &moved))?;
        } else {
            return Ok(false);
        }
        let ln = self.heap.leaf(left)?.len() as u64;
        let rn = self.heap.leaf(right)?.len() as u64;
        self.heap.update_branch(parent, |p| {
            p.counts[index] = ln;
            p.counts[index + 1] = rn;
        })?;
        Ok(false)
    }
}

//! Merge, redistribution and bulk pruning of branches.

use arbor_common::error::{ArborError, ArborResult};
use arbor_common::types::{Key, NodeId};

use super::core::TxCore;
use crate::node::{shift_left, shift_right, TreeBranch};
use crate::stack::TreeStack;

/// What [`TxCore::balance_branches`] did to a sibling pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Balance {
    /// The right sibling was folded into the left one.
    Merged,
    /// Children moved between the siblings.
    Shifted,
    /// Both siblings already met the target.
    Unchanged,
}

impl TxCore {
    /// Rebalances children `left` and `left + 1` of heap branch `parent`.
    ///
    /// Merges them if they fit in one branch. Otherwise moves children
    /// until the smaller one holds `target` children, or half of both when
    /// no target is given, without taking the donor below the minimum.
    pub(crate) fn balance_branches(
        &mut self,
        parent: NodeId,
        left: usize,
        target: Option<usize>,
    ) -> ArborResult<Balance> {
        let max = self.config.max_branch_size;
        let separator = self.heap.branch(parent)?.keys()[left];
        let left_id = self.unfreeze_child(parent, left, Key::HEAD)?;
        let right_id = self.unfreeze_child(parent, left + 1, separator)?;

        let mut l = TreeBranch::clone(&*self.heap.branch(left_id)?);
        let mut r = TreeBranch::clone(&*self.heap.branch(right_id)?);
        let (ln, rn) = (l.len(), r.len());

        if ln + rn <= max {
            l.absorb(separator, &r);
            let total = l.total();
            self.heap.update_branch(left_id, |b| *b = l)?;
            self.heap.delete(right_id)?;
            self.heap.update_branch(parent, |p| {
                p.remove_child(left + 1);
                p.counts[left] = total;
            })?;
            return Ok(Balance::Merged);
        }

        let min = self.config.min_branch_children();
        let target = target.unwrap_or((ln + rn) / 2);
        let separator = if ln < target && rn > min {
            shift_left(&mut l, &mut r, separator, (target - ln).min(rn - min))
        } else if rn < target && ln > min {
            shift_right(&mut l, &mut r, separator, (target - rn).min(ln - min))
        } else {
            return Ok(Balance::Unchanged);
        };
        let (lt, rt) = (l.total(), r.total());
        self.heap.update_branch(left_id, |b| *b = l)?;
        self.heap.update_branch(right_id, |b| *b = r)?;
        self.heap.update_branch(parent, |p| {
            p.keys[left] = separator;
            p.counts[left] = lt;
            p.counts[left + 1] = rt;
        })?;
        Ok(Balance::Shifted)
    }

    /// Replaces a root branch that has a single branch child by that child.
    pub(crate) fn collapse_root(&mut self) -> ArborResult<bool> {
        let mut changed = false;
        loop {
            let root = self.branch(self.root)?;
            if root.len() != 1 {
                break;
            }
            let child = root.child(0);
            if self.is_leaf(child)? {
                break;
            }
            let old = self.root;
            self.discard(old)?;
            self.root = child;
            changed = true;
        }
        if changed {
            self.bump();
        }
        Ok(changed)
    }

    /// Removes absolute range `[lo, hi)` by pruning whole subtrees, then
    /// rebalances along the cut.
    pub(crate) fn remove_absolute_bounds(&mut self, stack: &mut TreeStack, lo: u64, hi: u64) -> ArborResult<()> {
        if lo == 0 || lo >= hi {
            return Err(ArborError::integrity(format!("bad removal range [{lo}, {hi})")));
        }
        let root = self.unfreeze_root()?;
        self.prune_branch(root, 0, Key::HEAD, lo, hi)?;
        self.bump();

        loop {
            let mut changed = false;
            let total = self.total_size()?;
            for pos in [lo - 1, lo] {
                if pos < total {
                    stack.setup_for_position(self, pos)?;
                    changed |= stack.fix_path(self)?;
                }
            }
            if !changed {
                break;
            }
        }
        stack.invalidate();
        Ok(())
    }

    /// Removes `[lo, hi)` below heap branch `id`, which starts at `offset`
    /// and whose first leaf has key `first`.
    ///
    /// Returns the new first-leaf key when it changed.
    fn prune_branch(&mut self, id: NodeId, offset: u64, first: Key, lo: u64, hi: u64) -> ArborResult<Option<Key>> {
        let branch = self.heap.branch(id)?;
        let mut entries = Vec::with_capacity(branch.len());
        let mut start = offset;
        for i in 0..branch.len() {
            let (child, count) = (branch.child(i), branch.count(i));
            let key = branch.child_key(i, first);
            let end = start + count;
            if end <= lo || start >= hi {
                entries.push((child, count, key));
            } else if lo <= start && end <= hi {
                self.discard_subtree(child)?;
            } else {
                let cut_lo = lo.max(start);
                let removed = hi.min(end) - cut_lo;
                if self.is_leaf(child)? {
                    let trimmed = self.cut_leaf(child, key, (cut_lo - start) as usize, removed as usize)?;
                    entries.push((trimmed, count - removed, key));
                } else {
                    let copy = self.unfreeze_node(child, key)?;
                    let new_first = self.prune_branch(copy, start, key, lo, hi)?;
                    entries.push((copy, count - removed, new_first.unwrap_or(key)));
                }
            }
            start = end;
        }
        let new_first = match entries.first() {
            Some(&(_, _, key)) => key,
            None => return Err(ArborError::integrity(format!("pruning emptied {id}"))),
        };
        let rebuilt = TreeBranch::from_entries(entries);
        self.heap.update_branch(id, |b| *b = rebuilt)?;
        Ok((new_first != first).then_some(new_first))
    }

    /// Removes `count` bytes at `local` from a leaf that keeps some bytes.
    fn cut_leaf(&mut self, id: NodeId, key: Key, local: usize, count: usize) -> ArborResult<NodeId> {
        if let NodeId::Sparse { fill, len } = id {
            return Ok(NodeId::sparse(fill, len - count as u32));
        }
        let copy = self.unfreeze_node(id, key)?;
        self.heap.update_leaf(copy, |l| l.remove(local, count))?;
        Ok(copy)
    }
}

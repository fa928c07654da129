//! Writing heap nodes to the store.
//!
//! A flush plans a post-order walk of the heap part of the tree. A node is
//! written only when it is selected and, for branches, when every heap
//! child below it is written too, so a persisted branch never refers to
//! the heap. Children are planned before their parents; a branch refers to
//! a child written in the same batch by its batch index.

use std::collections::HashSet;
use std::sync::Arc;

use bytes::Bytes;
use tracing::debug;

use arbor_common::error::{ArborError, ArborResult};
use arbor_common::types::NodeId;

use super::core::TxCore;
use crate::heap::HeapNode;
use crate::store::{BatchChild, BatchNode, WriteBatch};

/// Where a node stands in a flush plan.
enum Planned {
    /// Stays on the heap.
    Kept,
    /// Already frozen.
    Frozen,
    /// Written as batch entry `k`.
    Pending(usize),
}

#[derive(Default)]
struct FlushPlan {
    batch: WriteBatch,
    /// Heap ids in batch order.
    heap_ids: Vec<NodeId>,
    /// `(parent, child index, batch index)` for every planned child.
    fixups: Vec<(NodeId, usize, usize)>,
}

impl TxCore {
    /// Persists every heap node accepted by `select` whose heap subtree is
    /// fully accepted. Returns the number of nodes written.
    pub(crate) fn write_nodes(&mut self, select: &dyn Fn(NodeId) -> bool) -> ArborResult<usize> {
        let mut plan = FlushPlan::default();
        let root = self.root;
        let planned = self.plan_node(root, select, &mut plan)?;
        if plan.batch.is_empty() {
            return Ok(0);
        }

        let ids = self.store.persist(&plan.batch)?;
        self.created.extend_from_slice(&ids);

        let written: HashSet<NodeId> = plan.heap_ids.iter().copied().collect();
        for (parent, index, k) in plan.fixups {
            if written.contains(&parent) {
                continue;
            }
            let area = *ids
                .get(k)
                .ok_or_else(|| ArborError::integrity(format!("flush lost batch entry {k}")))?;
            self.heap
                .update_branch(parent, |b| b.children[index] = NodeId::Stored(area))?;
        }
        if let Planned::Pending(k) = planned {
            if let Some(&area) = ids.get(k) {
                self.root = NodeId::Stored(area);
            }
        }
        for id in plan.heap_ids {
            self.heap.delete(id)?;
        }
        self.bump();
        Ok(ids.len())
    }

    fn plan_node(&mut self, id: NodeId, select: &dyn Fn(NodeId) -> bool, plan: &mut FlushPlan) -> ArborResult<Planned> {
        if id.is_frozen() {
            return Ok(Planned::Frozen);
        }
        let branch = match self.heap.peek(id)? {
            HeapNode::Leaf(leaf) => {
                if !select(id) {
                    return Ok(Planned::Kept);
                }
                let k = plan.batch.push(BatchNode::Leaf(Bytes::copy_from_slice(leaf.data())));
                plan.heap_ids.push(id);
                return Ok(Planned::Pending(k));
            }
            HeapNode::Branch(branch) => Arc::clone(branch),
        };

        let mut children = Vec::with_capacity(branch.len());
        let mut complete = true;
        for (i, &child) in branch.children().iter().enumerate() {
            match self.plan_node(child, select, plan)? {
                Planned::Kept => {
                    complete = false;
                    children.push(BatchChild::Node(child));
                }
                Planned::Frozen => children.push(BatchChild::Node(child)),
                Planned::Pending(k) => {
                    plan.fixups.push((id, i, k));
                    children.push(BatchChild::Pending(k));
                }
            }
        }
        if !complete || !select(id) {
            return Ok(Planned::Kept);
        }
        let k = plan.batch.push(BatchNode::Branch {
            children,
            counts: branch.counts.clone(),
            keys: branch.keys.clone(),
        });
        plan.heap_ids.push(id);
        Ok(Planned::Pending(k))
    }

    /// Writes out the coldest part of the heap once it exceeds its budget.
    pub(crate) fn flush_heap_if_needed(&mut self) -> ArborResult<()> {
        let before = self.heap.memory_used();
        if before <= self.config.heap_memory_budget {
            return Ok(());
        }
        let cold = self.heap.coldest(self.config.heap_flush_fraction);
        let written = self.write_nodes(&|id| matches!(id, NodeId::Heap(h) if cold.contains(&h)))?;
        self.store.record_heap_flush();
        debug!(written, before, after = self.heap.memory_used(), "flushed cold heap nodes");
        Ok(())
    }
}

//! Per-transaction node heap.
//!
//! Holds every mutable node of one transaction in a slot arena. Slots are
//! threaded on an intrusive recency list so the coldest nodes can be
//! written out when the heap outgrows its memory budget.
//!
//! ```text
//!  head (hot)                                   tail (cold)
//!     │                                              │
//!     ▼                                              ▼
//!  ┌──────┐ next ┌──────┐ next ┌──────┐ next ┌──────┐
//!  │ slot │─────►│ slot │─────►│ slot │─────►│ slot │
//!  │      │◄─────│      │◄─────│      │◄─────│      │
//!  └──────┘ prev └──────┘ prev └──────┘ prev └──────┘
//! ```
//!
//! Heap ids are negative and minted in decreasing order; they are never
//! reused within one heap.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use arbor_common::error::{ArborError, ArborResult};
use arbor_common::types::{Key, NodeId};

use crate::node::{HeapLeaf, TreeBranch, TreeLeaf};

/// A node owned by the heap.
#[derive(Debug, Clone)]
pub enum HeapNode {
    /// Branch; shared with readers until mutated.
    Branch(Arc<TreeBranch>),
    /// Leaf.
    Leaf(HeapLeaf),
}

impl HeapNode {
    /// Estimated footprint in bytes.
    pub fn memory_size(&self) -> usize {
        match self {
            Self::Branch(branch) => branch.memory_size(),
            Self::Leaf(leaf) => leaf.memory_size(),
        }
    }

    /// Returns true for leaves.
    pub fn is_leaf(&self) -> bool {
        matches!(self, Self::Leaf(_))
    }
}

struct Slot {
    id: i64,
    node: HeapNode,
    size: usize,
    prev: Option<usize>,
    next: Option<usize>,
}

/// Arena of a transaction's mutable nodes.
pub struct NodeHeap {
    slots: Vec<Option<Slot>>,
    free: Vec<usize>,
    index: HashMap<i64, usize>,
    head: Option<usize>,
    tail: Option<usize>,
    next_id: i64,
    memory: usize,
}

impl Default for NodeHeap {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeHeap {
    /// Creates an empty heap.
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            index: HashMap::new(),
            head: None,
            tail: None,
            next_id: -1,
            memory: 0,
        }
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Returns true if the heap holds no nodes.
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Estimated bytes held by all nodes.
    pub fn memory_used(&self) -> usize {
        self.memory
    }

    /// Adds a new branch.
    pub fn create_branch(&mut self, branch: TreeBranch) -> NodeId {
        self.insert(HeapNode::Branch(Arc::new(branch)))
    }

    /// Adds a new leaf for `key`.
    pub fn create_leaf(&mut self, key: Key, data: Vec<u8>) -> NodeId {
        self.insert(HeapNode::Leaf(HeapLeaf::new(key, data)))
    }

    /// Adds a mutable copy of a frozen branch.
    pub fn copy_branch(&mut self, branch: &TreeBranch) -> NodeId {
        self.insert(HeapNode::Branch(Arc::new(branch.clone())))
    }

    /// Adds a mutable copy of a frozen leaf.
    pub fn copy_leaf(&mut self, key: Key, leaf: &TreeLeaf) -> NodeId {
        self.insert(HeapNode::Leaf(leaf.to_heap(key)))
    }

    fn insert(&mut self, node: HeapNode) -> NodeId {
        let id = self.next_id;
        self.next_id -= 1;
        let size = node.memory_size();
        let slot = Slot {
            id,
            node,
            size,
            prev: None,
            next: None,
        };
        let idx = match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = Some(slot);
                idx
            }
            None => {
                self.slots.push(Some(slot));
                self.slots.len() - 1
            }
        };
        self.index.insert(id, idx);
        self.memory += size;
        self.push_front(idx);
        NodeId::Heap(id)
    }

    fn slot_index(&self, id: NodeId) -> ArborResult<usize> {
        match id {
            NodeId::Heap(h) => self
                .index
                .get(&h)
                .copied()
                .ok_or(ArborError::NodeNotFound { node: id }),
            _ => Err(ArborError::integrity(format!("{id} is not a heap node"))),
        }
    }

    fn slot(&self, idx: usize) -> ArborResult<&Slot> {
        self.slots[idx]
            .as_ref()
            .ok_or_else(|| ArborError::integrity("heap index points at a free slot"))
    }

    fn slot_mut(&mut self, idx: usize) -> ArborResult<&mut Slot> {
        self.slots[idx]
            .as_mut()
            .ok_or_else(|| ArborError::integrity("heap index points at a free slot"))
    }

    /// Looks up a node without changing its recency.
    pub fn peek(&self, id: NodeId) -> ArborResult<&HeapNode> {
        let idx = self.slot_index(id)?;
        Ok(&self.slot(idx)?.node)
    }

    /// Looks up a node and marks it most recently used.
    pub fn fetch(&mut self, id: NodeId) -> ArborResult<&HeapNode> {
        let idx = self.slot_index(id)?;
        self.touch(idx);
        Ok(&self.slot(idx)?.node)
    }

    /// Returns a shared handle to a heap branch.
    pub fn branch(&self, id: NodeId) -> ArborResult<Arc<TreeBranch>> {
        match self.peek(id)? {
            HeapNode::Branch(branch) => Ok(Arc::clone(branch)),
            HeapNode::Leaf(_) => Err(ArborError::integrity(format!("{id} is not a branch"))),
        }
    }

    /// Returns a heap leaf.
    pub fn leaf(&self, id: NodeId) -> ArborResult<&HeapLeaf> {
        match self.peek(id)? {
            HeapNode::Leaf(leaf) => Ok(leaf),
            HeapNode::Branch(_) => Err(ArborError::integrity(format!("{id} is not a leaf"))),
        }
    }

    /// Mutates a node in place and refreshes its memory estimate.
    pub fn update<R>(&mut self, id: NodeId, f: impl FnOnce(&mut HeapNode) -> R) -> ArborResult<R> {
        let idx = self.slot_index(id)?;
        self.touch(idx);
        let slot = self.slot_mut(idx)?;
        let before = slot.size;
        let result = f(&mut slot.node);
        slot.size = slot.node.memory_size();
        let after = slot.size;
        self.memory = self.memory + after - before;
        Ok(result)
    }

    /// Mutates a heap branch.
    pub fn update_branch<R>(
        &mut self,
        id: NodeId,
        f: impl FnOnce(&mut TreeBranch) -> R,
    ) -> ArborResult<R> {
        self.update(id, |node| match node {
            HeapNode::Branch(branch) => Some(f(Arc::make_mut(branch))),
            HeapNode::Leaf(_) => None,
        })?
        .ok_or_else(|| ArborError::integrity(format!("{id} is not a branch")))
    }

    /// Mutates a heap leaf.
    pub fn update_leaf<R>(&mut self, id: NodeId, f: impl FnOnce(&mut HeapLeaf) -> R) -> ArborResult<R> {
        self.update(id, |node| match node {
            HeapNode::Leaf(leaf) => Some(f(leaf)),
            HeapNode::Branch(_) => None,
        })?
        .ok_or_else(|| ArborError::integrity(format!("{id} is not a leaf")))
    }

    /// Removes a node, returning it.
    pub fn delete(&mut self, id: NodeId) -> ArborResult<HeapNode> {
        let idx = self.slot_index(id)?;
        self.unlink(idx);
        let slot = self.slots[idx]
            .take()
            .ok_or_else(|| ArborError::integrity("heap index points at a free slot"))?;
        self.index.remove(&slot.id);
        self.free.push(idx);
        self.memory -= slot.size;
        Ok(slot.node)
    }

    /// Returns the ids of the coldest `fraction` of nodes, coldest first.
    pub fn coldest(&self, fraction: f64) -> HashSet<i64> {
        let want = ((self.len() as f64 * fraction).ceil() as usize).min(self.len());
        let mut ids = HashSet::with_capacity(want);
        let mut cursor = self.tail;
        while let Some(idx) = cursor {
            if ids.len() >= want {
                break;
            }
            match &self.slots[idx] {
                Some(slot) => {
                    ids.insert(slot.id);
                    cursor = slot.prev;
                }
                None => break,
            }
        }
        ids
    }

    /// Drops every node.
    pub fn clear(&mut self) {
        self.slots.clear();
        self.free.clear();
        self.index.clear();
        self.head = None;
        self.tail = None;
        self.memory = 0;
    }

    fn touch(&mut self, idx: usize) {
        if self.head != Some(idx) {
            self.unlink(idx);
            self.push_front(idx);
        }
    }

    fn push_front(&mut self, idx: usize) {
        let old_head = self.head;
        if let Some(slot) = self.slots[idx].as_mut() {
            slot.prev = None;
            slot.next = old_head;
        }
        if let Some(h) = old_head {
            if let Some(slot) = self.slots[h].as_mut() {
                slot.prev = Some(idx);
            }
        }
        self.head = Some(idx);
        if self.tail.is_none() {
            self.tail = Some(idx);
        }
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = match self.slots[idx].as_ref() {
            Some(slot) => (slot.prev, slot.next),
            None => return,
        };
        match prev {
            Some(p) => {
                if let Some(slot) = self.slots[p].as_mut() {
                    slot.next = next;
                }
            }
            None => self.head = next,
        }
        match next {
            Some(n) => {
                if let Some(slot) = self.slots[n].as_mut() {
                    slot.prev = prev;
                }
            }
            None => self.tail = prev,
        }
        if let Some(slot) = self.slots[idx].as_mut() {
            slot.prev = None;
            slot.next = None;
        }
    }
}

//! Tree node representations.
//!
//! ```text
//!                 ┌───────────────────────────────┐
//!   TreeBranch    │ c0 │ k0 │ c1 │ k1 │ c2 │ ...   │   counts: n0 n1 n2 ...
//!                 └─┬─────────┬─────────┬─────────┘
//!                   ▼         ▼         ▼
//!                 leaf      leaf      leaf          (Heap | Stored | Sparse)
//! ```
//!
//! Separator `k(i-1)` is the key of the first leaf below child `i`. The
//! first leaf below child 0 inherits the key of the edge leading to the
//! branch, so leaf keys are known during descent without being stored.

use std::sync::Arc;

use arbor_common::types::{AreaId, Key, NodeId};
use bytes::Bytes;

/// Fixed overhead per node used in memory estimates.
const NODE_OVERHEAD: usize = 64;

/// Estimated bytes per branch child (id, count and separator).
const BRANCH_ENTRY_SIZE: usize = 8 + 8 + std::mem::size_of::<Key>();

/// An internal node.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TreeBranch {
    pub(crate) children: Vec<NodeId>,
    pub(crate) counts: Vec<u64>,
    pub(crate) keys: Vec<Key>,
}

impl TreeBranch {
    /// Creates a branch from its parts. `keys` holds one entry less than
    /// `children`.
    pub fn new(children: Vec<NodeId>, counts: Vec<u64>, keys: Vec<Key>) -> Self {
        debug_assert_eq!(children.len(), counts.len());
        debug_assert_eq!(children.len(), keys.len() + 1);
        Self {
            children,
            counts,
            keys,
        }
    }

    /// Builds a branch from `(child, count, first_key)` entries.
    pub(crate) fn from_entries(entries: Vec<(NodeId, u64, Key)>) -> Self {
        let mut branch = Self::default();
        for (i, (child, count, key)) in entries.into_iter().enumerate() {
            if i > 0 {
                branch.keys.push(key);
            }
            branch.children.push(child);
            branch.counts.push(count);
        }
        branch
    }

    /// Number of children.
    pub fn len(&self) -> usize {
        self.children.len()
    }

    /// Returns true if the branch has no children.
    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Child reference at `index`.
    pub fn child(&self, index: usize) -> NodeId {
        self.children[index]
    }

    /// Element count below child `index`.
    pub fn count(&self, index: usize) -> u64 {
        self.counts[index]
    }

    /// Separator keys.
    pub fn keys(&self) -> &[Key] {
        &self.keys
    }

    /// Child references.
    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    /// Total number of bytes below this branch.
    pub fn total(&self) -> u64 {
        self.counts.iter().sum()
    }

    /// Key of the first leaf below child `index`, given the key of the
    /// first leaf below this branch.
    pub fn child_key(&self, index: usize, first: Key) -> Key {
        if index == 0 {
            first
        } else {
            self.keys[index - 1]
        }
    }

    /// Finds the child holding relative position `rel`.
    ///
    /// Returns the child index and the relative offset of that child.
    pub fn locate(&self, rel: u64) -> Option<(usize, u64)> {
        let mut acc = 0;
        for (i, &count) in self.counts.iter().enumerate() {
            if rel < acc + count {
                return Some((i, acc));
            }
            acc += count;
        }
        None
    }

    /// Number of leading children whose leaves all sort before `key`
    /// (or not after it, when `inclusive`).
    pub(crate) fn key_rank(&self, key: &Key, inclusive: bool) -> usize {
        if inclusive {
            self.keys.partition_point(|k| k <= key)
        } else {
            self.keys.partition_point(|k| k < key)
        }
    }

    pub(crate) fn adjust_count(&mut self, index: usize, delta: i64) {
        self.counts[index] = (self.counts[index] as i64 + delta) as u64;
    }

    /// Inserts a child at `index >= 1` whose first leaf has key `key`.
    pub(crate) fn insert_child(&mut self, index: usize, key: Key, child: NodeId, count: u64) {
        debug_assert!(index >= 1);
        self.children.insert(index, child);
        self.counts.insert(index, count);
        self.keys.insert(index - 1, key);
    }

    /// Removes child `index`.
    ///
    /// Returns the removed child and its count, plus the new first-leaf key
    /// of the branch when child 0 was removed.
    pub(crate) fn remove_child(&mut self, index: usize) -> (NodeId, u64, Option<Key>) {
        let child = self.children.remove(index);
        let count = self.counts.remove(index);
        let first = if index > 0 {
            self.keys.remove(index - 1);
            None
        } else if self.keys.is_empty() {
            None
        } else {
            Some(self.keys.remove(0))
        };
        (child, count, first)
    }

    /// Splits off children `[at..]`, returning the separator between the
    /// halves and the right half.
    pub(crate) fn split_off(&mut self, at: usize) -> (Key, TreeBranch) {
        let children = self.children.split_off(at);
        let counts = self.counts.split_off(at);
        let keys = self.keys.split_off(at);
        let separator = self.keys.pop().unwrap_or(Key::HEAD);
        (separator, TreeBranch::new(children, counts, keys))
    }

    /// Appends every child of `right`, which follows this branch under
    /// separator `separator`.
    pub(crate) fn absorb(&mut self, separator: Key, right: &TreeBranch) {
        self.keys.push(separator);
        self.keys.extend_from_slice(&right.keys);
        self.children.extend_from_slice(&right.children);
        self.counts.extend_from_slice(&right.counts);
    }

    /// Estimated heap footprint in bytes.
    pub fn memory_size(&self) -> usize {
        NODE_OVERHEAD + self.children.capacity().max(self.children.len()) * BRANCH_ENTRY_SIZE
    }
}

/// Moves the first `count` children of `right` to the end of `left`.
///
/// `separator` is the key between the two; returns the new separator.
pub(crate) fn shift_left(
    left: &mut TreeBranch,
    right: &mut TreeBranch,
    mut separator: Key,
    count: usize,
) -> Key {
    for _ in 0..count {
        left.keys.push(separator);
        left.children.push(right.children.remove(0));
        left.counts.push(right.counts.remove(0));
        separator = right.keys.remove(0);
    }
    separator
}

/// Moves the last `count` children of `left` to the front of `right`.
///
/// `separator` is the key between the two; returns the new separator.
pub(crate) fn shift_right(
    left: &mut TreeBranch,
    right: &mut TreeBranch,
    mut separator: Key,
    count: usize,
) -> Key {
    for _ in 0..count {
        right.keys.insert(0, separator);
        if let (Some(child), Some(count), Some(key)) =
            (left.children.pop(), left.counts.pop(), left.keys.pop())
        {
            right.children.insert(0, child);
            right.counts.insert(0, count);
            separator = key;
        }
    }
    separator
}

/// A mutable leaf owned by a transaction's node heap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeapLeaf {
    key: Key,
    data: Vec<u8>,
}

impl HeapLeaf {
    /// Creates a leaf for `key` holding `data`.
    pub fn new(key: Key, data: Vec<u8>) -> Self {
        Self { key, data }
    }

    /// The key the leaf belongs to.
    pub fn key(&self) -> Key {
        self.key
    }

    /// Leaf content.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true if the leaf holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Copies `out.len()` bytes starting at `offset` into `out`.
    pub fn read(&self, offset: usize, out: &mut [u8]) {
        out.copy_from_slice(&self.data[offset..offset + out.len()]);
    }

    /// Overwrites bytes starting at `offset`.
    pub fn write(&mut self, offset: usize, src: &[u8]) {
        self.data[offset..offset + src.len()].copy_from_slice(src);
    }

    /// Inserts `src` at `offset`, moving the rest right.
    pub fn insert(&mut self, offset: usize, src: &[u8]) {
        self.data.splice(offset..offset, src.iter().copied());
    }

    /// Inserts `count` copies of `fill` at `offset`.
    pub fn insert_fill(&mut self, offset: usize, fill: u8, count: usize) {
        self.data
            .splice(offset..offset, std::iter::repeat(fill).take(count));
    }

    /// Removes `count` bytes at `offset`.
    pub fn remove(&mut self, offset: usize, count: usize) {
        self.data.drain(offset..offset + count);
    }

    /// Truncates the leaf at `at` and returns the removed tail.
    pub fn split_off(&mut self, at: usize) -> Vec<u8> {
        self.data.split_off(at)
    }

    /// Removes and returns the first `count` bytes.
    pub fn take_front(&mut self, count: usize) -> Vec<u8> {
        self.data.drain(..count).collect()
    }

    /// Appends bytes.
    pub fn append(&mut self, src: &[u8]) {
        self.data.extend_from_slice(src);
    }

    /// Estimated heap footprint in bytes.
    pub fn memory_size(&self) -> usize {
        NODE_OVERHEAD + self.data.capacity()
    }
}

/// A leaf in any of its three representations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TreeLeaf {
    /// Mutable leaf in a node heap.
    Heap(HeapLeaf),
    /// Persisted leaf; `payload` excludes the area header.
    Stored {
        /// Backing area.
        area: AreaId,
        /// Leaf bytes.
        payload: Bytes,
    },
    /// Virtual run of `len` copies of `fill`.
    Sparse {
        /// The repeated byte.
        fill: u8,
        /// Run length.
        len: u32,
    },
}

impl TreeLeaf {
    /// Length in bytes.
    pub fn len(&self) -> usize {
        match self {
            Self::Heap(leaf) => leaf.len(),
            Self::Stored { payload, .. } => payload.len(),
            Self::Sparse { len, .. } => *len as usize,
        }
    }

    /// Returns true if the leaf holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copies `out.len()` bytes starting at `offset` into `out`.
    pub fn read(&self, offset: usize, out: &mut [u8]) {
        match self {
            Self::Heap(leaf) => leaf.read(offset, out),
            Self::Stored { payload, .. } => {
                out.copy_from_slice(&payload[offset..offset + out.len()])
            }
            Self::Sparse { fill, .. } => out.fill(*fill),
        }
    }

    /// Materializes the content as a heap leaf for `key`.
    pub fn to_heap(&self, key: Key) -> HeapLeaf {
        match self {
            Self::Heap(leaf) => HeapLeaf::new(key, leaf.data.clone()),
            Self::Stored { payload, .. } => HeapLeaf::new(key, payload.to_vec()),
            Self::Sparse { fill, len } => HeapLeaf::new(key, vec![*fill; *len as usize]),
        }
    }
}

/// A decoded backing-store area.
#[derive(Debug, Clone)]
pub enum StoredNode {
    /// A branch; shared with the branch cache.
    Branch(Arc<TreeBranch>),
    /// A leaf.
    Leaf(TreeLeaf),
}

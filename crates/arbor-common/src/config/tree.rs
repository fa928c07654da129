//! Tree engine configuration.
//!
//! [`TreeConfig`] controls node sizes, memory budgets and the thresholds
//! used by compaction and bulk deletion.

use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_BRANCH_CACHE_BYTES, DEFAULT_BRANCH_COMPACT_FILL, DEFAULT_BULK_DELETE_THRESHOLD,
    DEFAULT_HEAP_FLUSH_FRACTION, DEFAULT_HEAP_MEMORY_BUDGET, DEFAULT_LEAF_COMPACT_FILL,
    DEFAULT_MAX_BRANCH_SIZE, DEFAULT_MAX_LEAF_BYTE_SIZE, MIN_BRANCH_SIZE, MIN_LEAF_BYTE_SIZE,
};
use crate::error::{ArborError, ArborResult};

/// Configuration for a tree system.
///
/// # Example
///
/// ```rust
/// use arbor_common::config::TreeConfig;
///
/// let config = TreeConfig::new()
///     .with_max_branch_size(32)
///     .with_max_leaf_byte_size(8192);
/// assert!(config.validate().is_ok());
/// assert_eq!(config.min_branch_children(), 16);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TreeConfig {
    /// Maximum number of children in a branch node.
    pub max_branch_size: usize,

    /// Maximum number of bytes in a leaf node.
    pub max_leaf_byte_size: usize,

    /// Heap memory (estimated bytes) above which cold heap nodes are flushed.
    pub heap_memory_budget: usize,

    /// Fraction of heap nodes, coldest first, written out per flush.
    pub heap_flush_fraction: f64,

    /// Estimated bytes of decoded branches kept in the branch cache.
    pub branch_cache_bytes: usize,

    /// Removals larger than this prune subtrees instead of shrinking leaves.
    pub bulk_delete_threshold: u64,

    /// Leaves filled below this fraction are merged at commit.
    pub leaf_compact_fill: f64,

    /// Branches filled below this fraction are merged at commit.
    pub branch_compact_fill: f64,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            max_branch_size: DEFAULT_MAX_BRANCH_SIZE,
            max_leaf_byte_size: DEFAULT_MAX_LEAF_BYTE_SIZE,
            heap_memory_budget: DEFAULT_HEAP_MEMORY_BUDGET,
            heap_flush_fraction: DEFAULT_HEAP_FLUSH_FRACTION,
            branch_cache_bytes: DEFAULT_BRANCH_CACHE_BYTES,
            bulk_delete_threshold: DEFAULT_BULK_DELETE_THRESHOLD,
            leaf_compact_fill: DEFAULT_LEAF_COMPACT_FILL,
            branch_compact_fill: DEFAULT_BRANCH_COMPACT_FILL,
        }
    }
}

impl TreeConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the maximum branch size.
    pub fn with_max_branch_size(mut self, size: usize) -> Self {
        self.max_branch_size = size;
        self
    }

    /// Sets the maximum leaf byte size.
    pub fn with_max_leaf_byte_size(mut self, size: usize) -> Self {
        self.max_leaf_byte_size = size;
        self
    }

    /// Sets the heap memory budget.
    pub fn with_heap_memory_budget(mut self, bytes: usize) -> Self {
        self.heap_memory_budget = bytes;
        self
    }

    /// Sets the fraction of heap nodes flushed when the budget is exceeded.
    pub fn with_heap_flush_fraction(mut self, fraction: f64) -> Self {
        self.heap_flush_fraction = fraction.clamp(0.05, 1.0);
        self
    }

    /// Sets the branch cache budget.
    pub fn with_branch_cache_bytes(mut self, bytes: usize) -> Self {
        self.branch_cache_bytes = bytes;
        self
    }

    /// Sets the bulk delete threshold.
    pub fn with_bulk_delete_threshold(mut self, bytes: u64) -> Self {
        self.bulk_delete_threshold = bytes;
        self
    }

    /// Sets the leaf and branch compaction thresholds.
    pub fn with_compact_fill(mut self, leaf: f64, branch: f64) -> Self {
        self.leaf_compact_fill = leaf.clamp(0.0, 1.0);
        self.branch_compact_fill = branch.clamp(0.0, 1.0);
        self
    }

    /// Smallest number of children a non-root branch keeps.
    pub fn min_branch_children(&self) -> usize {
        self.max_branch_size / 2
    }

    /// Branch occupancy below which a heap branch is merged at commit.
    pub fn branch_compact_target(&self) -> usize {
        ((self.max_branch_size as f64 * self.branch_compact_fill) as usize).max(1)
    }

    /// Leaf occupancy below which a heap leaf is merged at commit.
    pub fn leaf_compact_target(&self) -> usize {
        ((self.max_leaf_byte_size as f64 * self.leaf_compact_fill) as usize).max(1)
    }

    /// Checks the configuration for values the tree cannot work with.
    pub fn validate(&self) -> ArborResult<()> {
        if self.max_branch_size < MIN_BRANCH_SIZE {
            return Err(ArborError::invalid_config(format!(
                "max_branch_size {} is below the minimum {}",
                self.max_branch_size, MIN_BRANCH_SIZE
            )));
        }
        if self.max_leaf_byte_size < MIN_LEAF_BYTE_SIZE {
            return Err(ArborError::invalid_config(format!(
                "max_leaf_byte_size {} is below the minimum {}",
                self.max_leaf_byte_size, MIN_LEAF_BYTE_SIZE
            )));
        }
        if self.max_leaf_byte_size > u32::MAX as usize {
            return Err(ArborError::invalid_config(
                "max_leaf_byte_size must fit in 32 bits",
            ));
        }
        if !(self.heap_flush_fraction > 0.0 && self.heap_flush_fraction <= 1.0) {
            return Err(ArborError::invalid_config(
                "heap_flush_fraction must be in (0, 1]",
            ));
        }
        if self.bulk_delete_threshold == 0 {
            return Err(ArborError::invalid_config(
                "bulk_delete_threshold must be positive",
            ));
        }
        for (name, fill) in [
            ("leaf_compact_fill", self.leaf_compact_fill),
            ("branch_compact_fill", self.branch_compact_fill),
        ] {
            if !(fill > 0.0 && fill <= 1.0) {
                return Err(ArborError::invalid_config(format!("{name} must be in (0, 1]")));
            }
        }
        Ok(())
    }
}

/// Preset configurations.
impl TreeConfig {
    /// Creates a configuration with tiny nodes so tests build tall trees
    /// from little data.
    pub fn for_testing() -> Self {
        Self {
            max_branch_size: 6,
            max_leaf_byte_size: 64,
            heap_memory_budget: DEFAULT_HEAP_MEMORY_BUDGET,
            heap_flush_fraction: DEFAULT_HEAP_FLUSH_FRACTION,
            branch_cache_bytes: 256 * 1024,
            bulk_delete_threshold: 512,
            leaf_compact_fill: DEFAULT_LEAF_COMPACT_FILL,
            branch_compact_fill: DEFAULT_BRANCH_COMPACT_FILL,
        }
    }
}

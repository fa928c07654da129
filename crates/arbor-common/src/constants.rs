//! System-wide constants for the arbor tree engine.
//!
//! Magic numbers in this module are part of the persisted format and must
//! never change once data has been written with them.

// =============================================================================
// Node area format
// =============================================================================

/// Node type tag at the start of every persisted leaf area.
pub const LEAF_MAGIC: u16 = 0x019E;

/// Node type tag at the start of every persisted branch area.
pub const BRANCH_MAGIC: u16 = 0x022E;

/// Format version written after the node type tag.
pub const NODE_FORMAT_VERSION: u16 = 1;

/// Leaf area header: type (2) + version (2) + ref count (4) + payload length (4).
pub const LEAF_HEADER_SIZE: usize = 12;

/// Byte offset of the reference count inside a leaf area.
pub const LEAF_REF_COUNT_OFFSET: usize = 4;

/// Branch area header: type (2) + version (2) + child array length (4).
pub const BRANCH_HEADER_SIZE: usize = 8;

// =============================================================================
// Version metadata format
// =============================================================================

/// Magic number of the fixed root header area.
pub const HEADER_MAGIC: u32 = 0x092B_A001;

/// Magic number of a version list area.
pub const VERSION_LIST_MAGIC: u32 = 0x0000_1433;

/// Magic number of a per-version record area.
pub const VERSION_RECORD_MAGIC: u32 = 0x0004_EA23;

/// Header area size: magic (4) + format (4) + version list area (8).
pub const HEADER_AREA_SIZE: usize = 16;

// =============================================================================
// Keys
// =============================================================================

/// First key type reserved for system use. User files may not use key types
/// at or above this value.
pub const RESERVED_KEY_TYPE_START: i16 = 0x7F80;

// =============================================================================
// Tree defaults
// =============================================================================

/// Default maximum number of children in a branch.
pub const DEFAULT_MAX_BRANCH_SIZE: usize = 16;

/// Smallest branch size accepted by configuration validation.
pub const MIN_BRANCH_SIZE: usize = 6;

/// Default maximum number of bytes held by a single leaf.
pub const DEFAULT_MAX_LEAF_BYTE_SIZE: usize = 4096;

/// Smallest leaf size accepted by configuration validation.
pub const MIN_LEAF_BYTE_SIZE: usize = 4;

/// Default heap memory budget before cold nodes are flushed (64 MB).
pub const DEFAULT_HEAP_MEMORY_BUDGET: usize = 64 * 1024 * 1024;

/// Default fraction of the coldest heap nodes written out per heap flush.
pub const DEFAULT_HEAP_FLUSH_FRACTION: f64 = 0.3;

/// Default branch cache budget (16 MB).
pub const DEFAULT_BRANCH_CACHE_BYTES: usize = 16 * 1024 * 1024;

/// Removals larger than this many bytes prune whole subtrees instead of
/// shrinking leaves one at a time (32 KB).
pub const DEFAULT_BULK_DELETE_THRESHOLD: u64 = 32 * 1024;

/// Leaves filled below this fraction are merged with a same-key sibling at commit.
pub const DEFAULT_LEAF_COMPACT_FILL: f64 = 0.80;

/// Branches filled below this fraction are merged with a sibling at commit.
pub const DEFAULT_BRANCH_COMPACT_FILL: f64 = 0.75;

//! Caching utilities for the arbor tree engine.
//!
//! - **Sized LRU Cache**: least-recently-used cache bounded by the summed
//!   size estimate of its entries rather than by entry count. Decoded branch
//!   nodes vary in size, so a byte budget is the meaningful bound.
//!
//! # Example
//!
//! ```rust
//! use arbor_cache::SizedLruCache;
//!
//! let mut cache = SizedLruCache::new(100);
//! cache.insert("a", "first", 60);
//! cache.insert("b", "second", 60);
//! // "a" was evicted to stay within the 100 byte budget
//! assert!(cache.get(&"a").is_none());
//! assert_eq!(cache.get(&"b"), Some(&"second"));
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod lru;
pub mod stats;

pub use lru::{SizedLruCache, SyncSizedLruCache};
pub use stats::CacheStats;

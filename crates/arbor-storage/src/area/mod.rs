//! The backing store contract.
//!
//! ```text
//! ┌───────────────────────────────────────────┐
//! │              AreaStore trait              │
//! │ (allocate, finish, get, write, delete,    │
//! │  header, checkpoint, lock_for_write)      │
//! └───────────────────────────────────────────┘
//!            │                     │
//!            ▼                     ▼
//! ┌─────────────────────┐  ┌─────────────────────┐
//! │  MemoryAreaStore    │  │   FileAreaStore     │
//! │  (tests, scratch)   │  │  (checksummed log)  │
//! └─────────────────────┘  └─────────────────────┘
//! ```
//!
//! Areas are immutable once finished, except through [`MutableArea`], which
//! the tree engine uses only for leaf reference counts and the fixed header.

mod handle;

pub use handle::{AreaWriter, MutableArea};

use arbor_common::error::ArborResult;
use arbor_common::types::AreaId;
use bytes::Bytes;

/// Trait for area allocating backing stores.
///
/// All methods take `&self`; implementations synchronize internally so a
/// store can be shared between transactions through an `Arc<dyn AreaStore>`.
pub trait AreaStore: Send + Sync {
    /// Reserves a fresh area id for an area of `size` bytes.
    ///
    /// The area does not exist until [`AreaStore::finish_area`] is called
    /// with its content. Prefer [`AreaStoreExt::create_area`].
    fn allocate_area(&self, size: usize) -> ArborResult<AreaId>;

    /// Seals a reserved area with its final content.
    fn finish_area(&self, id: AreaId, data: Bytes) -> ArborResult<()>;

    /// Returns the content of a finished area.
    fn get_area(&self, id: AreaId) -> ArborResult<Bytes>;

    /// Overwrites part of a finished area in place.
    fn write_area(&self, id: AreaId, offset: usize, data: &[u8]) -> ArborResult<()>;

    /// Deletes an area. Its id is never handed out again.
    fn delete_area(&self, id: AreaId) -> ArborResult<()>;

    /// Returns the fixed header area, if one was registered.
    fn header_area(&self) -> Option<AreaId>;

    /// Registers the fixed header area that bootstraps a reopen.
    fn set_header_area(&self, id: AreaId) -> ArborResult<()>;

    /// Durability barrier: every operation issued before it survives a crash.
    fn checkpoint(&self) -> ArborResult<()>;

    /// Takes the store-wide write lock.
    ///
    /// Held across allocation, version-list mutation and reference-count
    /// changes so those multi-area updates are not interleaved.
    fn lock_for_write(&self) -> WriteGuard<'_>;

    /// Returns the number of live areas.
    fn area_count(&self) -> usize;
}

/// Holds a store's write lock until dropped.
///
/// Wraps whatever guard the implementation locks with, so the trait does not
/// fix a particular lock type.
#[must_use = "the write lock is released as soon as the guard is dropped"]
pub struct WriteGuard<'a> {
    _held: Box<dyn Held + 'a>,
}

trait Held {}

impl<T> Held for T {}

impl<'a> WriteGuard<'a> {
    /// Wraps `guard`; the lock it represents is released when the
    /// returned value is dropped.
    pub fn new<G: 'a>(guard: G) -> Self {
        Self {
            _held: Box::new(guard),
        }
    }
}

impl std::fmt::Debug for WriteGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("WriteGuard")
    }
}

/// Handle constructors available on every [`AreaStore`], including trait objects.
pub trait AreaStoreExt: AreaStore {
    /// Starts a new area of exactly `size` bytes, written sequentially.
    fn create_area(&self, size: usize) -> ArborResult<AreaWriter<'_, Self>> {
        let id = self.allocate_area(size)?;
        Ok(AreaWriter::new(self, id, size))
    }

    /// Opens a finished area for in-place updates.
    fn get_mutable_area(&self, id: AreaId) -> ArborResult<MutableArea<'_, Self>> {
        let data = self.get_area(id)?;
        Ok(MutableArea::new(self, id, &data))
    }
}

impl<S: AreaStore + ?Sized> AreaStoreExt for S {}

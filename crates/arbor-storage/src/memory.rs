//! Heap-backed area store.
//!
//! Areas live in a hash map for the life of the process. Besides serving
//! tests and scratch trees, the store can inject I/O failures so callers
//! can exercise their fatal-error paths.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use arbor_common::error::{ArborError, ArborResult};
use arbor_common::types::AreaId;
use bytes::{Bytes, BytesMut};
use parking_lot::{Mutex, RwLock};

use crate::area::{AreaStore, WriteGuard};

/// An [`AreaStore`] that keeps every area in memory.
#[derive(Debug, Default)]
pub struct MemoryAreaStore {
    /// Finished areas.
    areas: RwLock<HashMap<AreaId, Bytes>>,
    /// Next area id to hand out.
    next_id: AtomicU64,
    /// Fixed header area.
    header: RwLock<Option<AreaId>>,
    /// Store-wide write lock.
    write_lock: Mutex<()>,
    /// When set, every mutating call fails with an I/O error.
    fail_writes: AtomicBool,
    /// Number of checkpoints taken.
    checkpoints: AtomicU64,
}

impl MemoryAreaStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent mutating call fail (or succeed again).
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Returns the number of checkpoints taken so far.
    pub fn checkpoint_count(&self) -> u64 {
        self.checkpoints.load(Ordering::Relaxed)
    }

    /// Returns true if an area with this id exists.
    pub fn contains(&self, id: AreaId) -> bool {
        self.areas.read().contains_key(&id)
    }

    fn check_writable(&self) -> ArborResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::Other, "injected write failure").into());
        }
        Ok(())
    }
}

impl AreaStore for MemoryAreaStore {
    fn allocate_area(&self, _size: usize) -> ArborResult<AreaId> {
        self.check_writable()?;
        let id = AreaId::new(self.next_id.fetch_add(1, Ordering::SeqCst));
        if id > AreaId::MAX {
            return Err(ArborError::OutOfMemory {
                message: "area id space exhausted".into(),
            });
        }
        Ok(id)
    }

    fn finish_area(&self, id: AreaId, data: Bytes) -> ArborResult<()> {
        self.check_writable()?;
        self.areas.write().insert(id, data);
        Ok(())
    }

    fn get_area(&self, id: AreaId) -> ArborResult<Bytes> {
        self.areas
            .read()
            .get(&id)
            .cloned()
            .ok_or(ArborError::AreaNotFound { area: id })
    }

    fn write_area(&self, id: AreaId, offset: usize, data: &[u8]) -> ArborResult<()> {
        self.check_writable()?;
        let mut areas = self.areas.write();
        let area = areas.get_mut(&id).ok_or(ArborError::AreaNotFound { area: id })?;
        if offset + data.len() > area.len() {
            return Err(ArborError::corruption(format!(
                "write of {} bytes at {} beyond area {} of {} bytes",
                data.len(),
                offset,
                id,
                area.len()
            )));
        }
        let mut updated = BytesMut::from(&area[..]);
        updated[offset..offset + data.len()].copy_from_slice(data);
        *area = updated.freeze();
        Ok(())
    }

    fn delete_area(&self, id: AreaId) -> ArborResult<()> {
        self.check_writable()?;
        self.areas
            .write()
            .remove(&id)
            .map(|_| ())
            .ok_or(ArborError::AreaNotFound { area: id })
    }

    fn header_area(&self) -> Option<AreaId> {
        *self.header.read()
    }

    fn set_header_area(&self, id: AreaId) -> ArborResult<()> {
        self.check_writable()?;
        *self.header.write() = Some(id);
        Ok(())
    }

    fn checkpoint(&self) -> ArborResult<()> {
        self.check_writable()?;
        self.checkpoints.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn lock_for_write(&self) -> WriteGuard<'_> {
        WriteGuard::new(self.write_lock.lock())
    }

    fn area_count(&self) -> usize {
        self.areas.read().len()
    }
}

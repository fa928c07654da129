//! Area handles: sequential writers and in-place updaters.

use arbor_common::error::{ArborError, ArborResult};
use arbor_common::types::AreaId;
use bytes::{BufMut, BytesMut};

use super::AreaStore;

/// Sequential-write-only handle for a new area.
///
/// Values are written big-endian. [`AreaWriter::finish`] seals the area;
/// a writer dropped without finishing leaves no area behind.
pub struct AreaWriter<'a, S: AreaStore + ?Sized> {
    store: &'a S,
    id: AreaId,
    size: usize,
    buf: BytesMut,
}

impl<'a, S: AreaStore + ?Sized> AreaWriter<'a, S> {
    pub(crate) fn new(store: &'a S, id: AreaId, size: usize) -> Self {
        Self {
            store,
            id,
            size,
            buf: BytesMut::with_capacity(size),
        }
    }

    /// Returns the id the area will have once finished.
    pub fn id(&self) -> AreaId {
        self.id
    }

    /// Returns the number of bytes still to be written.
    pub fn remaining(&self) -> usize {
        self.size.saturating_sub(self.buf.len())
    }

    /// Appends a `u16`.
    pub fn put_u16(&mut self, value: u16) {
        self.buf.put_u16(value);
    }

    /// Appends a `u32`.
    pub fn put_u32(&mut self, value: u32) {
        self.buf.put_u32(value);
    }

    /// Appends an `i64`.
    pub fn put_i64(&mut self, value: i64) {
        self.buf.put_i64(value);
    }

    /// Appends raw bytes.
    pub fn put_slice(&mut self, data: &[u8]) {
        self.buf.put_slice(data);
    }

    /// Seals the area and returns its stable id.
    ///
    /// Fails if the written length differs from the size the area was
    /// created with.
    pub fn finish(self) -> ArborResult<AreaId> {
        if self.buf.len() != self.size {
            return Err(ArborError::integrity(format!(
                "area {} created with {} bytes but {} were written",
                self.id,
                self.size,
                self.buf.len()
            )));
        }
        self.store.finish_area(self.id, self.buf.freeze())?;
        Ok(self.id)
    }
}

/// In-place update handle for a finished area.
///
/// Reads and writes go to a private copy; [`MutableArea::check_out`] writes
/// the modified byte range back to the store.
pub struct MutableArea<'a, S: AreaStore + ?Sized> {
    store: &'a S,
    id: AreaId,
    data: BytesMut,
    dirty: Option<(usize, usize)>,
}

impl<'a, S: AreaStore + ?Sized> MutableArea<'a, S> {
    pub(crate) fn new(store: &'a S, id: AreaId, data: &[u8]) -> Self {
        Self {
            store,
            id,
            data: BytesMut::from(data),
            dirty: None,
        }
    }

    /// Returns the area id.
    pub fn id(&self) -> AreaId {
        self.id
    }

    /// Returns the area length.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true if the area holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn check_range(&self, offset: usize, len: usize) -> ArborResult<()> {
        if offset + len > self.data.len() {
            return Err(ArborError::corruption(format!(
                "access at {}..{} beyond area {} of {} bytes",
                offset,
                offset + len,
                self.id,
                self.data.len()
            )));
        }
        Ok(())
    }

    /// Reads a `u32` at `offset`.
    pub fn get_u32(&self, offset: usize) -> ArborResult<u32> {
        self.check_range(offset, 4)?;
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&self.data[offset..offset + 4]);
        Ok(u32::from_be_bytes(raw))
    }

    /// Writes a `u32` at `offset`.
    pub fn put_u32(&mut self, offset: usize, value: u32) -> ArborResult<()> {
        self.put_slice(offset, &value.to_be_bytes())
    }

    /// Writes raw bytes at `offset`.
    pub fn put_slice(&mut self, offset: usize, bytes: &[u8]) -> ArborResult<()> {
        self.check_range(offset, bytes.len())?;
        self.data[offset..offset + bytes.len()].copy_from_slice(bytes);
        let end = offset + bytes.len();
        self.dirty = Some(match self.dirty {
            Some((lo, hi)) => (lo.min(offset), hi.max(end)),
            None => (offset, end),
        });
        Ok(())
    }

    /// Writes the modified range back to the store.
    pub fn check_out(self) -> ArborResult<()> {
        if let Some((lo, hi)) = self.dirty {
            self.store.write_area(self.id, lo, &self.data[lo..hi])?;
        }
        Ok(())
    }
}

//! Byte-level file operations.
//!
//! Files are addressed by key and translated to absolute positions through
//! [`TxCore::file_bounds`]. Content enters the tree as [`Piece`]s: small
//! inserts land in the leaf at the cursor, larger ones become a chain of
//! new leaves linked after it.

use std::collections::VecDeque;

use tracing::debug;

use arbor_common::error::{ArborError, ArborResult};
use arbor_common::types::{AreaId, Key, NodeId};

use super::core::TxCore;
use super::Piece;
use crate::stack::TreeStack;

impl TxCore {
    pub(crate) fn file_length(&mut self, key: Key) -> ArborResult<u64> {
        let (start, end) = self.file_bounds(key)?;
        Ok(end - start)
    }

    fn out_of_bounds(key: Key, position: u64, length: u64) -> ArborError {
        ArborError::OutOfBounds { key, position, length }
    }

    /// End of `count` bytes at `pos`, which must not pass `length`.
    fn span_end(key: Key, pos: u64, count: u64, length: u64) -> ArborResult<u64> {
        match pos.checked_add(count) {
            Some(end) if end <= length => Ok(end),
            _ => Err(Self::out_of_bounds(key, pos.saturating_add(count), length)),
        }
    }

    /// Rejects growth of `key` by `count` bytes that would overflow the
    /// tree's byte positions.
    fn check_growth(&mut self, key: Key, length: u64, count: u64) -> ArborResult<()> {
        match self.total_size()?.checked_add(count) {
            Some(_) => Ok(()),
            None => Err(Self::out_of_bounds(key, length.saturating_add(count), length)),
        }
    }

    // =========================================================================
    // File operations
    // =========================================================================

    pub(crate) fn read_file(&mut self, stack: &mut TreeStack, key: Key, pos: u64, out: &mut [u8]) -> ArborResult<()> {
        let (start, end) = self.file_bounds(key)?;
        Self::span_end(key, pos, out.len() as u64, end - start)?;
        self.read_absolute(stack, start + pos, out)
    }

    /// Overwrites from `pos`, extending the file when the data runs past
    /// its end.
    pub(crate) fn write_file(&mut self, stack: &mut TreeStack, key: Key, pos: u64, data: &[u8]) -> ArborResult<()> {
        let (start, end) = self.file_bounds(key)?;
        let length = end - start;
        if pos > length {
            return Err(Self::out_of_bounds(key, pos, length));
        }
        let overlap = (data.len() as u64).min(length - pos) as usize;
        if overlap > 0 {
            self.overwrite_absolute(stack, start + pos, &data[..overlap])?;
        }
        if overlap < data.len() {
            self.check_growth(key, length, (data.len() - overlap) as u64)?;
            self.insert_pieces(stack, key, end, vec![Piece::Bytes(data[overlap..].to_vec())])?;
            self.size_changed(key);
        }
        Ok(())
    }

    /// Grows the file with zeros or cuts it down to `new_length`.
    pub(crate) fn set_file_length(&mut self, stack: &mut TreeStack, key: Key, new_length: u64) -> ArborResult<()> {
        let (start, end) = self.file_bounds(key)?;
        let length = end - start;
        if new_length > length {
            self.check_growth(key, length, new_length - length)?;
            self.insert_pieces(stack, key, end, vec![Piece::Fill(new_length - length)])?;
        } else if new_length < length {
            self.remove_range(stack, start + new_length, end)?;
        } else {
            return Ok(());
        }
        self.size_changed(key);
        Ok(())
    }

    /// Inserts `delta` zero bytes at `pos`, or removes `-delta` bytes there.
    pub(crate) fn shift_file(&mut self, stack: &mut TreeStack, key: Key, pos: u64, delta: i64) -> ArborResult<()> {
        let (start, end) = self.file_bounds(key)?;
        let length = end - start;
        if pos > length {
            return Err(Self::out_of_bounds(key, pos, length));
        }
        if delta > 0 {
            self.check_growth(key, length, delta as u64)?;
            self.insert_pieces(stack, key, start + pos, vec![Piece::Fill(delta as u64)])?;
        } else if delta < 0 {
            let end = Self::span_end(key, pos, delta.unsigned_abs(), length)?;
            self.remove_range(stack, start + pos, start + end)?;
        } else {
            return Ok(());
        }
        self.size_changed(key);
        Ok(())
    }

    pub(crate) fn delete_file(&mut self, stack: &mut TreeStack, key: Key) -> ArborResult<()> {
        let (start, end) = self.file_bounds(key)?;
        if start == end {
            return Ok(());
        }
        self.remove_range(stack, start, end)?;
        self.size_changed(key);
        Ok(())
    }

    /// Replaces the whole content of `key` with `pieces`.
    pub(crate) fn replace_file(&mut self, stack: &mut TreeStack, key: Key, pieces: Vec<Piece>) -> ArborResult<()> {
        self.delete_file(stack, key)?;
        let (start, _) = self.file_bounds(key)?;
        self.insert_pieces(stack, key, start, pieces)?;
        self.size_changed(key);
        Ok(())
    }

    pub(crate) fn copy_data(
        &mut self,
        stack: &mut TreeStack,
        src: Key,
        src_pos: u64,
        dst: Key,
        dst_pos: u64,
        len: u64,
    ) -> ArborResult<()> {
        let (src_start, src_end) = self.file_bounds(src)?;
        Self::span_end(src, src_pos, len, src_end - src_start)?;
        let dst_len = self.file_length(dst)?;
        if dst_pos > dst_len {
            return Err(Self::out_of_bounds(dst, dst_pos, dst_len));
        }
        if len == 0 {
            return Ok(());
        }
        self.check_growth(dst, dst_len, len)?;

        let lo = src_start + src_pos;
        let mut links = Vec::new();
        let pieces = self.collect_pieces(stack, lo, lo + len, &mut links);
        let linked = links.len();
        self.linked.extend(links);
        let pieces = pieces?;

        let (dst_start, _) = self.file_bounds(dst)?;
        self.insert_pieces(stack, dst, dst_start + dst_pos, pieces)?;
        self.size_changed(dst);
        debug!(len, linked, "copied data");
        Ok(())
    }

    // =========================================================================
    // Absolute positions
    // =========================================================================

    pub(crate) fn read_absolute(&mut self, stack: &mut TreeStack, pos: u64, out: &mut [u8]) -> ArborResult<()> {
        let mut done = 0;
        while done < out.len() {
            let at = pos + done as u64;
            let leaf = stack.setup_for_position(self, at)?;
            let local = (at - leaf.offset) as usize;
            let n = (out.len() - done).min(leaf.size as usize - local);
            self.read_leaf(leaf.node, local, &mut out[done..done + n])?;
            done += n;
        }
        Ok(())
    }

    fn overwrite_absolute(&mut self, stack: &mut TreeStack, pos: u64, data: &[u8]) -> ArborResult<()> {
        let mut done = 0;
        while done < data.len() {
            let at = pos + done as u64;
            let leaf = stack.setup_for_position(self, at)?;
            let local = (at - leaf.offset) as usize;
            let n = (data.len() - done).min(leaf.size as usize - local);
            stack.write_leaf(self, local, &data[done..done + n])?;
            done += n;
        }
        Ok(())
    }

    /// Removes absolute range `[lo, hi)`.
    pub(crate) fn remove_range(&mut self, stack: &mut TreeStack, lo: u64, hi: u64) -> ArborResult<()> {
        if hi <= lo {
            return Ok(());
        }
        if hi - lo > self.config.bulk_delete_threshold {
            return self.remove_absolute_bounds(stack, lo, hi);
        }
        let mut remaining = hi - lo;
        while remaining > 0 {
            let leaf = stack.setup_for_position(self, lo)?;
            let local = lo - leaf.offset;
            let count = remaining.min(leaf.size - local);
            stack.trim_leaf(self, local as usize, count as usize)?;
            remaining -= count;
        }
        Ok(())
    }

    /// Describes absolute range `[lo, hi)` as pieces. Whole stored leaves
    /// are linked and recorded in `links`; whole sparse leaves are reused.
    pub(crate) fn collect_pieces(
        &mut self,
        stack: &mut TreeStack,
        lo: u64,
        hi: u64,
        links: &mut Vec<AreaId>,
    ) -> ArborResult<Vec<Piece>> {
        let mut pieces: Vec<Piece> = Vec::new();
        let mut pos = lo;
        while pos < hi {
            let leaf = stack.setup_for_position(self, pos)?;
            let local = pos - leaf.offset;
            let n = (hi - pos).min(leaf.size - local);
            let whole = local == 0 && n == leaf.size;
            match leaf.node {
                NodeId::Stored(area) if whole => {
                    self.store.link_leaf(area)?;
                    links.push(area);
                    pieces.push(Piece::Leaf { node: leaf.node, size: n });
                }
                NodeId::Sparse { .. } if whole => pieces.push(Piece::Leaf { node: leaf.node, size: n }),
                NodeId::Sparse { fill: 0, .. } => match pieces.last_mut() {
                    Some(Piece::Fill(count)) => *count += n,
                    _ => pieces.push(Piece::Fill(n)),
                },
                _ => {
                    let mut buf = vec![0; n as usize];
                    self.read_leaf(leaf.node, local as usize, &mut buf)?;
                    match pieces.last_mut() {
                        Some(Piece::Bytes(bytes)) => bytes.extend_from_slice(&buf),
                        _ => pieces.push(Piece::Bytes(buf)),
                    }
                }
            }
            pos += n;
        }
        Ok(pieces)
    }

    // =========================================================================
    // Insertion
    // =========================================================================

    /// Inserts `pieces` into `key` at absolute position `pos`.
    ///
    /// `pos` must lie within `key`'s bounds or at their end. The leaf holding
    /// `pos - 1` is the anchor: when it belongs to `key` it is split at
    /// `pos`, otherwise `pos` starts the file and new leaves go after the
    /// previous file's last leaf.
    pub(crate) fn insert_pieces(&mut self, stack: &mut TreeStack, key: Key, pos: u64, pieces: Vec<Piece>) -> ArborResult<()> {
        let total: u64 = pieces.iter().map(Piece::len).sum();
        if total == 0 {
            return Ok(());
        }
        let max = self.config.max_leaf_byte_size as u64;
        let simple = pieces.iter().all(|p| !matches!(p, Piece::Leaf { .. }));

        let anchor = stack.setup_for_position(self, pos - 1)?;
        let mut cursor = pos;
        let mut queue: VecDeque<Piece> = VecDeque::new();
        let mut tail = Vec::new();

        if anchor.key == key {
            let local = (pos - anchor.offset) as usize;
            if simple && anchor.size + total <= max {
                return stack.shift_leaf(self, local, &pieces);
            }
            tail = stack.split_leaf(self, local)?;
            queue.extend(pieces);
            let head = take_front(&mut queue, max.saturating_sub(local as u64));
            if !head.is_empty() {
                stack.shift_leaf(self, local, &head)?;
                cursor += head.iter().map(Piece::len).sum::<u64>();
            }
        } else {
            let (_, end) = self.file_bounds(key)?;
            if simple && pos < end {
                let first = stack.setup_for_position(self, pos)?;
                if first.key == key && first.size + total <= max {
                    return stack.shift_leaf(self, 0, &pieces);
                }
            }
            queue.extend(pieces);
        }

        for piece in queue {
            match piece {
                Piece::Bytes(bytes) => {
                    for chunk in bytes.chunks(max as usize) {
                        let id = self.heap.create_leaf(key, chunk.to_vec());
                        self.append_leaf(stack, key, &mut cursor, id, chunk.len() as u64)?;
                    }
                }
                Piece::Fill(mut count) => {
                    while count > 0 {
                        let len = count.min(max);
                        self.append_leaf(stack, key, &mut cursor, NodeId::sparse(0, len as u32), len)?;
                        count -= len;
                    }
                }
                Piece::Leaf { node, size } => self.append_leaf(stack, key, &mut cursor, node, size)?,
            }
        }
        if !tail.is_empty() {
            let size = tail.len() as u64;
            let id = self.heap.create_leaf(key, tail);
            self.append_leaf(stack, key, &mut cursor, id, size)?;
        }
        Ok(())
    }

    fn append_leaf(&mut self, stack: &mut TreeStack, key: Key, cursor: &mut u64, node: NodeId, size: u64) -> ArborResult<()> {
        stack.setup_for_position(self, *cursor - 1)?;
        stack.insert_leaf_after(self, key, node, size)?;
        *cursor += size;
        Ok(())
    }
}

/// Pops up to `room` bytes of byte and fill pieces off the front of `queue`.
fn take_front(queue: &mut VecDeque<Piece>, mut room: u64) -> Vec<Piece> {
    let mut out = Vec::new();
    while room > 0 {
        match queue.front_mut() {
            Some(Piece::Bytes(bytes)) if bytes.len() as u64 > room => {
                let rest = bytes.split_off(room as usize);
                out.push(Piece::Bytes(std::mem::replace(bytes, rest)));
                room = 0;
            }
            Some(Piece::Fill(count)) if *count > room => {
                *count -= room;
                out.push(Piece::Fill(room));
                room = 0;
            }
            Some(Piece::Bytes(_) | Piece::Fill(_)) => {
                if let Some(piece) = queue.pop_front() {
                    room -= piece.len();
                    out.push(piece);
                }
            }
            _ => break,
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_take_front_splits_bytes() {
        let mut queue = VecDeque::from(vec![Piece::Bytes(vec![1, 2, 3, 4]), Piece::Fill(10)]);
        let head = take_front(&mut queue, 3);
        assert_eq!(head, vec![Piece::Bytes(vec![1, 2, 3])]);
        assert_eq!(queue.front(), Some(&Piece::Bytes(vec![4])));
    }

    #[test]
    fn test_take_front_spans_pieces() {
        let mut queue = VecDeque::from(vec![Piece::Bytes(vec![1, 2]), Piece::Fill(10)]);
        let head = take_front(&mut queue, 5);
        assert_eq!(head, vec![Piece::Bytes(vec![1, 2]), Piece::Fill(3)]);
        assert_eq!(queue.front(), Some(&Piece::Fill(7)));
    }

    #[test]
    fn test_take_front_stops_at_leaf() {
        let leaf = Piece::Leaf { node: NodeId::sparse(0, 4), size: 4 };
        let mut queue = VecDeque::from(vec![leaf.clone(), Piece::Bytes(vec![1])]);
        assert!(take_front(&mut queue, 100).is_empty());
        assert_eq!(queue.len(), 2);
    }
}

//! Operations over every file in a key range.

use arbor_common::error::ArborResult;
use arbor_common::types::Key;

use crate::stack::TreeStack;
use crate::transaction::core::TxCore;
use crate::transaction::Transaction;

/// The files with keys in `[min, max]`.
///
/// [`Key::HEAD`] as the minimum or [`Key::TAIL`] as the maximum leave that
/// end of the range open.
#[derive(Debug)]
pub struct DataRange<'a> {
    tx: &'a mut Transaction,
    min: Key,
    max: Key,
}

impl<'a> DataRange<'a> {
    pub(crate) fn new(tx: &'a mut Transaction, min: Key, max: Key) -> Self {
        Self { tx, min, max }
    }

    /// Lower bound, inclusive.
    pub fn min(&self) -> Key {
        self.min
    }

    /// Upper bound, inclusive.
    pub fn max(&self) -> Key {
        self.max
    }

    /// Keys of the files in the range, in order.
    pub fn keys(&mut self) -> ArborResult<Vec<Key>> {
        let (min, max) = (self.min, self.max);
        self.tx.run(false, |core, stack| range_keys(core, stack, min, max))
    }

    /// Number of files in the range.
    pub fn key_count(&mut self) -> ArborResult<usize> {
        Ok(self.keys()?.len())
    }

    /// Total bytes of every file in the range.
    pub fn size(&mut self) -> ArborResult<u64> {
        let (min, max) = (self.min, self.max);
        self.tx.run(false, |core, _| {
            let (start, end) = range_bounds(core, min, max)?;
            Ok(end - start)
        })
    }

    /// Key of the first file, if any.
    pub fn first_key(&mut self) -> ArborResult<Option<Key>> {
        let (min, max) = (self.min, self.max);
        self.tx.run(false, |core, stack| {
            let (start, end) = range_bounds(core, min, max)?;
            if start == end {
                return Ok(None);
            }
            Ok(Some(stack.setup_for_position(core, start)?.key))
        })
    }

    /// Key of the last file, if any.
    pub fn last_key(&mut self) -> ArborResult<Option<Key>> {
        let (min, max) = (self.min, self.max);
        self.tx.run(false, |core, stack| {
            let (start, end) = range_bounds(core, min, max)?;
            if start == end {
                return Ok(None);
            }
            Ok(Some(stack.setup_for_position(core, end - 1)?.key))
        })
    }

    /// Deletes every file in the range.
    pub fn delete(&mut self) -> ArborResult<()> {
        let (min, max) = (self.min, self.max);
        self.tx.run(true, |core, stack| {
            let (start, end) = range_bounds(core, min, max)?;
            core.remove_range(stack, start, end)?;
            core.size_changed(min);
            Ok(())
        })
    }

    /// Makes every file of the range in `target` equal to its content here,
    /// returning the number of files copied. Files of `target` in the range
    /// that do not exist here are left alone.
    pub fn replicate_to(&mut self, target: &mut Transaction) -> ArborResult<usize> {
        let keys = self.keys()?;
        self.tx.replicate_keys(&keys, target)?;
        Ok(keys.len())
    }
}

/// Absolute `[start, end)` covered by the files in `[min, max]`.
fn range_bounds(core: &mut TxCore, min: Key, max: Key) -> ArborResult<(u64, u64)> {
    let start = if min == Key::HEAD {
        core.file_bounds(Key::HEAD)?.1
    } else {
        core.file_bounds(min)?.0
    };
    let end = if max == Key::TAIL {
        core.file_bounds(Key::TAIL)?.0
    } else {
        core.file_bounds(max)?.1
    };
    Ok((start, end.max(start)))
}

fn range_keys(core: &mut TxCore, stack: &mut TreeStack, min: Key, max: Key) -> ArborResult<Vec<Key>> {
    let (start, end) = range_bounds(core, min, max)?;
    let mut keys = Vec::new();
    let mut pos = start;
    while pos < end {
        let key = stack.setup_for_position(core, pos)?.key;
        keys.push(key);
        pos = core.file_bounds(key)?.1;
    }
    Ok(keys)
}

//! Positioned access to one file.

use arbor_common::error::{ArborError, ArborResult};
use arbor_common::types::Key;

use crate::transaction::{check_user_key, AccessMode, Transaction};

/// A byte file named by a key, seen through a transaction.
///
/// Reads and writes start at the current position and advance it. The
/// file exists while it holds at least one byte.
///
/// ```text
///   file K     |0 . . . . . . . . . . . length)
///                      ^ position
///   write(4)   |0 . . . . . . [x x x x] . . .)   position += 4
///   shift(3)   |0 . . . . . . [0 0 0] . . . .)   length += 3
/// ```
#[derive(Debug)]
pub struct DataFile<'a> {
    tx: &'a mut Transaction,
    key: Key,
    mode: AccessMode,
    position: u64,
}

impl<'a> DataFile<'a> {
    pub(crate) fn new(tx: &'a mut Transaction, key: Key, mode: AccessMode) -> Self {
        Self {
            tx,
            key,
            mode,
            position: 0,
        }
    }

    /// The file's key.
    pub fn key(&self) -> Key {
        self.key
    }

    /// The access mode the file was opened with.
    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    /// Current position.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Moves the position. Positions past the end are rejected by the next
    /// read or write.
    pub fn set_position(&mut self, position: u64) {
        self.position = position;
    }

    /// Length in bytes.
    pub fn length(&mut self) -> ArborResult<u64> {
        let key = self.key;
        self.tx.run(false, |core, _| core.file_length(key))
    }

    /// Whether the file holds any bytes.
    pub fn exists(&mut self) -> ArborResult<bool> {
        Ok(self.length()? > 0)
    }

    /// Fills `buf` from the current position.
    pub fn read(&mut self, buf: &mut [u8]) -> ArborResult<()> {
        let (key, pos) = (self.key, self.position);
        self.tx.run(false, |core, stack| core.read_file(stack, key, pos, buf))?;
        self.position += buf.len() as u64;
        Ok(())
    }

    /// Reads `len` bytes from the current position.
    pub fn read_vec(&mut self, len: usize) -> ArborResult<Vec<u8>> {
        let mut buf = vec![0; len];
        self.read(&mut buf)?;
        Ok(buf)
    }

    /// Writes `data` at the current position, growing the file when the
    /// write runs past its end.
    pub fn write(&mut self, data: &[u8]) -> ArborResult<()> {
        self.check_writable()?;
        let (key, pos) = (self.key, self.position);
        self.tx.run(true, |core, stack| core.write_file(stack, key, pos, data))?;
        self.position += data.len() as u64;
        Ok(())
    }

    /// Truncates or zero-extends the file to `length` bytes.
    pub fn set_length(&mut self, length: u64) -> ArborResult<()> {
        self.check_writable()?;
        let key = self.key;
        self.tx.run(true, |core, stack| core.set_file_length(stack, key, length))
    }

    /// At the current position, inserts `delta` zero bytes when positive or
    /// removes `-delta` bytes when negative.
    pub fn shift(&mut self, delta: i64) -> ArborResult<()> {
        self.check_writable()?;
        let (key, pos) = (self.key, self.position);
        self.tx.run(true, |core, stack| core.shift_file(stack, key, pos, delta))
    }

    /// Removes every byte of the file.
    pub fn delete(&mut self) -> ArborResult<()> {
        self.check_writable()?;
        let key = self.key;
        self.tx.run(true, |core, stack| core.delete_file(stack, key))?;
        self.position = 0;
        Ok(())
    }

    /// Inserts `len` bytes from the current position into file `target` at
    /// `target_pos`.
    pub fn copy_to(&mut self, target: Key, target_pos: u64, len: u64) -> ArborResult<()> {
        self.check_writable()?;
        check_user_key(target)?;
        let (key, pos) = (self.key, self.position);
        self.tx
            .run(true, |core, stack| core.copy_data(stack, key, pos, target, target_pos, len))
    }

    fn check_writable(&self) -> ArborResult<()> {
        match self.mode {
            AccessMode::ReadWrite => Ok(()),
            AccessMode::Read => Err(ArborError::ReadOnly { what: "file" }),
        }
    }
}

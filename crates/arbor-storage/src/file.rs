//! File-backed area store.
//!
//! Every mutation is appended to a single checksummed log:
//!
//! ```text
//! ┌──────────┬──────────┬──────────┬────────┬──────────────────┐
//! │ magic u32│ len u32  │ crc32 u32│ op u8  │ body (len-1)     │
//! └──────────┴──────────┴──────────┴────────┴──────────────────┘
//! ```
//!
//! | op | body                               |
//! |----|------------------------------------|
//! | 1  | put: id u64, area bytes            |
//! | 2  | write: id u64, offset u32, bytes   |
//! | 3  | delete: id u64                     |
//! | 4  | header: id u64                     |
//! | 5  | next id: u64                       |
//!
//! Opening the store replays the log into memory. A record that is cut
//! short or fails its checksum marks the end of the durable prefix: the
//! file is truncated there, which drops exactly the writes that were not
//! covered by a checkpoint when the process died. Reads are served from
//! memory.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use arbor_common::error::{ArborError, ArborResult};
use arbor_common::types::AreaId;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::area::{AreaStore, WriteGuard};

/// Name of the area log inside the store directory.
pub const LOG_FILE: &str = "areas.log";

/// Temporary name used while compacting the log.
pub const LOG_FILE_TMP: &str = "areas.log.tmp";

/// Magic number at the start of every log record ("AREA").
const RECORD_MAGIC: u32 = 0x4152_4541;

/// magic + len + crc
const RECORD_HEADER_SIZE: usize = 12;

const OP_PUT: u8 = 1;
const OP_WRITE: u8 = 2;
const OP_DELETE: u8 = 3;
const OP_HEADER: u8 = 4;
const OP_NEXT_ID: u8 = 5;

/// Configuration for a [`FileAreaStore`].
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Directory holding the area log.
    pub dir: PathBuf,
    /// Whether checkpoints fsync the log.
    pub sync_writes: bool,
}

impl StoreConfig {
    /// Creates a configuration for the given directory with synced checkpoints.
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            sync_writes: true,
        }
    }

    /// Enables or disables fsync on checkpoint.
    pub fn with_sync_writes(mut self, sync: bool) -> Self {
        self.sync_writes = sync;
        self
    }
}

/// State rebuilt from the log.
#[derive(Default)]
struct Replayed {
    areas: HashMap<AreaId, Bytes>,
    header: Option<AreaId>,
    next_id: u64,
    valid_len: u64,
    records: usize,
}

/// An [`AreaStore`] persisted in an append-only, checksummed log file.
pub struct FileAreaStore {
    config: StoreConfig,
    areas: RwLock<HashMap<AreaId, Bytes>>,
    next_id: AtomicU64,
    header: RwLock<Option<AreaId>>,
    log: Mutex<BufWriter<File>>,
    write_lock: Mutex<()>,
}

impl FileAreaStore {
    /// Opens the store in `config.dir`, creating it if needed.
    pub fn open(config: StoreConfig) -> ArborResult<Self> {
        fs::create_dir_all(&config.dir)?;
        let path = config.dir.join(LOG_FILE);

        let replayed = if path.exists() {
            let mut data = Vec::new();
            File::open(&path)?.read_to_end(&mut data)?;
            let replayed = replay(&data)?;
            if replayed.valid_len < data.len() as u64 {
                warn!(
                    path = %path.display(),
                    valid = replayed.valid_len,
                    total = data.len(),
                    "truncating torn area log tail"
                );
                let file = OpenOptions::new().write(true).open(&path)?;
                file.set_len(replayed.valid_len)?;
                file.sync_all()?;
            }
            replayed
        } else {
            Replayed::default()
        };

        debug!(
            path = %path.display(),
            areas = replayed.areas.len(),
            records = replayed.records,
            "opened area log"
        );

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            config,
            areas: RwLock::new(replayed.areas),
            next_id: AtomicU64::new(replayed.next_id),
            header: RwLock::new(replayed.header),
            log: Mutex::new(BufWriter::new(file)),
            write_lock: Mutex::new(()),
        })
    }

    /// Opens a store in `dir` with default settings.
    pub fn open_dir<P: AsRef<Path>>(dir: P) -> ArborResult<Self> {
        Self::open(StoreConfig::new(dir))
    }

    /// Returns the store configuration.
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Rewrites the log so it holds only live areas.
    ///
    /// Uses atomic file replacement: write to a temp file, sync, rename.
    pub fn compact(&self) -> ArborResult<()> {
        let _guard = self.write_lock.lock();
        let mut log = self.log.lock();
        log.flush()?;

        let tmp_path = self.config.dir.join(LOG_FILE_TMP);
        let path = self.config.dir.join(LOG_FILE);
        {
            let mut out = BufWriter::new(
                OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(&tmp_path)?,
            );
            let mut body = BytesMut::new();
            body.put_u64(self.next_id.load(Ordering::SeqCst));
            write_record(&mut out, OP_NEXT_ID, &body)?;
            if let Some(header) = *self.header.read() {
                let mut body = BytesMut::new();
                body.put_u64(header.as_u64());
                write_record(&mut out, OP_HEADER, &body)?;
            }
            for (id, data) in self.areas.read().iter() {
                let mut body = BytesMut::with_capacity(8 + data.len());
                body.put_u64(id.as_u64());
                body.put_slice(data);
                write_record(&mut out, OP_PUT, &body)?;
            }
            out.flush()?;
            out.get_ref().sync_all()?;
        }
        fs::rename(&tmp_path, &path)?;
        if let Ok(dir) = File::open(&self.config.dir) {
            let _ = dir.sync_all();
        }

        let file = OpenOptions::new().append(true).open(&path)?;
        *log = BufWriter::new(file);
        debug!(path = %path.display(), "compacted area log");
        Ok(())
    }

    fn append(&self, op: u8, body: &[u8]) -> ArborResult<()> {
        let mut log = self.log.lock();
        write_record(&mut *log, op, body)
    }
}

impl Drop for FileAreaStore {
    fn drop(&mut self) {
        let _ = self.log.lock().flush();
    }
}

fn write_record<W: Write>(out: &mut W, op: u8, body: &[u8]) -> ArborResult<()> {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&[op]);
    hasher.update(body);
    let crc = hasher.finalize();

    let mut header = [0u8; RECORD_HEADER_SIZE + 1];
    header[0..4].copy_from_slice(&RECORD_MAGIC.to_be_bytes());
    header[4..8].copy_from_slice(&(body.len() as u32 + 1).to_be_bytes());
    header[8..12].copy_from_slice(&crc.to_be_bytes());
    header[12] = op;
    out.write_all(&header)?;
    out.write_all(body)?;
    Ok(())
}

/// Replays log records until the first incomplete or corrupt record.
fn replay(data: &[u8]) -> ArborResult<Replayed> {
    let mut state = Replayed::default();
    let mut offset = 0usize;

    while data.len() - offset >= RECORD_HEADER_SIZE {
        let mut header = &data[offset..offset + RECORD_HEADER_SIZE];
        let magic = header.get_u32();
        let len = header.get_u32() as usize;
        let crc = header.get_u32();
        let start = offset + RECORD_HEADER_SIZE;
        if magic != RECORD_MAGIC || len == 0 || data.len() - start < len {
            break;
        }
        let payload = &data[start..start + len];
        if crc32fast::hash(payload) != crc {
            break;
        }
        apply(&mut state, payload[0], &payload[1..])?;
        offset = start + len;
        state.records += 1;
    }

    state.valid_len = offset as u64;
    Ok(state)
}

fn apply(state: &mut Replayed, op: u8, mut body: &[u8]) -> ArborResult<()> {
    let truncated = || ArborError::corruption(format!("truncated area log record (op {op})"));
    if body.len() < 8 {
        return Err(truncated());
    }
    let id = AreaId::new(body.get_u64());
    match op {
        OP_PUT => {
            state.areas.insert(id, Bytes::copy_from_slice(body));
            state.next_id = state.next_id.max(id.as_u64() + 1);
        }
        OP_WRITE => {
            if body.len() < 4 {
                return Err(truncated());
            }
            let at = body.get_u32() as usize;
            let area = state
                .areas
                .get_mut(&id)
                .ok_or(ArborError::AreaNotFound { area: id })?;
            if at + body.len() > area.len() {
                return Err(ArborError::corruption(format!(
                    "logged write beyond area {id}"
                )));
            }
            let mut updated = BytesMut::from(&area[..]);
            updated[at..at + body.len()].copy_from_slice(body);
            *area = updated.freeze();
        }
        OP_DELETE => {
            state.areas.remove(&id);
            state.next_id = state.next_id.max(id.as_u64() + 1);
        }
        OP_HEADER => state.header = Some(id),
        OP_NEXT_ID => state.next_id = state.next_id.max(id.as_u64()),
        other => {
            return Err(ArborError::corruption(format!(
                "unknown area log op {other}"
            )))
        }
    }
    Ok(())
}

impl AreaStore for FileAreaStore {
    fn allocate_area(&self, _size: usize) -> ArborResult<AreaId> {
        let id = AreaId::new(self.next_id.fetch_add(1, Ordering::SeqCst));
        if id > AreaId::MAX {
            return Err(ArborError::OutOfMemory {
                message: "area id space exhausted".into(),
            });
        }
        Ok(id)
    }

    fn finish_area(&self, id: AreaId, data: Bytes) -> ArborResult<()> {
        let mut body = BytesMut::with_capacity(8 + data.len());
        body.put_u64(id.as_u64());
        body.put_slice(&data);
        self.append(OP_PUT, &body)?;
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
        let mut body = BytesMut::with_capacity(12 + data.len());
        body.put_u64(id.as_u64());
        body.put_u32(offset as u32);
        body.put_slice(data);
        self.append(OP_WRITE, &body)?;

        let mut updated = BytesMut::from(&area[..]);
        updated[offset..offset + data.len()].copy_from_slice(data);
        *area = updated.freeze();
        Ok(())
    }

    fn delete_area(&self, id: AreaId) -> ArborResult<()> {
        if !self.areas.read().contains_key(&id) {
            return Err(ArborError::AreaNotFound { area: id });
        }
        self.append(OP_DELETE, &id.as_u64().to_be_bytes())?;
        self.areas.write().remove(&id);
        Ok(())
    }

    fn header_area(&self) -> Option<AreaId> {
        *self.header.read()
    }

    fn set_header_area(&self, id: AreaId) -> ArborResult<()> {
        self.append(OP_HEADER, &id.as_u64().to_be_bytes())?;
        *self.header.write() = Some(id);
        Ok(())
    }

    fn checkpoint(&self) -> ArborResult<()> {
        let mut log = self.log.lock();
        log.flush()?;
        if self.config.sync_writes {
            log.get_ref().sync_data()?;
        }
        Ok(())
    }

    fn lock_for_write(&self) -> WriteGuard<'_> {
        WriteGuard::new(self.write_lock.lock())
    }

    fn area_count(&self) -> usize {
        self.areas.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::area::AreaStoreExt;
    use tempfile::TempDir;

    fn put(store: &FileAreaStore, data: &[u8]) -> AreaId {
        let mut writer = store.create_area(data.len()).unwrap();
        writer.put_slice(data);
        writer.finish().unwrap()
    }

    #[test]
    fn test_reopen_restores_areas() {
        let tmp = TempDir::new().unwrap();
        let (a, b);
        {
            let store = FileAreaStore::open_dir(tmp.path()).unwrap();
            a = put(&store, b"alpha");
            b = put(&store, b"beta");
            store.write_area(a, 0, b"A").unwrap();
            store.set_header_area(b).unwrap();
            store.checkpoint().unwrap();
        }

        let store = FileAreaStore::open_dir(tmp.path()).unwrap();
        assert_eq!(&store.get_area(a).unwrap()[..], b"Alpha");
        assert_eq!(&store.get_area(b).unwrap()[..], b"beta");
        assert_eq!(store.header_area(), Some(b));

        // New ids never collide with replayed ones
        let c = put(&store, b"gamma");
        assert!(c > b);
    }

    #[test]
    fn test_delete_survives_reopen() {
        let tmp = TempDir::new().unwrap();
        let a;
        {
            let store = FileAreaStore::open_dir(tmp.path()).unwrap();
            a = put(&store, b"gone");
            store.delete_area(a).unwrap();
            store.checkpoint().unwrap();
        }
        let store = FileAreaStore::open_dir(tmp.path()).unwrap();
        assert!(store.get_area(a).is_err());
        assert_eq!(store.area_count(), 0);
        assert!(put(&store, b"new") > a);
    }

    #[test]
    fn test_torn_tail_is_truncated() {
        let tmp = TempDir::new().unwrap();
        let a;
        {
            let store = FileAreaStore::open_dir(tmp.path()).unwrap();
            a = put(&store, b"kept");
            store.checkpoint().unwrap();
        }
        let path = tmp.path().join(LOG_FILE);
        let good_len = fs::metadata(&path).unwrap().len();
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(&RECORD_MAGIC.to_be_bytes()).unwrap();
            file.write_all(&[0, 0, 0, 40, 1, 2]).unwrap();
        }

        let store = FileAreaStore::open_dir(tmp.path()).unwrap();
        assert_eq!(&store.get_area(a).unwrap()[..], b"kept");
        assert_eq!(fs::metadata(&path).unwrap().len(), good_len);
    }

    #[test]
    fn test_corrupt_record_stops_replay() {
        let tmp = TempDir::new().unwrap();
        let (a, b);
        {
            let store = FileAreaStore::open_dir(tmp.path()).unwrap();
            a = put(&store, b"first");
            b = put(&store, b"second");
            store.checkpoint().unwrap();
        }
        let path = tmp.path().join(LOG_FILE);
        let mut data = fs::read(&path).unwrap();
        let last = data.len() - 1;
        data[last] ^= 0xFF;
        fs::write(&path, &data).unwrap();

        let store = FileAreaStore::open_dir(tmp.path()).unwrap();
        assert!(store.get_area(a).is_ok());
        assert!(store.get_area(b).is_err());
    }

    #[test]
    fn test_compact_keeps_live_areas() {
        let tmp = TempDir::new().unwrap();
        let (a, b);
        {
            let store = FileAreaStore::open_dir(tmp.path()).unwrap();
            a = put(&store, &[7u8; 1024]);
            b = put(&store, b"small");
            store.delete_area(a).unwrap();
            store.set_header_area(b).unwrap();
            let before = {
                store.checkpoint().unwrap();
                fs::metadata(tmp.path().join(LOG_FILE)).unwrap().len()
            };
            store.compact().unwrap();
            let after = fs::metadata(tmp.path().join(LOG_FILE)).unwrap().len();
            assert!(after < before);
            put(&store, b"after-compact");
            store.checkpoint().unwrap();
        }
        let store = FileAreaStore::open_dir(tmp.path()).unwrap();
        assert_eq!(store.area_count(), 2);
        assert_eq!(store.header_area(), Some(b));
        assert!(put(&store, b"x") > b);
    }
}

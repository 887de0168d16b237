//! Durable ordered key/value store backed by an append-only log file
//!
//! File format:
//! ```text
//! [HEADER: 64 bytes]
//!   - magic: 8 bytes ("HOWTO_KV")
//!   - version: 4 bytes (u32 LE)
//!   - reserved: 52 bytes
//!
//! [RECORDS: variable]
//!   - length: 4 bytes (u32 LE)
//!   - checksum: 32 bytes (BLAKE3 of payload)
//!   - payload: bincode-encoded Batch
//! ```
//!
//! Every batch is one record: it is appended and flushed to disk before any of
//! its operations become visible to readers, so a batch is either entirely
//! applied or entirely absent. The whole log is replayed into an in-memory
//! ordered map on open.
//!
//! Records are always written at the end of the last committed record. A
//! write that fails partway is cut off again, and if that fails too the next
//! write lands on top of the leftover bytes, so a failed write never hides
//! the ones after it.

use crate::{Error, Result, KV_MAGIC, KV_VERSION};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::ops::Bound;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const HEADER_SIZE: u64 = 64;
const RECORD_PREFIX: usize = 4 + 32;

/// A single mutation
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Op {
    Put(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
}

/// A group of mutations applied atomically
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Batch {
    ops: Vec<Op>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> &mut Self {
        self.ops.push(Op::Put(key.into(), value.into()));
        self
    }

    pub fn delete(&mut self, key: impl Into<Vec<u8>>) -> &mut Self {
        self.ops.push(Op::Delete(key.into()));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }
}

type Map = BTreeMap<Vec<u8>, Vec<u8>>;

/// An ordered key/value store persisted as a log of batches
pub struct KvStore {
    path: PathBuf,
    /// Held across write + apply so log order is apply order
    log: Mutex<LogFile>,
    map: RwLock<Map>,
}

struct LogFile {
    file: File,
    /// Length of the log up to the end of the last committed record
    end: u64,
}

impl KvStore {
    /// Open the log at `path`, creating it if it does not exist
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        if file.metadata()?.len() == 0 {
            write_header(&mut file)?;
        }

        let map = replay(&mut file, &path)?;
        let end = file.seek(SeekFrom::End(0))?;
        debug!(path = %path.display(), entries = map.len(), "opened index log");

        Ok(KvStore {
            path,
            log: Mutex::new(LogFile { file, end }),
            map: RwLock::new(map),
        })
    }

    /// Durably apply a batch
    pub fn write(&self, batch: Batch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let record = encode_record(&bincode::serialize(&batch)?)?;

        let mut log = self.log.lock();
        let LogFile { file, end } = &mut *log;
        let start = *end;
        let written = file
            .seek(SeekFrom::Start(start))
            .and_then(|_| file.write_all(&record))
            .and_then(|()| file.sync_data());
        if let Err(err) = written {
            if let Err(undo) = file.set_len(start) {
                warn!(%undo, offset = start, "could not cut off a failed index record");
            }
            return Err(err.into());
        }
        *end = start + record.len() as u64;

        let mut map = self.map.write();
        apply(&mut map, batch);
        Ok(())
    }

    pub fn put(&self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Result<()> {
        let mut batch = Batch::new();
        batch.put(key, value);
        self.write(batch)
    }

    pub fn delete(&self, key: impl Into<Vec<u8>>) -> Result<()> {
        let mut batch = Batch::new();
        batch.delete(key);
        self.write(batch)
    }

    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.map.read().get(key).cloned()
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.map.read().contains_key(key)
    }

    /// Snapshot of all entries whose key starts with `prefix`, ascending
    pub fn scan_prefix(&self, prefix: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
        let map = self.map.read();
        map.range::<[u8], _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Whether any key starts with `prefix`
    pub fn has_prefix(&self, prefix: &[u8]) -> bool {
        let map = self.map.read();
        map.range::<[u8], _>((Bound::Included(prefix), Bound::Unbounded))
            .next()
            .is_some_and(|(k, _)| k.starts_with(prefix))
    }

    /// Delete every key under `prefix` in one batch
    pub fn delete_prefix(&self, prefix: &[u8]) -> Result<usize> {
        let mut batch = Batch::new();
        for (key, _) in self.scan_prefix(prefix) {
            batch.delete(key);
        }
        let count = batch.len();
        self.write(batch)?;
        Ok(count)
    }

    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }

    /// Rewrite the log so it holds only live entries
    pub fn compact(&self) -> Result<()> {
        let mut log = self.log.lock();
        let map = self.map.read();

        let temp_path = self.path.with_extension("compact");
        let mut temp = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)?;
        write_header(&mut temp)?;

        let mut batch = Batch::new();
        for (k, v) in map.iter() {
            batch.put(k.clone(), v.clone());
        }
        if !batch.is_empty() {
            temp.write_all(&encode_record(&bincode::serialize(&batch)?)?)?;
        }
        temp.sync_all()?;
        fs::rename(&temp_path, &self.path)?;

        let end = temp.seek(SeekFrom::End(0))?;
        *log = LogFile { file: temp, end };
        debug!(entries = map.len(), "compacted index log");
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn write_header(file: &mut File) -> Result<()> {
    let mut header = [0u8; HEADER_SIZE as usize];
    header[0..8].copy_from_slice(KV_MAGIC);
    header[8..12].copy_from_slice(&KV_VERSION.to_le_bytes());
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&header)?;
    file.sync_all()?;
    Ok(())
}

/// Frame a serialized batch as `[len][checksum][payload]`
fn encode_record(payload: &[u8]) -> Result<Vec<u8>> {
    let len = u32::try_from(payload.len())
        .map_err(|_| Error::Config(format!("batch too large: {} bytes", payload.len())))?;
    let mut record = Vec::with_capacity(RECORD_PREFIX + payload.len());
    record.extend_from_slice(&len.to_le_bytes());
    record.extend_from_slice(blake3::hash(payload).as_bytes());
    record.extend_from_slice(payload);
    Ok(record)
}

fn apply(map: &mut Map, batch: Batch) {
    for op in batch.ops {
        match op {
            Op::Put(k, v) => {
                map.insert(k, v);
            }
            Op::Delete(k) => {
                map.remove(&k);
            }
        }
    }
}

/// Rebuild the map from the log, truncating a torn tail left by a crash
fn replay(file: &mut File, path: &Path) -> Result<Map> {
    let file_len = file.metadata()?.len();
    file.seek(SeekFrom::Start(0))?;

    let mut header = [0u8; HEADER_SIZE as usize];
    file.read_exact(&mut header)
        .map_err(|_| Error::InvalidFile(format!("{}: short header", path.display())))?;
    if &header[0..8] != KV_MAGIC {
        return Err(Error::InvalidFile(format!("{}: bad magic", path.display())));
    }
    let mut version = [0u8; 4];
    version.copy_from_slice(&header[8..12]);
    let version = u32::from_le_bytes(version);
    if version != KV_VERSION {
        return Err(Error::VersionMismatch {
            expected: KV_VERSION,
            found: version,
        });
    }

    let mut map = Map::new();
    let mut reader = BufReader::new(&mut *file);
    let mut offset = HEADER_SIZE;

    while offset < file_len {
        let mut prefix = [0u8; RECORD_PREFIX];
        if reader.read_exact(&mut prefix).is_err() {
            break;
        }
        let mut len = [0u8; 4];
        len.copy_from_slice(&prefix[0..4]);
        let len = u32::from_le_bytes(len) as u64;
        if offset + RECORD_PREFIX as u64 + len > file_len {
            break;
        }

        let mut payload = vec![0u8; len as usize];
        reader.read_exact(&mut payload)?;
        if blake3::hash(&payload).as_bytes() != &prefix[4..] {
            break;
        }

        let batch: Batch = bincode::deserialize(&payload)
            .map_err(|e| Error::Corrupt(format!("{}: record at {}: {}", path.display(), offset, e)))?;
        apply(&mut map, batch);
        offset += RECORD_PREFIX as u64 + len;
    }
    drop(reader);

    if offset < file_len {
        warn!(
            path = %path.display(),
            offset,
            discarded = file_len - offset,
            "truncating torn record at end of index log"
        );
        file.set_len(offset)?;
        file.sync_all()?;
    }

    Ok(map)
}

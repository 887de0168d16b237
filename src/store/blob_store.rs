//! Directory-backed content-addressed blob store
//!
//! Layout:
//! ```text
//! <root>/
//!   ab/
//!     cdef...   (encoding byte + body; file name is the rest of the hex hash)
//! ```
//!
//! Blobs are immutable once written. A write lands in a temp file next to its
//! final location and is renamed into place after `fsync`, so a reader never
//! observes a partially written blob.

use crate::model::Hash;
use crate::store::blob::{Blob, Encoding};
use crate::{Error, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

const TEMP_SUFFIX: &str = ".tmp";

/// A content-addressed store of immutable byte blobs
pub struct BlobStore {
    root: PathBuf,
    encoding: Encoding,
    temp_counter: AtomicU64,
}

impl BlobStore {
    /// Open (creating if needed) a blob store rooted at `root`
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(BlobStore {
            root,
            encoding: Encoding::Zstd,
            temp_counter: AtomicU64::new(0),
        })
    }

    /// Store blobs with a different encoding
    pub fn with_encoding(mut self, encoding: Encoding) -> Self {
        self.encoding = encoding;
        self
    }

    fn path_for(&self, hash: &Hash) -> PathBuf {
        let (dir, file) = hash.fanout();
        self.root.join(dir).join(file)
    }

    /// Store `data`, returning its hash. Writing content that is already
    /// present is a no-op.
    pub fn put(&self, data: &[u8]) -> Result<Hash> {
        let blob = Blob::new(data.to_vec());
        self.put_blob(&blob)?;
        Ok(blob.hash)
    }

    /// Store everything read from `reader`
    pub fn put_reader(&self, mut reader: impl Read) -> Result<Hash> {
        let mut data = Vec::new();
        reader.read_to_end(&mut data)?;
        let blob = Blob::new(data);
        self.put_blob(&blob)?;
        Ok(blob.hash)
    }

    /// Store a blob whose hash has already been computed
    pub fn put_blob(&self, blob: &Blob) -> Result<()> {
        let path = self.path_for(&blob.hash);
        if path.exists() {
            return Ok(());
        }

        let dir = path
            .parent()
            .ok_or_else(|| Error::Config(format!("bad blob path {}", path.display())))?;
        fs::create_dir_all(dir)?;

        let temp = dir.join(format!(
            "{}.{}.{}{}",
            blob.hash.short(),
            std::process::id(),
            self.temp_counter.fetch_add(1, Ordering::Relaxed),
            TEMP_SUFFIX
        ));

        let encoded = blob.encode(self.encoding)?;
        let written = (|| -> Result<()> {
            let mut file = OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&temp)?;
            file.write_all(&encoded)?;
            file.sync_all()?;
            fs::rename(&temp, &path)?;
            sync_dir(dir)
        })();

        if written.is_err() {
            let _ = fs::remove_file(&temp);
        } else {
            debug!(hash = %blob.hash.short(), size = blob.size(), "stored blob");
        }
        written
    }

    /// Retrieve verified content by hash
    pub fn get(&self, hash: &Hash) -> Result<Vec<u8>> {
        Ok(self.get_blob(hash)?.data)
    }

    pub fn get_blob(&self, hash: &Hash) -> Result<Blob> {
        let path = self.path_for(hash);
        let mut stored = Vec::new();
        match File::open(&path) {
            Ok(mut file) => {
                file.read_to_end(&mut stored)?;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::NotFound(hash.to_hex()));
            }
            Err(e) => return Err(e.into()),
        }
        Blob::decode(hash, &stored)
    }

    /// A reader over verified content
    pub fn open_reader(&self, hash: &Hash) -> Result<Cursor<Vec<u8>>> {
        Ok(Cursor::new(self.get(hash)?))
    }

    /// Existence check without reading the content
    pub fn has(&self, hash: &Hash) -> bool {
        self.path_for(hash).is_file()
    }

    /// All stored hashes, in no particular order
    pub fn hashes(&self) -> Result<Vec<Hash>> {
        let mut hashes = Vec::new();
        for dir in fs::read_dir(&self.root)? {
            let dir = dir?;
            if !dir.file_type()?.is_dir() {
                continue;
            }
            let prefix = dir.file_name().to_string_lossy().to_string();
            for file in fs::read_dir(dir.path())? {
                let name = file?.file_name().to_string_lossy().to_string();
                if name.ends_with(TEMP_SUFFIX) {
                    continue;
                }
                match Hash::from_hex(&format!("{}{}", prefix, name)) {
                    Ok(hash) => hashes.push(hash),
                    Err(_) => warn!(file = %name, "ignoring stray file in blob store"),
                }
            }
        }
        Ok(hashes)
    }

    /// Re-read every blob and report the ones that fail verification
    pub fn scrub(&self) -> Result<Vec<Hash>> {
        let mut corrupt = Vec::new();
        for hash in self.hashes()? {
            match self.get_blob(&hash) {
                Ok(_) => {}
                Err(Error::Corrupt(reason)) => {
                    warn!(%reason, "corrupt blob");
                    corrupt.push(hash);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(corrupt)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> Result<()> {
    File::open(dir)?.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> Result<()> {
    Ok(())
}

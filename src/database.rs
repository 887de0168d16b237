//! High-level Store API
//!
//! This module provides the main entry point for interacting with a howto
//! data directory: the blob store, the revision index and the search index
//! wired together, plus replication with a peer.

use crate::model::{Hash, Heads, Revision};
use crate::replicate::{Mode, ReplicationOutcome, Replicator};
use crate::revision::{Applied, History, RevisionIndex};
use crate::search::{SearchHit, SearchIndex};
use crate::store::{BlobStore, Encoding, KvStore};
use crate::{Error, Result};
use serde::Serialize;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

const BLOB_DIR: &str = "blob";
const INDEX_FILE: &str = "index.db";

/// Tunables for a store
#[derive(Clone, Debug)]
pub struct StoreOptions {
    /// How many recent hashes a replication manifest carries besides the heads
    pub manifest_recent: usize,
    /// Encoding for newly written blobs
    pub encoding: Encoding,
}

impl Default for StoreOptions {
    fn default() -> Self {
        StoreOptions {
            manifest_recent: 256,
            encoding: Encoding::Zstd,
        }
    }
}

/// Parameters of [`Store::write`]
#[derive(Clone, Debug, Default)]
pub struct WriteOptions {
    /// Key to record under; inherited from `prev` when omitted
    pub key: Option<String>,
    /// Head being superseded
    pub prev: Option<Hash>,
    /// Tags; inherited from `prev` when empty
    pub tags: Vec<String>,
}

impl WriteOptions {
    pub fn key(key: impl Into<String>) -> Self {
        WriteOptions {
            key: Some(key.into()),
            ..Default::default()
        }
    }

    pub fn with_prev(mut self, prev: Hash) -> Self {
        self.prev = Some(prev);
        self
    }

    pub fn with_tags(mut self, tags: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }
}

/// Counts reported by [`Store::status`]
#[derive(Clone, Debug, Serialize)]
pub struct StoreStatus {
    pub path: PathBuf,
    pub keys: usize,
    pub revisions: usize,
    pub blobs: usize,
    /// Keys with more than one head
    pub diverged: Vec<String>,
}

/// A howto data directory
///
/// Layout:
/// ```text
/// <root>/
///   blob/       content-addressed blobs
///   index.db    revision and search indices
/// ```
///
/// All operations take `&self`. Cloning is cheap and every clone refers to
/// the same open directory, so a `Store` can be handed to other tasks and
/// to blocking threads.
#[derive(Clone)]
pub struct Store {
    inner: Arc<Inner>,
}

struct Inner {
    root: PathBuf,
    blobs: BlobStore,
    kv: Arc<KvStore>,
    revisions: RevisionIndex,
    search: SearchIndex,
    options: StoreOptions,
}

impl Store {
    /// Open (creating if needed) the store at `root`
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(root, StoreOptions::default())
    }

    pub fn open_with(root: impl AsRef<Path>, options: StoreOptions) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;

        let blobs = BlobStore::open(root.join(BLOB_DIR))?.with_encoding(options.encoding);
        let kv = Arc::new(KvStore::open(root.join(INDEX_FILE))?);
        let revisions = RevisionIndex::new(kv.clone());
        let search = SearchIndex::new(kv.clone());

        if !search.is_consistent(&revisions) {
            info!(path = %root.display(), "search index missing or stale, rebuilding");
            search.rebuild(&revisions)?;
        }

        debug!(path = %root.display(), "opened store");
        Ok(Store {
            inner: Arc::new(Inner {
                root,
                blobs,
                kv,
                revisions,
                search,
                options,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.inner.root
    }

    pub fn options(&self) -> &StoreOptions {
        &self.inner.options
    }

    pub fn blobs(&self) -> &BlobStore {
        &self.inner.blobs
    }

    pub fn revisions(&self) -> &RevisionIndex {
        &self.inner.revisions
    }

    // === Blob Operations ===

    /// Store content without recording a revision
    pub fn put(&self, data: &[u8]) -> Result<Hash> {
        self.inner.blobs.put(data)
    }

    /// Verified content of `hash`
    pub fn get(&self, hash: &Hash) -> Result<Vec<u8>> {
        self.inner.blobs.get(hash)
    }

    pub fn has(&self, hash: &Hash) -> bool {
        self.inner.blobs.has(hash)
    }

    // === Revision Operations ===

    /// Record a revision of `key` whose content is already stored
    pub fn append(
        &self,
        key: &str,
        hash: Hash,
        prev: Option<Hash>,
        tags: Vec<String>,
    ) -> Result<Revision> {
        if !self.inner.blobs.has(&hash) {
            return Err(Error::NotFound(format!("blob {}", hash)));
        }
        let revision = self.inner.revisions.append(key, hash, prev, tags)?;
        if !self.inner.search.is_indexed(&revision.hash) {
            self.inner.search.index(&revision)?;
        }
        Ok(revision)
    }

    /// Store everything read from `reader` as a new revision
    ///
    /// Without an explicit key, the key of `prev` is used, and likewise its
    /// tags when none are given.
    pub fn write(&self, reader: impl Read, options: WriteOptions) -> Result<Revision> {
        let WriteOptions { key, prev, mut tags } = options;

        let parent = match prev {
            Some(prev) => Some(self.inner.revisions.revision(&prev)?),
            None => None,
        };
        let key = match (key, &parent) {
            (Some(key), _) => key,
            (None, Some(parent)) => parent.key.clone(),
            (None, None) => return Err(Error::Config("a key is required".into())),
        };
        if tags.is_empty() {
            if let Some(parent) = &parent {
                tags = parent.tags.clone();
            }
        }

        let hash = self.inner.blobs.put_reader(reader)?;
        self.append(&key, hash, prev, tags)
    }

    /// Resolve a hex hash or key name to a revision hash
    ///
    /// A key resolves to its most recent head.
    pub fn resolve(&self, target: &str) -> Result<Hash> {
        if let Ok(hash) = target.parse::<Hash>() {
            if self.inner.revisions.contains(&hash) || self.inner.blobs.has(&hash) {
                return Ok(hash);
            }
        }
        let heads = self.inner.revisions.heads(target)?;
        if heads.is_diverged() {
            warn!(key = target, heads = heads.len(), "key has diverged, reading the newest head");
        }
        heads
            .latest()
            .map(|r| r.hash)
            .ok_or_else(|| Error::NotFound(target.to_string()))
    }

    /// Verified content of a hash or of a key's latest head
    pub fn read(&self, target: &str) -> Result<Cursor<Vec<u8>>> {
        let hash = self.resolve(target)?;
        self.inner.blobs.open_reader(&hash)
    }

    pub fn revision(&self, hash: &Hash) -> Result<Revision> {
        self.inner.revisions.revision(hash)
    }

    pub fn heads(&self, key: &str) -> Result<Heads> {
        self.inner.revisions.heads(key)
    }

    pub fn history(&self, hash: Hash) -> History<'_> {
        self.inner.revisions.history(hash)
    }

    /// Known key names, sorted
    pub fn keys(&self) -> Vec<String> {
        self.inner.revisions.keys().collect()
    }

    /// Most recent revisions, newest first
    pub fn recent(&self, limit: Option<usize>) -> Result<Vec<Revision>> {
        self.inner.revisions.recent(limit).collect()
    }

    pub fn search<S: AsRef<str>>(&self, terms: &[S]) -> Result<Vec<SearchHit>> {
        self.inner.search.search(terms)
    }

    // === Maintenance ===

    /// Rebuild the search index from the revision index
    pub fn reindex(&self) -> Result<usize> {
        self.inner.search.rebuild(&self.inner.revisions)
    }

    /// Rewrite the index log with only live entries
    pub fn compact(&self) -> Result<()> {
        self.inner.kv.compact()
    }

    /// Hashes of blobs that fail verification
    pub fn scrub(&self) -> Result<Vec<Hash>> {
        self.inner.blobs.scrub()
    }

    pub fn status(&self) -> Result<StoreStatus> {
        let keys = self.keys();
        let diverged = keys
            .iter()
            .filter(|key| self.inner.revisions.head_hashes(key).len() > 1)
            .cloned()
            .collect();
        Ok(StoreStatus {
            path: self.inner.root.clone(),
            keys: keys.len(),
            revisions: self.inner.revisions.count(),
            blobs: self.inner.blobs.hashes()?.len(),
            diverged,
        })
    }

    // === Replication ===

    /// Record a revision received from a peer; its blob must already be stored
    pub fn apply_replicated(&self, revision: &Revision) -> Result<Applied> {
        if !self.inner.blobs.has(&revision.hash) {
            return Err(Error::NotFound(format!("blob {}", revision.hash)));
        }
        let applied = self.inner.revisions.apply_replicated(revision)?;
        if applied == Applied::Inserted {
            self.inner.search.index(revision)?;
        }
        Ok(applied)
    }

    /// Run one replication session with a peer over separate read and write halves
    pub async fn replicate<R, W>(&self, mode: Mode, reader: R, writer: W) -> Result<ReplicationOutcome>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        Replicator::new(self.clone(), mode).run(reader, writer).await
    }

    /// Run one replication session over a single duplex stream
    pub async fn replicate_stream<S>(&self, mode: Mode, stream: S) -> Result<ReplicationOutcome>
    where
        S: AsyncRead + AsyncWrite,
    {
        let (reader, writer) = tokio::io::split(stream);
        self.replicate(mode, reader, writer).await
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("root", &self.inner.root)
            .field("options", &self.inner.options)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_store_create_and_open() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("howto");

        let head = {
            let store = Store::open(&path).unwrap();
            store
                .write(&b"boil water"[..], WriteOptions::key("tea"))
                .unwrap()
        };

        let store = Store::open(&path).unwrap();
        assert_eq!(store.heads("tea").unwrap(), Heads::Single(head));
        assert!(path.join("blob").is_dir());
        assert!(path.join("index.db").is_file());
    }

    #[test]
    fn test_write_inherits_key_and_tags() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();

        let first = store
            .write(&b"v1"[..], WriteOptions::key("notes").with_tags(["draft"]))
            .unwrap();
        let second = store
            .write(
                &b"v2"[..],
                WriteOptions {
                    prev: Some(first.hash),
                    ..Default::default()
                },
            )
            .unwrap();

        assert_eq!(second.key, "notes");
        assert_eq!(second.tags, vec!["draft".to_string()]);
        assert_eq!(second.prev, Some(first.hash));

        assert!(matches!(
            store.write(&b"v3"[..], WriteOptions::default()),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_read_by_key_or_hash() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();

        let v1 = store.write(&b"first"[..], WriteOptions::key("doc")).unwrap();
        store
            .write(&b"second"[..], WriteOptions::key("doc").with_prev(v1.hash))
            .unwrap();

        let mut out = String::new();
        store.read("doc").unwrap().read_to_string(&mut out).unwrap();
        assert_eq!(out, "second");

        out.clear();
        store
            .read(&v1.hash.to_hex())
            .unwrap()
            .read_to_string(&mut out)
            .unwrap();
        assert_eq!(out, "first");

        assert!(matches!(store.read("missing"), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_append_requires_blob() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();

        let err = store
            .append("doc", Hash::digest(b"never stored"), None, vec![])
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn test_search_and_reindex() {
        let dir = tempdir().unwrap();
        let path = dir.path().to_path_buf();
        {
            let store = Store::open(&path).unwrap();
            store
                .write(&b"..."[..], WriteOptions::key("install rust").with_tags(["linux"]))
                .unwrap();
            store.write(&b"!!!"[..], WriteOptions::key("make tea")).unwrap();

            let hits = store.search(&["rust", "LINUX"]).unwrap();
            assert_eq!(hits.len(), 1);
            assert_eq!(hits[0].key, "install rust");
            assert_eq!(store.reindex().unwrap(), 2);
        }

        let store = Store::open(&path).unwrap();
        assert_eq!(store.search(&["tea"]).unwrap().len(), 1);
        let status = store.status().unwrap();
        assert_eq!(status.keys, 2);
        assert_eq!(status.revisions, 2);
        assert_eq!(status.blobs, 2);
        assert!(status.diverged.is_empty());
    }

    #[test]
    fn test_compact_keeps_state() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let mut prev = None;
        for i in 0..5 {
            let mut options = WriteOptions::key("counter");
            options.prev = prev;
            prev = Some(store.write(format!("{}", i).as_bytes(), options).unwrap().hash);
        }
        store.compact().unwrap();
        drop(store);

        let store = Store::open(dir.path()).unwrap();
        assert_eq!(store.heads("counter").unwrap().hashes(), vec![prev.unwrap()]);
        assert_eq!(store.history(prev.unwrap()).count(), 5);
    }
}

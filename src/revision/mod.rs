//! Revision index: key names, ancestry links and head sets
//!
//! Everything lives in the shared index log under these prefixes:
//!
//! ```text
//! r/<hash>                 -> Revision (bincode)
//! k/<key>                  -> ()
//! h/<key>\0<hash>          -> ()   current heads of <key>
//! c/<prev><hash>           -> ()   child link, <hash>.prev == <prev>
//! t/<time BE u64><hash>    -> ()   chronological index
//! ```
//!
//! A revision is a head iff no `c/<hash>` link exists. Every append writes
//! its revision, links and head changes as one batch, so readers observe an
//! append either completely or not at all.

mod history;
mod locks;

pub use history::History;
pub use locks::{KeyGuard, KeyLocks};

use crate::model::{Hash, Heads, Revision};
use crate::store::{Batch, KvStore};
use crate::{Error, Result};
use std::sync::Arc;
use tracing::{debug, warn};

const REVISION: &[u8] = b"r/";
const KEY: &[u8] = b"k/";
const HEAD: &[u8] = b"h/";
const CHILD: &[u8] = b"c/";
const TIME: &[u8] = b"t/";

/// Result of applying a revision received from a peer
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Applied {
    /// Newly recorded
    Inserted,
    /// Already known; nothing changed
    Present,
    /// Refused because its content or its parent is recorded under another key
    Conflict,
}

/// Persistent mapping from keys to revision chains and their heads
pub struct RevisionIndex {
    kv: Arc<KvStore>,
    locks: KeyLocks,
}

impl RevisionIndex {
    pub fn new(kv: Arc<KvStore>) -> Self {
        RevisionIndex {
            kv,
            locks: KeyLocks::new(),
        }
    }

    /// Record a new local revision of `key`.
    ///
    /// With `prev`, the new revision supersedes `prev`, which must be a
    /// current head of `key`; otherwise this fails with `StaleParent`.
    /// Without `prev` a new chain is started alongside any existing ones.
    ///
    /// Content that is already recorded is only accepted when nothing would
    /// change: `prev` is that same revision, or there is no `prev` and it is
    /// already a head of `key`. Anything else, such as reverting to an older
    /// text of the key, fails with `HashInUse`.
    pub fn append(
        &self,
        key: &str,
        hash: Hash,
        prev: Option<Hash>,
        tags: Vec<String>,
    ) -> Result<Revision> {
        validate_key(key)?;
        let _guard = self.locks.lock(key);

        if let Some(prev) = prev {
            if !self.kv.contains(&head_key(key, &prev)) {
                return Err(Error::StaleParent {
                    key: key.to_string(),
                    prev: prev.to_hex(),
                });
            }
        }

        if let Some(existing) = self.get(&hash)? {
            let unchanged = existing.key == key
                && match prev {
                    Some(prev) => prev == hash,
                    None => self.kv.contains(&head_key(key, &hash)),
                };
            if !unchanged {
                return Err(Error::HashInUse {
                    hash: hash.to_hex(),
                    key: existing.key,
                });
            }
            debug!(key, hash = %hash.short(), "content unchanged, keeping existing revision");
            return Ok(existing);
        }

        let revision = Revision::new(hash, key, prev).with_tags(tags);
        self.commit(&revision)?;
        debug!(key, hash = %hash.short(), prev = ?prev, "appended revision");
        Ok(revision)
    }

    /// Record a revision received from a peer, keeping its `prev`, time and tags.
    ///
    /// No head check is made: the revision extends history that already
    /// happened elsewhere, and if the key moved on locally the result is
    /// divergence. The parent must already be present and belong to the
    /// same key; a revision that would cross keys is refused as `Conflict`.
    pub fn apply_replicated(&self, revision: &Revision) -> Result<Applied> {
        validate_key(&revision.key)?;
        let _guard = self.locks.lock(&revision.key);

        if let Some(existing) = self.get(&revision.hash)? {
            if existing.key != revision.key {
                warn!(
                    hash = %revision.hash.short(),
                    local = %existing.key,
                    remote = %revision.key,
                    "replicated content already recorded under another key"
                );
                return Ok(Applied::Conflict);
            }
            return Ok(Applied::Present);
        }

        if let Some(prev) = revision.prev {
            let parent = self.get(&prev)?.ok_or_else(|| Error::BrokenChain {
                missing: prev.to_hex(),
            })?;
            if parent.key != revision.key {
                warn!(
                    hash = %revision.hash.short(),
                    prev = %prev.short(),
                    parent_key = %parent.key,
                    key = %revision.key,
                    "replicated revision extends a revision of another key"
                );
                return Ok(Applied::Conflict);
            }
        }

        self.commit(revision)?;
        Ok(Applied::Inserted)
    }

    fn commit(&self, revision: &Revision) -> Result<()> {
        let hash = revision.hash;
        let mut batch = Batch::new();
        batch
            .put(revision_key(&hash), bincode::serialize(revision)?)
            .put(name_key(&revision.key), Vec::new())
            .put(time_key(revision.time, &hash), Vec::new());

        if let Some(prev) = revision.prev {
            batch
                .put(child_key(&prev, &hash), Vec::new())
                .delete(head_key(&revision.key, &prev));
        }

        if !self.kv.has_prefix(&child_prefix(&hash)) {
            batch.put(head_key(&revision.key, &hash), Vec::new());
        }

        self.kv.write(batch)
    }

    /// Current heads of `key`
    pub fn heads(&self, key: &str) -> Result<Heads> {
        let revisions = self
            .head_hashes(key)
            .iter()
            .map(|hash| self.revision(hash))
            .collect::<Result<Vec<_>>>()?;
        Ok(Heads::from_revisions(revisions))
    }

    /// Head hashes of `key`, without loading the revisions
    pub fn head_hashes(&self, key: &str) -> Vec<Hash> {
        let prefix = head_prefix(key);
        self.kv
            .scan_prefix(&prefix)
            .into_iter()
            .filter_map(|(k, _)| hash_suffix(&k))
            .collect()
    }

    /// Every (key, head) pair in the index
    pub fn all_heads(&self) -> Vec<(String, Hash)> {
        self.kv
            .scan_prefix(HEAD)
            .into_iter()
            .filter_map(|(k, _)| {
                let body = &k[HEAD.len()..];
                let split = body.len().checked_sub(Hash::LEN + 1)?;
                let key = String::from_utf8(body[..split].to_vec()).ok()?;
                Some((key, hash_suffix(&k)?))
            })
            .collect()
    }

    /// Walk `prev` links from `hash` back to the root of its chain
    pub fn history(&self, hash: Hash) -> History<'_> {
        History::new(self, hash)
    }

    /// All known key names
    pub fn keys(&self) -> impl Iterator<Item = String> {
        self.kv
            .scan_prefix(KEY)
            .into_iter()
            .filter_map(|(k, _)| String::from_utf8(k[KEY.len()..].to_vec()).ok())
    }

    /// Revisions newest first
    pub fn recent(&self, limit: Option<usize>) -> impl Iterator<Item = Result<Revision>> + '_ {
        let hashes: Vec<Hash> = self
            .kv
            .scan_prefix(TIME)
            .into_iter()
            .rev()
            .take(limit.unwrap_or(usize::MAX))
            .filter_map(|(k, _)| hash_suffix(&k))
            .collect();
        hashes.into_iter().map(move |hash| self.revision(&hash))
    }

    /// Revisions oldest first
    pub fn chronological(&self) -> impl Iterator<Item = Result<Revision>> + '_ {
        let hashes: Vec<Hash> = self
            .kv
            .scan_prefix(TIME)
            .into_iter()
            .filter_map(|(k, _)| hash_suffix(&k))
            .collect();
        hashes.into_iter().map(move |hash| self.revision(&hash))
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.kv.contains(&revision_key(hash))
    }

    pub fn get(&self, hash: &Hash) -> Result<Option<Revision>> {
        match self.kv.get(&revision_key(hash)) {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Metadata of `hash`, or `NotFound`
    pub fn revision(&self, hash: &Hash) -> Result<Revision> {
        self.get(hash)?
            .ok_or_else(|| Error::NotFound(hash.to_hex()))
    }

    /// Direct children of `hash`
    pub fn children(&self, hash: &Hash) -> Vec<Hash> {
        self.kv
            .scan_prefix(&child_prefix(hash))
            .into_iter()
            .filter_map(|(k, _)| hash_suffix(&k))
            .collect()
    }

    pub fn count(&self) -> usize {
        self.kv.scan_prefix(REVISION).len()
    }
}

fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() || key.contains('\0') {
        return Err(Error::Config(format!("invalid key name: {:?}", key)));
    }
    Ok(())
}

fn revision_key(hash: &Hash) -> Vec<u8> {
    [REVISION, &hash.as_bytes()[..]].concat()
}

fn name_key(key: &str) -> Vec<u8> {
    [KEY, key.as_bytes()].concat()
}

fn head_prefix(key: &str) -> Vec<u8> {
    [HEAD, key.as_bytes(), &b"\0"[..]].concat()
}

fn head_key(key: &str, hash: &Hash) -> Vec<u8> {
    [head_prefix(key).as_slice(), &hash.as_bytes()[..]].concat()
}

fn child_prefix(parent: &Hash) -> Vec<u8> {
    [CHILD, &parent.as_bytes()[..]].concat()
}

fn child_key(parent: &Hash, child: &Hash) -> Vec<u8> {
    [CHILD, &parent.as_bytes()[..], &child.as_bytes()[..]].concat()
}

fn time_key(time: u64, hash: &Hash) -> Vec<u8> {
    [TIME, &time.to_be_bytes()[..], &hash.as_bytes()[..]].concat()
}

/// The trailing hash of an index key
fn hash_suffix(key: &[u8]) -> Option<Hash> {
    let start = key.len().checked_sub(Hash::LEN)?;
    let bytes: [u8; 32] = key[start..].try_into().ok()?;
    Some(Hash::from_bytes(bytes))
}

//! Revision type - one versioned snapshot of a key's content

use super::Hash;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// One node in a key's history
///
/// Revisions form a forest of chains per key, linked through `prev`. The
/// `hash` is the hash of the revision's blob, so the chain is an arena of
/// immutable nodes addressed by content.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Revision {
    /// Hash of the blob holding this revision's content
    pub hash: Hash,

    /// Owning key name
    pub key: String,

    /// The revision this one supersedes (None for a chain root)
    pub prev: Option<Hash>,

    /// Creation time (unix millis)
    pub time: u64,

    /// Free-form tags used by search
    #[serde(default)]
    pub tags: Vec<String>,
}

impl Revision {
    pub fn new(hash: Hash, key: impl Into<String>, prev: Option<Hash>) -> Self {
        Revision {
            hash,
            key: key.into(),
            prev,
            time: now_millis(),
            tags: Vec::new(),
        }
    }

    pub fn with_tags(mut self, tags: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_time(mut self, time: u64) -> Self {
        self.time = time;
        self
    }

    pub fn is_root(&self) -> bool {
        self.prev.is_none()
    }
}

/// The current heads of a key
///
/// Divergence is an ordinary outcome of concurrent edits or replication,
/// not an error, so callers see it as a variant.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Heads {
    /// Unknown key
    Empty,
    /// A single linear history
    Single(Revision),
    /// Concurrent chains; most recent first
    Diverged(Vec<Revision>),
}

impl Heads {
    /// Build from an unordered set of head revisions
    pub fn from_revisions(mut revisions: Vec<Revision>) -> Self {
        match revisions.len() {
            0 => Heads::Empty,
            1 => Heads::Single(revisions.remove(0)),
            _ => {
                revisions.sort_by(|a, b| b.time.cmp(&a.time).then(a.hash.cmp(&b.hash)));
                Heads::Diverged(revisions)
            }
        }
    }

    /// The most recent head, if any
    pub fn latest(&self) -> Option<&Revision> {
        match self {
            Heads::Empty => None,
            Heads::Single(rev) => Some(rev),
            Heads::Diverged(revs) => revs.first(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Heads::Empty => 0,
            Heads::Single(_) => 1,
            Heads::Diverged(revs) => revs.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Heads::Empty)
    }

    pub fn is_diverged(&self) -> bool {
        matches!(self, Heads::Diverged(_))
    }

    pub fn hashes(&self) -> Vec<Hash> {
        self.iter().map(|r| r.hash).collect()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Revision> {
        match self {
            Heads::Empty => [].iter(),
            Heads::Single(rev) => std::slice::from_ref(rev).iter(),
            Heads::Diverged(revs) => revs.iter(),
        }
    }

    pub fn into_vec(self) -> Vec<Revision> {
        match self {
            Heads::Empty => Vec::new(),
            Heads::Single(rev) => vec![rev],
            Heads::Diverged(revs) => revs,
        }
    }
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_revision() {
        let rev = Revision::new(Hash::digest(b"a"), "notes", None);
        assert!(rev.is_root());
        assert!(rev.time > 0);
    }

    #[test]
    fn test_heads_variants() {
        assert!(Heads::from_revisions(vec![]).is_empty());

        let a = Revision::new(Hash::digest(b"a"), "k", None).with_time(10);
        let b = Revision::new(Hash::digest(b"b"), "k", None).with_time(20);

        let single = Heads::from_revisions(vec![a.clone()]);
        assert_eq!(single.latest(), Some(&a));
        assert!(!single.is_diverged());

        let diverged = Heads::from_revisions(vec![a.clone(), b.clone()]);
        assert!(diverged.is_diverged());
        assert_eq!(diverged.len(), 2);
        assert_eq!(diverged.latest(), Some(&b));
        assert_eq!(diverged.hashes(), vec![b.hash, a.hash]);
    }
}

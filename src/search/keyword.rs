//! Inverted keyword index over key names and tags
//!
//! Layout in the shared index log:
//!
//! ```text
//! s/<token>\0<hash>   -> (key, time)   one entry per token per revision
//! x/<hash>            -> ()            revision has been indexed
//! m/search            -> format version
//! ```
//!
//! Matching policy: terms and indexed text are lowercased and split on
//! anything that is not alphanumeric. A revision matches a term when one of
//! its tokens starts with every token of the term; multiple terms are ANDed.
//! Tags are indexed both whole and split into words.

use crate::model::{Hash, Revision};
use crate::revision::RevisionIndex;
use crate::store::{Batch, KvStore};
use crate::Result;
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, info};

const TOKEN: &[u8] = b"s/";
const INDEXED: &[u8] = b"x/";
const FORMAT_KEY: &[u8] = b"m/search";
const FORMAT: u32 = 1;

/// A revision matched by a search
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SearchHit {
    pub key: String,
    pub hash: Hash,
    pub time: u64,
}

impl PartialOrd for SearchHit {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SearchHit {
    fn cmp(&self, other: &Self) -> Ordering {
        // Newest first
        other
            .time
            .cmp(&self.time)
            .then_with(|| self.key.cmp(&other.key))
            .then_with(|| self.hash.cmp(&other.hash))
    }
}

/// Keyword index; a rebuildable projection of the revision index
pub struct SearchIndex {
    kv: Arc<KvStore>,
}

impl SearchIndex {
    pub fn new(kv: Arc<KvStore>) -> Self {
        SearchIndex { kv }
    }

    /// Add a committed revision to the index
    pub fn index(&self, revision: &Revision) -> Result<()> {
        let value = bincode::serialize(&(&revision.key, revision.time))?;
        let mut batch = Batch::new();
        for token in revision_tokens(revision) {
            batch.put(token_key(&token, &revision.hash), value.clone());
        }
        batch.put(indexed_key(&revision.hash), Vec::new());
        self.kv.write(batch)
    }

    /// Revisions whose key or tags match every term, newest first
    pub fn search<S: AsRef<str>>(&self, terms: &[S]) -> Result<Vec<SearchHit>> {
        let tokens: BTreeSet<String> = terms.iter().flat_map(|t| tokenize(t.as_ref())).collect();
        if tokens.is_empty() {
            return Ok(Vec::new());
        }

        let mut matched: Option<HashMap<Hash, SearchHit>> = None;
        for token in &tokens {
            let hits = self.lookup(token)?;
            matched = Some(match matched {
                None => hits,
                Some(mut acc) => {
                    acc.retain(|hash, _| hits.contains_key(hash));
                    acc
                }
            });
            if matched.as_ref().is_some_and(|m| m.is_empty()) {
                break;
            }
        }

        let mut hits: Vec<SearchHit> = matched.unwrap_or_default().into_values().collect();
        hits.sort();
        Ok(hits)
    }

    /// Every revision with a token that starts with `token`
    fn lookup(&self, token: &str) -> Result<HashMap<Hash, SearchHit>> {
        let prefix = [TOKEN, token.as_bytes()].concat();
        let mut hits = HashMap::new();
        for (k, v) in self.kv.scan_prefix(&prefix) {
            let Some(hash) = hash_suffix(&k) else { continue };
            let (key, time): (String, u64) = bincode::deserialize(&v)?;
            hits.insert(hash, SearchHit { key, hash, time });
        }
        Ok(hits)
    }

    pub fn is_indexed(&self, hash: &Hash) -> bool {
        self.kv.contains(&indexed_key(hash))
    }

    /// Whether the index is in the current format and covers every revision
    pub fn is_consistent(&self, revisions: &RevisionIndex) -> bool {
        let format_ok = self
            .kv
            .get(FORMAT_KEY)
            .and_then(|v| bincode::deserialize::<u32>(&v).ok())
            == Some(FORMAT);
        format_ok && self.kv.scan_prefix(INDEXED).len() == revisions.count()
    }

    /// Drop the index and replay every revision in time order
    pub fn rebuild(&self, revisions: &RevisionIndex) -> Result<usize> {
        let dropped = self.kv.delete_prefix(TOKEN)? + self.kv.delete_prefix(INDEXED)?;
        debug!(dropped, "cleared search index");

        let mut count = 0;
        for revision in revisions.chronological() {
            self.index(&revision?)?;
            count += 1;
        }
        self.kv.put(FORMAT_KEY, bincode::serialize(&FORMAT)?)?;
        info!(revisions = count, "rebuilt search index");
        Ok(count)
    }
}

/// Lowercased alphanumeric words of `text`
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect()
}

fn revision_tokens(revision: &Revision) -> BTreeSet<String> {
    let mut tokens: BTreeSet<String> = tokenize(&revision.key).into_iter().collect();
    for tag in &revision.tags {
        let whole = tag.trim().to_lowercase();
        if !whole.is_empty() && !whole.contains('\0') {
            tokens.insert(whole);
        }
        tokens.extend(tokenize(tag));
    }
    tokens
}

fn token_key(token: &str, hash: &Hash) -> Vec<u8> {
    [TOKEN, token.as_bytes(), &b"\0"[..], &hash.as_bytes()[..]].concat()
}

fn indexed_key(hash: &Hash) -> Vec<u8> {
    [INDEXED, &hash.as_bytes()[..]].concat()
}

fn hash_suffix(key: &[u8]) -> Option<Hash> {
    let start = key.len().checked_sub(Hash::LEN)?;
    let bytes: [u8; 32] = key[start..].try_into().ok()?;
    Some(Hash::from_bytes(bytes))
}

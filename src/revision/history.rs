//! Lazy ancestry walk

use super::RevisionIndex;
use crate::model::{Hash, Revision};
use crate::{Error, Result};

/// Iterator over a revision and its ancestors, newest first
///
/// Stops after the chain root. A missing starting revision yields
/// `NotFound`; a missing ancestor yields `BrokenChain`. Either error ends
/// the walk.
pub struct History<'a> {
    index: &'a RevisionIndex,
    next: Option<Hash>,
    first: bool,
}

impl<'a> History<'a> {
    pub(super) fn new(index: &'a RevisionIndex, start: Hash) -> Self {
        History {
            index,
            next: Some(start),
            first: true,
        }
    }
}

impl Iterator for History<'_> {
    type Item = Result<Revision>;

    fn next(&mut self) -> Option<Self::Item> {
        let hash = self.next.take()?;
        let first = std::mem::replace(&mut self.first, false);

        match self.index.get(&hash) {
            Ok(Some(revision)) => {
                self.next = revision.prev;
                Some(Ok(revision))
            }
            Ok(None) if first => Some(Err(Error::NotFound(hash.to_hex()))),
            Ok(None) => Some(Err(Error::BrokenChain {
                missing: hash.to_hex(),
            })),
            Err(e) => Some(Err(e)),
        }
    }
}

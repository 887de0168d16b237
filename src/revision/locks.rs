//! Per-key serialization for head updates

use parking_lot::{Mutex, RawMutex};
use std::collections::HashMap;
use std::sync::Arc;

/// Held while a key's head set is being read and rewritten
pub type KeyGuard = parking_lot::lock_api::ArcMutexGuard<RawMutex, ()>;

/// An arena of one lock cell per key
///
/// Appends to different keys never contend; the arena's own mutex is only
/// held long enough to find or create a cell.
#[derive(Default)]
pub struct KeyLocks {
    cells: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl KeyLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until `key` is free and hold it until the guard drops
    pub fn lock(&self, key: &str) -> KeyGuard {
        let cell = {
            let mut cells = self.cells.lock();
            cells
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        cell.lock_arc()
    }
}

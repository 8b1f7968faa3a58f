//! TTL-bounded key/value store.
//!
//! Keys are 160-bit digests; values are opaque bytes. Insertion order is
//! preserved across overwrites (re-insertion moves an existing key to the
//! back), so culling expired entries can stop at the first live one instead
//! of scanning the whole map.

use crate::identity::NodeId;
use indexmap::IndexMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

struct Entry {
    inserted: Instant,
    bytes: Vec<u8>,
}

pub struct ValueStore {
    ttl: Duration,
    entries: Mutex<IndexMap<NodeId, Entry>>,
}

impl ValueStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(IndexMap::new()),
        }
    }

    /// Replace any prior entry for `key`, stamping the current time, then
    /// cull expired entries.
    pub fn set(&self, key: NodeId, value: Vec<u8>) {
        let mut guard = self.entries.lock().expect("value store mutex poisoned");
        // shift_remove + re-insert so overwrite moves the key to the back,
        // keeping FIFO order intact for `items_older_than`/`items`.
        guard.shift_remove(&key);
        guard.insert(
            key,
            Entry {
                inserted: Instant::now(),
                bytes: value,
            },
        );
        Self::cull_locked(&mut guard, self.ttl);
    }

    /// Fetch `key`, culling expired entries first.
    pub fn get(&self, key: &NodeId) -> Option<Vec<u8>> {
        let mut guard = self.entries.lock().expect("value store mutex poisoned");
        Self::cull_locked(&mut guard, self.ttl);
        guard.get(key).map(|e| e.bytes.clone())
    }

    /// Entries whose stamp is older than `now - age`, oldest first.
    pub fn items_older_than(&self, age: Duration) -> Vec<(NodeId, Vec<u8>)> {
        let guard = self.entries.lock().expect("value store mutex poisoned");
        let cutoff = Instant::now().checked_sub(age).unwrap_or_else(Instant::now);
        guard
            .iter()
            .filter(|(_, e)| e.inserted < cutoff)
            .map(|(k, e)| (*k, e.bytes.clone()))
            .collect()
    }

    /// All live entries, after culling.
    pub fn items(&self) -> Vec<(NodeId, Vec<u8>)> {
        let mut guard = self.entries.lock().expect("value store mutex poisoned");
        Self::cull_locked(&mut guard, self.ttl);
        guard.iter().map(|(k, e)| (*k, e.bytes.clone())).collect()
    }

    fn cull_locked(guard: &mut IndexMap<NodeId, Entry>, ttl: Duration) {
        let cutoff = match Instant::now().checked_sub(ttl) {
            Some(c) => c,
            None => return,
        };
        // Entries are FIFO-ordered by insertion; drop from the front while
        // stale, stop at the first live entry.
        while let Some((_, entry)) = guard.first() {
            if entry.inserted < cutoff {
                guard.shift_remove_index(0);
            } else {
                break;
            }
        }
    }
}

//! Per-device dedup cache (C1).
//!
//! Tracks which block numbers have already been snapshotted during the
//! current epoch so repeat writes to a hot block don't re-copy it. A hit
//! promotes the entry to most-recently-used, matching `lookup_lru`'s
//! remove-then-reinsert behavior in the original workqueue implementation.
//! False negatives (evicting an entry that then misses) are acceptable and
//! only cost an extra snapblock write; false positives are not possible
//! since entries are never forgotten except by eviction.

use std::hash::Hash;
use std::num::NonZeroUsize;

use lru::LruCache;

/// A bounded, MRU-promoting membership set.
///
/// Not `Send`/`Sync` by itself; each device's worker task owns its
/// `LruSet` exclusively, so no internal locking is needed.
pub struct LruSet<K: Hash + Eq> {
    inner: LruCache<K, ()>,
}

impl<K: Hash + Eq> LruSet<K> {
    /// Create a set bounded to `capacity` entries.
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            inner: LruCache::new(capacity),
        }
    }

    /// Check membership, promoting the key to most-recently-used on a hit.
    pub fn contains_mru(&mut self, key: &K) -> bool {
        self.inner.get(key).is_some()
    }

    /// Insert a key, evicting the least-recently-used entry if the set is
    /// already at capacity.
    pub fn insert(&mut self, key: K) {
        self.inner.push(key, ());
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

//! Bounded block cache shared by every SST the engine opens.
//!
//! Keys are `(sst_id, block_idx)` pairs and values are decoded blocks
//! behind `Arc`, so concurrent readers share one decode. The policy is a
//! two-queue scheme parameterized by `(capacity, k)`: new entries enter a
//! probationary queue; an entry that has been hit at least `k` times by
//! the time the eviction scan reaches it is promoted to the protected
//! queue, where it gets a decaying second chance instead of immediate
//! eviction. The entry count never exceeds `capacity`.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::Mutex;

use crate::sstable::Block;

/// Cache key: which block of which SST.
pub type BlockKey = (u64, usize);

/// Hit counts saturate here; enough to clear any promote threshold.
const MAX_HITS: u8 = 8;

struct Entry {
    value: Arc<Block>,
    hits: u8,
    protected: bool,
}

struct Inner {
    entries: HashMap<BlockKey, Entry>,
    probation: VecDeque<BlockKey>,
    protected: VecDeque<BlockKey>,
}

/// Thread-safe bounded `(sst_id, block_idx) -> block` cache.
pub struct BlockCache {
    inner: Mutex<Inner>,
    capacity: usize,
    k: u8,
}

impl BlockCache {
    pub fn new(capacity: usize, k: u8) -> Self {
        assert!(capacity > 0, "block cache capacity must be positive");
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                probation: VecDeque::new(),
                protected: VecDeque::new(),
            }),
            capacity,
            k,
        }
    }

    pub fn get(&self, key: &BlockKey) -> Option<Arc<Block>> {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner.entries.get_mut(key)?;
        entry.hits = std::cmp::min(entry.hits + 1, MAX_HITS);
        Some(entry.value.clone())
    }

    pub fn insert(&self, key: BlockKey, value: Arc<Block>) {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        if let Some(entry) = inner.entries.get_mut(&key) {
            entry.value = value;
            return;
        }

        while inner.entries.len() >= self.capacity {
            self.evict_one(inner);
        }
        inner.entries.insert(
            key,
            Entry {
                value,
                hits: 0,
                protected: false,
            },
        );
        inner.probation.push_back(key);
    }

    pub fn remove(&self, key: &BlockKey) {
        let mut inner = self.inner.lock().unwrap();
        // Queue copies are cleaned up lazily by the eviction scan.
        inner.entries.remove(key);
    }

    /// Drops every cached block belonging to `sst_id`.
    pub fn remove_sst(&self, sst_id: u64, block_count: usize) {
        let mut inner = self.inner.lock().unwrap();
        for idx in 0..block_count {
            inner.entries.remove(&(sst_id, idx));
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Evicts exactly one live entry. Scans the probationary queue first,
    /// promoting entries that earned at least `k` hits; falls back to the
    /// protected queue with hit-count decay.
    fn evict_one(&self, inner: &mut Inner) {
        while let Some(key) = inner.probation.pop_front() {
            let Some(entry) = inner.entries.get_mut(&key) else {
                continue; // removed since it was queued
            };
            if entry.protected {
                continue; // stale queue copy
            }
            if entry.hits >= self.k {
                entry.protected = true;
                inner.protected.push_back(key);
                continue;
            }
            inner.entries.remove(&key);
            return;
        }

        while let Some(key) = inner.protected.pop_front() {
            let Some(entry) = inner.entries.get_mut(&key) else {
                continue;
            };
            if !entry.protected {
                continue;
            }
            if entry.hits > 0 {
                entry.hits -= 1;
                inner.protected.push_back(key);
                continue;
            }
            inner.entries.remove(&key);
            return;
        }
    }
}

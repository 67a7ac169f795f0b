//! The in-memory write buffer: one active skiplist plus a queue of
//! frozen ones waiting to flush.
//!
//! Writes only touch the active list. When the active list reaches its
//! size watermark it is frozen (made immutable and queued) and a fresh
//! empty list takes its place. Flushing pops the oldest frozen list and
//! streams it into a level-0 SST.
//!
//! Reads check the active list first, then frozen lists from newest to
//! oldest, so the most recent write for a key always wins. A tombstone
//! (empty value) is returned as-is; the engine maps it to "not present".
//!
//! Locking: the active list sits behind an `RwLock` (concurrent readers,
//! one writer); frozen lists are immutable once queued and shared via
//! `Arc`. The total byte count is an atomic kept equal to the sum of all
//! list sizes.

use std::cmp::Ordering;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Arc, RwLock};

use crate::cache::BlockCache;
use crate::error::Result;
use crate::iterator::{HeapIterator, KvIterator};
use crate::skiplist::SkipList;
use crate::sstable::{Sst, SstBuilder};

/// In-memory write buffer for the LSM engine.
pub struct MemTable {
    active: RwLock<SkipList>,
    /// Newest frozen list at the front, oldest at the back.
    frozen: RwLock<VecDeque<Arc<SkipList>>>,
    total_size: AtomicUsize,
    per_table_size: usize,
}

impl MemTable {
    /// `per_table_size` is the watermark at which the active list is
    /// frozen before accepting another write.
    pub fn new(per_table_size: usize) -> Self {
        Self {
            active: RwLock::new(SkipList::new()),
            frozen: RwLock::new(VecDeque::new()),
            total_size: AtomicUsize::new(0),
            per_table_size,
        }
    }

    /// Inserts or overwrites a key. Freezes the active list first if it
    /// has reached the per-table watermark.
    pub fn put(&self, key: &[u8], value: &[u8]) {
        let mut active = self.active.write().unwrap();
        if active.size_bytes() >= self.per_table_size && !active.is_empty() {
            let full = std::mem::take(&mut *active);
            self.frozen.write().unwrap().push_front(Arc::new(full));
        }
        let delta = active.put(key, value);
        self.apply_delta(delta);
    }

    pub fn put_batch(&self, pairs: &[(Vec<u8>, Vec<u8>)]) {
        for (key, value) in pairs {
            self.put(key, value);
        }
    }

    /// Writes a tombstone for `key`.
    pub fn remove(&self, key: &[u8]) {
        self.put(key, b"");
    }

    pub fn remove_batch(&self, keys: &[Vec<u8>]) {
        for key in keys {
            self.remove(key);
        }
    }

    /// Looks up a key across all lists, newest first. An empty value is
    /// a tombstone and is returned as-is.
    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        if let Some(value) = self.active.read().unwrap().get(key) {
            return Some(value.to_vec());
        }
        let frozen = self.frozen.read().unwrap();
        for list in frozen.iter() {
            if let Some(value) = list.get(key) {
                return Some(value.to_vec());
            }
        }
        None
    }

    /// Total bytes across the active and all frozen lists.
    pub fn total_size(&self) -> usize {
        self.total_size.load(AtomicOrdering::SeqCst)
    }

    pub fn has_frozen(&self) -> bool {
        !self.frozen.read().unwrap().is_empty()
    }

    /// Moves the active list onto the frozen queue and installs a fresh
    /// empty one. A no-op when the active list is empty.
    pub fn freeze_active(&self) {
        let mut active = self.active.write().unwrap();
        if active.is_empty() {
            return;
        }
        let full = std::mem::take(&mut *active);
        self.frozen.write().unwrap().push_front(Arc::new(full));
    }

    /// Pops the oldest frozen list and streams it through `builder` into
    /// an SST at `path`.
    ///
    /// # Panics
    ///
    /// Panics if no frozen list exists; the engine freezes the active
    /// list before flushing.
    pub fn flush_oldest(
        &self,
        mut builder: SstBuilder,
        path: &Path,
        sst_id: u64,
        cache: Arc<BlockCache>,
    ) -> Result<Sst> {
        let oldest = self
            .frozen
            .write()
            .unwrap()
            .pop_back()
            .expect("flush_oldest called with no frozen memtable");

        for (key, value) in oldest.iter() {
            builder.add(key, value);
        }
        let sst = builder.build(sst_id, path, cache)?;

        self.total_size
            .fetch_sub(oldest.size_bytes(), AtomicOrdering::SeqCst);
        Ok(sst)
    }

    /// Merged ascending cursor over every list with newest-wins
    /// semantics. Tombstones are included; the engine filters them.
    pub fn iter(&self) -> HeapIterator {
        HeapIterator::new(self.snapshot_sources(|list| {
            list.iter().map(|(k, v)| (k.to_vec(), v.to_vec())).collect()
        }))
    }

    /// Merged ascending cursor over the sub-range where the monotone
    /// predicate is `Equal`, or `None` when no list holds a matching
    /// key. The predicate yields `Greater`, then `Equal`, then `Less` as
    /// keys ascend.
    pub fn range_monotone<F>(&self, pred: &F) -> Option<HeapIterator>
    where
        F: Fn(&[u8]) -> Ordering,
    {
        let sources = self.snapshot_sources(|list| {
            list.range_monotone(pred)
                .map(|(k, v)| (k.to_vec(), v.to_vec()))
                .collect()
        });
        if sources.is_empty() {
            return None;
        }
        Some(HeapIterator::new(sources))
    }

    /// Drops every list and resets the byte count.
    pub fn clear(&self) {
        let mut active = self.active.write().unwrap();
        let mut frozen = self.frozen.write().unwrap();
        *active = SkipList::new();
        frozen.clear();
        self.total_size.store(0, AtomicOrdering::SeqCst);
    }

    /// Snapshots each non-empty list (active first, then frozen newest
    /// to oldest) into an owned source cursor. Snapshotting under the
    /// briefly-held read locks keeps the cursors independent of later
    /// writes.
    fn snapshot_sources<F>(&self, snapshot: F) -> Vec<KvIterator>
    where
        F: Fn(&SkipList) -> Vec<(Vec<u8>, Vec<u8>)>,
    {
        let mut sources: Vec<KvIterator> = Vec::new();
        let mut push = |entries: Vec<(Vec<u8>, Vec<u8>)>| {
            if !entries.is_empty() {
                sources.push(Box::new(entries.into_iter().map(Ok)));
            }
        };

        push(snapshot(&self.active.read().unwrap()));
        let frozen = self.frozen.read().unwrap();
        for list in frozen.iter() {
            push(snapshot(list));
        }
        sources
    }

    fn apply_delta(&self, delta: isize) {
        if delta >= 0 {
            self.total_size
                .fetch_add(delta as usize, AtomicOrdering::SeqCst);
        } else {
            self.total_size
                .fetch_sub((-delta) as usize, AtomicOrdering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn collect(iter: HeapIterator) -> Vec<(Vec<u8>, Vec<u8>)> {
        iter.map(|r| r.expect("iteration failed")).collect()
    }

    #[test]
    fn test_put_and_get() {
        let memtable = MemTable::new(1024);
        memtable.put(b"key1", b"value1");
        memtable.put(b"key2", b"value2");

        assert_eq!(memtable.get(b"key1"), Some(b"value1".to_vec()));
        assert_eq!(memtable.get(b"key2"), Some(b"value2".to_vec()));
        assert_eq!(memtable.get(b"key3"), None);
    }

    #[test]
    fn test_remove_writes_tombstone() {
        let memtable = MemTable::new(1024);
        memtable.put(b"key1", b"value1");
        memtable.remove(b"key1");

        // The tombstone is visible at this layer.
        assert_eq!(memtable.get(b"key1"), Some(Vec::new()));
    }

    #[test]
    fn test_freeze_at_watermark() {
        let memtable = MemTable::new(16);

        // Each entry is 9 bytes; the third write finds the active list
        // at the watermark and must land in a fresh one.
        for i in 0..4 {
            let key = format!("key{}", i);
            memtable.put(key.as_bytes(), b"value");
        }

        assert!(memtable.has_frozen());
        // Older values stay readable through the frozen list.
        assert_eq!(memtable.get(b"key0"), Some(b"value".to_vec()));
        assert_eq!(memtable.get(b"key3"), Some(b"value".to_vec()));
    }

    #[test]
    fn test_newest_value_wins_across_freezes() {
        let memtable = MemTable::new(16);
        memtable.put(b"key", b"old");
        memtable.freeze_active();
        memtable.put(b"key", b"new");

        assert_eq!(memtable.get(b"key"), Some(b"new".to_vec()));

        let entries = collect(memtable.iter());
        assert_eq!(entries, vec![(b"key".to_vec(), b"new".to_vec())]);
    }

    #[test]
    fn test_total_size_tracks_all_lists() {
        let memtable = MemTable::new(16);
        memtable.put(b"aaaa", b"bbbb");
        assert_eq!(memtable.total_size(), 8);

        memtable.freeze_active();
        memtable.put(b"cccc", b"dddd");
        assert_eq!(memtable.total_size(), 16);
    }

    #[test]
    fn test_flush_oldest_pops_oldest() {
        let dir = TempDir::new().expect("tempdir");
        let cache = Arc::new(BlockCache::new(64, 2));
        let memtable = MemTable::new(1024);

        memtable.put(b"old", b"1");
        memtable.freeze_active();
        memtable.put(b"new", b"2");
        memtable.freeze_active();

        let sst = memtable
            .flush_oldest(
                SstBuilder::new(4096, true),
                &dir.path().join("0.sst"),
                0,
                Arc::clone(&cache),
            )
            .expect("flush failed");
        assert_eq!(sst.get(b"old").unwrap(), Some(b"1".to_vec()));
        assert_eq!(sst.get(b"new").unwrap(), None);

        // The newer frozen list is still in memory.
        assert!(memtable.has_frozen());
        assert_eq!(memtable.get(b"new"), Some(b"2".to_vec()));
        assert_eq!(memtable.total_size(), 4);
    }

    #[test]
    #[should_panic(expected = "no frozen memtable")]
    fn test_flush_oldest_without_frozen_panics() {
        let dir = TempDir::new().expect("tempdir");
        let cache = Arc::new(BlockCache::new(64, 2));
        let memtable = MemTable::new(1024);

        let _ = memtable.flush_oldest(
            SstBuilder::new(4096, true),
            &dir.path().join("0.sst"),
            0,
            cache,
        );
    }

    #[test]
    fn test_iter_is_sorted_and_deduplicated() {
        let memtable = MemTable::new(1024);
        memtable.put(b"c", b"3");
        memtable.put(b"a", b"1");
        memtable.freeze_active();
        memtable.put(b"b", b"2");
        memtable.put(b"a", b"updated");

        let entries = collect(memtable.iter());
        assert_eq!(
            entries,
            vec![
                (b"a".to_vec(), b"updated".to_vec()),
                (b"b".to_vec(), b"2".to_vec()),
                (b"c".to_vec(), b"3".to_vec()),
            ]
        );
    }

    #[test]
    fn test_range_monotone_spans_lists() {
        let memtable = MemTable::new(1024);
        for i in 0..50 {
            memtable.put(format!("k{:02}", i).as_bytes(), b"v");
        }
        memtable.freeze_active();
        for i in 50..100 {
            memtable.put(format!("k{:02}", i).as_bytes(), b"v");
        }

        let pred = |key: &[u8]| {
            if key < b"k30".as_slice() {
                Ordering::Greater
            } else if key < b"k70".as_slice() {
                Ordering::Equal
            } else {
                Ordering::Less
            }
        };

        let entries = collect(memtable.range_monotone(&pred).expect("expected a range"));
        assert_eq!(entries.len(), 40);
        assert_eq!(entries[0].0, b"k30");
        assert_eq!(entries[39].0, b"k69");
    }

    #[test]
    fn test_range_monotone_no_match() {
        let memtable = MemTable::new(1024);
        memtable.put(b"a", b"1");

        let pred = |_: &[u8]| Ordering::Less;
        assert!(memtable.range_monotone(&pred).is_none());
    }

    #[test]
    fn test_clear() {
        let memtable = MemTable::new(16);
        memtable.put(b"key1", b"value1");
        memtable.freeze_active();
        memtable.put(b"key2", b"value2");

        memtable.clear();
        assert_eq!(memtable.total_size(), 0);
        assert_eq!(memtable.get(b"key1"), None);
        assert!(!memtable.has_frozen());
    }

    #[test]
    fn test_concurrent_reads_and_writes() {
        use std::thread;

        let memtable = Arc::new(MemTable::new(1024));

        thread::scope(|s| {
            for writer in 0..4 {
                let memtable = Arc::clone(&memtable);
                s.spawn(move || {
                    for i in 0..250 {
                        let key = format!("w{}_{:03}", writer, i);
                        memtable.put(key.as_bytes(), b"value");
                    }
                });
            }
            for _ in 0..2 {
                let memtable = Arc::clone(&memtable);
                s.spawn(move || {
                    for i in 0..500 {
                        let key = format!("w0_{:03}", i % 250);
                        // Value is either absent or fully written.
                        if let Some(value) = memtable.get(key.as_bytes()) {
                            assert_eq!(value, b"value");
                        }
                    }
                });
            }
        });

        for writer in 0..4 {
            for i in 0..250 {
                let key = format!("w{}_{:03}", writer, i);
                assert_eq!(memtable.get(key.as_bytes()), Some(b"value".to_vec()));
            }
        }
    }
}

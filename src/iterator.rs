//! Merging cursors for scan operations.
//!
//! Every cursor in the crate is a plain `Iterator` over
//! `Result<(key, value)>` items in ascending key order. This module
//! composes them:
//!
//! - [`HeapIterator`] merges N sorted sources through a min-heap with
//!   newest-wins deduplication. Recency is the source position: sources
//!   are passed newest first, and among equal keys the entry from the
//!   lowest source index is emitted while the rest are consumed.
//! - [`ConcatIterator`] chains cursors over SSTs whose key ranges are
//!   disjoint and ascending, so no merging is needed.
//! - [`TwoMergeIterator`] merges exactly two cursors, memtable side
//!   against disk side; on equal keys the memtable side wins and both
//!   advance. An exhausted child behaves as +infinity.
//! - [`TombstoneFilter`] drops empty-valued records so callers never
//!   observe deletions.
//!
//! ```text
//! Sources:  [a, d, g, ...]  [b, e, h, ...]  [c, f, i, ...]
//!               |               |               |
//! Heap:     [   a,              b,              c   ]
//!               | (pop minimum, refill from its source)
//! Output:       a
//! ```

use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::sstable::{Sst, SstIterator};

/// A key-value pair as merged cursors produce it.
pub type KvPair = (Vec<u8>, Vec<u8>);

/// Boxed source cursor for merge operations.
pub type KvIterator = Box<dyn Iterator<Item = Result<KvPair>> + Send>;

struct HeapEntry {
    key: Vec<u8>,
    value: Vec<u8>,
    source: usize,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.source == other.source
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap: reverse the key order so the smallest
        // key surfaces first, and among equal keys surface the lowest
        // source index (the newest source).
        match self.key.cmp(&other.key) {
            Ordering::Equal => other.source.cmp(&self.source),
            ord => ord.reverse(),
        }
    }
}

/// Min-heap merge over N sorted sources with newest-wins deduplication.
pub struct HeapIterator {
    sources: Vec<KvIterator>,
    heap: BinaryHeap<HeapEntry>,
    last_key: Option<Vec<u8>>,
    errors: VecDeque<Error>,
}

impl HeapIterator {
    /// `sources` must each be sorted ascending, ordered newest first.
    pub fn new(sources: Vec<KvIterator>) -> Self {
        let mut iter = Self {
            sources,
            heap: BinaryHeap::new(),
            last_key: None,
            errors: VecDeque::new(),
        };
        for source in 0..iter.sources.len() {
            iter.refill(source);
        }
        iter
    }

    fn refill(&mut self, source: usize) {
        match self.sources[source].next() {
            Some(Ok((key, value))) => self.heap.push(HeapEntry { key, value, source }),
            Some(Err(e)) => self.errors.push_back(e),
            None => {}
        }
    }
}

impl Iterator for HeapIterator {
    type Item = Result<KvPair>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(e) = self.errors.pop_front() {
            return Some(Err(e));
        }
        while let Some(entry) = self.heap.pop() {
            self.refill(entry.source);

            // Older duplicate of the key just emitted.
            if self.last_key.as_deref() == Some(entry.key.as_slice()) {
                continue;
            }
            self.last_key = Some(entry.key.clone());
            return Some(Ok((entry.key, entry.value)));
        }
        None
    }
}

/// Chains cursors over SSTs whose key ranges are disjoint and ascending
/// (the level >= 1 invariant). Construction asserts the ordering.
pub struct ConcatIterator {
    ssts: std::vec::IntoIter<Arc<Sst>>,
    cur: Option<SstIterator>,
}

impl ConcatIterator {
    pub fn new(ssts: Vec<Arc<Sst>>) -> Self {
        debug_assert!(
            ssts.windows(2)
                .all(|w| w[0].last_key() < w[1].first_key()),
            "concat iterator requires disjoint ascending runs"
        );
        Self {
            ssts: ssts.into_iter(),
            cur: None,
        }
    }
}

impl Iterator for ConcatIterator {
    type Item = Result<KvPair>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(iter) = &mut self.cur {
                if let Some(entry) = iter.next() {
                    return Some(entry);
                }
            }
            self.cur = Some(self.ssts.next()?.iter());
        }
    }
}

/// Merges the memtable-side cursor `a` against the disk-side cursor `b`.
/// Equal keys: `a` wins and both advance.
pub struct TwoMergeIterator {
    a: KvIterator,
    b: KvIterator,
    a_slot: Option<KvPair>,
    b_slot: Option<KvPair>,
    errors: VecDeque<Error>,
}

impl TwoMergeIterator {
    pub fn new(a: KvIterator, b: KvIterator) -> Self {
        let mut iter = Self {
            a,
            b,
            a_slot: None,
            b_slot: None,
            errors: VecDeque::new(),
        };
        iter.advance_a();
        iter.advance_b();
        iter
    }

    fn advance_a(&mut self) {
        self.a_slot = match self.a.next() {
            Some(Ok(pair)) => Some(pair),
            Some(Err(e)) => {
                // Surface the error and treat the child as ended.
                self.errors.push_back(e);
                None
            }
            None => None,
        };
    }

    fn advance_b(&mut self) {
        self.b_slot = match self.b.next() {
            Some(Ok(pair)) => Some(pair),
            Some(Err(e)) => {
                self.errors.push_back(e);
                None
            }
            None => None,
        };
    }
}

impl Iterator for TwoMergeIterator {
    type Item = Result<KvPair>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(e) = self.errors.pop_front() {
            return Some(Err(e));
        }
        // Decide which side to emit before touching the slots.
        let winner = match (self.a_slot.as_ref(), self.b_slot.as_ref()) {
            (None, None) => return None,
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (Some(a), Some(b)) => a.0.cmp(&b.0),
        };
        match winner {
            Ordering::Less => {
                let pair = self.a_slot.take();
                self.advance_a();
                pair.map(Ok)
            }
            Ordering::Greater => {
                let pair = self.b_slot.take();
                self.advance_b();
                pair.map(Ok)
            }
            Ordering::Equal => {
                let pair = self.a_slot.take();
                self.advance_a();
                self.advance_b();
                pair.map(Ok)
            }
        }
    }
}

/// Drops tombstones (empty values) from a merged cursor.
pub struct TombstoneFilter<I> {
    inner: I,
}

impl<I> TombstoneFilter<I> {
    pub fn new(inner: I) -> Self {
        Self { inner }
    }
}

impl<I> Iterator for TombstoneFilter<I>
where
    I: Iterator<Item = Result<KvPair>>,
{
    type Item = Result<KvPair>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.inner.next()? {
                Ok((_, value)) if value.is_empty() => continue,
                item => return Some(item),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(entries: Vec<(&str, &str)>) -> KvIterator {
        Box::new(
            entries
                .into_iter()
                .map(|(k, v)| Ok((k.as_bytes().to_vec(), v.as_bytes().to_vec())))
                .collect::<Vec<_>>()
                .into_iter(),
        )
    }

    fn collect_keys_values(iter: impl Iterator<Item = Result<KvPair>>) -> Vec<(String, String)> {
        iter.map(|r| {
            let (k, v) = r.expect("iteration failed");
            (
                String::from_utf8(k).unwrap(),
                String::from_utf8(v).unwrap(),
            )
        })
        .collect()
    }

    #[test]
    fn test_heap_merges_sorted_sources() {
        let merged = HeapIterator::new(vec![
            source(vec![("a", "1"), ("d", "4")]),
            source(vec![("b", "2"), ("e", "5")]),
            source(vec![("c", "3")]),
        ]);

        let entries = collect_keys_values(merged);
        let keys: Vec<_> = entries.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["a", "b", "c", "d", "e"]);
    }

    #[test]
    fn test_heap_newest_wins_on_duplicates() {
        // Source 0 is newest.
        let merged = HeapIterator::new(vec![
            source(vec![("b", "new")]),
            source(vec![("a", "1"), ("b", "old")]),
            source(vec![("b", "oldest"), ("c", "3")]),
        ]);

        let entries = collect_keys_values(merged);
        assert_eq!(
            entries,
            vec![
                ("a".to_string(), "1".to_string()),
                ("b".to_string(), "new".to_string()),
                ("c".to_string(), "3".to_string()),
            ]
        );
    }

    #[test]
    fn test_heap_output_strictly_ascending() {
        let merged = HeapIterator::new(vec![
            source(vec![("a", "x"), ("b", "x"), ("c", "x")]),
            source(vec![("a", "y"), ("b", "y"), ("d", "y")]),
        ]);

        let entries = collect_keys_values(merged);
        let keys: Vec<_> = entries.iter().map(|(k, _)| k.clone()).collect();
        let mut sorted = keys.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(keys, sorted);
    }

    #[test]
    fn test_two_merge_a_wins_ties() {
        let merged = TwoMergeIterator::new(
            source(vec![("a", "memtable"), ("c", "memtable")]),
            source(vec![("a", "disk"), ("b", "disk"), ("c", "disk")]),
        );

        let entries = collect_keys_values(merged);
        assert_eq!(
            entries,
            vec![
                ("a".to_string(), "memtable".to_string()),
                ("b".to_string(), "disk".to_string()),
                ("c".to_string(), "memtable".to_string()),
            ]
        );
    }

    #[test]
    fn test_two_merge_empty_children() {
        let merged = TwoMergeIterator::new(source(vec![]), source(vec![]));
        assert_eq!(collect_keys_values(merged).len(), 0);

        let merged = TwoMergeIterator::new(source(vec![("a", "1")]), source(vec![]));
        assert_eq!(collect_keys_values(merged).len(), 1);

        let merged = TwoMergeIterator::new(source(vec![]), source(vec![("b", "2")]));
        assert_eq!(collect_keys_values(merged).len(), 1);
    }

    #[test]
    fn test_tombstone_filter() {
        let filtered = TombstoneFilter::new(source(vec![
            ("a", "1"),
            ("b", ""),
            ("c", "3"),
            ("d", ""),
        ]));

        let entries = collect_keys_values(filtered);
        assert_eq!(
            entries,
            vec![
                ("a".to_string(), "1".to_string()),
                ("c".to_string(), "3".to_string()),
            ]
        );
    }

    #[test]
    fn test_errors_are_surfaced() {
        let failing: KvIterator = Box::new(
            vec![
                Ok((b"a".to_vec(), b"1".to_vec())),
                Err(Error::InvalidData("boom".to_string())),
            ]
            .into_iter(),
        );
        let merged = TwoMergeIterator::new(failing, source(vec![("b", "2")]));

        let results: Vec<_> = merged.collect();
        assert!(results.iter().any(|r| r.is_err()));
        assert!(results.iter().any(
            |r| matches!(r, Ok((k, _)) if k == b"b")
        ));
    }
}

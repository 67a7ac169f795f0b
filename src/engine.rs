//! The LSM engine: orchestrates the write path, flush, tiered
//! compaction, and the read/scan paths over one data directory.
//!
//! ```text
//! ┌─────────────────┐    ┌─────────────────┐
//! │ Active Skiplist │◄───┤ Frozen Skiplists│   MemTable
//! └────────┬────────┘    └────────┬────────┘
//!          │ freeze               │ flush
//!          ▼                      ▼
//!                          ┌─────────────┐
//!                          │  Level 0    │  newest first, may overlap
//!                          └──────┬──────┘
//!                                 │ tiered compaction
//!                                 ▼
//!                          ┌─────────────┐
//!                          │  Level 1..N │  disjoint, sorted runs
//!                          └─────────────┘
//! ```
//!
//! ## Read Path
//!
//! 1. MemTable (active list, then frozen newest to oldest)
//! 2. Level-0 SSTs in newest-id-first order (ranges may overlap)
//! 3. Levels 1..N, binary-searching the one SST whose range covers the
//!    key (ranges are disjoint within a level)
//!
//! An empty value is a tombstone at every layer; readers report it as
//! "not present" and range cursors skip it.
//!
//! ## Locking
//!
//! A single reader/writer lock guards the level map and open tables.
//! Point reads and scans hold it shared just long enough to snapshot the
//! tables they need (SSTs are immutable once registered, so block reads
//! happen outside the lock); flushes and compactions hold it exclusively
//! for their whole critical section, including the disk writes.

use std::cmp::Ordering;
use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use crate::cache::BlockCache;
use crate::config::LsmConfig;
use crate::error::Result;
use crate::iterator::{
    ConcatIterator, HeapIterator, KvIterator, TombstoneFilter, TwoMergeIterator,
};
use crate::memtable::MemTable;
use crate::sstable::{Sst, SstBuilder};

/// Cursor type returned by the engine's range scans.
pub type ScanIterator = TombstoneFilter<TwoMergeIterator>;

/// Registered tables and the per-level id lists.
struct LevelState {
    tables: HashMap<u64, Arc<Sst>>,
    /// `levels[0]` is ordered newest-id-first; deeper levels ascend by
    /// first key (equivalently by id, since compaction mints ids in key
    /// order).
    levels: Vec<VecDeque<u64>>,
    next_sst_id: u64,
}

impl LevelState {
    fn max_level(&self) -> usize {
        self.levels.len().saturating_sub(1)
    }

    fn level(&self, level: usize) -> &VecDeque<u64> {
        static EMPTY: VecDeque<u64> = VecDeque::new();
        self.levels.get(level).unwrap_or(&EMPTY)
    }

    fn ensure_level(&mut self, level: usize) -> &mut VecDeque<u64> {
        while self.levels.len() <= level {
            self.levels.push(VecDeque::new());
        }
        &mut self.levels[level]
    }

    fn table(&self, id: u64) -> Arc<Sst> {
        Arc::clone(
            self.tables
                .get(&id)
                .expect("level list references an unregistered table"),
        )
    }

    fn mint_sst_id(&mut self) -> u64 {
        let id = self.next_sst_id;
        self.next_sst_id += 1;
        id
    }
}

/// Snapshot of engine state for monitoring and tests.
#[derive(Debug, Clone)]
pub struct EngineStats {
    pub memtable_bytes: usize,
    /// SST ids per level, in stored order.
    pub levels: Vec<Vec<u64>>,
}

/// A persistent key-value store over one data directory.
pub struct LsmEngine {
    config: LsmConfig,
    memtable: MemTable,
    cache: Arc<BlockCache>,
    state: RwLock<LevelState>,
}

impl LsmEngine {
    /// Opens the store, creating the directory if needed. An existing
    /// directory is scanned for `sst_<id>.<level>` files; files that
    /// fail validation are skipped with a warning, and anything else in
    /// the directory is ignored.
    pub fn open(config: LsmConfig) -> Result<Self> {
        let cache = Arc::new(BlockCache::new(
            config.block_cache_capacity,
            config.block_cache_k,
        ));
        let mut state = LevelState {
            tables: HashMap::new(),
            levels: Vec::new(),
            next_sst_id: 0,
        };

        fs::create_dir_all(&config.dir)?;
        for entry in fs::read_dir(&config.dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name();
            let Some((sst_id, level)) = parse_sst_filename(&name.to_string_lossy()) else {
                continue;
            };

            // Reserve the id even when the file is unreadable so new
            // tables never collide with a name already on disk.
            state.next_sst_id = state.next_sst_id.max(sst_id + 1);

            match Sst::open(sst_id, &entry.path(), Arc::clone(&cache)) {
                Ok(sst) => {
                    state.tables.insert(sst_id, Arc::new(sst));
                    state.ensure_level(level).push_back(sst_id);
                }
                Err(e) => {
                    tracing::warn!(
                        sst_id = sst_id,
                        level = level,
                        error = %e,
                        "skipping unreadable sst file"
                    );
                }
            }
        }

        for (level, ids) in state.levels.iter_mut().enumerate() {
            let mut sorted: Vec<u64> = ids.iter().copied().collect();
            sorted.sort_unstable();
            if level == 0 {
                // Level 0 is kept newest first; deeper levels ascend by
                // first key, which id order already gives.
                sorted.reverse();
            }
            *ids = sorted.into();
        }

        tracing::info!(
            dir = %config.dir.display(),
            tables = state.tables.len(),
            levels = state.levels.len(),
            "opened lsm engine"
        );

        Ok(Self {
            memtable: MemTable::new(config.per_memtable_size),
            cache,
            state: RwLock::new(state),
            config,
        })
    }

    /// Inserts or overwrites a key.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.memtable.put(key, value);
        self.maybe_flush()
    }

    pub fn put_batch(&self, pairs: &[(Vec<u8>, Vec<u8>)]) -> Result<()> {
        self.memtable.put_batch(pairs);
        self.maybe_flush()
    }

    /// Deletes a key by writing a tombstone.
    pub fn remove(&self, key: &[u8]) -> Result<()> {
        self.memtable.remove(key);
        self.maybe_flush()
    }

    pub fn remove_batch(&self, keys: &[Vec<u8>]) -> Result<()> {
        self.memtable.remove_batch(keys);
        self.maybe_flush()
    }

    /// Point lookup across the memtable and every level.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if let Some(value) = self.memtable.get(key) {
            return Ok(live_value(value));
        }

        let state = self.state.read().unwrap();

        // Level 0 runs may overlap; scan newest first.
        for &id in state.level(0) {
            if let Some(value) = state.table(id).get(key)? {
                return Ok(live_value(value));
            }
        }

        // Deeper levels are disjoint: binary search for the one run
        // whose range covers the key.
        for level in 1..=state.max_level() {
            let ids = state.level(level);
            let mut lo = 0;
            let mut hi = ids.len();
            while lo < hi {
                let mid = lo + (hi - lo) / 2;
                let sst = state.table(ids[mid]);
                if sst.last_key() < key {
                    lo = mid + 1;
                } else if sst.first_key() > key {
                    hi = mid;
                } else {
                    if let Some(value) = sst.get(key)? {
                        return Ok(live_value(value));
                    }
                    break; // covered but absent here; try deeper levels
                }
            }
        }

        Ok(None)
    }

    /// Flushes one memtable list to a level-0 SST. Compacts level 0
    /// first when it has reached the fan-out ratio. A no-op when the
    /// memtable is empty.
    pub fn flush(&self) -> Result<()> {
        if self.memtable.total_size() == 0 {
            return Ok(());
        }

        let mut state = self.state.write().unwrap();

        if state.level(0).len() >= self.config.level_ratio {
            self.compact_into_next(&mut state, 0)?;
        }

        if !self.memtable.has_frozen() {
            self.memtable.freeze_active();
            if !self.memtable.has_frozen() {
                // A concurrent flush drained the memtable between the
                // size check and the lock.
                return Ok(());
            }
        }

        let sst_id = state.mint_sst_id();
        let path = self.sst_path(sst_id, 0);
        let builder = SstBuilder::new(self.config.block_size, true);
        let sst = self
            .memtable
            .flush_oldest(builder, &path, sst_id, Arc::clone(&self.cache))?;

        tracing::info!(
            sst_id = sst_id,
            entries = sst.num_entries(),
            "flushed memtable to level 0"
        );

        state.tables.insert(sst_id, Arc::new(sst));
        state.ensure_level(0).push_front(sst_id);
        Ok(())
    }

    /// Flushes until the memtable holds no bytes.
    pub fn flush_all(&self) -> Result<()> {
        while self.memtable.total_size() > 0 {
            self.flush()?;
        }
        Ok(())
    }

    /// Merged ascending cursor over the whole store, tombstones removed.
    pub fn scan(&self) -> ScanIterator {
        // Snapshot the memtable before the level map: a flush that lands
        // in between then shows the moved entries on both sides, which
        // the merge deduplicates, instead of on neither.
        let mem = self.memtable.iter();

        let state = self.state.read().unwrap();
        let disk = HeapIterator::new(Self::disk_sources(&state));
        drop(state);

        TombstoneFilter::new(TwoMergeIterator::new(Box::new(mem), Box::new(disk)))
    }

    /// Ascending cursor over the sub-range where the monotone predicate
    /// is `Equal`, merged across the memtable and every SST at every
    /// level; `None` when nothing matches. As keys ascend the predicate
    /// yields `Greater`, then `Equal`, then `Less`.
    pub fn scan_monotone<F>(&self, pred: &F) -> Result<Option<ScanIterator>>
    where
        F: Fn(&[u8]) -> Ordering,
    {
        let mem = self.memtable.range_monotone(pred);

        let state = self.state.read().unwrap();
        let mut sources: Vec<KvIterator> = Vec::new();
        for level in 0..=state.max_level() {
            for &id in state.level(level) {
                let matched = state.table(id).range_monotone(pred)?;
                if !matched.is_empty() {
                    sources.push(Box::new(matched.into_iter().map(Ok)));
                }
            }
        }
        drop(state);

        if mem.is_none() && sources.is_empty() {
            return Ok(None);
        }

        let mem_side: KvIterator = match mem {
            Some(iter) => Box::new(iter),
            None => Box::new(std::iter::empty()),
        };
        Ok(Some(TombstoneFilter::new(TwoMergeIterator::new(
            mem_side,
            Box::new(HeapIterator::new(sources)),
        ))))
    }

    /// Erases all in-memory state and removes every file in the data
    /// directory.
    pub fn clear(&self) -> Result<()> {
        let mut state = self.state.write().unwrap();
        self.memtable.clear();
        state.tables.clear();
        state.levels.clear();

        for entry in fs::read_dir(&self.config.dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                fs::remove_file(entry.path())?;
            }
        }
        tracing::info!(dir = %self.config.dir.display(), "cleared store");
        Ok(())
    }

    /// Current memtable bytes and per-level table ids.
    pub fn stats(&self) -> EngineStats {
        let state = self.state.read().unwrap();
        EngineStats {
            memtable_bytes: self.memtable.total_size(),
            levels: state
                .levels
                .iter()
                .map(|ids| ids.iter().copied().collect())
                .collect(),
        }
    }

    /// Compacts every table at `src` and `src + 1` into new runs at
    /// `src + 1`, recursing first when the target level is itself at the
    /// fan-out ratio. Old files are deleted only after the replacement
    /// runs are built and registered.
    fn compact_into_next(&self, state: &mut LevelState, src: usize) -> Result<()> {
        if state.level(src + 1).len() >= self.config.level_ratio {
            self.compact_into_next(state, src + 1)?;
        }

        let x_ids: Vec<u64> = state.level(src).iter().copied().collect();
        let y_ids: Vec<u64> = state.level(src + 1).iter().copied().collect();
        if x_ids.is_empty() && y_ids.is_empty() {
            return Ok(());
        }

        let x_ssts: Vec<Arc<Sst>> = x_ids.iter().map(|&id| state.table(id)).collect();
        let y_ssts: Vec<Arc<Sst>> = y_ids.iter().map(|&id| state.table(id)).collect();

        // Level 0 runs overlap and need a real merge; deeper sources are
        // disjoint, so a concat cursor suffices on each side. Either
        // way the newer side goes first so equal keys resolve to it.
        let newer: KvIterator = if src == 0 {
            let l0: Vec<KvIterator> = x_ssts
                .iter()
                .map(|sst| Box::new(Arc::clone(sst).iter()) as KvIterator)
                .collect();
            Box::new(HeapIterator::new(l0))
        } else {
            Box::new(ConcatIterator::new(x_ssts))
        };
        let older: KvIterator = Box::new(ConcatIterator::new(y_ssts));
        let merged = TwoMergeIterator::new(newer, older);

        let target_level = src + 1;
        let new_ssts =
            self.build_run_from_iter(state, merged, self.target_sst_size(target_level), target_level)?;

        let new_ids: Vec<u64> = new_ssts.iter().map(|sst| sst.id()).collect();
        for sst in new_ssts {
            state.tables.insert(sst.id(), Arc::new(sst));
        }
        let target = state.ensure_level(target_level);
        target.clear();
        target.extend(new_ids.iter().copied());
        state.ensure_level(src).clear();

        // Tombstones were carried into the new runs, so dropping the old
        // files cannot resurrect older values.
        for &id in x_ids.iter().chain(&y_ids) {
            if let Some(sst) = state.tables.remove(&id) {
                if let Err(e) = sst.delete() {
                    tracing::warn!(sst_id = id, error = %e, "failed to delete compacted sst");
                }
            }
        }

        tracing::info!(
            src_level = src,
            target_level = target_level,
            merged = x_ids.len() + y_ids.len(),
            produced = new_ids.len(),
            "compacted level"
        );
        Ok(())
    }

    /// Streams a merged cursor into new SSTs at `target_level`, starting
    /// a new file whenever the builder reaches `target_size`.
    fn build_run_from_iter(
        &self,
        state: &mut LevelState,
        iter: TwoMergeIterator,
        target_size: usize,
        target_level: usize,
    ) -> Result<Vec<Sst>> {
        let mut new_ssts = Vec::new();
        let mut builder = SstBuilder::new(self.config.block_size, true);

        for entry in iter {
            let (key, value) = entry?;
            builder.add(&key, &value);

            if builder.estimated_size() >= target_size {
                let sst_id = state.mint_sst_id();
                let full = std::mem::replace(
                    &mut builder,
                    SstBuilder::new(self.config.block_size, true),
                );
                new_ssts.push(full.build(
                    sst_id,
                    &self.sst_path(sst_id, target_level),
                    Arc::clone(&self.cache),
                )?);
            }
        }
        if !builder.is_empty() {
            let sst_id = state.mint_sst_id();
            new_ssts.push(builder.build(
                sst_id,
                &self.sst_path(sst_id, target_level),
                Arc::clone(&self.cache),
            )?);
        }
        Ok(new_ssts)
    }

    /// Target SST size for a level: the per-memtable watermark scaled by
    /// the fan-out ratio per level.
    fn target_sst_size(&self, level: usize) -> usize {
        let mut size = self.config.per_memtable_size;
        for _ in 0..level {
            size = size.saturating_mul(self.config.level_ratio);
        }
        size
    }

    /// All disk cursors in recency order: level-0 tables newest first,
    /// then one concat cursor per deeper level.
    fn disk_sources(state: &LevelState) -> Vec<KvIterator> {
        let mut sources: Vec<KvIterator> = Vec::new();
        for &id in state.level(0) {
            sources.push(Box::new(state.table(id).iter()));
        }
        for level in 1..=state.max_level() {
            let ssts: Vec<Arc<Sst>> = state.level(level).iter().map(|&id| state.table(id)).collect();
            if !ssts.is_empty() {
                sources.push(Box::new(ConcatIterator::new(ssts)));
            }
        }
        sources
    }

    fn maybe_flush(&self) -> Result<()> {
        if self.memtable.total_size() >= self.config.total_memtable_size {
            self.flush()?;
        }
        Ok(())
    }

    fn sst_path(&self, sst_id: u64, level: usize) -> PathBuf {
        self.config.dir.join(format!("sst_{:032}.{}", sst_id, level))
    }
}

impl Drop for LsmEngine {
    fn drop(&mut self) {
        // Drain frozen and active lists so every write survives reopen.
        if let Err(e) = self.flush_all() {
            tracing::error!(error = %e, "failed to flush memtables on close");
        }
    }
}

fn live_value(value: Vec<u8>) -> Option<Vec<u8>> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

/// Parses `sst_<zero-padded-id>.<level>` file names; anything else is
/// not ours.
fn parse_sst_filename(name: &str) -> Option<(u64, usize)> {
    let rest = name.strip_prefix("sst_")?;
    let (id_str, level_str) = rest.split_once('.')?;
    if id_str.is_empty() || level_str.is_empty() {
        return None;
    }
    let id = id_str.parse().ok()?;
    let level = level_str.parse().ok()?;
    Some((id, level))
}

use std::path::PathBuf;

/// Configuration for the LSM store
#[derive(Debug, Clone)]
pub struct LsmConfig {
    /// Directory path for the database
    pub dir: PathBuf,

    /// Target size for SST data blocks (default: 4KB)
    pub block_size: usize,

    /// Size at which the active skiplist is frozen (default: 4MB)
    pub per_memtable_size: usize,

    /// Total memtable bytes that trigger a flush (default: 64MB)
    pub total_memtable_size: usize,

    /// Fan-out per level; a level with this many tables is compacted
    /// into the next (default: 4)
    pub level_ratio: usize,

    /// Maximum number of blocks held by the block cache (default: 1024)
    pub block_cache_capacity: usize,

    /// Cache hits before an entry is promoted to the protected queue
    /// (default: 2)
    pub block_cache_k: u8,
}

impl Default for LsmConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./emberdb"),
            block_size: 4096,
            per_memtable_size: 4 * 1024 * 1024,
            total_memtable_size: 64 * 1024 * 1024,
            level_ratio: 4,
            block_cache_capacity: 1024,
            block_cache_k: 2,
        }
    }
}

impl LsmConfig {
    /// Create a new config with the given directory
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }

    /// Set the target data block size
    pub fn block_size(mut self, size: usize) -> Self {
        self.block_size = size;
        self
    }

    /// Set the per-skiplist freeze watermark
    pub fn per_memtable_size(mut self, size: usize) -> Self {
        self.per_memtable_size = size;
        self
    }

    /// Set the total memtable flush watermark
    pub fn total_memtable_size(mut self, size: usize) -> Self {
        self.total_memtable_size = size;
        self
    }

    /// Set the per-level fan-out ratio
    pub fn level_ratio(mut self, ratio: usize) -> Self {
        self.level_ratio = ratio;
        self
    }

    /// Set the block cache capacity (in blocks)
    pub fn block_cache_capacity(mut self, capacity: usize) -> Self {
        self.block_cache_capacity = capacity;
        self
    }

    /// Set the block cache promotion threshold
    pub fn block_cache_k(mut self, k: u8) -> Self {
        self.block_cache_k = k;
        self
    }
}

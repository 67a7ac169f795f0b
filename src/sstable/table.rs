//! The immutable SST handle: open and validate a finished file, serve
//! cached point lookups and streaming cursors, and unlink the file when
//! compaction retires it.
//!
//! ## SST File Layout
//!
//! ```text
//! +--------------------+
//! | Data Block 0..n    |
//! +--------------------+
//! | Meta Index         |  entry count, then one BlockMeta per block
//! +--------------------+
//! | Bloom Block        |  optional, zero-length when absent
//! +--------------------+
//! | Footer (24 bytes)  |  meta off/len, bloom off/len, crc32, magic
//! +--------------------+
//! ```
//!
//! The footer CRC covers the meta index and bloom sections. A bad magic,
//! short file, or checksum mismatch is a corruption error; the engine
//! skips such files on open.

use std::cmp::Ordering;
use std::fs::File;
use std::io::{Cursor, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use byteorder::{BigEndian, ReadBytesExt};
use crc::{Crc, CRC_32_ISCSI};

use crate::cache::BlockCache;
use crate::error::{Error, Result};

use super::block::{Block, BlockIterator};
use super::bloom::BloomFilter;
use super::meta::{self, BlockMeta};

/// Footer magic tag ("EMBR").
pub const MAGIC: u32 = 0x454D_4252;

/// Footer length: meta offset/len, bloom offset/len, crc32, magic.
pub const FOOTER_LEN: u64 = 24;

/// Checksum algorithm for the footer CRC.
pub const FOOTER_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// An immutable on-disk sorted run.
pub struct Sst {
    id: u64,
    path: PathBuf,
    /// Block reads seek then read; the mutex keeps them atomic against
    /// concurrent readers sharing this handle.
    file: Mutex<File>,
    metas: Vec<BlockMeta>,
    bloom: Option<BloomFilter>,
    first_key: Vec<u8>,
    last_key: Vec<u8>,
    num_entries: u32,
    cache: Arc<BlockCache>,
}

impl Sst {
    /// Opens an SST file, validating footer magic and checksum and
    /// loading the meta index and bloom filter into memory.
    pub fn open(id: u64, path: &Path, cache: Arc<BlockCache>) -> Result<Self> {
        let mut file = File::open(path)?;
        let file_len = file.metadata()?.len();
        if file_len < FOOTER_LEN {
            return Err(Error::Corruption(format!(
                "file {} shorter than its footer",
                path.display()
            )));
        }

        file.seek(SeekFrom::End(-(FOOTER_LEN as i64)))?;
        let meta_offset = file.read_u32::<BigEndian>()? as u64;
        let meta_len = file.read_u32::<BigEndian>()? as u64;
        let bloom_offset = file.read_u32::<BigEndian>()? as u64;
        let bloom_len = file.read_u32::<BigEndian>()? as u64;
        let checksum = file.read_u32::<BigEndian>()?;
        let magic = file.read_u32::<BigEndian>()?;

        if magic != MAGIC {
            return Err(Error::Corruption(format!(
                "bad magic in {}",
                path.display()
            )));
        }
        if bloom_offset + bloom_len + FOOTER_LEN != file_len
            || meta_offset + meta_len != bloom_offset
        {
            return Err(Error::Corruption(format!(
                "inconsistent footer offsets in {}",
                path.display()
            )));
        }

        let mut meta_section = vec![0u8; meta_len as usize];
        file.seek(SeekFrom::Start(meta_offset))?;
        file.read_exact(&mut meta_section)?;

        let mut bloom_section = vec![0u8; bloom_len as usize];
        file.read_exact(&mut bloom_section)?;

        let mut digest = FOOTER_CRC.digest();
        digest.update(&meta_section);
        digest.update(&bloom_section);
        if digest.finalize() != checksum {
            return Err(Error::Corruption(format!(
                "checksum mismatch in {}",
                path.display()
            )));
        }

        let mut cursor = Cursor::new(meta_section.as_slice());
        let num_entries = cursor
            .read_u32::<BigEndian>()
            .map_err(|e| Error::Decode("entry count in meta index", e))?;
        let mut metas = Vec::new();
        while (cursor.position() as usize) < meta_section.len() {
            metas.push(BlockMeta::decode_from(&mut cursor)?);
        }
        if metas.is_empty() {
            return Err(Error::Corruption(format!(
                "{} holds no data blocks",
                path.display()
            )));
        }

        let bloom = if bloom_section.is_empty() {
            None
        } else {
            Some(BloomFilter::decode(&bloom_section)?)
        };

        let first_key = metas[0].first_key.clone();
        let last_key = metas[metas.len() - 1].last_key.clone();

        Ok(Self {
            id,
            path: path.to_path_buf(),
            file: Mutex::new(file),
            metas,
            bloom,
            first_key,
            last_key,
            num_entries,
            cache,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn first_key(&self) -> &[u8] {
        &self.first_key
    }

    pub fn last_key(&self) -> &[u8] {
        &self.last_key
    }

    pub fn num_entries(&self) -> u32 {
        self.num_entries
    }

    pub fn block_count(&self) -> usize {
        self.metas.len()
    }

    /// Point lookup. Returns the stored value, which is empty for a
    /// tombstone; callers decide what emptiness means.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if key < self.first_key.as_slice() || key > self.last_key.as_slice() {
            return Ok(None);
        }
        if let Some(bloom) = &self.bloom {
            if !bloom.may_contain(key) {
                return Ok(None);
            }
        }
        let Some(idx) = meta::find_candidate(&self.metas, key) else {
            return Ok(None);
        };
        let block = self.read_block(idx)?;
        Ok(block.get(key))
    }

    /// Ascending cursor over every record, reading blocks through the
    /// cache as it goes.
    pub fn iter(self: Arc<Self>) -> SstIterator {
        SstIterator {
            sst: self,
            next_block: 0,
            block_iter: None,
        }
    }

    /// Materializes the sub-range where the monotone predicate is
    /// `Equal`: skips blocks entirely inside the `Greater` region via the
    /// meta index, then binary-searches within the first overlapping
    /// block.
    pub fn range_monotone<F>(&self, pred: &F) -> Result<Vec<(Vec<u8>, Vec<u8>)>>
    where
        F: Fn(&[u8]) -> Ordering,
    {
        let mut out = Vec::new();
        for (idx, meta) in self.metas.iter().enumerate() {
            if pred(&meta.last_key) == Ordering::Greater {
                continue; // block ends before the matching range
            }
            if pred(&meta.first_key) == Ordering::Less {
                break; // block starts after the matching range
            }
            let block = self.read_block(idx)?;
            let start = block.partition_by_pred(pred);
            for i in start..block.entry_count() {
                let (key, value) = block.record_at(i);
                if pred(key) != Ordering::Equal {
                    return Ok(out);
                }
                out.push((key.to_vec(), value.to_vec()));
            }
        }
        Ok(out)
    }

    /// Fetches a block through the cache, reading from disk on a miss.
    /// A failed load is a miss and does not poison the cache key.
    pub fn read_block(&self, idx: usize) -> Result<Arc<Block>> {
        let key = (self.id, idx);
        if let Some(block) = self.cache.get(&key) {
            return Ok(block);
        }

        let meta = &self.metas[idx];
        let mut raw = vec![0u8; meta.len as usize];
        {
            let mut file = self.file.lock().unwrap();
            file.seek(SeekFrom::Start(meta.offset as u64))?;
            file.read_exact(&mut raw)?;
        }

        let block = Arc::new(Block::decode(raw)?);
        self.cache.insert(key, Arc::clone(&block));
        Ok(block)
    }

    /// Unlinks the backing file and drops its cached blocks. The handle
    /// keeps working for readers that still hold it; the file goes away
    /// when the last one closes.
    pub fn delete(&self) -> Result<()> {
        self.cache.remove_sst(self.id, self.metas.len());
        std::fs::remove_file(&self.path)?;
        Ok(())
    }
}

/// Streaming cursor over one SST.
pub struct SstIterator {
    sst: Arc<Sst>,
    next_block: usize,
    block_iter: Option<BlockIterator>,
}

impl Iterator for SstIterator {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(iter) = &mut self.block_iter {
                if let Some(entry) = iter.next() {
                    return Some(Ok(entry));
                }
            }
            if self.next_block >= self.sst.block_count() {
                return None;
            }
            match self.sst.read_block(self.next_block) {
                Ok(block) => {
                    self.block_iter = Some(block.iter());
                    self.next_block += 1;
                }
                Err(e) => {
                    self.next_block = self.sst.block_count();
                    return Some(Err(e));
                }
            }
        }
    }
}

//! Streams sorted records into a finished SST file.

use std::path::Path;
use std::sync::Arc;

use byteorder::{BigEndian, WriteBytesExt};

use crate::cache::BlockCache;
use crate::error::{Error, Result};

use super::block;
use super::bloom::{self, BloomFilter};
use super::meta::BlockMeta;
use super::table::{Sst, FOOTER_CRC, MAGIC};

/// Builds an SST from records added in ascending key order. The open
/// block is finalized whenever it reaches the block size threshold;
/// `build` writes data blocks, meta index, bloom block, and footer, then
/// opens the finished file.
pub struct SstBuilder {
    block_size: usize,
    with_bloom: bool,
    data: Vec<u8>,
    metas: Vec<BlockMeta>,
    block: block::Builder,
    block_first_key: Vec<u8>,
    last_key: Vec<u8>,
    key_hashes: Vec<u64>,
    num_entries: u32,
}

impl SstBuilder {
    pub fn new(block_size: usize, with_bloom: bool) -> Self {
        Self {
            block_size,
            with_bloom,
            data: Vec::new(),
            metas: Vec::new(),
            block: block::Builder::new(),
            block_first_key: Vec::new(),
            last_key: Vec::new(),
            key_hashes: Vec::new(),
            num_entries: 0,
        }
    }

    /// Appends a record. Keys must arrive in strictly ascending order;
    /// an empty value is a tombstone and is stored as-is.
    pub fn add(&mut self, key: &[u8], value: &[u8]) {
        if self.block.is_empty() {
            self.block_first_key = key.to_vec();
        }
        self.block.add(key, value);
        self.last_key = key.to_vec();
        if self.with_bloom {
            self.key_hashes.push(bloom::hash_key(key));
        }
        self.num_entries += 1;

        if self.block.estimated_size() >= self.block_size {
            self.finish_block();
        }
    }

    /// Total bytes of finalized blocks plus the open block.
    pub fn estimated_size(&self) -> usize {
        let open = if self.block.is_empty() {
            0
        } else {
            self.block.estimated_size()
        };
        self.data.len() + open
    }

    pub fn is_empty(&self) -> bool {
        self.num_entries == 0
    }

    /// Finalizes the file at `path` and returns the opened SST.
    pub fn build(mut self, sst_id: u64, path: &Path, cache: Arc<BlockCache>) -> Result<Sst> {
        if !self.block.is_empty() {
            self.finish_block();
        }
        if self.metas.is_empty() {
            return Err(Error::InvalidData(
                "cannot build an SST with no records".to_string(),
            ));
        }

        let mut meta_section = Vec::new();
        meta_section
            .write_u32::<BigEndian>(self.num_entries)
            .unwrap();
        for meta in &self.metas {
            meta.encode_into(&mut meta_section);
        }

        let mut bloom_section = Vec::new();
        if self.with_bloom {
            BloomFilter::from_hashes(&self.key_hashes).encode_into(&mut bloom_section);
        }

        let meta_offset = self.data.len() as u32;
        let bloom_offset = meta_offset + meta_section.len() as u32;
        let checksum = {
            let mut digest = FOOTER_CRC.digest();
            digest.update(&meta_section);
            digest.update(&bloom_section);
            digest.finalize()
        };

        let mut file_bytes = self.data;
        file_bytes.extend_from_slice(&meta_section);
        file_bytes.extend_from_slice(&bloom_section);
        file_bytes.write_u32::<BigEndian>(meta_offset).unwrap();
        file_bytes
            .write_u32::<BigEndian>(meta_section.len() as u32)
            .unwrap();
        file_bytes.write_u32::<BigEndian>(bloom_offset).unwrap();
        file_bytes
            .write_u32::<BigEndian>(bloom_section.len() as u32)
            .unwrap();
        file_bytes.write_u32::<BigEndian>(checksum).unwrap();
        file_bytes.write_u32::<BigEndian>(MAGIC).unwrap();

        std::fs::write(path, &file_bytes)?;

        // Reopen through the normal read path so the finished file is
        // validated the same way a restart would validate it.
        Sst::open(sst_id, path, cache)
    }

    fn finish_block(&mut self) {
        let builder = std::mem::take(&mut self.block);
        let offset = self.data.len() as u32;
        let bytes = builder.finish();
        self.metas.push(BlockMeta {
            offset,
            len: bytes.len() as u32,
            first_key: std::mem::take(&mut self.block_first_key),
            last_key: self.last_key.clone(),
        });
        self.data.extend_from_slice(&bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_cache() -> Arc<BlockCache> {
        Arc::new(BlockCache::new(64, 2))
    }

    #[test]
    fn test_build_empty_fails() {
        let dir = TempDir::new().expect("tempdir");
        let builder = SstBuilder::new(4096, true);
        assert!(builder
            .build(1, &dir.path().join("empty.sst"), test_cache())
            .is_err());
    }

    #[test]
    fn test_block_rollover() {
        let dir = TempDir::new().expect("tempdir");
        let mut builder = SstBuilder::new(64, true);

        for i in 0..100 {
            let key = format!("key_{:03}", i);
            let value = format!("value_{:03}", i);
            builder.add(key.as_bytes(), value.as_bytes());
        }

        let sst = builder
            .build(1, &dir.path().join("multi.sst"), test_cache())
            .expect("build failed");
        assert!(sst.block_count() > 1, "expected several blocks");
        assert_eq!(sst.first_key(), b"key_000");
        assert_eq!(sst.last_key(), b"key_099");
    }

    #[test]
    fn test_estimated_size_grows() {
        let mut builder = SstBuilder::new(4096, false);
        assert_eq!(builder.estimated_size(), 0);

        builder.add(b"a", b"1");
        let after_one = builder.estimated_size();
        assert!(after_one > 0);

        builder.add(b"b", b"2");
        assert!(builder.estimated_size() > after_one);
    }
}

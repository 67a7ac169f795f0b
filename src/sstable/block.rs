//! Data block encoding and the cursor over one block.
//!
//! ## Block Layout
//!
//! A block is a self-describing, binary-searchable run of sorted records:
//!
//! ```text
//! +---------------------------------------+
//! | klen:u16 | key | vlen:u16 | value     |  record 0
//! +---------------------------------------+
//! | ...                                   |  record 1..n-1
//! +---------------------------------------+
//! | offset:u16 * n                        |  record offset table
//! +---------------------------------------+
//! | count:u16                             |
//! +---------------------------------------+
//! ```
//!
//! All integers are big-endian. A record with `vlen == 0` is a tombstone;
//! the block stores it like any other record and leaves the
//! interpretation to the readers above.

use std::cmp::Ordering;
use std::io;
use std::sync::Arc;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Error, Result};

/// Builds one block from records added in ascending key order.
pub struct Builder {
    data: Vec<u8>,
    offsets: Vec<u16>,
}

impl Builder {
    pub fn new() -> Self {
        Self {
            data: Vec::new(),
            offsets: Vec::new(),
        }
    }

    /// Appends a record. Keys must arrive in strictly ascending order.
    pub fn add(&mut self, key: &[u8], value: &[u8]) {
        debug_assert!(self.data.len() <= u16::MAX as usize, "block overflows its offset table");
        self.offsets.push(self.data.len() as u16);
        self.data.write_u16::<BigEndian>(key.len() as u16).unwrap();
        self.data.extend_from_slice(key);
        self.data
            .write_u16::<BigEndian>(value.len() as u16)
            .unwrap();
        self.data.extend_from_slice(value);
    }

    /// Encoded size of the block as built so far, trailer included.
    pub fn estimated_size(&self) -> usize {
        self.data.len() + self.offsets.len() * 2 + 2
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    pub fn entry_count(&self) -> usize {
        self.offsets.len()
    }

    /// Finalizes the block: appends the offset table and record count.
    pub fn finish(mut self) -> Vec<u8> {
        let offsets = std::mem::take(&mut self.offsets);
        for offset in &offsets {
            self.data.write_u16::<BigEndian>(*offset).unwrap();
        }
        self.data
            .write_u16::<BigEndian>(offsets.len() as u16)
            .unwrap();
        self.data
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

/// A decoded, immutable block.
pub struct Block {
    data: Vec<u8>,
    offsets: Vec<u16>,
}

impl Block {
    /// Decodes a block, validating the trailer and every record boundary
    /// up front so record access cannot run out of bounds later.
    pub fn decode(raw: Vec<u8>) -> Result<Self> {
        if raw.len() < 2 {
            return Err(Error::Decode(
                "block trailer",
                io::Error::new(io::ErrorKind::UnexpectedEof, "block shorter than its trailer"),
            ));
        }

        let count = (&raw[raw.len() - 2..]).read_u16::<BigEndian>()? as usize;
        let offsets_start = raw
            .len()
            .checked_sub(2 + count * 2)
            .ok_or_else(|| Error::Corruption("block offset table out of bounds".to_string()))?;

        let mut offsets = Vec::with_capacity(count);
        let mut cursor = &raw[offsets_start..raw.len() - 2];
        for _ in 0..count {
            offsets.push(cursor.read_u16::<BigEndian>()?);
        }

        let data = raw[..offsets_start].to_vec();
        let block = Self { data, offsets };
        for i in 0..count {
            block.check_record(i)?;
        }
        Ok(block)
    }

    pub fn entry_count(&self) -> usize {
        self.offsets.len()
    }

    /// The record at `idx` as borrowed key and value slices.
    pub fn record_at(&self, idx: usize) -> (&[u8], &[u8]) {
        let mut pos = self.offsets[idx] as usize;
        let klen = u16::from_be_bytes([self.data[pos], self.data[pos + 1]]) as usize;
        pos += 2;
        let key = &self.data[pos..pos + klen];
        pos += klen;
        let vlen = u16::from_be_bytes([self.data[pos], self.data[pos + 1]]) as usize;
        pos += 2;
        let value = &self.data[pos..pos + vlen];
        (key, value)
    }

    /// Binary search: the index of the first record with key >= `key`.
    pub fn partition_at_key(&self, key: &[u8]) -> usize {
        let mut lo = 0;
        let mut hi = self.offsets.len();
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.record_at(mid).0 < key {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo
    }

    /// Binary search guided by a monotone predicate: the index of the
    /// first record whose key is no longer in the `Greater` region.
    pub fn partition_by_pred<F>(&self, pred: &F) -> usize
    where
        F: Fn(&[u8]) -> Ordering,
    {
        let mut lo = 0;
        let mut hi = self.offsets.len();
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if pred(self.record_at(mid).0) == Ordering::Greater {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo
    }

    /// Exact-match lookup within this block.
    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        let idx = self.partition_at_key(key);
        if idx >= self.offsets.len() {
            return None;
        }
        let (found, value) = self.record_at(idx);
        if found == key {
            Some(value.to_vec())
        } else {
            None
        }
    }

    /// Cursor over all records.
    pub fn iter(self: Arc<Self>) -> BlockIterator {
        BlockIterator {
            block: self,
            idx: 0,
        }
    }

    fn check_record(&self, idx: usize) -> Result<()> {
        let corrupt = || Error::Corruption(format!("block record {idx} out of bounds"));
        let mut pos = self.offsets[idx] as usize;
        if pos + 2 > self.data.len() {
            return Err(corrupt());
        }
        let klen = u16::from_be_bytes([self.data[pos], self.data[pos + 1]]) as usize;
        pos += 2 + klen;
        if pos + 2 > self.data.len() {
            return Err(corrupt());
        }
        let vlen = u16::from_be_bytes([self.data[pos], self.data[pos + 1]]) as usize;
        pos += 2 + vlen;
        if pos > self.data.len() {
            return Err(corrupt());
        }
        Ok(())
    }
}

/// Owning cursor over one block's records.
pub struct BlockIterator {
    block: Arc<Block>,
    idx: usize,
}

impl Iterator for BlockIterator {
    type Item = (Vec<u8>, Vec<u8>);

    fn next(&mut self) -> Option<Self::Item> {
        if self.idx >= self.block.entry_count() {
            return None;
        }
        let (key, value) = self.block.record_at(self.idx);
        self.idx += 1;
        Some((key.to_vec(), value.to_vec()))
    }
}

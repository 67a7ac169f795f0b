//! Bloom filter block: a compact membership approximation over every key
//! stored in an SST, so point lookups for absent keys skip the file
//! without touching a data block.

use crate::error::{Error, Result};

const BITS_PER_KEY: usize = 10;

/// Probabilistic set membership with double hashing over an FNV-1a base.
pub struct BloomFilter {
    bits: Vec<u8>,
    num_bits: usize,
    num_hashes: usize,
}

impl BloomFilter {
    /// Builds a filter from pre-computed key hashes (see [`hash_key`]).
    pub fn from_hashes(hashes: &[u64]) -> Self {
        // Whole bytes, so the bit count survives an encode/decode
        // round-trip (decode recovers it as bits.len() * 8).
        let num_bytes = std::cmp::max(64, BITS_PER_KEY * hashes.len()).div_ceil(8);
        let num_bits = num_bytes * 8;
        let num_hashes = std::cmp::max(1, (BITS_PER_KEY as f64 * 0.69) as usize);

        let mut filter = Self {
            bits: vec![0; num_bytes],
            num_bits,
            num_hashes,
        };
        for &hash in hashes {
            for i in 0..filter.num_hashes {
                let pos = filter.bit_position(hash, i);
                filter.bits[pos / 8] |= 1 << (pos % 8);
            }
        }
        filter
    }

    /// Whether `key` might be present. False positives are possible,
    /// false negatives are not.
    pub fn may_contain(&self, key: &[u8]) -> bool {
        let hash = hash_key(key);
        for i in 0..self.num_hashes {
            let pos = self.bit_position(hash, i);
            if self.bits[pos / 8] & (1 << (pos % 8)) == 0 {
                return false;
            }
        }
        true
    }

    /// Encoding: `num_hashes:u8 | bit array`.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.push(self.num_hashes as u8);
        buf.extend_from_slice(&self.bits);
    }

    pub fn decode(raw: &[u8]) -> Result<Self> {
        if raw.len() < 2 {
            return Err(Error::Corruption("bloom block too short".to_string()));
        }
        let num_hashes = raw[0] as usize;
        let bits = raw[1..].to_vec();
        let num_bits = bits.len() * 8;
        Ok(Self {
            bits,
            num_bits,
            num_hashes,
        })
    }

    /// Double hashing: split the 64-bit hash into two 32-bit halves.
    fn bit_position(&self, hash: u64, i: usize) -> usize {
        let h1 = hash as u32 as usize;
        let h2 = (hash >> 32) as usize;
        h1.wrapping_add(i.wrapping_mul(h2)) % self.num_bits
    }
}

/// FNV-1a over the key bytes.
pub fn hash_key(key: &[u8]) -> u64 {
    let mut hash = 0xcbf29ce484222325u64;
    for byte in key {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

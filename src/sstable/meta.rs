//! Per-block meta index entries for an SST.
//!
//! The meta index holds one entry per data block: its position in the
//! file and its first and last keys. Point lookups binary-search the
//! first keys to find the one candidate block; range code uses the
//! first/last pair to decide whether a block overlaps at all.

use std::io::{Cursor, Read};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Error, Result};

/// Location and key range of one data block.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockMeta {
    pub offset: u32,
    pub len: u32,
    pub first_key: Vec<u8>,
    pub last_key: Vec<u8>,
}

impl BlockMeta {
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.write_u32::<BigEndian>(self.offset).unwrap();
        buf.write_u32::<BigEndian>(self.len).unwrap();

        buf.write_u16::<BigEndian>(self.first_key.len() as u16)
            .unwrap();
        buf.extend_from_slice(&self.first_key);

        buf.write_u16::<BigEndian>(self.last_key.len() as u16)
            .unwrap();
        buf.extend_from_slice(&self.last_key);
    }

    pub fn decode_from(cursor: &mut Cursor<&[u8]>) -> Result<Self> {
        let offset = cursor
            .read_u32::<BigEndian>()
            .map_err(|e| Error::Decode("block offset in meta index", e))?;
        let len = cursor
            .read_u32::<BigEndian>()
            .map_err(|e| Error::Decode("block length in meta index", e))?;

        let first_key_len = cursor
            .read_u16::<BigEndian>()
            .map_err(|e| Error::Decode("first key length in meta index", e))?
            as usize;
        let mut first_key = vec![0u8; first_key_len];
        cursor
            .read_exact(&mut first_key)
            .map_err(|e| Error::Decode("first key in meta index", e))?;

        let last_key_len = cursor
            .read_u16::<BigEndian>()
            .map_err(|e| Error::Decode("last key length in meta index", e))?
            as usize;
        let mut last_key = vec![0u8; last_key_len];
        cursor
            .read_exact(&mut last_key)
            .map_err(|e| Error::Decode("last key in meta index", e))?;

        Ok(Self {
            offset,
            len,
            first_key,
            last_key,
        })
    }
}

/// Binary search across block metas: the index of the block that may
/// contain `key`, i.e. the last block whose first key is <= `key`.
/// `None` means the key sorts before every block.
pub fn find_candidate(metas: &[BlockMeta], key: &[u8]) -> Option<usize> {
    let mut lo = 0;
    let mut hi = metas.len();
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        if metas[mid].first_key.as_slice() <= key {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    lo.checked_sub(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(offset: u32, first: &[u8], last: &[u8]) -> BlockMeta {
        BlockMeta {
            offset,
            len: 100,
            first_key: first.to_vec(),
            last_key: last.to_vec(),
        }
    }

    fn test_metas() -> Vec<BlockMeta> {
        vec![
            meta(0, b"apple", b"avocado"),
            meta(100, b"banana", b"cherry"),
            meta(200, b"date", b"fig"),
        ]
    }

    #[test]
    fn test_find_exact_first_key() {
        let metas = test_metas();
        assert_eq!(find_candidate(&metas, b"banana"), Some(1));
    }

    #[test]
    fn test_find_between_blocks() {
        let metas = test_metas();
        // Sorts after the first block's keys begin, before the second's.
        assert_eq!(find_candidate(&metas, b"apricot"), Some(0));
    }

    #[test]
    fn test_find_smaller_than_all() {
        let metas = test_metas();
        assert_eq!(find_candidate(&metas, b"aardvark"), None);
    }

    #[test]
    fn test_find_larger_than_all() {
        let metas = test_metas();
        assert_eq!(find_candidate(&metas, b"zebra"), Some(2));
    }

    #[test]
    fn test_find_empty_index() {
        assert_eq!(find_candidate(&[], b"any"), None);
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let original = test_metas();
        let mut buf = Vec::new();
        for m in &original {
            m.encode_into(&mut buf);
        }

        let mut cursor = Cursor::new(buf.as_slice());
        let mut decoded = Vec::new();
        while (cursor.position() as usize) < buf.len() {
            decoded.push(BlockMeta::decode_from(&mut cursor).expect("decode failed"));
        }
        assert_eq!(original, decoded);
    }

    #[test]
    fn test_decode_truncated_fails() {
        let mut buf = Vec::new();
        meta(0, b"apple", b"avocado").encode_into(&mut buf);
        buf.truncate(buf.len() - 4);

        let mut cursor = Cursor::new(buf.as_slice());
        assert!(BlockMeta::decode_from(&mut cursor).is_err());
    }
}

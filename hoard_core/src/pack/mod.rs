//! Pack files: append-only containers of length-prefixed values with a
//! sorted key index at the end.
//!
//! Layout (all integers little-endian):
//! ```text
//! 0x00  8   footer offset
//! 0x08  ..  entries: u16 len, len bytes
//! footer:   u64 count, then count x (u16 keylen, key, u64 offset)
//! ```
//!
//! Footer keys are strictly ascending in byte order. An entry offset points
//! at the entry's length prefix; the value length is read from there rather
//! than stored in the index.

mod reader;
mod writer;

pub use reader::PackReader;
pub use writer::PackWriter;

use crate::error::{Error, Result};

/// Size of the header holding the footer offset.
pub const HEADER_LEN: u64 = 8;

/// One index record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub key: Vec<u8>,
    pub offset: u64,
}

/// The sorted key index of one pack.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PackIndex {
    entries: Vec<IndexEntry>,
}

impl PackIndex {
    /// Build an index from unsorted entries. Keys must be unique.
    pub fn from_entries(mut entries: Vec<IndexEntry>) -> Result<Self> {
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        if entries.windows(2).any(|w| w[0].key == w[1].key) {
            return Err(Error::corrupt_pack("duplicate key in pack index"));
        }
        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    /// Offset of the entry stored under `key`.
    pub fn find(&self, key: &[u8]) -> Option<u64> {
        self.entries
            .binary_search_by(|e| e.key.as_slice().cmp(key))
            .ok()
            .map(|i| self.entries[i].offset)
    }

    /// Serialize in footer form.
    pub fn encode(&self) -> Vec<u8> {
        let size: usize = self.entries.iter().map(|e| 2 + e.key.len() + 8).sum();
        let mut buf = Vec::with_capacity(8 + size);
        buf.extend_from_slice(&(self.entries.len() as u64).to_le_bytes());
        for entry in &self.entries {
            buf.extend_from_slice(&(entry.key.len() as u16).to_le_bytes());
            buf.extend_from_slice(&entry.key);
            buf.extend_from_slice(&entry.offset.to_le_bytes());
        }
        buf
    }

    /// Parse footer bytes, rejecting unordered keys and trailing garbage.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut cur = Cursor { data, pos: 0 };
        let count = cur.u64()?;
        // Every record takes at least 10 bytes.
        if count > (data.len() as u64) / 10 {
            return Err(Error::corrupt_pack(format!(
                "index claims {} entries in {} bytes",
                count,
                data.len()
            )));
        }

        let mut entries: Vec<IndexEntry> = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let keylen = cur.u16()? as usize;
            let key = cur.take(keylen)?.to_vec();
            let offset = cur.u64()?;
            if let Some(prev) = entries.last() {
                if prev.key >= key {
                    return Err(Error::corrupt_pack("index keys are not strictly ascending"));
                }
            }
            if offset < HEADER_LEN {
                return Err(Error::corrupt_pack(format!(
                    "entry offset {} inside the header",
                    offset
                )));
            }
            entries.push(IndexEntry { key, offset });
        }

        if cur.pos != data.len() {
            return Err(Error::corrupt_pack(format!(
                "{} trailing bytes after index",
                data.len() - cur.pos
            )));
        }
        Ok(Self { entries })
    }
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let bytes = self
            .data
            .get(self.pos..self.pos + n)
            .ok_or_else(|| Error::corrupt_pack("truncated index"))?;
        self.pos += n;
        Ok(bytes)
    }

    fn u16(&mut self) -> Result<u16> {
        let mut b = [0u8; 2];
        b.copy_from_slice(self.take(2)?);
        Ok(u16::from_le_bytes(b))
    }

    fn u64(&mut self) -> Result<u64> {
        let mut b = [0u8; 8];
        b.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(b))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::io::Cursor as IoCursor;

    #[test]
    fn test_from_entries_sorts() {
        let idx = PackIndex::from_entries(vec![
            IndexEntry { key: b"b".to_vec(), offset: 20 },
            IndexEntry { key: b"a".to_vec(), offset: 8 },
        ])
        .unwrap();
        assert_eq!(idx.entries()[0].key, b"a");
        assert_eq!(idx.find(b"b"), Some(20));
        assert_eq!(idx.find(b"c"), None);
    }

    #[test]
    fn test_from_entries_rejects_duplicates() {
        let dup = vec![
            IndexEntry { key: b"a".to_vec(), offset: 8 },
            IndexEntry { key: b"a".to_vec(), offset: 10 },
        ];
        assert!(PackIndex::from_entries(dup).is_err());
    }

    #[test]
    fn test_decode_rejects_unsorted() {
        let mut buf = 2u64.to_le_bytes().to_vec();
        for key in [b"z", b"a"] {
            buf.extend_from_slice(&1u16.to_le_bytes());
            buf.extend_from_slice(key);
            buf.extend_from_slice(&8u64.to_le_bytes());
        }
        assert!(PackIndex::decode(&buf).unwrap_err().is_corrupt());
    }

    #[test]
    fn test_decode_rejects_truncation() {
        let idx = PackIndex::from_entries(vec![IndexEntry {
            key: vec![1; 32],
            offset: 8,
        }])
        .unwrap();
        let buf = idx.encode();
        for cut in 0..buf.len() {
            assert!(PackIndex::decode(&buf[..cut]).is_err());
        }
        let mut long = buf.clone();
        long.push(0);
        assert!(PackIndex::decode(&long).is_err());
    }

    #[test]
    fn test_decode_rejects_huge_count() {
        let buf = u64::MAX.to_le_bytes();
        assert!(PackIndex::decode(&buf).is_err());
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 64,
            max_shrink_iters: 10000,
            ..ProptestConfig::default()
        })]

        /// Every inserted key is found with its value; the index is sorted;
        /// absent keys are a clean miss.
        #[test]
        fn prop_pack_index_order_and_search(
            items in prop::collection::btree_map(
                prop::collection::vec(any::<u8>(), 0..40),
                prop::collection::vec(any::<u8>(), 0..200),
                0..100,
            ),
            absent in prop::collection::vec(any::<u8>(), 41..60),
        ) {
            let mut w = PackWriter::new(IoCursor::new(Vec::new()))?;
            for (k, v) in &items {
                w.add(k, v)?;
            }
            let (out, written) = w.close()?;

            let mut r = PackReader::open(IoCursor::new(out.into_inner()))?;
            prop_assert_eq!(r.index().as_ref(), &written);
            let keys: Vec<&Vec<u8>> = r.index().entries().iter().map(|e| &e.key).collect();
            let expected: Vec<&Vec<u8>> = items.keys().collect();
            prop_assert_eq!(keys, expected);

            for (k, v) in &items {
                prop_assert_eq!(r.get(k)?, Some(v.clone()));
            }
            prop_assert_eq!(r.get(&absent)?, None);
        }
    }
}

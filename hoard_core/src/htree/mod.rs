//! Hash trees: arbitrary byte streams stored as bounded-size, content-addressed
//! nodes.
//!
//! Node layout:
//! ```text
//! 0x00  1   level (0..=9)
//! level 0:  raw stream bytes
//! level >0: repeated 40-byte records
//!           0x00  8   start offset of the child subtree (u64 LE)
//!           0x08  32  child digest
//! ```
//!
//! Records are ascending by start offset. A level-L record points at a
//! level-(L-1) node.

mod reader;
mod writer;

pub use reader::Reader;
pub use writer::Writer;

use crate::digest::{DIGEST_SIZE, Digest};
use crate::error::{Error, Result};
use crate::store::{ContentStore, ContentWriter};
use std::fmt;
use std::str::FromStr;

/// Maximum size of any stored node, level byte included.
pub const MAXLEN: usize = 65535;

/// Maximum tree height.
pub const NLEVELS: usize = 10;

/// Size of one index record.
pub const RECORD_LEN: usize = 8 + DIGEST_SIZE;

/// The external name of a stored stream.
///
/// `depth` is the number of levels from the root down to and including the
/// leaves, so the root node's level byte is `depth - 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TreeHandle {
    pub depth: u8,
    pub root: Digest,
}

impl TreeHandle {
    pub fn new(depth: u8, root: Digest) -> Self {
        Self { depth, root }
    }

    /// Level byte the root node must carry.
    pub(crate) fn root_level(&self) -> Result<usize> {
        match self.depth as usize {
            0 => Err(Error::invalid_tree_handle("depth must be at least 1")),
            d if d > NLEVELS => Err(Error::invalid_tree_handle(format!(
                "depth {} exceeds {} levels",
                d, NLEVELS
            ))),
            d => Ok(d - 1),
        }
    }
}

impl fmt::Display for TreeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.depth, self.root)
    }
}

impl FromStr for TreeHandle {
    type Err = Error;

    /// Parse the `<depth>:<hex digest>` form used for tag values.
    fn from_str(s: &str) -> Result<Self> {
        let (depth, root) = s
            .trim()
            .split_once(':')
            .ok_or_else(|| Error::invalid_tree_handle(format!("missing ':' in {:?}", s)))?;
        let depth: u8 = depth
            .parse()
            .map_err(|_| Error::invalid_tree_handle(format!("bad depth {:?}", depth)))?;
        let handle = TreeHandle::new(depth, Digest::from_hex(root)?);
        handle.root_level()?;
        Ok(handle)
    }
}

/// One decoded index record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Record {
    pub start: u64,
    pub child: Digest,
}

/// Decode the record starting at byte `pos` of an index node.
pub(crate) fn record_at(node: &[u8], pos: usize) -> Result<Record> {
    let rec = node
        .get(pos..pos + RECORD_LEN)
        .ok_or_else(|| Error::corrupt_node(format!("truncated record at byte {}", pos)))?;
    let mut start = [0u8; 8];
    start.copy_from_slice(&rec[..8]);
    Ok(Record {
        start: u64::from_le_bytes(start),
        child: Digest::from_slice(&rec[8..])?,
    })
}

/// Number of records in an index node.
pub(crate) fn record_count(node: &[u8]) -> usize {
    node.len().saturating_sub(1) / RECORD_LEN
}

/// Validate a fetched node against the level its parent says it has.
pub(crate) fn check_node(node: &[u8], level: usize) -> Result<()> {
    let Some(&tag) = node.first() else {
        return Err(Error::corrupt_node("empty node"));
    };
    if tag as usize >= NLEVELS {
        return Err(Error::corrupt_node(format!("level byte {} out of range", tag)));
    }
    if tag as usize != level {
        return Err(Error::corrupt_node(format!(
            "expected level {}, found {}",
            level, tag
        )));
    }
    if level > 0 {
        let body = node.len() - 1;
        if body == 0 || body % RECORD_LEN != 0 {
            return Err(Error::corrupt_node(format!(
                "index node body of {} bytes is not a whole number of records",
                body
            )));
        }
    }
    Ok(())
}

/// Store a complete byte stream and return its handle.
pub fn write_all<S: ContentWriter + ?Sized>(store: &S, data: &[u8]) -> Result<TreeHandle> {
    let mut writer = Writer::new(store);
    writer.write(data)?;
    writer.close()
}

/// Read a complete stream back into memory.
pub fn read_all<S: ContentStore + ?Sized>(store: &S, handle: &TreeHandle) -> Result<Vec<u8>> {
    let mut reader = Reader::new(store, *handle)?;
    let mut out = Vec::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            return Ok(out);
        }
        out.extend_from_slice(&buf[..n]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[test]
    fn test_handle_text_roundtrip() {
        let handle = TreeHandle::new(3, Digest::of(b"root"));
        let text = handle.to_string();
        assert!(text.starts_with("3:"));
        assert_eq!(text.parse::<TreeHandle>().unwrap(), handle);
    }

    #[test]
    fn test_handle_parse_rejects_garbage() {
        assert!("".parse::<TreeHandle>().is_err());
        assert!("3".parse::<TreeHandle>().is_err());
        assert!("x:00".parse::<TreeHandle>().is_err());
        let hex = Digest::of(b"r").to_hex();
        assert!(format!("0:{}", hex).parse::<TreeHandle>().is_err());
        assert!(format!("11:{}", hex).parse::<TreeHandle>().is_err());
        assert!(format!("10:{}", hex).parse::<TreeHandle>().is_ok());
    }

    #[test]
    fn test_check_node() {
        assert!(check_node(&[], 0).is_err());
        assert!(check_node(&[0, 1, 2], 0).is_ok());
        assert!(check_node(&[1, 1, 2], 0).is_err());
        assert!(check_node(&[12], 12).is_err());
        assert!(check_node(&[1], 1).is_err());

        let mut node = vec![1u8];
        node.extend_from_slice(&[0u8; RECORD_LEN]);
        assert!(check_node(&node, 1).is_ok());
        node.push(0);
        assert!(check_node(&node, 1).is_err());
    }

    #[test]
    fn test_record_at_truncated() {
        let node = vec![1u8; 20];
        assert!(record_at(&node, 1).is_err());
    }

    #[test]
    fn test_write_all_read_all() {
        let store = MemoryStore::new();
        let data: Vec<u8> = (0..200_000u32).map(|i| (i * 7 % 251) as u8).collect();
        let handle = write_all(&store, &data).unwrap();
        assert_eq!(read_all(&store, &handle).unwrap(), data);
    }
}

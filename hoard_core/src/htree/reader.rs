//! Seekable hash tree reader.

use super::{NLEVELS, RECORD_LEN, TreeHandle, check_node, record_at, record_count};
use crate::digest::Digest;
use crate::error::{Error, Result};
use crate::store::ContentStore;
use std::io::{self, SeekFrom};

/// Reads a hash tree sequentially or from any offset.
///
/// Traversal state is one loaded node and one cursor per level, so moving to
/// the next leaf walks up and down this stack instead of recursing.
pub struct Reader<'a, S: ContentStore + ?Sized> {
    store: &'a S,
    handle: TreeHandle,
    height: usize,
    nodes: [Vec<u8>; NLEVELS],
    pos: [usize; NLEVELS],
    offset: u64,
}

impl<'a, S: ContentStore + ?Sized> Reader<'a, S> {
    pub fn new(store: &'a S, handle: TreeHandle) -> Result<Self> {
        let height = handle.root_level()?;
        let mut reader = Self {
            store,
            handle,
            height,
            nodes: Default::default(),
            pos: [0; NLEVELS],
            offset: 0,
        };
        reader.seek(0)?;
        Ok(reader)
    }

    pub fn handle(&self) -> TreeHandle {
        self.handle
    }

    /// Current absolute offset in the stream.
    pub fn position(&self) -> u64 {
        self.offset
    }

    fn fetch(&self, digest: &Digest, level: usize) -> Result<Vec<u8>> {
        let node = self.store.get(digest)?;
        check_node(&node, level)?;
        Ok(node)
    }

    /// Load the leaf following the current one. Returns false at end of stream.
    fn next_leaf(&mut self) -> Result<bool> {
        let mut lvl = 1;
        loop {
            if lvl > self.height {
                return Ok(false);
            }
            if self.pos[lvl] < self.nodes[lvl].len() {
                break;
            }
            lvl += 1;
        }

        while lvl > 0 {
            let rec = record_at(&self.nodes[lvl], self.pos[lvl])?;
            self.pos[lvl] += RECORD_LEN;
            self.nodes[lvl - 1] = self.fetch(&rec.child, lvl - 1)?;
            self.pos[lvl - 1] = 1;
            lvl -= 1;
        }
        Ok(true)
    }

    /// Read into `buf`, returning 0 at end of stream.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut nread = 0;
        while nread < buf.len() {
            let leaf = &self.nodes[0];
            let avail = &leaf[self.pos[0].min(leaf.len())..];
            if avail.is_empty() {
                if !self.next_leaf()? {
                    break;
                }
                continue;
            }
            let n = avail.len().min(buf.len() - nread);
            buf[nread..nread + n].copy_from_slice(&avail[..n]);
            self.pos[0] += n;
            nread += n;
        }
        self.offset += nread as u64;
        Ok(nread)
    }

    /// Position the reader at `target`, or at end of stream if `target` lies
    /// beyond it. Returns the offset actually reached.
    pub fn seek(&mut self, target: u64) -> Result<u64> {
        let mut lvl = self.height;
        self.nodes[lvl] = self.fetch(&self.handle.root, lvl)?;
        self.pos[lvl] = 1;

        let mut start = 0u64;
        while lvl > 0 {
            let node = &self.nodes[lvl];
            let count = record_count(node);
            let mut i = 0;
            while i + 1 < count && record_at(node, 1 + (i + 1) * RECORD_LEN)?.start <= target {
                i += 1;
            }
            let rec = record_at(node, 1 + i * RECORD_LEN)?;
            if rec.start < start {
                return Err(Error::corrupt_node(format!(
                    "record offset {} precedes parent offset {}",
                    rec.start, start
                )));
            }
            start = rec.start;
            self.pos[lvl] = 1 + (i + 1) * RECORD_LEN;
            self.nodes[lvl - 1] = self.fetch(&rec.child, lvl - 1)?;
            self.pos[lvl - 1] = 1;
            lvl -= 1;
        }

        let leaf_len = (self.nodes[0].len() - 1) as u64;
        let within = target.saturating_sub(start).min(leaf_len);
        self.pos[0] = 1 + within as usize;
        self.offset = start + within;
        Ok(self.offset)
    }

    /// Total length of the stream. Leaves the reader at end of stream.
    pub fn size(&mut self) -> Result<u64> {
        self.seek(u64::MAX)
    }
}

impl<S: ContentStore + ?Sized> io::Read for Reader<'_, S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Reader::read(self, buf).map_err(io::Error::other)
    }
}

impl<S: ContentStore + ?Sized> io::Seek for Reader<'_, S> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(n) => Some(n),
            SeekFrom::Current(d) => self.offset.checked_add_signed(d),
            SeekFrom::End(d) => {
                let size = self.size().map_err(io::Error::other)?;
                size.checked_add_signed(d)
            }
        };
        let target = target.ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "seek to a negative offset")
        })?;
        Reader::seek(self, target).map_err(io::Error::other)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::htree::Writer;
    use crate::store::MemoryStore;
    use std::io::Read as _;

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 253) as u8).collect()
    }

    fn store_stream(store: &MemoryStore, data: &[u8], leaf_len: usize) -> TreeHandle {
        let mut w = Writer::with_leaf_len(store, leaf_len);
        w.write(data).unwrap();
        w.close().unwrap()
    }

    #[test]
    fn test_sequential_small_reads() {
        let store = MemoryStore::new();
        let data = pattern(10_000);
        let handle = store_stream(&store, &data, 64);

        let mut r = Reader::new(&store, handle).unwrap();
        let mut out = Vec::new();
        let mut buf = [0u8; 7];
        loop {
            let n = r.read(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        assert_eq!(out, data);
        assert_eq!(r.position(), data.len() as u64);
    }

    #[test]
    fn test_seek_every_offset() {
        let store = MemoryStore::new();
        let data = pattern(700);
        let handle = store_stream(&store, &data, 10);
        let mut r = Reader::new(&store, handle).unwrap();

        for off in 0..=data.len() {
            assert_eq!(r.seek(off as u64).unwrap(), off as u64);
            let mut rest = Vec::new();
            r.read_to_end(&mut rest).unwrap();
            assert_eq!(rest, &data[off..]);
        }
    }

    #[test]
    fn test_seek_past_end_clamps() {
        let store = MemoryStore::new();
        let data = pattern(1000);
        let handle = store_stream(&store, &data, 100);
        let mut r = Reader::new(&store, handle).unwrap();

        assert_eq!(r.seek(1000).unwrap(), 1000);
        assert_eq!(r.seek(1001).unwrap(), 1000);
        let mut buf = [0u8; 1];
        assert_eq!(r.read(&mut buf).unwrap(), 0);
        assert_eq!(r.size().unwrap(), 1000);
    }

    #[test]
    fn test_io_seek_variants() {
        let store = MemoryStore::new();
        let data = pattern(500);
        let handle = store_stream(&store, &data, 50);
        let mut r = Reader::new(&store, handle).unwrap();

        assert_eq!(io::Seek::seek(&mut r, SeekFrom::End(-10)).unwrap(), 490);
        assert_eq!(io::Seek::seek(&mut r, SeekFrom::Current(-90)).unwrap(), 400);
        let mut buf = [0u8; 1];
        r.read_exact(&mut buf).unwrap();
        assert_eq!(buf[0], data[400]);
        assert!(io::Seek::seek(&mut r, SeekFrom::Current(-1000)).is_err());
    }

    #[test]
    fn test_missing_node_fails() {
        let store = MemoryStore::new();
        let data = pattern(300);
        let handle = store_stream(&store, &data, 100);

        let empty = MemoryStore::new();
        assert!(Reader::new(&empty, handle).err().unwrap().is_not_found());
    }

    #[test]
    fn test_wrong_depth_is_corrupt() {
        let store = MemoryStore::new();
        let handle = store_stream(&store, &pattern(300), 100);
        let lying = TreeHandle::new(handle.depth + 1, handle.root);
        assert!(Reader::new(&store, lying).err().unwrap().is_corrupt());
    }
}

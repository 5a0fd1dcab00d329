//! Append-only hash tree writer.

use super::{MAXLEN, NLEVELS, RECORD_LEN, TreeHandle, record_at, record_count};
use crate::digest::Digest;
use crate::error::{Error, Result};
use crate::store::ContentWriter;
use std::io;

/// Streams bytes into a hash tree.
///
/// One node buffer is kept per level. A buffer holding only its level byte
/// has no content yet.
pub struct Writer<'a, S: ContentWriter + ?Sized> {
    store: &'a S,
    levels: [Vec<u8>; NLEVELS],
    offset: u64,
    leaf_len: usize,
}

impl<'a, S: ContentWriter + ?Sized> Writer<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Self::with_leaf_len(store, MAXLEN)
    }

    /// Use smaller leaves. Index nodes keep the full size cap.
    pub fn with_leaf_len(store: &'a S, leaf_len: usize) -> Self {
        Self {
            store,
            levels: std::array::from_fn(|lvl| vec![lvl as u8]),
            offset: 0,
            leaf_len: leaf_len.clamp(2, MAXLEN),
        }
    }

    /// Bytes accepted so far.
    pub fn len(&self) -> u64 {
        self.offset + (self.levels[0].len() - 1) as u64
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn write(&mut self, mut buf: &[u8]) -> Result<usize> {
        let total = buf.len();
        while !buf.is_empty() {
            let room = self.leaf_len - self.levels[0].len();
            if room == 0 {
                self.flush_level(0)?;
                continue;
            }
            let n = room.min(buf.len());
            self.levels[0].extend_from_slice(&buf[..n]);
            buf = &buf[n..];
        }
        Ok(total)
    }

    /// Store the node at `lvl` and record it one level up.
    fn flush_level(&mut self, lvl: usize) -> Result<()> {
        let node = std::mem::replace(&mut self.levels[lvl], vec![lvl as u8]);
        let digest = self.store.put(&node)?;

        let start = if lvl == 0 {
            let start = self.offset;
            self.offset += (node.len() - 1) as u64;
            start
        } else {
            // A subtree starts where its first record starts.
            record_at(&node, 1)?.start
        };

        self.push_record(lvl + 1, start, digest)
    }

    fn push_record(&mut self, lvl: usize, start: u64, digest: Digest) -> Result<()> {
        if lvl >= NLEVELS {
            return Err(Error::TreeTooDeep { levels: NLEVELS });
        }
        if self.levels[lvl].len() + RECORD_LEN > MAXLEN {
            self.flush_level(lvl)?;
        }
        let node = &mut self.levels[lvl];
        node.extend_from_slice(&start.to_le_bytes());
        node.extend_from_slice(digest.as_bytes());
        Ok(())
    }

    fn has_records(&self, lvl: usize) -> bool {
        record_count(&self.levels[lvl]) > 0
    }

    /// Flush every level bottom-up and return the handle of the stream.
    pub fn close(mut self) -> Result<TreeHandle> {
        let nothing_flushed = (1..NLEVELS).all(|lvl| !self.has_records(lvl));
        if self.levels[0].len() > 1 || nothing_flushed {
            self.flush_level(0)?;
        }

        for lvl in 1..NLEVELS {
            if !self.has_records(lvl) {
                continue;
            }
            let is_top = (lvl + 1..NLEVELS).all(|l| !self.has_records(l));
            if !is_top {
                self.flush_level(lvl)?;
                continue;
            }

            let node = &self.levels[lvl];
            return if record_count(node) == 1 {
                let only = record_at(node, 1)?;
                Ok(TreeHandle::new(lvl as u8, only.child))
            } else {
                let root = self.store.put(node)?;
                Ok(TreeHandle::new(lvl as u8 + 1, root))
            };
        }

        // Level 0 was flushed above, so some level holds a record.
        Err(Error::corrupt_node("hash tree writer lost its root"))
    }
}

impl<S: ContentWriter + ?Sized> io::Write for Writer<'_, S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Writer::write(self, buf).map_err(io::Error::other)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

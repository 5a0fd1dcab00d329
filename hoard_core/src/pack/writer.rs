use super::{HEADER_LEN, IndexEntry, PackIndex};
use crate::error::{Error, Result};
use std::collections::HashSet;
use std::io::{Seek, SeekFrom, Write};

/// Appends values to a pack, then writes its index on close.
pub struct PackWriter<W: Write + Seek> {
    inner: W,
    offset: u64,
    keys: HashSet<Vec<u8>>,
    entries: Vec<IndexEntry>,
}

impl<W: Write + Seek> PackWriter<W> {
    /// Start a pack at the current position of `inner`, which must be the
    /// start of the stream.
    pub fn new(mut inner: W) -> Result<Self> {
        inner.write_all(&[0u8; HEADER_LEN as usize])?;
        Ok(Self {
            inner,
            offset: HEADER_LEN,
            keys: HashSet::new(),
            entries: Vec::new(),
        })
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// Append a value. Returns false without writing if `key` is already in
    /// this pack.
    pub fn add(&mut self, key: &[u8], value: &[u8]) -> Result<bool> {
        if key.len() > u16::MAX as usize {
            return Err(Error::value_too_large(format!(
                "pack key of {} bytes",
                key.len()
            )));
        }
        if value.len() > u16::MAX as usize {
            return Err(Error::value_too_large(format!(
                "pack value of {} bytes",
                value.len()
            )));
        }
        if self.keys.contains(key) {
            return Ok(false);
        }

        self.inner.write_all(&(value.len() as u16).to_le_bytes())?;
        self.inner.write_all(value)?;
        self.keys.insert(key.to_vec());
        self.entries.push(IndexEntry {
            key: key.to_vec(),
            offset: self.offset,
        });
        self.offset += 2 + value.len() as u64;
        Ok(true)
    }

    /// Write the index and patch the header. Returns the underlying stream,
    /// positioned at its end, and the index that was written.
    pub fn close(mut self) -> Result<(W, PackIndex)> {
        let index = PackIndex::from_entries(std::mem::take(&mut self.entries))?;
        let footer_offset = self.offset;
        self.inner.write_all(&index.encode())?;
        self.inner.seek(SeekFrom::Start(0))?;
        self.inner.write_all(&footer_offset.to_le_bytes())?;
        self.inner.seek(SeekFrom::End(0))?;
        self.inner.flush()?;
        Ok((self.inner, index))
    }
}

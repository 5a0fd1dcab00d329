use super::{HEADER_LEN, PackIndex};
use crate::error::{Error, Result};
use std::io::{Read, Seek, SeekFrom};
use std::sync::Arc;

/// Random access to the values of a closed pack.
pub struct PackReader<R: Read + Seek> {
    inner: R,
    index: Arc<PackIndex>,
    footer_offset: u64,
}

impl<R: Read + Seek> PackReader<R> {
    /// Open a pack, loading its index from the footer.
    pub fn open(mut inner: R) -> Result<Self> {
        let footer_offset = read_footer_offset(&mut inner)?;
        inner.seek(SeekFrom::Start(footer_offset))?;
        let mut footer = Vec::new();
        inner.read_to_end(&mut footer)?;
        let index = PackIndex::decode(&footer)?;
        check_offsets(&index, footer_offset)?;
        Ok(Self {
            inner,
            index: Arc::new(index),
            footer_offset,
        })
    }

    /// Open a pack whose index is already known, skipping the footer read.
    pub fn with_index(mut inner: R, index: Arc<PackIndex>) -> Result<Self> {
        let footer_offset = read_footer_offset(&mut inner)?;
        check_offsets(&index, footer_offset)?;
        Ok(Self {
            inner,
            index,
            footer_offset,
        })
    }

    pub fn index(&self) -> &Arc<PackIndex> {
        &self.index
    }

    /// Look `key` up in the index and read its value. A key that is not in
    /// the pack is `None`, not an error.
    pub fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        match self.index.find(key) {
            Some(offset) => self.read_at(offset).map(Some),
            None => Ok(None),
        }
    }

    /// Read the length-prefixed value at `offset`.
    pub fn read_at(&mut self, offset: u64) -> Result<Vec<u8>> {
        if !entry_fits(offset, 0, self.footer_offset) {
            return Err(Error::corrupt_pack(format!(
                "entry offset {} outside the data region",
                offset
            )));
        }
        self.inner.seek(SeekFrom::Start(offset))?;
        let mut len = [0u8; 2];
        self.inner.read_exact(&mut len)?;
        let len = u16::from_le_bytes(len) as u64;
        if !entry_fits(offset, len, self.footer_offset) {
            return Err(Error::corrupt_pack(format!(
                "entry at {} runs into the index",
                offset
            )));
        }
        let mut value = vec![0u8; len as usize];
        self.inner.read_exact(&mut value)?;
        Ok(value)
    }
}

fn read_footer_offset<R: Read + Seek>(inner: &mut R) -> Result<u64> {
    inner.seek(SeekFrom::Start(0))?;
    let mut header = [0u8; HEADER_LEN as usize];
    inner
        .read_exact(&mut header)
        .map_err(|_| Error::corrupt_pack("pack shorter than its header"))?;
    let footer_offset = u64::from_le_bytes(header);
    let len = inner.seek(SeekFrom::End(0))?;
    if footer_offset < HEADER_LEN || footer_offset > len {
        return Err(Error::corrupt_pack(format!(
            "footer offset {} outside a {} byte pack",
            footer_offset, len
        )));
    }
    Ok(footer_offset)
}

/// Whether a value of `len` bytes with its length prefix, starting at
/// `offset`, lies between the header and the footer.
fn entry_fits(offset: u64, len: u64, footer_offset: u64) -> bool {
    offset >= HEADER_LEN
        && offset
            .checked_add(2 + len)
            .is_some_and(|end| end <= footer_offset)
}

fn check_offsets(index: &PackIndex, footer_offset: u64) -> Result<()> {
    match index
        .entries()
        .iter()
        .find(|e| !entry_fits(e.offset, 0, footer_offset))
    {
        Some(bad) => Err(Error::corrupt_pack(format!(
            "index entry offset {} past footer at {}",
            bad.offset, footer_offset
        ))),
        None => Ok(()),
    }
}

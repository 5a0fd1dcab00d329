//! Directory encoding.
//!
//! A directory is a hash-tree stream of entries sorted by name. Each entry:
//! ```text
//! 2   name length (u16 LE)
//! N   name (UTF-8)
//! 8   size (u64 LE)
//! 4   mode (u32 LE)
//! 8   mtime, seconds since the epoch (i64 LE)
//! 1   depth of the entry's hash tree
//! 32  root digest of the entry's hash tree
//! ```

use crate::digest::{DIGEST_SIZE, Digest};
use crate::error::{Error, Result};
use crate::htree::{self, TreeHandle};
use crate::store::{ContentStore, ContentWriter};
use std::io::{Cursor, Read};

/// File mode (POSIX type and permission bits).
pub type FileMode = u32;

/// Common file modes.
pub mod file_modes {
    use super::FileMode;

    /// Regular file (non-executable).
    pub const REGULAR: FileMode = 0o100644;

    /// Executable file.
    pub const EXECUTABLE: FileMode = 0o100755;

    /// Directory.
    pub const DIRECTORY: FileMode = 0o040755;

    /// Mask selecting the file type bits.
    pub const TYPE_MASK: FileMode = 0o170000;

    /// File type bits of a directory.
    pub const DIR_TYPE: FileMode = 0o040000;
}

/// Kind of a directory entry, derived from its mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Dir,
}

/// One entry of a directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub mode: FileMode,
    pub size: u64,
    pub mtime: i64,
    /// File contents, or the nested directory stream.
    pub handle: TreeHandle,
}

impl DirEntry {
    /// Create an entry, validating its name.
    pub fn new(
        name: impl Into<String>,
        mode: FileMode,
        size: u64,
        mtime: i64,
        handle: TreeHandle,
    ) -> Result<Self> {
        let name = name.into();
        validate_entry_name(&name)?;
        Ok(Self {
            name,
            mode,
            size,
            mtime,
            handle,
        })
    }

    pub fn kind(&self) -> EntryKind {
        if self.mode & file_modes::TYPE_MASK == file_modes::DIR_TYPE {
            EntryKind::Dir
        } else {
            EntryKind::File
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind() == EntryKind::Dir
    }

    fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&(self.name.len() as u16).to_le_bytes());
        buf.extend_from_slice(self.name.as_bytes());
        buf.extend_from_slice(&self.size.to_le_bytes());
        buf.extend_from_slice(&self.mode.to_le_bytes());
        buf.extend_from_slice(&self.mtime.to_le_bytes());
        buf.push(self.handle.depth);
        buf.extend_from_slice(self.handle.root.as_bytes());
    }

    fn decode(reader: &mut Cursor<&[u8]>) -> Result<Self> {
        let name_len = u16::from_le_bytes(read_field(reader)?) as usize;
        let mut name = vec![0u8; name_len];
        reader
            .read_exact(&mut name)
            .map_err(|_| Error::invalid_dir_entry("truncated name"))?;
        let name = String::from_utf8(name)
            .map_err(|e| Error::invalid_dir_entry(format!("Invalid UTF-8 in name: {}", e)))?;

        let size = u64::from_le_bytes(read_field(reader)?);
        let mode = u32::from_le_bytes(read_field(reader)?);
        let mtime = i64::from_le_bytes(read_field(reader)?);
        let [depth] = read_field(reader)?;
        let root: [u8; DIGEST_SIZE] = read_field(reader)?;

        let handle = TreeHandle::new(depth, Digest::from_bytes(root));
        handle.root_level()?;
        Self::new(name, mode, size, mtime, handle)
    }
}

fn read_field<const N: usize>(reader: &mut Cursor<&[u8]>) -> Result<[u8; N]> {
    let mut buf = [0u8; N];
    reader
        .read_exact(&mut buf)
        .map_err(|_| Error::invalid_dir_entry("truncated entry"))?;
    Ok(buf)
}

fn validate_entry_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::invalid_dir_entry("Name cannot be empty"));
    }
    if name.len() > u16::MAX as usize {
        return Err(Error::invalid_dir_entry(format!(
            "Name too long: {} bytes (max {})",
            name.len(),
            u16::MAX
        )));
    }
    if name == "." || name == ".." {
        return Err(Error::invalid_dir_entry(format!("Reserved name {:?}", name)));
    }
    if name.contains('/') || name.contains('\0') {
        return Err(Error::invalid_dir_entry(format!(
            "Name {:?} contains '/' or a null byte",
            name
        )));
    }
    Ok(())
}

/// Encode entries in canonical order. Duplicate names are rejected.
pub fn encode_dir(mut entries: Vec<DirEntry>) -> Result<Vec<u8>> {
    entries.sort_by(|a, b| a.name.as_bytes().cmp(b.name.as_bytes()));
    if let Some(pair) = entries.windows(2).find(|w| w[0].name == w[1].name) {
        return Err(Error::invalid_dir_entry(format!(
            "duplicate entry {:?}",
            pair[0].name
        )));
    }

    let size = entries.iter().map(|e| 55 + e.name.len()).sum();
    let mut buf = Vec::with_capacity(size);
    for entry in &entries {
        entry.encode_into(&mut buf);
    }
    Ok(buf)
}

/// Decode an encoded directory, checking canonical order.
pub fn decode_dir(data: &[u8]) -> Result<Vec<DirEntry>> {
    let mut reader = Cursor::new(data);
    let mut entries: Vec<DirEntry> = Vec::new();

    while reader.position() < data.len() as u64 {
        let entry = DirEntry::decode(&mut reader)?;
        if let Some(prev) = entries.last()
            && prev.name.as_bytes() >= entry.name.as_bytes()
        {
            return Err(Error::invalid_dir_entry(format!(
                "entry {:?} out of order after {:?}",
                entry.name, prev.name
            )));
        }
        entries.push(entry);
    }

    Ok(entries)
}

/// Store a directory and return the handle of its stream.
pub fn write_dir<S: ContentWriter + ?Sized>(store: &S, entries: Vec<DirEntry>) -> Result<TreeHandle> {
    htree::write_all(store, &encode_dir(entries)?)
}

/// Load a directory stored with [`write_dir`].
pub fn read_dir<S: ContentStore + ?Sized>(store: &S, handle: &TreeHandle) -> Result<Vec<DirEntry>> {
    decode_dir(&htree::read_all(store, handle)?)
}

//! The remote pack repository the store persists to.
//!
//! A repository holds immutable pack files and mutable named tags. Pack
//! removal and tag updates are fenced by a GC epoch: every start or stop of a
//! collection bumps the epoch, an upload that straddles a bump is refused at
//! commit, and packs can only be removed by the collection holding the
//! current epoch.

mod local;
mod memory;

pub use local::LocalRepository;
pub use memory::MemoryRepository;

use crate::error::{Error, Result};
use serde::Serialize;
use std::fmt;
use std::io::{Read, Seek, Write};

/// Longest accepted pack or tag name.
pub const MAX_NAME_LEN: usize = 1024;

/// Fencing token for pack removal and tag updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct GcEpoch(pub u64);

impl fmt::Display for GcEpoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One published pack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PackListing {
    pub name: String,
    pub size: u64,
}

/// A readable, seekable pack stream.
pub trait PackSource: Read + Seek + Send {}

impl<T: Read + Seek + Send> PackSource for T {}

/// A pack being uploaded. It becomes visible only on [`commit`]; dropping it
/// uncommitted discards it.
///
/// [`commit`]: PackUpload::commit
pub trait PackUpload: Write + Send {
    /// Publish the pack. Fails with `GcConflict` if a collection started or
    /// stopped since the upload was created.
    fn commit(self: Box<Self>) -> Result<()>;

    /// Discard the upload.
    fn cancel(self: Box<Self>) -> Result<()>;
}

/// Storage for packs and tags.
pub trait PackRepository: Send + Sync {
    fn list_packs(&self) -> Result<Vec<PackListing>>;

    fn open_pack(&self, name: &str) -> Result<Box<dyn PackSource>>;

    /// Begin uploading a new pack. The name must not already exist.
    fn create_pack(&self, name: &str) -> Result<Box<dyn PackUpload>>;

    /// Remove a pack. Requires a running collection holding `epoch`.
    fn remove_pack(&self, name: &str, epoch: GcEpoch) -> Result<()>;

    /// Mark a collection as running, discard unfinished uploads, and return
    /// the new epoch.
    fn start_gc(&self) -> Result<GcEpoch>;

    /// End the running collection. A no-op when none is running.
    fn stop_gc(&self) -> Result<()>;

    fn current_epoch(&self) -> Result<GcEpoch>;

    fn list_tags(&self) -> Result<Vec<String>>;

    /// Current value of a tag, or `TagNotFound`.
    fn get_tag(&self, name: &str) -> Result<String>;

    /// Set `name` to `new` if it currently holds `old` (`None` meaning the tag
    /// does not exist) and `epoch` is current. Returns whether it was set.
    fn cas_tag(&self, name: &str, old: Option<&str>, new: &str, epoch: GcEpoch) -> Result<bool>;
}

/// Reject names that are empty, too long, or could escape a directory.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::invalid_name("name cannot be empty"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(Error::invalid_name(format!(
            "name of {} bytes exceeds {}",
            name.len(),
            MAX_NAME_LEN
        )));
    }
    if name.contains("..") || name.contains('/') || name.contains('\\') || name.contains('\0') {
        return Err(Error::invalid_name(format!(
            "Invalid name: {} (must not contain .. or path separators)",
            name
        )));
    }
    if name.starts_with('.') {
        return Err(Error::invalid_name(format!(
            "Invalid name: {} (must not start with '.')",
            name
        )));
    }
    Ok(())
}

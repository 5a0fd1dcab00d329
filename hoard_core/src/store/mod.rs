//! Content-addressed blob stores.
//!
//! [`ContentStore`] is the read side shared by every store and cache layer,
//! [`ContentWriter`] adds deduplicating writes. [`StoreWriter`] and
//! [`StoreReader`] persist blobs in encrypted packs held by a
//! [`PackRepository`](crate::remote::PackRepository); [`MemoryStore`] keeps
//! them in process.

mod memory;
mod metaindex;
mod packset;
mod reader;
mod writer;

pub use memory::MemoryStore;
pub use metaindex::MetaIndex;
pub use reader::StoreReader;
pub use writer::{StoreStats, StoreWriter};

pub(crate) use packset::{PackSpool, open_remote_pack};

use crate::digest::Digest;
use crate::error::{Error, Result};
use flate2::Compression;
use flate2::read::{DeflateDecoder, DeflateEncoder};
use std::io::Read;
use std::sync::Arc;

/// Largest blob any store accepts. Pack entries carry a u16 length prefix.
pub const MAX_BLOB_LEN: usize = u16::MAX as usize;

/// File name suffix of every pack.
pub const PACK_SUFFIX: &str = ".ebpack";

/// Read access to blobs by digest.
pub trait ContentStore {
    /// Whether the blob is known to this store.
    fn has(&self, digest: &Digest) -> Result<bool>;

    /// Fetch a blob. Fails with `ObjectNotFound` if it is absent.
    fn get(&self, digest: &Digest) -> Result<Vec<u8>>;
}

/// A store that also accepts new blobs.
pub trait ContentWriter: ContentStore {
    /// Store a blob and return its digest. Storing content that is already
    /// present returns the existing digest without writing anything.
    fn put(&self, data: &[u8]) -> Result<Digest>;

    /// Make every blob put so far durable and visible to other readers.
    fn flush(&self) -> Result<()>;

    fn close(&self) -> Result<()> {
        self.flush()
    }
}

impl<T: ContentStore + ?Sized> ContentStore for Arc<T> {
    fn has(&self, digest: &Digest) -> Result<bool> {
        (**self).has(digest)
    }

    fn get(&self, digest: &Digest) -> Result<Vec<u8>> {
        (**self).get(digest)
    }
}

impl<T: ContentWriter + ?Sized> ContentWriter for Arc<T> {
    fn put(&self, data: &[u8]) -> Result<Digest> {
        (**self).put(data)
    }

    fn flush(&self) -> Result<()> {
        (**self).flush()
    }

    fn close(&self) -> Result<()> {
        (**self).close()
    }
}

pub(crate) fn check_blob_len(len: usize) -> Result<()> {
    if len > MAX_BLOB_LEN {
        return Err(Error::value_too_large(format!(
            "blob of {} bytes exceeds the {} byte limit",
            len, MAX_BLOB_LEN
        )));
    }
    Ok(())
}

/// Generate a fresh random pack name.
pub fn new_pack_name() -> String {
    let id: [u8; 32] = rand::random();
    format!("{}{}", hex::encode(id), PACK_SUFFIX)
}

/// Encode a blob for storage in a pack: DEFLATE when that makes it smaller,
/// raw bytes otherwise.
pub(crate) fn encode_blob(data: &[u8]) -> Result<Vec<u8>> {
    let mut compressed = Vec::with_capacity(data.len() / 2);
    DeflateEncoder::new(data, Compression::default())
        .read_to_end(&mut compressed)
        .map_err(|e| Error::compression(format!("deflate failed: {}", e)))?;

    if compressed.len() < data.len() {
        Ok(compressed)
    } else {
        Ok(data.to_vec())
    }
}

/// Decode a stored pack value, verifying it against the digest it was filed
/// under.
pub(crate) fn decode_blob(digest: &Digest, stored: &[u8]) -> Result<Vec<u8>> {
    let mut inflated = Vec::new();
    let inflate_ok = DeflateDecoder::new(stored)
        .take(MAX_BLOB_LEN as u64 + 1)
        .read_to_end(&mut inflated)
        .is_ok();
    if inflate_ok && inflated.len() <= MAX_BLOB_LEN && Digest::of(&inflated) == *digest {
        return Ok(inflated);
    }

    if Digest::of(stored) == *digest {
        return Ok(stored.to_vec());
    }

    Err(Error::corrupt_pack(format!(
        "stored value does not match digest {}",
        digest
    )))
}

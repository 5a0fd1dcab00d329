//! Blob caches layered over a content store.
//!
//! A [`BlobCache`] maps digests to blob contents under a byte budget with
//! strict least-recently-used eviction. [`CachedStore`] puts any cache in
//! front of any content store.

mod daemon;
mod disk;
mod lru;
mod mem;

pub use daemon::{CacheClient, MAX_VALUE_LEN, router, serve};
pub use disk::DiskCache;
pub use mem::{MemCache, MemCachedStore};

use crate::digest::Digest;
use crate::error::Result;
use crate::store::{ContentStore, ContentWriter};
use std::sync::Arc;
use tracing::{debug, warn};

/// Digest-keyed blob cache.
pub trait BlobCache: Send + Sync {
    /// Cached contents, or `None` on a miss.
    fn get(&self, digest: &Digest) -> Result<Option<Vec<u8>>>;

    /// Cache a blob, evicting older entries as needed.
    fn put(&self, digest: &Digest, value: &[u8]) -> Result<()>;
}

impl<T: BlobCache + ?Sized> BlobCache for Arc<T> {
    fn get(&self, digest: &Digest) -> Result<Option<Vec<u8>>> {
        (**self).get(digest)
    }

    fn put(&self, digest: &Digest, value: &[u8]) -> Result<()> {
        (**self).put(digest, value)
    }
}

/// A content store with a cache in front: read-through on get,
/// write-through on put.
pub struct CachedStore<S, C> {
    store: S,
    cache: C,
}

impl<S, C> CachedStore<S, C> {
    pub fn new(store: S, cache: C) -> Self {
        Self { store, cache }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn cache(&self) -> &C {
        &self.cache
    }

    pub fn into_inner(self) -> S {
        self.store
    }
}

impl<S: ContentStore, C: BlobCache> ContentStore for CachedStore<S, C> {
    fn has(&self, digest: &Digest) -> Result<bool> {
        self.store.has(digest)
    }

    fn get(&self, digest: &Digest) -> Result<Vec<u8>> {
        if let Some(value) = self.cache.get(digest)? {
            if Digest::of(&value) == *digest {
                return Ok(value);
            }
            warn!(digest = %digest, "cached value does not match its digest");
        }
        let value = self.store.get(digest)?;
        debug!(digest = %digest, len = value.len(), "cache fill");
        self.cache.put(digest, &value)?;
        Ok(value)
    }
}

impl<S: ContentWriter, C: BlobCache> ContentWriter for CachedStore<S, C> {
    fn put(&self, data: &[u8]) -> Result<Digest> {
        let digest = self.store.put(data)?;
        self.cache.put(&digest, data)?;
        Ok(digest)
    }

    fn flush(&self) -> Result<()> {
        self.store.flush()
    }

    fn close(&self) -> Result<()> {
        self.store.close()
    }
}

use super::lru::ByteLru;
use super::{BlobCache, CachedStore};
use crate::digest::Digest;
use crate::error::Result;
use parking_lot::Mutex;
use tracing::trace;

/// In-process blob cache. Values larger than the whole budget are not
/// cached.
pub struct MemCache {
    lru: Mutex<ByteLru<Vec<u8>>>,
}

/// A content store fronted by an in-process cache.
pub type MemCachedStore<S> = CachedStore<S, MemCache>;

impl MemCache {
    pub fn new(max_size: u64) -> Self {
        Self {
            lru: Mutex::new(ByteLru::new(max_size)),
        }
    }

    pub fn len(&self) -> usize {
        self.lru.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn size(&self) -> u64 {
        self.lru.lock().size()
    }

    pub fn max_size(&self) -> u64 {
        self.lru.lock().max_size()
    }
}

impl BlobCache for MemCache {
    fn get(&self, digest: &Digest) -> Result<Option<Vec<u8>>> {
        Ok(self.lru.lock().get(digest).cloned())
    }

    fn put(&self, digest: &Digest, value: &[u8]) -> Result<()> {
        let mut lru = self.lru.lock();
        let len = value.len() as u64;
        if len > lru.max_size() {
            trace!(digest = %digest, len, "value exceeds cache budget, not cached");
            return Ok(());
        }
        lru.insert(*digest, value.to_vec(), len)?;
        Ok(())
    }
}

impl<S> MemCachedStore<S> {
    pub fn with_budget(store: S, max_size: u64) -> Self {
        CachedStore::new(store, MemCache::new(max_size))
    }
}

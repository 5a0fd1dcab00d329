use crate::digest::Digest;
use crate::error::{Error, Result};
use lru::LruCache;

/// Digest-keyed LRU bounded by the total size of its values rather than
/// their count.
pub(crate) struct ByteLru<V> {
    entries: LruCache<Digest, (V, u64)>,
    size: u64,
    max_size: u64,
}

impl<V> ByteLru<V> {
    pub fn new(max_size: u64) -> Self {
        Self {
            entries: LruCache::unbounded(),
            size: 0,
            max_size,
        }
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn contains(&self, digest: &Digest) -> bool {
        self.entries.contains(digest)
    }

    /// Look up an entry and mark it most recently used.
    pub fn get(&mut self, digest: &Digest) -> Option<&V> {
        self.entries.get(digest).map(|(value, _)| value)
    }

    pub fn remove(&mut self, digest: &Digest) -> Option<V> {
        let (value, len) = self.entries.pop(digest)?;
        self.size -= len;
        Some(value)
    }

    /// Insert an entry of `len` bytes, evicting from the tail until it fits.
    /// Returns the evicted digests. An entry already present is only
    /// promoted.
    pub fn insert(&mut self, digest: Digest, value: V, len: u64) -> Result<Vec<Digest>> {
        if self.entries.get(&digest).is_some() {
            return Ok(Vec::new());
        }
        self.check_len(len)?;
        let mut evicted = Vec::new();
        while self.size + len > self.max_size {
            match self.entries.pop_lru() {
                Some((old, (_, old_len))) => {
                    self.size -= old_len;
                    evicted.push(old);
                }
                None => break,
            }
        }
        self.entries.put(digest, (value, len));
        self.size += len;
        Ok(evicted)
    }

    /// Digests [`insert`](Self::insert) would evict to fit `len` more bytes,
    /// least recently used first. Nothing is removed.
    pub fn evictions_for(&self, len: u64) -> Result<Vec<Digest>> {
        self.check_len(len)?;
        let mut resident = self.size;
        let mut evicted = Vec::new();
        for (digest, (_, old_len)) in self.entries.iter().rev() {
            if resident + len <= self.max_size {
                break;
            }
            resident -= old_len;
            evicted.push(*digest);
        }
        Ok(evicted)
    }

    fn check_len(&self, len: u64) -> Result<()> {
        if len > self.max_size {
            return Err(Error::value_too_large(format!(
                "value of {} bytes exceeds the {} byte cache budget",
                len, self.max_size
            )));
        }
        Ok(())
    }

    /// Add an entry found at startup, least recently used position first.
    /// Does not evict; call [`shrink`](Self::shrink) afterwards.
    pub fn load(&mut self, digest: Digest, value: V, len: u64) {
        if let Some((_, old_len)) = self.entries.put(digest, (value, len)) {
            self.size -= old_len;
        }
        self.size += len;
    }

    /// Evict until resident size is within budget.
    pub fn shrink(&mut self) -> Vec<Digest> {
        let mut evicted = Vec::new();
        while self.size > self.max_size {
            let Some((old, (_, old_len))) = self.entries.pop_lru() else {
                break;
            };
            self.size -= old_len;
            evicted.push(old);
        }
        evicted
    }
}

use super::{ContentStore, ContentWriter, check_blob_len};
use crate::digest::Digest;
use crate::error::{Error, Result};
use parking_lot::RwLock;
use std::collections::HashMap;

/// An in-process store. Nothing is persisted; flush is a no-op.
#[derive(Debug, Default)]
pub struct MemoryStore {
    blobs: RwLock<HashMap<Digest, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct blobs held.
    pub fn len(&self) -> usize {
        self.blobs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.read().is_empty()
    }

    /// Total bytes held.
    pub fn size(&self) -> usize {
        self.blobs.read().values().map(Vec::len).sum()
    }

    /// Copies of every stored blob, in no particular order.
    pub fn values(&self) -> Vec<Vec<u8>> {
        self.blobs.read().values().cloned().collect()
    }

    pub fn digests(&self) -> Vec<Digest> {
        self.blobs.read().keys().copied().collect()
    }
}

impl ContentStore for MemoryStore {
    fn has(&self, digest: &Digest) -> Result<bool> {
        Ok(self.blobs.read().contains_key(digest))
    }

    fn get(&self, digest: &Digest) -> Result<Vec<u8>> {
        self.blobs
            .read()
            .get(digest)
            .cloned()
            .ok_or_else(|| Error::object_not_found(digest.to_hex()))
    }
}

impl ContentWriter for MemoryStore {
    fn put(&self, data: &[u8]) -> Result<Digest> {
        check_blob_len(data.len())?;
        let digest = Digest::of(data);
        self.blobs
            .write()
            .entry(digest)
            .or_insert_with(|| data.to_vec());
        Ok(digest)
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get() {
        let store = MemoryStore::new();
        let digest = store.put(b"hello").unwrap();
        assert_eq!(digest, Digest::of(b"hello"));
        assert!(store.has(&digest).unwrap());
        assert_eq!(store.get(&digest).unwrap(), b"hello");
    }

    #[test]
    fn test_put_twice_does_not_grow() {
        let store = MemoryStore::new();
        let a = store.put(b"same").unwrap();
        let size = store.size();
        let b = store.put(b"same").unwrap();
        assert_eq!(a, b);
        assert_eq!(store.len(), 1);
        assert_eq!(store.size(), size);
    }

    #[test]
    fn test_missing_is_not_found() {
        let store = MemoryStore::new();
        let err = store.get(&Digest::of(b"nope")).unwrap_err();
        assert!(err.is_not_found());
        assert!(!store.has(&Digest::of(b"nope")).unwrap());
    }

    #[test]
    fn test_rejects_oversized() {
        let store = MemoryStore::new();
        assert!(store.put(&vec![0u8; super::super::MAX_BLOB_LEN + 1]).is_err());
        assert!(store.is_empty());
    }
}

use super::ContentStore;
use super::packset::PackSet;
use crate::config::StoreConfig;
use crate::crypt::PackCipher;
use crate::digest::Digest;
use crate::error::Result;
use crate::remote::PackRepository;
use parking_lot::Mutex;
use std::sync::Arc;

/// Read-only access to the blobs in a repository's packs.
pub struct StoreReader {
    packs: Mutex<PackSet>,
}

impl StoreReader {
    /// Load the index of every pack the repository lists.
    pub fn open(
        repo: Arc<dyn PackRepository>,
        cipher: PackCipher,
        config: &StoreConfig,
    ) -> Result<Self> {
        let packs = PackSet::new(repo, cipher, config.cache_dir.clone(), config.open_packs)?;
        Ok(Self {
            packs: Mutex::new(packs),
        })
    }

    /// Pick up packs published since the last refresh.
    pub fn refresh(&self) -> Result<()> {
        self.packs.lock().refresh()
    }

    pub fn pack_count(&self) -> usize {
        self.packs.lock().metaindex().pack_count()
    }
}

impl ContentStore for StoreReader {
    fn has(&self, digest: &Digest) -> Result<bool> {
        Ok(self.packs.lock().contains(digest))
    }

    fn get(&self, digest: &Digest) -> Result<Vec<u8>> {
        self.packs.lock().fetch(digest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypt::pack_cipher;
    use crate::remote::MemoryRepository;
    use crate::store::{ContentWriter, StoreWriter};

    #[test]
    fn test_reader_sees_flushed_blobs_only() {
        let repo = Arc::new(MemoryRepository::new());
        let cipher = pack_cipher(&[9u8; 32]).unwrap();
        let config = StoreConfig::default();

        let writer = StoreWriter::open(repo.clone(), cipher.clone(), &config).unwrap();
        let flushed = writer.put(b"flushed").unwrap();
        writer.flush().unwrap();
        let pending = writer.put(b"pending").unwrap();

        let reader = StoreReader::open(repo.clone(), cipher, &config).unwrap();
        assert_eq!(reader.pack_count(), 1);
        assert!(reader.has(&flushed).unwrap());
        assert_eq!(reader.get(&flushed).unwrap(), b"flushed");
        assert!(!reader.has(&pending).unwrap());
        assert!(reader.get(&pending).unwrap_err().is_not_found());

        writer.close().unwrap();
        assert_eq!(reader.get(&pending).unwrap(), b"pending");
    }

    #[test]
    fn test_wrong_key_is_corrupt() {
        let repo = Arc::new(MemoryRepository::new());
        let config = StoreConfig::default();
        let writer =
            StoreWriter::open(repo.clone(), pack_cipher(&[1u8; 32]).unwrap(), &config).unwrap();
        writer.put(b"secret").unwrap();
        writer.close().unwrap();

        let result = StoreReader::open(repo.clone(), pack_cipher(&[2u8; 32]).unwrap(), &config);
        assert!(result.is_err());
    }
}

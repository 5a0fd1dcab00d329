use super::BlobCache;
use super::lru::ByteLru;
use crate::digest::{DIGEST_SIZE, Digest};
use crate::error::{Error, Result};
use parking_lot::Mutex;
use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition};
use std::path::Path;
use tracing::{debug, info, warn};

const BLOB_TABLE: TableDefinition<[u8; DIGEST_SIZE], Vec<u8>> = TableDefinition::new("blobs");

/// Persistent blob cache backed by a redb database.
///
/// Recency is tracked in memory only. On open every stored entry is loaded
/// as if untouched, so the order after a restart follows the table's key
/// order rather than past accesses.
pub struct DiskCache {
    db: Database,
    lru: Mutex<ByteLru<()>>,
}

impl DiskCache {
    /// Open or create the cache database at `path`.
    pub fn open<P: AsRef<Path>>(path: P, max_size: u64) -> Result<Self> {
        let path = path.as_ref();
        if path == Path::new("/") {
            return Err(Error::config("refusing to open / as a cache database"));
        }
        let db = Database::create(path)?;
        let cache = Self::with_database(db, max_size)?;
        info!(
            path = %path.display(),
            entries = cache.len(),
            size = cache.size(),
            max_size,
            "cache opened"
        );
        Ok(cache)
    }

    /// A cache that lives in memory, for tests.
    pub fn temporary(max_size: u64) -> Result<Self> {
        let db = Database::builder()
            .create_with_backend(redb::backends::InMemoryBackend::new())?;
        Self::with_database(db, max_size)
    }

    fn with_database(db: Database, max_size: u64) -> Result<Self> {
        let mut lru = ByteLru::new(max_size);

        let txn = db.begin_write()?;
        {
            let mut table = txn.open_table(BLOB_TABLE)?;
            for entry in table.iter()? {
                let (key, value) = entry?;
                lru.load(
                    Digest::from_bytes(key.value()),
                    (),
                    value.value().len() as u64,
                );
            }
            let evicted = lru.shrink();
            if !evicted.is_empty() {
                warn!(count = evicted.len(), max_size, "cache over budget, evicting");
            }
            for digest in evicted {
                table.remove(digest.as_bytes())?;
            }
        }
        txn.commit()?;

        Ok(Self {
            db,
            lru: Mutex::new(lru),
        })
    }

    pub fn len(&self) -> usize {
        self.lru.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes of cached values.
    pub fn size(&self) -> u64 {
        self.lru.lock().size()
    }

    /// Entry count as stored in the database.
    pub fn stored_len(&self) -> Result<u64> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(BLOB_TABLE)?;
        Ok(table.len()?)
    }
}

impl BlobCache for DiskCache {
    fn get(&self, digest: &Digest) -> Result<Option<Vec<u8>>> {
        let mut lru = self.lru.lock();
        if lru.get(digest).is_none() {
            return Ok(None);
        }

        let txn = self.db.begin_read()?;
        let table = txn.open_table(BLOB_TABLE)?;
        match table.get(digest.as_bytes())? {
            Some(value) => Ok(Some(value.value())),
            None => {
                warn!(digest = %digest, "cache entry missing from database");
                lru.remove(digest);
                Ok(None)
            }
        }
    }

    fn put(&self, digest: &Digest, value: &[u8]) -> Result<()> {
        let mut lru = self.lru.lock();
        if lru.contains(digest) {
            return Ok(());
        }
        let len = value.len() as u64;
        // The in-memory index only changes once the table has.
        let evicted = lru.evictions_for(len)?;

        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(BLOB_TABLE)?;
            for old in &evicted {
                table.remove(old.as_bytes())?;
            }
            table.insert(digest.as_bytes(), value.to_vec())?;
        }
        txn.commit()?;

        for old in &evicted {
            lru.remove(old);
        }
        lru.insert(*digest, (), len)?;

        if !evicted.is_empty() {
            debug!(count = evicted.len(), size = lru.size(), "cache eviction");
        }
        Ok(())
    }
}

//! Remote pack access shared by the store reader and writer.

use super::{MetaIndex, decode_blob, new_pack_name};
use crate::crypt::{EncryptedReader, EncryptedWriter, PackCipher};
use crate::digest::Digest;
use crate::error::{Error, Result};
use crate::pack::{PackIndex, PackReader, PackWriter};
use crate::remote::{PackRepository, PackSource, PackUpload};
use lru::LruCache;
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, BufWriter, Seek, SeekFrom, Write};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A decrypting reader over one remote pack.
pub(crate) type RemotePack = PackReader<EncryptedReader<Box<dyn PackSource>, PackCipher>>;

/// Open a remote pack, reading its index unless one is supplied.
pub(crate) fn open_remote_pack(
    repo: &dyn PackRepository,
    cipher: &PackCipher,
    name: &str,
    index: Option<Arc<PackIndex>>,
) -> Result<RemotePack> {
    let plain = EncryptedReader::new(repo.open_pack(name)?, cipher.clone())?;
    match index {
        Some(index) => PackReader::with_index(plain, index),
        None => PackReader::open(plain),
    }
}

/// A pack being assembled in a local temporary file.
///
/// The upload is created up front so the repository fences it against any
/// collection that starts before it commits.
pub(crate) struct PackSpool {
    name: String,
    writer: PackWriter<BufWriter<File>>,
    upload: Box<dyn PackUpload>,
}

impl PackSpool {
    pub fn create(repo: &dyn PackRepository, spool_dir: Option<&Path>) -> Result<Self> {
        let name = new_pack_name();
        let upload = repo.create_pack(&name)?;
        let file = match spool_dir {
            Some(dir) => tempfile::tempfile_in(dir)?,
            None => tempfile::tempfile()?,
        };
        let writer = PackWriter::new(BufWriter::new(file))?;
        debug!(pack = %name, "pack opened");
        Ok(Self {
            name,
            writer,
            upload,
        })
    }

    pub fn entry_count(&self) -> usize {
        self.writer.entry_count()
    }

    pub fn add(&mut self, key: &[u8], value: &[u8]) -> Result<bool> {
        self.writer.add(key, value)
    }

    /// Close the pack, encrypt it into the upload and publish it.
    pub fn finish(self, cipher: &PackCipher) -> Result<(String, PackIndex)> {
        let (buffered, index) = self.writer.close()?;
        let mut file = buffered.into_inner().map_err(|e| e.into_error())?;
        file.seek(SeekFrom::Start(0))?;

        let mut encrypted = EncryptedWriter::new(self.upload, cipher.clone());
        io::copy(&mut file, &mut encrypted)?;
        encrypted.finish()?.commit()?;
        Ok((self.name, index))
    }

    /// Drop the pack without publishing it.
    pub fn cancel(self) -> Result<()> {
        debug!(pack = %self.name, "pack abandoned");
        self.upload.cancel()
    }
}

/// The metaindex plus a bounded set of open pack readers.
pub(crate) struct PackSet {
    repo: Arc<dyn PackRepository>,
    cipher: PackCipher,
    index_dir: Option<PathBuf>,
    index: MetaIndex,
    open: LruCache<String, RemotePack>,
}

impl PackSet {
    pub fn new(
        repo: Arc<dyn PackRepository>,
        cipher: PackCipher,
        index_dir: Option<PathBuf>,
        open_packs: usize,
    ) -> Result<Self> {
        if let Some(dir) = &index_dir {
            fs::create_dir_all(dir)?;
        }
        let capacity = NonZeroUsize::new(open_packs).unwrap_or(NonZeroUsize::MIN);
        let mut set = Self {
            repo,
            cipher,
            index_dir,
            index: MetaIndex::new(),
            open: LruCache::new(capacity),
        };
        set.refresh()?;
        Ok(set)
    }

    pub fn repo(&self) -> &Arc<dyn PackRepository> {
        &self.repo
    }

    pub fn spool_dir(&self) -> Option<&Path> {
        self.index_dir.as_deref()
    }

    pub fn metaindex(&self) -> &MetaIndex {
        &self.index
    }

    pub fn contains(&self, digest: &Digest) -> bool {
        self.index.contains(digest)
    }

    /// Sync the metaindex with the repository's pack listing.
    pub fn refresh(&mut self) -> Result<()> {
        let listed = self.repo.list_packs()?;
        let names: HashSet<&str> = listed.iter().map(|p| p.name.as_str()).collect();

        self.index.retain_packs(|name| names.contains(name));
        let stale: Vec<String> = self
            .open
            .iter()
            .map(|(name, _)| name.clone())
            .filter(|name| !names.contains(name.as_str()))
            .collect();
        for name in stale {
            self.open.pop(&name);
        }

        let mut added = 0;
        for pack in &listed {
            if self.index.has_pack(&pack.name) {
                continue;
            }
            match self.load_index(&pack.name) {
                Ok(index) => {
                    self.index.insert_pack(&pack.name, index)?;
                    added += 1;
                }
                // Removed by a collection since it was listed.
                Err(e) if e.is_not_found() => {
                    debug!(pack = %pack.name, "pack vanished during refresh");
                }
                Err(e) => return Err(e),
            }
        }

        debug!(
            packs = self.index.pack_count(),
            digests = self.index.len(),
            added,
            "metaindex refreshed"
        );
        Ok(())
    }

    fn index_path(&self, name: &str) -> Option<PathBuf> {
        self.index_dir
            .as_ref()
            .map(|dir| dir.join(format!("{}.index", name)))
    }

    fn load_index(&mut self, name: &str) -> Result<Arc<PackIndex>> {
        if let Some(path) = self.index_path(name)
            && path.exists()
        {
            match PackIndex::decode(&fs::read(&path)?) {
                Ok(index) => return Ok(Arc::new(index)),
                Err(e) => warn!(pack = %name, error = %e, "ignoring corrupt cached index"),
            }
        }

        let reader = open_remote_pack(&*self.repo, &self.cipher, name, None)?;
        let index = Arc::clone(reader.index());
        self.cache_index(name, &index)?;
        self.open.put(name.to_string(), reader);
        Ok(index)
    }

    /// Write a pack's index to the local cache. Packs are immutable, so an
    /// existing valid cache file is never rewritten.
    fn cache_index(&self, name: &str, index: &PackIndex) -> Result<()> {
        let (Some(dir), Some(path)) = (&self.index_dir, self.index_path(name)) else {
            return Ok(());
        };
        if path.exists() && fs::read(&path).is_ok_and(|b| PackIndex::decode(&b).is_ok()) {
            return Ok(());
        }
        let mut temp_file = tempfile::NamedTempFile::new_in(dir)?;
        temp_file.write_all(&index.encode())?;
        temp_file.flush()?;
        temp_file.persist(&path)?;
        Ok(())
    }

    /// Record a pack this process just published.
    pub fn add_pack(&mut self, name: &str, index: PackIndex) -> Result<()> {
        self.cache_index(name, &index)?;
        self.index.insert_pack(name, Arc::new(index))
    }

    fn reader(&mut self, name: &str) -> Result<&mut RemotePack> {
        if !self.open.contains(name) {
            let index = self.index.pack_index(name).cloned();
            let reader = open_remote_pack(&*self.repo, &self.cipher, name, index)?;
            if let Some((evicted, _)) = self.open.push(name.to_string(), reader)
                && evicted != name
            {
                debug!(pack = %evicted, "closed least recently used pack");
            }
        }
        self.open
            .get_mut(name)
            .ok_or_else(|| Error::pack_not_found(name))
    }

    /// Stored (encoded) bytes of a blob, or `None` if no known pack has it or
    /// its pack has disappeared.
    pub fn get_raw(&mut self, digest: &Digest) -> Result<Option<Vec<u8>>> {
        let Some(loc) = self.index.locate(digest).cloned() else {
            return Ok(None);
        };
        let result = self
            .reader(&loc.pack)
            .and_then(|reader| reader.read_at(loc.offset));
        match result {
            Ok(raw) => Ok(Some(raw)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Fetch and decode a blob, refreshing the metaindex once on a miss.
    pub fn fetch(&mut self, digest: &Digest) -> Result<Vec<u8>> {
        if let Some(raw) = self.get_raw(digest)? {
            return decode_blob(digest, &raw);
        }
        self.refresh()?;
        match self.get_raw(digest)? {
            Some(raw) => decode_blob(digest, &raw),
            None => Err(Error::object_not_found(digest.to_hex())),
        }
    }

    /// Encode, pack and publish a batch of blobs in one new pack.
    pub fn publish(&mut self, spool: PackSpool) -> Result<String> {
        let entries = spool.entry_count();
        let (name, index) = spool.finish(&self.cipher)?;
        self.add_pack(&name, index)?;
        info!(pack = %name, entries, "pack flushed");
        Ok(name)
    }
}

use super::packset::{PackSet, PackSpool};
use super::{ContentStore, ContentWriter, check_blob_len, encode_blob};
use crate::config::StoreConfig;
use crate::crypt::PackCipher;
use crate::digest::Digest;
use crate::error::{Error, Result};
use crate::remote::PackRepository;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Counters describing what a writer has done.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub packs_flushed: u64,
    pub blobs_written: u64,
    /// Encoded bytes appended to packs.
    pub bytes_written: u64,
    /// Puts answered with an already stored digest.
    pub dedup_hits: u64,
}

struct WriterState {
    packs: PackSet,
    /// Uncompressed copies of blobs in the open pack.
    working: HashMap<Digest, Vec<u8>>,
    working_bytes: u64,
    open: Option<PackSpool>,
    stats: StoreStats,
}

/// Deduplicating, batching writer over a pack repository.
///
/// Blobs accumulate in an open pack and a working set. Once the working set
/// exceeds the flush threshold the pack is published and the working set
/// cleared. Dropping the writer without [`close`](ContentWriter::close)
/// discards the open pack.
pub struct StoreWriter {
    state: Mutex<WriterState>,
    flush_threshold: u64,
}

impl StoreWriter {
    pub fn open(
        repo: Arc<dyn PackRepository>,
        cipher: PackCipher,
        config: &StoreConfig,
    ) -> Result<Self> {
        let packs = PackSet::new(repo, cipher, config.cache_dir.clone(), config.open_packs)?;
        Ok(Self {
            state: Mutex::new(WriterState {
                packs,
                working: HashMap::new(),
                working_bytes: 0,
                open: None,
                stats: StoreStats::default(),
            }),
            flush_threshold: config.flush_threshold,
        })
    }

    pub fn stats(&self) -> StoreStats {
        self.state.lock().stats
    }

    /// Blobs put since the last flush.
    pub fn pending(&self) -> usize {
        self.state.lock().working.len()
    }

    /// Drop the open pack and working set without publishing them.
    pub fn abandon(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.working.clear();
        state.working_bytes = 0;
        match state.open.take() {
            Some(spool) => spool.cancel(),
            None => Ok(()),
        }
    }

    /// Pick up packs published by other writers.
    pub fn refresh(&self) -> Result<()> {
        self.state.lock().packs.refresh()
    }
}

impl WriterState {
    fn flush(&mut self) -> Result<()> {
        let Some(spool) = self.open.take() else {
            return Ok(());
        };
        let published = self.packs.publish(spool);
        // A pack that failed to publish is gone; its blobs must not stay
        // visible.
        self.working.clear();
        self.working_bytes = 0;
        published?;
        self.stats.packs_flushed += 1;
        Ok(())
    }
}

impl ContentStore for StoreWriter {
    fn has(&self, digest: &Digest) -> Result<bool> {
        let state = self.state.lock();
        Ok(state.working.contains_key(digest) || state.packs.contains(digest))
    }

    fn get(&self, digest: &Digest) -> Result<Vec<u8>> {
        let mut state = self.state.lock();
        if let Some(data) = state.working.get(digest) {
            return Ok(data.clone());
        }
        state.packs.fetch(digest)
    }
}

impl ContentWriter for StoreWriter {
    fn put(&self, data: &[u8]) -> Result<Digest> {
        check_blob_len(data.len())?;
        let digest = Digest::of(data);

        let mut state = self.state.lock();
        if state.working.contains_key(&digest) || state.packs.contains(&digest) {
            state.stats.dedup_hits += 1;
            return Ok(digest);
        }

        let encoded = encode_blob(data)?;
        if state.open.is_none() {
            let spool = PackSpool::create(&**state.packs.repo(), state.packs.spool_dir())?;
            state.open = Some(spool);
        }
        let spool = state
            .open
            .as_mut()
            .ok_or_else(|| Error::corrupt_pack("no open pack"))?;
        spool.add(digest.as_bytes(), &encoded)?;

        state.working.insert(digest, data.to_vec());
        state.working_bytes += data.len() as u64;
        state.stats.blobs_written += 1;
        state.stats.bytes_written += encoded.len() as u64;
        debug!(digest = %digest, len = data.len(), stored = encoded.len(), "blob added");

        if state.working_bytes > self.flush_threshold {
            state.flush()?;
        }
        Ok(digest)
    }

    fn flush(&self) -> Result<()> {
        self.state.lock().flush()
    }
}

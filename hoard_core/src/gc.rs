//! Garbage collection.
//!
//! A collection fences the repository with a fresh epoch, marks every node
//! reachable from any tag's history, then rewrites the packs: live blobs are
//! copied into new packs and the old packs removed once their replacements
//! are published. Large packs whose contents are all live are left in place.
//!
//! Writers must flush or abandon their open packs before a collection
//! starts; an upload created before the epoch changes can no longer be
//! committed.

use crate::cache::MemCachedStore;
use crate::config::StoreConfig;
use crate::crypt::{PackCipher, RepoKeys};
use crate::digest::{DIGEST_SIZE, Digest};
use crate::dir::read_dir;
use crate::error::Result;
use crate::htree::{RECORD_LEN, TreeHandle, check_node, record_at, record_count};
use crate::refs::{RefKey, get_ref, verify_tag};
use crate::remote::{GcEpoch, PackListing, PackRepository};
use crate::store::{ContentStore, PackSpool, StoreReader, open_remote_pack};
use serde::Serialize;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Collection tunables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GcOptions {
    /// Fully live packs larger than this are not rewritten.
    pub skip_threshold: u64,
    /// Compacted packs are closed once they would exceed this size.
    pub pack_size: u64,
    /// Mark and plan the sweep without writing or deleting anything.
    pub dry_run: bool,
}

impl GcOptions {
    pub fn from_config(config: &StoreConfig) -> Self {
        Self {
            skip_threshold: config.gc_skip_threshold,
            pack_size: config.gc_pack_size,
            dry_run: false,
        }
    }
}

impl Default for GcOptions {
    fn default() -> Self {
        Self::from_config(&StoreConfig::default())
    }
}

/// Statistics from a collection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GcStats {
    /// Distinct reachable node digests.
    pub reachable: usize,
    pub packs_scanned: usize,
    /// Large fully live packs left in place.
    pub packs_skipped: usize,
    pub packs_deleted: usize,
    pub packs_written: usize,
    pub blobs_copied: usize,
    /// Unreachable blobs left behind in deleted packs.
    pub blobs_dropped: usize,
    /// Bytes of deleted packs minus bytes of compacted packs.
    pub bytes_reclaimed: u64,
}

/// Run a full collection.
///
/// The collection is always stopped before returning, including when it
/// fails. A failure never deletes a pack whose live contents were not
/// already republished.
pub fn collect(
    repo: Arc<dyn PackRepository>,
    keys: &RepoKeys,
    config: &StoreConfig,
    options: &GcOptions,
) -> Result<GcStats> {
    let epoch = repo.start_gc()?;
    info!(epoch = %epoch, dry_run = options.dry_run, "gc started");

    let result = run(&repo, keys, config, options, epoch);
    let stopped = repo.stop_gc();

    match (result, stopped) {
        (Ok(stats), Ok(())) => {
            info!(
                reachable = stats.reachable,
                deleted = stats.packs_deleted,
                written = stats.packs_written,
                skipped = stats.packs_skipped,
                reclaimed = stats.bytes_reclaimed,
                "gc finished"
            );
            Ok(stats)
        }
        (Ok(_), Err(err)) => Err(err),
        (Err(err), stopped) => {
            if let Err(stop_err) = stopped {
                warn!(error = %stop_err, "failed to stop gc");
            }
            warn!(error = %err, "gc aborted");
            Err(err)
        }
    }
}

/// Reader used for marking, fronted by the in-process cache so nodes
/// shared between snapshots are fetched once.
fn mark_store(
    repo: &Arc<dyn PackRepository>,
    cipher: &PackCipher,
    config: &StoreConfig,
) -> Result<MemCachedStore<StoreReader>> {
    let reader = StoreReader::open(Arc::clone(repo), cipher.clone(), config)?;
    Ok(MemCachedStore::with_budget(reader, config.mem_cache_size))
}

fn run(
    repo: &Arc<dyn PackRepository>,
    keys: &RepoKeys,
    config: &StoreConfig,
    options: &GcOptions,
    epoch: GcEpoch,
) -> Result<GcStats> {
    let store = mark_store(repo, &keys.pack, config)?;
    let reachable = mark(&**repo, &store, &keys.refs)?;
    info!(
        reachable = reachable.len(),
        cached = store.cache().len(),
        "mark complete"
    );

    let mut sweeper = Sweeper {
        repo: &**repo,
        cipher: &keys.pack,
        epoch,
        options,
        spool_dir: config.cache_dir.as_deref(),
        reachable: &reachable,
        copied: HashSet::new(),
        spool: None,
        pending_entries: 0,
        pending_bytes: 0,
        doomed: Vec::new(),
        written_bytes: 0,
        deleted_bytes: 0,
        stats: GcStats {
            reachable: reachable.len(),
            ..GcStats::default()
        },
    };
    for listing in repo.list_packs()? {
        sweeper.sweep_pack(&listing)?;
    }
    sweeper.rotate()?;
    info!("sweep complete");

    let mut stats = sweeper.stats;
    stats.bytes_reclaimed = sweeper.deleted_bytes.saturating_sub(sweeper.written_bytes);
    Ok(stats)
}

/// Collect every node digest reachable from any tag.
///
/// Each tag's signature is checked, then its refs are followed through
/// `prev` to the first snapshot. Ref blobs, directory streams, the streams of
/// every entry and all of their hash-tree nodes are marked. A tag that fails
/// verification aborts the mark.
pub fn mark<S: ContentStore + ?Sized>(
    repo: &dyn PackRepository,
    store: &S,
    key: &RefKey,
) -> Result<HashSet<Digest>> {
    let mut marker = Marker {
        store,
        reachable: HashSet::new(),
        refs_seen: HashSet::new(),
        dirs_seen: HashSet::new(),
    };

    for tag in repo.list_tags()? {
        let value = match repo.get_tag(&tag) {
            Ok(value) => value,
            Err(err) if err.is_not_found() => continue,
            Err(err) => return Err(err),
        };
        let head = verify_tag(key, &value)?;
        debug!(tag = %tag, head = %head, "marking tag");
        marker.mark_history(head)?;
    }

    Ok(marker.reachable)
}

struct Marker<'a, S: ?Sized> {
    store: &'a S,
    reachable: HashSet<Digest>,
    refs_seen: HashSet<Digest>,
    dirs_seen: HashSet<Digest>,
}

impl<S: ContentStore + ?Sized> Marker<'_, S> {
    /// Mark a ref and every ref before it. Stops at a ref already marked
    /// through another tag.
    fn mark_history(&mut self, head: Digest) -> Result<()> {
        let mut next = Some(head);
        while let Some(digest) = next {
            if !self.refs_seen.insert(digest) {
                break;
            }
            self.reachable.insert(digest);
            let r = get_ref(self.store, &digest)?;
            self.mark_dir(r.root)?;
            next = r.prev;
        }
        Ok(())
    }

    fn mark_dir(&mut self, root: TreeHandle) -> Result<()> {
        let mut dirs = vec![root];
        while let Some(dir) = dirs.pop() {
            if !self.dirs_seen.insert(dir.root) {
                continue;
            }
            self.mark_tree(dir)?;
            for entry in read_dir(self.store, &dir)? {
                if entry.is_dir() {
                    dirs.push(entry.handle);
                } else {
                    self.mark_tree(entry.handle)?;
                }
            }
        }
        Ok(())
    }

    /// Mark a hash tree's nodes. Leaves are marked from their parent's
    /// records without being fetched.
    fn mark_tree(&mut self, handle: TreeHandle) -> Result<()> {
        let mut stack = vec![(handle.root, handle.root_level()?)];
        while let Some((digest, level)) = stack.pop() {
            if self.reachable.contains(&digest) {
                continue;
            }
            if level > 0 {
                let node = self.store.get(&digest)?;
                check_node(&node, level)?;
                for i in 0..record_count(&node) {
                    let child = record_at(&node, 1 + i * RECORD_LEN)?.child;
                    if level == 1 {
                        self.reachable.insert(child);
                    } else {
                        stack.push((child, level - 1));
                    }
                }
            }
            self.reachable.insert(digest);
        }
        Ok(())
    }
}

struct Sweeper<'a> {
    repo: &'a dyn PackRepository,
    cipher: &'a PackCipher,
    epoch: GcEpoch,
    options: &'a GcOptions,
    spool_dir: Option<&'a Path>,
    reachable: &'a HashSet<Digest>,
    /// Digests already placed in a compacted pack or kept in a skipped one.
    copied: HashSet<Digest>,
    spool: Option<PackSpool>,
    pending_entries: usize,
    pending_bytes: u64,
    /// Fully handled packs, removed once the open spool is published.
    doomed: Vec<PackListing>,
    written_bytes: u64,
    deleted_bytes: u64,
    stats: GcStats,
}

impl Sweeper<'_> {
    fn sweep_pack(&mut self, listing: &PackListing) -> Result<()> {
        self.stats.packs_scanned += 1;
        let mut pack = open_remote_pack(self.repo, self.cipher, &listing.name, None)?;
        let index = Arc::clone(pack.index());

        let mut entries: Vec<(Digest, u64)> = index
            .entries()
            .iter()
            .filter_map(|e| Digest::from_slice(&e.key).ok().map(|d| (d, e.offset)))
            .collect();
        let foreign = index.len() - entries.len();
        entries.sort_by_key(|&(_, offset)| offset);

        if listing.size > self.options.skip_threshold
            && foreign == 0
            && entries
                .iter()
                .all(|(d, _)| self.reachable.contains(d) && !self.copied.contains(d))
        {
            self.copied.extend(entries.iter().map(|&(d, _)| d));
            self.stats.packs_skipped += 1;
            info!(pack = %listing.name, size = listing.size, "pack skipped, fully live");
            return Ok(());
        }

        let mut copied = 0usize;
        let mut dropped = foreign;
        for (digest, offset) in entries {
            if !self.reachable.contains(&digest) {
                dropped += 1;
                continue;
            }
            if self.copied.contains(&digest) {
                continue;
            }
            let raw = pack.read_at(offset)?;
            self.copy(&digest, &raw)?;
            copied += 1;
        }
        self.stats.blobs_dropped += dropped;
        debug!(pack = %listing.name, copied, dropped, "pack swept");

        self.doomed.push(listing.clone());
        Ok(())
    }

    fn copy(&mut self, digest: &Digest, raw: &[u8]) -> Result<()> {
        // Value with its length prefix, plus its footer record.
        let entry_len = (2 + raw.len() + 2 + DIGEST_SIZE + 8) as u64;
        if self.pending_entries > 0 && self.pending_bytes + entry_len > self.options.pack_size {
            self.rotate()?;
        }

        if !self.options.dry_run {
            if self.spool.is_none() {
                self.spool = Some(PackSpool::create(self.repo, self.spool_dir)?);
            }
            if let Some(spool) = self.spool.as_mut() {
                spool.add(digest.as_bytes(), raw)?;
            }
        }

        self.copied.insert(*digest);
        self.pending_entries += 1;
        self.pending_bytes += entry_len;
        self.stats.blobs_copied += 1;
        Ok(())
    }

    /// Publish the open compacted pack, then remove every pack whose live
    /// contents it (or an earlier one) holds.
    fn rotate(&mut self) -> Result<()> {
        if let Some(spool) = self.spool.take() {
            let entries = spool.entry_count();
            let (name, _) = spool.finish(self.cipher)?;
            info!(pack = %name, entries, "compacted pack written");
        }
        if self.pending_entries > 0 {
            self.stats.packs_written += 1;
            self.written_bytes += self.pending_bytes;
        }
        self.pending_entries = 0;
        self.pending_bytes = 0;

        for listing in std::mem::take(&mut self.doomed) {
            if !self.options.dry_run {
                self.repo.remove_pack(&listing.name, self.epoch)?;
            }
            info!(
                pack = %listing.name,
                size = listing.size,
                dry_run = self.options.dry_run,
                "pack deleted"
            );
            self.stats.packs_deleted += 1;
            self.deleted_bytes += listing.size;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dir::{DirEntry, file_modes, write_dir};
    use crate::htree::{self, Writer};
    use crate::refs::{commit_tag, sign_tag};
    use crate::remote::MemoryRepository;
    use crate::store::{ContentWriter, StoreWriter};

    fn keys() -> RepoKeys {
        RepoKeys::from_master(&[3u8; 32]).unwrap()
    }

    fn small_config() -> StoreConfig {
        StoreConfig {
            flush_threshold: 1 << 20,
            ..StoreConfig::default()
        }
    }

    fn writer(repo: &Arc<MemoryRepository>) -> StoreWriter {
        StoreWriter::open(repo.clone(), keys().pack, &small_config()).unwrap()
    }

    /// Store files under a root directory and commit it as the newest
    /// snapshot of `tag`. Flushes the store.
    fn snapshot<S: ContentWriter>(
        repo: &MemoryRepository,
        store: &S,
        tag: &str,
        files: &[(&str, &[u8])],
    ) -> TreeHandle {
        let entries = files
            .iter()
            .map(|(name, contents)| {
                let mut w = Writer::with_leaf_len(store, 64);
                w.write(contents).unwrap();
                let handle = w.close().unwrap();
                DirEntry::new(*name, file_modes::REGULAR, contents.len() as u64, 0, handle)
                    .unwrap()
            })
            .collect();
        let root = write_dir(store, entries).unwrap();
        let epoch = repo.current_epoch().unwrap();
        commit_tag(repo, store, &keys().refs, tag, root, 0, epoch)
            .unwrap()
            .unwrap();
        root
    }

    fn reader(repo: &Arc<MemoryRepository>) -> StoreReader {
        StoreReader::open(repo.clone(), keys().pack, &small_config()).unwrap()
    }

    #[test]
    fn test_gc_empty_repository() {
        let repo = Arc::new(MemoryRepository::new());
        let stats = collect(repo.clone(), &keys(), &small_config(), &GcOptions::default()).unwrap();
        assert_eq!(stats, GcStats::default());
        assert!(!repo.gc_running());
    }

    #[test]
    fn test_mark_covers_all_nodes() {
        let repo = Arc::new(MemoryRepository::new());
        let store = writer(&repo);
        let big: Vec<u8> = (0..5000u32).map(|i| (i % 253) as u8).collect();
        snapshot(&repo, &store, "default", &[("big", &big), ("small", b"tiny")]);
        store.close().unwrap();

        let reachable = mark(&*repo, &reader(&repo), &keys().refs).unwrap();
        let stored = reader(&repo);
        for digest in &reachable {
            assert!(stored.has(digest).unwrap());
        }
        // Every node in the repository belongs to the snapshot or its ref.
        assert_eq!(reachable.len(), store.stats().blobs_written as usize);
    }

    #[test]
    fn test_gc_drops_unreachable_keeps_reachable() {
        let repo = Arc::new(MemoryRepository::new());
        let store = writer(&repo);
        let garbage = store.put(b"nobody points here").unwrap();
        let root = snapshot(&repo, &store, "default", &[("keep.txt", b"keep me")]);
        store.close().unwrap();

        let stats = collect(repo.clone(), &keys(), &small_config(), &GcOptions::default()).unwrap();
        assert_eq!(stats.packs_deleted, 1);
        assert_eq!(stats.packs_written, 1);
        assert_eq!(stats.blobs_dropped, 1);

        let after = reader(&repo);
        assert!(after.get(&garbage).unwrap_err().is_not_found());
        let entries = read_dir(&after, &root).unwrap();
        assert_eq!(htree::read_all(&after, &entries[0].handle).unwrap(), b"keep me");
    }

    #[test]
    fn test_gc_all_tags_are_roots() {
        let repo = Arc::new(MemoryRepository::new());
        let store = writer(&repo);
        let a = snapshot(&repo, &store, "alpha", &[("a", b"from alpha")]);
        let b = snapshot(&repo, &store, "beta", &[("b", b"from beta")]);
        store.close().unwrap();

        collect(repo.clone(), &keys(), &small_config(), &GcOptions::default()).unwrap();
        let after = reader(&repo);
        assert_eq!(read_dir(&after, &a).unwrap()[0].name, "a");
        assert_eq!(read_dir(&after, &b).unwrap()[0].name, "b");
    }

    #[test]
    fn test_gc_copies_duplicates_once() {
        let repo = Arc::new(MemoryRepository::new());
        // Two writers that cannot see each other's packs store the same blob.
        let first = writer(&repo);
        let second = writer(&repo);
        snapshot(&repo, &first, "default", &[("dup", b"shared content")]);
        htree::write_all(&second, b"shared content").unwrap();
        first.close().unwrap();
        second.close().unwrap();
        assert_eq!(repo.pack_count(), 2);

        let stats = collect(repo.clone(), &keys(), &small_config(), &GcOptions::default()).unwrap();
        assert_eq!(stats.packs_deleted, 2);
        assert_eq!(stats.blobs_copied, stats.reachable);
        assert_eq!(repo.pack_count(), 1);
    }

    #[test]
    fn test_gc_rotates_compacted_packs() {
        let repo = Arc::new(MemoryRepository::new());
        let store = writer(&repo);
        let data: Vec<u8> = (0..20_000u32).map(|i| (i * 31 % 251) as u8).collect();
        snapshot(&repo, &store, "default", &[("data", &data)]);
        store.close().unwrap();

        let options = GcOptions {
            pack_size: 2048,
            ..GcOptions::default()
        };
        let stats = collect(repo.clone(), &keys(), &small_config(), &options).unwrap();
        assert!(stats.packs_written > 1);
        assert_eq!(repo.pack_count(), stats.packs_written);

        let reachable = mark(&*repo, &reader(&repo), &keys().refs).unwrap();
        assert_eq!(reachable.len(), stats.reachable);
    }

    #[test]
    fn test_gc_skips_large_live_pack() {
        let repo = Arc::new(MemoryRepository::new());
        let store = writer(&repo);
        snapshot(&repo, &store, "default", &[("live", b"all of this is live")]);
        store.close().unwrap();
        let before = repo.pack_count();

        let options = GcOptions {
            skip_threshold: 16,
            ..GcOptions::default()
        };
        let stats = collect(repo.clone(), &keys(), &small_config(), &options).unwrap();
        assert_eq!(stats.packs_skipped, 1);
        assert_eq!(stats.packs_deleted, 0);
        assert_eq!(stats.packs_written, 0);
        assert_eq!(repo.pack_count(), before);
    }

    #[test]
    fn test_gc_dry_run_changes_nothing() {
        let repo = Arc::new(MemoryRepository::new());
        let store = writer(&repo);
        let garbage = store.put(b"garbage").unwrap();
        snapshot(&repo, &store, "default", &[("f", b"contents")]);
        store.close().unwrap();

        let options = GcOptions {
            dry_run: true,
            ..GcOptions::default()
        };
        let stats = collect(repo.clone(), &keys(), &small_config(), &options).unwrap();
        assert_eq!(stats.packs_deleted, 1);
        assert_eq!(stats.blobs_dropped, 1);
        assert_eq!(repo.pack_count(), 1);
        assert_eq!(reader(&repo).get(&garbage).unwrap(), b"garbage");
    }

    #[test]
    fn test_gc_failure_stops_and_deletes_nothing() {
        let repo = Arc::new(MemoryRepository::new());
        let store = writer(&repo);
        store.put(b"only data").unwrap();
        store.close().unwrap();
        let epoch = repo.current_epoch().unwrap();
        // A validly signed tag naming a ref that was never stored.
        let missing = sign_tag(&keys().refs, &Digest::of(b"never stored"));
        assert!(repo.cas_tag("default", None, &missing, epoch).unwrap());

        let err = collect(repo.clone(), &keys(), &small_config(), &GcOptions::default())
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(!repo.gc_running());
        assert_eq!(repo.pack_count(), 1);
    }

    #[test]
    fn test_writer_racing_gc_cannot_publish() {
        let repo = Arc::new(MemoryRepository::new());
        let store = writer(&repo);
        snapshot(&repo, &store, "default", &[("f", b"published")]);
        store.close().unwrap();

        let racer = writer(&repo);
        racer.put(b"in flight during gc").unwrap();
        collect(repo.clone(), &keys(), &small_config(), &GcOptions::default()).unwrap();
        assert!(racer.flush().unwrap_err().is_concurrency());
    }

    #[test]
    fn test_gc_keeps_earlier_snapshots() {
        let repo = Arc::new(MemoryRepository::new());
        let store = writer(&repo);
        let old = snapshot(&repo, &store, "default", &[("v", b"first version")]);
        let new = snapshot(&repo, &store, "default", &[("v", b"second version")]);
        store.close().unwrap();

        collect(repo.clone(), &keys(), &small_config(), &GcOptions::default()).unwrap();
        let after = reader(&repo);
        for (root, contents) in [(old, &b"first version"[..]), (new, &b"second version"[..])] {
            let entries = read_dir(&after, &root).unwrap();
            assert_eq!(htree::read_all(&after, &entries[0].handle).unwrap(), contents);
        }
    }

    #[test]
    fn test_gc_refuses_unsigned_tag() {
        let repo = Arc::new(MemoryRepository::new());
        let store = writer(&repo);
        let root = htree::write_all(&store, b"planted").unwrap();
        store.close().unwrap();
        let epoch = repo.current_epoch().unwrap();
        assert!(
            repo.cas_tag("default", None, &root.to_string(), epoch)
                .unwrap()
        );

        let err = collect(repo.clone(), &keys(), &small_config(), &GcOptions::default())
            .unwrap_err();
        assert!(err.is_corrupt());
        assert!(!repo.gc_running());
        assert_eq!(repo.pack_count(), 1);
    }

    #[test]
    fn test_mark_store_uses_configured_cache() {
        let repo = Arc::new(MemoryRepository::new());
        let store = writer(&repo);
        let digest = store.put(b"cached during mark").unwrap();
        store.close().unwrap();

        let config = StoreConfig {
            mem_cache_size: 4096,
            ..small_config()
        };
        let dyn_repo: Arc<dyn PackRepository> = repo.clone();
        let cached = mark_store(&dyn_repo, &keys().pack, &config).unwrap();
        assert_eq!(cached.cache().max_size(), 4096);
        assert_eq!(cached.get(&digest).unwrap(), b"cached during mark");
        assert_eq!(cached.cache().len(), 1);
    }
}

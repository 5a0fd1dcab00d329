use crate::digest::Digest;
use crate::error::Result;
use crate::pack::PackIndex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Where a blob lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    pub pack: Arc<str>,
    pub offset: u64,
}

/// Merged view of the indexes of every known pack.
#[derive(Debug, Default)]
pub struct MetaIndex {
    packs: BTreeMap<Arc<str>, Arc<PackIndex>>,
    locations: HashMap<Digest, Location>,
}

impl MetaIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a pack's entries. A digest already located in another pack keeps
    /// its first location.
    pub fn insert_pack(&mut self, name: &str, index: Arc<PackIndex>) -> Result<()> {
        let digests = index
            .entries()
            .iter()
            .map(|e| Digest::from_slice(&e.key))
            .collect::<Result<Vec<_>>>()?;

        let pack: Arc<str> = Arc::from(name);
        for (digest, entry) in digests.into_iter().zip(index.entries()) {
            self.locations.entry(digest).or_insert_with(|| Location {
                pack: Arc::clone(&pack),
                offset: entry.offset,
            });
        }
        self.packs.insert(pack, index);
        Ok(())
    }

    /// Forget packs that are no longer listed, re-homing digests they shared
    /// with surviving packs.
    pub fn retain_packs(&mut self, keep: impl Fn(&str) -> bool) {
        let before = self.packs.len();
        self.packs.retain(|name, _| keep(&**name));
        if self.packs.len() == before {
            return;
        }

        self.locations.clear();
        for (pack, index) in &self.packs {
            for entry in index.entries() {
                // Keys were validated when the pack was inserted.
                if let Ok(digest) = Digest::from_slice(&entry.key) {
                    self.locations.entry(digest).or_insert_with(|| Location {
                        pack: Arc::clone(pack),
                        offset: entry.offset,
                    });
                }
            }
        }
    }

    pub fn contains(&self, digest: &Digest) -> bool {
        self.locations.contains_key(digest)
    }

    pub fn locate(&self, digest: &Digest) -> Option<&Location> {
        self.locations.get(digest)
    }

    pub fn has_pack(&self, name: &str) -> bool {
        self.packs.contains_key(name)
    }

    pub fn pack_index(&self, name: &str) -> Option<&Arc<PackIndex>> {
        self.packs.get(name)
    }

    pub fn pack_count(&self) -> usize {
        self.packs.len()
    }

    /// Number of distinct digests.
    pub fn len(&self) -> usize {
        self.locations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locations.is_empty()
    }
}

//! Signed tags and snapshot history.
//!
//! A tag does not name a root directory directly. It names a ref blob in the
//! content store, and the ref records the root, when the snapshot was taken,
//! and the ref it replaced. Following `prev` links walks a tag's history.
//!
//! Tag values have the form `<ref digest hex>:<mac hex>`, where the MAC is a
//! keyed BLAKE3 hash of the ref digest under the repository's ref key. A
//! party holding only the repository cannot point a tag at other data.
//!
//! Ref encoding:
//! ```text
//! 1   format version (1)
//! 8   created_at, seconds since the epoch (i64 LE)
//! 1   depth of the root directory's hash tree
//! 32  root digest
//! 1   1 if a previous ref follows, 0 otherwise
//! 32  previous ref digest (only when the flag is 1)
//! ```

use crate::digest::{DIGEST_SIZE, Digest};
use crate::error::{Error, Result};
use crate::htree::TreeHandle;
use crate::remote::{GcEpoch, PackRepository};
use crate::store::{ContentStore, ContentWriter};
use std::fmt;
use tracing::debug;

const REF_VERSION: u8 = 1;
const REF_LEN_NO_PREV: usize = 1 + 8 + 1 + DIGEST_SIZE + 1;

/// Key authenticating tag values.
#[derive(Clone, PartialEq, Eq)]
pub struct RefKey([u8; 32]);

impl RefKey {
    pub fn new(key: [u8; 32]) -> Self {
        Self(key)
    }

    fn mac(&self, digest: &Digest) -> blake3::Hash {
        blake3::keyed_hash(&self.0, digest.as_bytes())
    }
}

impl fmt::Debug for RefKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RefKey(..)")
    }
}

/// One snapshot in a tag's history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ref {
    /// Root directory of the snapshot.
    pub root: TreeHandle,
    /// Seconds since the epoch.
    pub created_at: i64,
    /// The ref this one replaced.
    pub prev: Option<Digest>,
}

impl Ref {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(REF_LEN_NO_PREV + DIGEST_SIZE);
        buf.push(REF_VERSION);
        buf.extend_from_slice(&self.created_at.to_le_bytes());
        buf.push(self.root.depth);
        buf.extend_from_slice(self.root.root.as_bytes());
        match &self.prev {
            Some(prev) => {
                buf.push(1);
                buf.extend_from_slice(prev.as_bytes());
            }
            None => buf.push(0),
        }
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < REF_LEN_NO_PREV {
            return Err(Error::corrupt_ref(format!("{} bytes is too short", data.len())));
        }
        if data[0] != REF_VERSION {
            return Err(Error::corrupt_ref(format!("unknown version {}", data[0])));
        }

        let mut created_at = [0u8; 8];
        created_at.copy_from_slice(&data[1..9]);
        let root = TreeHandle::new(data[9], Digest::from_slice(&data[10..10 + DIGEST_SIZE])?);
        root.root_level()
            .map_err(|e| Error::corrupt_ref(format!("bad root: {}", e)))?;

        let rest = &data[REF_LEN_NO_PREV..];
        let prev = match (data[REF_LEN_NO_PREV - 1], rest.len()) {
            (0, 0) => None,
            (1, DIGEST_SIZE) => Some(Digest::from_slice(rest)?),
            (flag, len) => {
                return Err(Error::corrupt_ref(format!(
                    "prev flag {} with {} trailing bytes",
                    flag, len
                )));
            }
        };

        Ok(Self {
            root,
            created_at: i64::from_le_bytes(created_at),
            prev,
        })
    }
}

/// Store a ref and return its digest.
pub fn put_ref<S: ContentWriter + ?Sized>(store: &S, r: &Ref) -> Result<Digest> {
    store.put(&r.encode())
}

/// Load a ref stored with [`put_ref`].
pub fn get_ref<S: ContentStore + ?Sized>(store: &S, digest: &Digest) -> Result<Ref> {
    Ref::decode(&store.get(digest)?)
}

/// Tag value pointing at `digest`.
pub fn sign_tag(key: &RefKey, digest: &Digest) -> String {
    format!("{}:{}", digest.to_hex(), key.mac(digest).to_hex())
}

/// Check a tag value and return the ref digest it points at.
pub fn verify_tag(key: &RefKey, value: &str) -> Result<Digest> {
    let (digest, mac) = value
        .split_once(':')
        .ok_or_else(|| Error::bad_signature("tag value has no signature"))?;
    let digest = Digest::from_hex(digest)?;
    let mac = blake3::Hash::from_hex(mac)
        .map_err(|e| Error::bad_signature(format!("malformed signature: {}", e)))?;
    // blake3::Hash equality is constant time.
    if mac != key.mac(&digest) {
        return Err(Error::bad_signature(format!(
            "signature does not match ref {}",
            digest
        )));
    }
    Ok(digest)
}

/// Read and verify a tag. Returns `None` when the tag does not exist.
pub fn read_tag(repo: &dyn PackRepository, key: &RefKey, name: &str) -> Result<Option<Digest>> {
    match repo.get_tag(name) {
        Ok(value) => verify_tag(key, &value).map(Some),
        Err(err) if err.is_not_found() => Ok(None),
        Err(err) => Err(err),
    }
}

/// Record a new snapshot under `name`.
///
/// The ref is stored and flushed before the tag moves, chained to the ref
/// the tag pointed at. Returns the new ref's digest, or `None` when another
/// writer moved the tag first or the epoch is stale.
pub fn commit_tag<S: ContentWriter + ?Sized>(
    repo: &dyn PackRepository,
    store: &S,
    key: &RefKey,
    name: &str,
    root: TreeHandle,
    created_at: i64,
    epoch: GcEpoch,
) -> Result<Option<Digest>> {
    let old = match repo.get_tag(name) {
        Ok(value) => Some(value),
        Err(err) if err.is_not_found() => None,
        Err(err) => return Err(err),
    };
    let prev = old.as_deref().map(|v| verify_tag(key, v)).transpose()?;

    let digest = put_ref(
        store,
        &Ref {
            root,
            created_at,
            prev,
        },
    )?;
    store.flush()?;

    if !repo.cas_tag(name, old.as_deref(), &sign_tag(key, &digest), epoch)? {
        debug!(tag = %name, "tag moved concurrently");
        return Ok(None);
    }
    debug!(tag = %name, ref_digest = %digest, root = %root, "tag committed");
    Ok(Some(digest))
}

/// Iterate over a tag's history, newest first.
pub fn history<S: ContentStore + ?Sized>(store: &S, head: Digest) -> History<'_, S> {
    History {
        store,
        next: Some(head),
    }
}

/// Iterator returned by [`history`].
pub struct History<'a, S: ?Sized> {
    store: &'a S,
    next: Option<Digest>,
}

impl<S: ContentStore + ?Sized> Iterator for History<'_, S> {
    type Item = Result<(Digest, Ref)>;

    fn next(&mut self) -> Option<Self::Item> {
        let digest = self.next.take()?;
        Some(get_ref(self.store, &digest).map(|r| {
            self.next = r.prev;
            (digest, r)
        }))
    }
}

/// The snapshot `n` versions before `head`, or the oldest one if the
/// history is shorter.
pub fn versions_ago<S: ContentStore + ?Sized>(
    store: &S,
    head: Digest,
    n: usize,
) -> Result<(Digest, Ref)> {
    let mut found = None;
    for item in history(store, head).take(n.saturating_add(1)) {
        found = Some(item?);
    }
    found.ok_or_else(|| Error::object_not_found(head.to_hex()))
}

/// The newest snapshot taken at or before `time`, if any.
pub fn at_time<S: ContentStore + ?Sized>(
    store: &S,
    head: Digest,
    time: i64,
) -> Result<Option<(Digest, Ref)>> {
    for item in history(store, head) {
        let (digest, r) = item?;
        if r.created_at <= time {
            return Ok(Some((digest, r)));
        }
    }
    Ok(None)
}

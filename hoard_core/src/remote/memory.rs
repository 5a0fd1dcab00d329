use super::{GcEpoch, PackListing, PackRepository, PackSource, PackUpload, validate_name};
use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::io::{self, Cursor, Write};
use std::sync::Arc;

#[derive(Debug, Default)]
struct State {
    packs: BTreeMap<String, Arc<[u8]>>,
    /// Pending uploads by name, mapped to the id of the upload holding it.
    uploads: HashMap<String, u64>,
    tags: BTreeMap<String, String>,
    generation: u64,
    gc_running: bool,
    next_upload: u64,
}

/// A repository held entirely in memory. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MemoryRepository {
    state: Arc<Mutex<State>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw (encrypted) bytes of a published pack.
    pub fn pack_bytes(&self, name: &str) -> Option<Vec<u8>> {
        self.state.lock().packs.get(name).map(|b| b.to_vec())
    }

    pub fn pack_count(&self) -> usize {
        self.state.lock().packs.len()
    }

    pub fn gc_running(&self) -> bool {
        self.state.lock().gc_running
    }
}

impl PackRepository for MemoryRepository {
    fn list_packs(&self) -> Result<Vec<PackListing>> {
        Ok(self
            .state
            .lock()
            .packs
            .iter()
            .map(|(name, data)| PackListing {
                name: name.clone(),
                size: data.len() as u64,
            })
            .collect())
    }

    fn open_pack(&self, name: &str) -> Result<Box<dyn PackSource>> {
        let data = self
            .state
            .lock()
            .packs
            .get(name)
            .cloned()
            .ok_or_else(|| Error::pack_not_found(name))?;
        Ok(Box::new(Cursor::new(data)))
    }

    fn create_pack(&self, name: &str) -> Result<Box<dyn PackUpload>> {
        validate_name(name)?;
        let mut state = self.state.lock();
        if state.packs.contains_key(name) || state.uploads.contains_key(name) {
            return Err(Error::invalid_name(format!("pack {} already exists", name)));
        }
        let id = state.next_upload;
        state.next_upload += 1;
        state.uploads.insert(name.to_string(), id);

        Ok(Box::new(MemoryUpload {
            state: Arc::clone(&self.state),
            name: name.to_string(),
            id,
            generation: state.generation,
            data: Vec::new(),
            finished: false,
        }))
    }

    fn remove_pack(&self, name: &str, epoch: GcEpoch) -> Result<()> {
        let mut state = self.state.lock();
        if !state.gc_running {
            return Err(Error::GcNotRunning);
        }
        if epoch.0 != state.generation {
            return Err(Error::gc_conflict(format!(
                "epoch {} is stale, current is {}",
                epoch, state.generation
            )));
        }
        state
            .packs
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| Error::pack_not_found(name))
    }

    fn start_gc(&self) -> Result<GcEpoch> {
        let mut state = self.state.lock();
        state.generation += 1;
        state.gc_running = true;
        state.uploads.clear();
        Ok(GcEpoch(state.generation))
    }

    fn stop_gc(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.gc_running {
            state.generation += 1;
            state.gc_running = false;
        }
        Ok(())
    }

    fn current_epoch(&self) -> Result<GcEpoch> {
        Ok(GcEpoch(self.state.lock().generation))
    }

    fn list_tags(&self) -> Result<Vec<String>> {
        Ok(self.state.lock().tags.keys().cloned().collect())
    }

    fn get_tag(&self, name: &str) -> Result<String> {
        self.state
            .lock()
            .tags
            .get(name)
            .cloned()
            .ok_or_else(|| Error::tag_not_found(name))
    }

    fn cas_tag(&self, name: &str, old: Option<&str>, new: &str, epoch: GcEpoch) -> Result<bool> {
        validate_name(name)?;
        let mut state = self.state.lock();
        if epoch.0 != state.generation {
            return Ok(false);
        }
        if state.tags.get(name).map(String::as_str) != old {
            return Ok(false);
        }
        state.tags.insert(name.to_string(), new.to_string());
        Ok(true)
    }
}

struct MemoryUpload {
    state: Arc<Mutex<State>>,
    name: String,
    id: u64,
    generation: u64,
    data: Vec<u8>,
    finished: bool,
}

impl Write for MemoryUpload {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.data.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl PackUpload for MemoryUpload {
    fn commit(mut self: Box<Self>) -> Result<()> {
        self.finished = true;
        let mut state = self.state.lock();
        let still_pending = state.uploads.get(&self.name) == Some(&self.id);
        if !still_pending || state.generation != self.generation {
            if still_pending {
                state.uploads.remove(&self.name);
            }
            return Err(Error::gc_conflict(format!(
                "collection ran while uploading {}",
                self.name
            )));
        }
        state.uploads.remove(&self.name);
        let data: Arc<[u8]> = std::mem::take(&mut self.data).into();
        state.packs.insert(self.name.clone(), data);
        Ok(())
    }

    fn cancel(mut self: Box<Self>) -> Result<()> {
        self.finished = true;
        self.discard();
        Ok(())
    }
}

impl MemoryUpload {
    fn discard(&self) {
        let mut state = self.state.lock();
        if state.uploads.get(&self.name) == Some(&self.id) {
            state.uploads.remove(&self.name);
        }
    }
}

impl Drop for MemoryUpload {
    fn drop(&mut self) {
        if !self.finished {
            self.discard();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn upload(repo: &MemoryRepository, name: &str, data: &[u8]) -> Result<()> {
        let mut up = repo.create_pack(name)?;
        up.write_all(data)?;
        up.commit()
    }

    #[test]
    fn test_upload_visible_after_commit() {
        let repo = MemoryRepository::new();
        let mut up = repo.create_pack("a.ebpack").unwrap();
        up.write_all(b"data").unwrap();
        assert!(repo.list_packs().unwrap().is_empty());
        up.commit().unwrap();

        let listing = repo.list_packs().unwrap();
        assert_eq!(listing, vec![PackListing { name: "a.ebpack".into(), size: 4 }]);
        let mut out = Vec::new();
        repo.open_pack("a.ebpack").unwrap().read_to_end(&mut out).unwrap();
        assert_eq!(out, b"data");
    }

    #[test]
    fn test_cancel_and_drop_discard() {
        let repo = MemoryRepository::new();
        repo.create_pack("a").unwrap().cancel().unwrap();
        drop(repo.create_pack("b").unwrap());
        assert_eq!(repo.pack_count(), 0);
        // Names are free again.
        upload(&repo, "a", b"x").unwrap();
        upload(&repo, "b", b"y").unwrap();
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let repo = MemoryRepository::new();
        upload(&repo, "a", b"x").unwrap();
        assert!(repo.create_pack("a").is_err());
    }

    #[test]
    fn test_upload_straddling_gc_fails() {
        let repo = MemoryRepository::new();
        let mut up = repo.create_pack("a").unwrap();
        up.write_all(b"x").unwrap();
        repo.start_gc().unwrap();
        let err = up.commit().unwrap_err();
        assert!(err.is_concurrency());
        assert_eq!(repo.pack_count(), 0);
    }

    #[test]
    fn test_upload_during_gc_succeeds() {
        let repo = MemoryRepository::new();
        repo.start_gc().unwrap();
        upload(&repo, "compacted", b"x").unwrap();
        repo.stop_gc().unwrap();
        assert_eq!(repo.pack_count(), 1);
    }

    #[test]
    fn test_remove_requires_current_epoch() {
        let repo = MemoryRepository::new();
        upload(&repo, "a", b"x").unwrap();
        let epoch = repo.current_epoch().unwrap();
        assert!(matches!(repo.remove_pack("a", epoch), Err(Error::GcNotRunning)));

        let epoch = repo.start_gc().unwrap();
        assert!(repo.remove_pack("a", GcEpoch(epoch.0 - 1)).unwrap_err().is_concurrency());
        repo.remove_pack("a", epoch).unwrap();
        assert!(repo.remove_pack("a", epoch).unwrap_err().is_not_found());
        repo.stop_gc().unwrap();
    }

    #[test]
    fn test_stop_gc_twice_is_noop() {
        let repo = MemoryRepository::new();
        let epoch = repo.start_gc().unwrap();
        repo.stop_gc().unwrap();
        let after = repo.current_epoch().unwrap();
        assert!(after > epoch);
        repo.stop_gc().unwrap();
        assert_eq!(repo.current_epoch().unwrap(), after);
        assert!(!repo.gc_running());
    }

    #[test]
    fn test_cas_tag() {
        let repo = MemoryRepository::new();
        let epoch = repo.current_epoch().unwrap();
        assert!(repo.get_tag("default").unwrap_err().is_not_found());

        assert!(repo.cas_tag("default", None, "v1", epoch).unwrap());
        assert!(!repo.cas_tag("default", None, "v2", epoch).unwrap());
        assert!(!repo.cas_tag("default", Some("v0"), "v2", epoch).unwrap());
        assert!(repo.cas_tag("default", Some("v1"), "v2", epoch).unwrap());
        assert_eq!(repo.get_tag("default").unwrap(), "v2");

        repo.start_gc().unwrap();
        assert!(!repo.cas_tag("default", Some("v2"), "v3", epoch).unwrap());
        assert_eq!(repo.list_tags().unwrap(), vec!["default".to_string()]);
    }
}

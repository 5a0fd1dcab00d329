//! A pack repository in a local directory.
//!
//! Layout:
//! - `config`: `version=1`
//! - `state`: GC generation and running flag
//! - `packs/`: one file per published pack
//! - `uploads/`: temporary files of uploads in progress
//! - `tags/`: one file per tag holding its value

use super::{GcEpoch, PackListing, PackRepository, PackSource, PackUpload, validate_name};
use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::fs;
use std::io::{self, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;
use tracing::debug;

#[derive(Debug)]
struct Inner {
    root: PathBuf,
    /// Serializes read-modify-write of `state` and tags within this process.
    lock: Mutex<()>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct GcState {
    generation: u64,
    running: bool,
}

/// A repository rooted at a local directory.
#[derive(Debug, Clone)]
pub struct LocalRepository {
    inner: Arc<Inner>,
}

impl LocalRepository {
    /// Create the directory structure of a new repository.
    pub fn init<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(root.join("packs"))?;
        fs::create_dir_all(root.join("uploads"))?;
        fs::create_dir_all(root.join("tags"))?;
        fs::write(root.join("config"), "version=1\n")?;

        let repo = Self::from_root(root);
        repo.write_state(GcState {
            generation: 0,
            running: false,
        })?;
        Ok(repo)
    }

    /// Open an existing repository, validating its structure.
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        if !root.exists() {
            return Err(Error::invalid_repository(&root, "directory does not exist"));
        }

        let config_path = root.join("config");
        if !config_path.exists() {
            return Err(Error::invalid_repository(&root, "config file not found"));
        }
        let config = fs::read_to_string(&config_path)?;
        let version = parse_pairs(&config)
            .find(|(k, _)| *k == "version")
            .map(|(_, v)| v);
        if version != Some("1") {
            return Err(Error::invalid_repository(
                &root,
                format!("Unsupported config version: {:?}", version),
            ));
        }

        for dir in ["packs", "uploads", "tags"] {
            if !root.join(dir).is_dir() {
                return Err(Error::invalid_repository(
                    &root,
                    format!("{} directory missing", dir),
                ));
            }
        }

        let repo = Self::from_root(root);
        repo.read_state()?;
        Ok(repo)
    }

    fn from_root(root: PathBuf) -> Self {
        Self {
            inner: Arc::new(Inner {
                root,
                lock: Mutex::new(()),
            }),
        }
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    fn pack_path(&self, name: &str) -> Result<PathBuf> {
        validate_name(name)?;
        Ok(self.inner.root.join("packs").join(name))
    }

    fn tag_path(&self, name: &str) -> Result<PathBuf> {
        validate_name(name)?;
        Ok(self.inner.root.join("tags").join(name))
    }

    fn read_state(&self) -> Result<GcState> {
        let root = &self.inner.root;
        let content = fs::read_to_string(root.join("state"))?;
        let mut generation = None;
        let mut running = None;
        for (key, value) in parse_pairs(&content) {
            match key {
                "generation" => generation = value.parse::<u64>().ok(),
                "running" => running = Some(value == "1"),
                _ => {}
            }
        }
        match (generation, running) {
            (Some(generation), Some(running)) => Ok(GcState {
                generation,
                running,
            }),
            _ => Err(Error::invalid_repository(root, "malformed state file")),
        }
    }

    fn write_state(&self, state: GcState) -> Result<()> {
        let content = format!(
            "generation={}\nrunning={}\n",
            state.generation,
            if state.running { 1 } else { 0 }
        );
        write_atomic(&self.inner.root, &self.inner.root.join("state"), content.as_bytes())
    }
}

fn parse_pairs(content: &str) -> impl Iterator<Item = (&str, &str)> {
    content.lines().filter_map(|line| {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return None;
        }
        line.split_once('=').map(|(k, v)| (k.trim(), v.trim()))
    })
}

fn write_atomic(dir: &Path, path: &Path, data: &[u8]) -> Result<()> {
    let mut temp_file = NamedTempFile::new_in(dir)?;
    temp_file.write_all(data)?;
    temp_file.flush()?;
    temp_file.persist(path)?;
    Ok(())
}

impl PackRepository for LocalRepository {
    fn list_packs(&self) -> Result<Vec<PackListing>> {
        let mut packs = Vec::new();
        for entry in fs::read_dir(self.inner.root.join("packs"))? {
            let entry = entry?;
            let meta = entry.metadata()?;
            if meta.is_file()
                && let Some(name) = entry.file_name().to_str()
            {
                packs.push(PackListing {
                    name: name.to_string(),
                    size: meta.len(),
                });
            }
        }
        packs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(packs)
    }

    fn open_pack(&self, name: &str) -> Result<Box<dyn PackSource>> {
        let path = self.pack_path(name)?;
        match fs::File::open(&path) {
            Ok(file) => Ok(Box::new(BufReader::new(file))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(Error::pack_not_found(name)),
            Err(e) => Err(e.into()),
        }
    }

    fn create_pack(&self, name: &str) -> Result<Box<dyn PackUpload>> {
        let dest = self.pack_path(name)?;
        if dest.exists() {
            return Err(Error::invalid_name(format!("pack {} already exists", name)));
        }
        let generation = self.read_state()?.generation;
        let file = NamedTempFile::new_in(self.inner.root.join("uploads"))?;
        debug!(pack = %name, generation, "upload started");
        Ok(Box::new(LocalUpload {
            repo: self.clone(),
            file,
            dest,
            generation,
        }))
    }

    fn remove_pack(&self, name: &str, epoch: GcEpoch) -> Result<()> {
        let path = self.pack_path(name)?;
        let _guard = self.inner.lock.lock();
        let state = self.read_state()?;
        if !state.running {
            return Err(Error::GcNotRunning);
        }
        if state.generation != epoch.0 {
            return Err(Error::gc_conflict(format!(
                "epoch {} is stale, current is {}",
                epoch, state.generation
            )));
        }
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(Error::pack_not_found(name)),
            Err(e) => Err(e.into()),
        }
    }

    fn start_gc(&self) -> Result<GcEpoch> {
        let _guard = self.inner.lock.lock();
        let mut state = self.read_state()?;
        state.generation += 1;
        state.running = true;
        self.write_state(state)?;

        // Unfinished uploads can no longer commit; reclaim their space.
        for entry in fs::read_dir(self.inner.root.join("uploads"))? {
            let entry = entry?;
            if let Err(e) = fs::remove_file(entry.path())
                && e.kind() != io::ErrorKind::NotFound
            {
                return Err(e.into());
            }
        }
        Ok(GcEpoch(state.generation))
    }

    fn stop_gc(&self) -> Result<()> {
        let _guard = self.inner.lock.lock();
        let mut state = self.read_state()?;
        if state.running {
            state.generation += 1;
            state.running = false;
            self.write_state(state)?;
        }
        Ok(())
    }

    fn current_epoch(&self) -> Result<GcEpoch> {
        Ok(GcEpoch(self.read_state()?.generation))
    }

    fn list_tags(&self) -> Result<Vec<String>> {
        let mut tags = Vec::new();
        for entry in fs::read_dir(self.inner.root.join("tags"))? {
            let entry = entry?;
            if entry.file_type()?.is_file()
                && let Some(name) = entry.file_name().to_str()
                && validate_name(name).is_ok()
            {
                tags.push(name.to_string());
            }
        }
        tags.sort();
        Ok(tags)
    }

    fn get_tag(&self, name: &str) -> Result<String> {
        let path = self.tag_path(name)?;
        match fs::read_to_string(&path) {
            Ok(value) => Ok(value),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(Error::tag_not_found(name)),
            Err(e) => Err(e.into()),
        }
    }

    fn cas_tag(&self, name: &str, old: Option<&str>, new: &str, epoch: GcEpoch) -> Result<bool> {
        let path = self.tag_path(name)?;
        let _guard = self.inner.lock.lock();
        if self.read_state()?.generation != epoch.0 {
            return Ok(false);
        }
        let current = match fs::read_to_string(&path) {
            Ok(value) => Some(value),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        if current.as_deref() != old {
            return Ok(false);
        }
        write_atomic(&self.inner.root.join("tags"), &path, new.as_bytes())?;
        Ok(true)
    }
}

struct LocalUpload {
    repo: LocalRepository,
    file: NamedTempFile,
    dest: PathBuf,
    generation: u64,
}

impl Write for LocalUpload {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl PackUpload for LocalUpload {
    fn commit(mut self: Box<Self>) -> Result<()> {
        self.file.flush()?;
        self.file.as_file().sync_all()?;

        let inner = Arc::clone(&self.repo.inner);
        let _guard = inner.lock.lock();
        let state = self.repo.read_state()?;
        let name = self
            .dest
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if state.generation != self.generation || !self.file.path().exists() {
            return Err(Error::gc_conflict(format!(
                "collection ran while uploading {}",
                name
            )));
        }
        let LocalUpload { file, dest, .. } = *self;
        file.persist_noclobber(&dest)?;
        debug!(pack = %name, "upload committed");
        Ok(())
    }

    fn cancel(self: Box<Self>) -> Result<()> {
        self.file.close()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use tempfile::TempDir;

    fn upload(repo: &LocalRepository, name: &str, data: &[u8]) -> Result<()> {
        let mut up = repo.create_pack(name)?;
        up.write_all(data)?;
        up.commit()
    }

    #[test]
    fn test_init_and_open() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("repo");
        LocalRepository::init(&root).unwrap();

        assert!(root.join("packs").is_dir());
        assert!(root.join("tags").is_dir());
        assert!(fs::read_to_string(root.join("config")).unwrap().contains("version=1"));

        let repo = LocalRepository::open(&root).unwrap();
        assert_eq!(repo.current_epoch().unwrap(), GcEpoch(0));
    }

    #[test]
    fn test_open_rejects_missing_parts() {
        let temp_dir = TempDir::new().unwrap();
        assert!(matches!(
            LocalRepository::open(temp_dir.path().join("nope")),
            Err(Error::InvalidRepository { .. })
        ));

        let root = temp_dir.path().join("repo");
        LocalRepository::init(&root).unwrap();
        fs::remove_dir(root.join("tags")).unwrap();
        assert!(LocalRepository::open(&root).is_err());
    }

    #[test]
    fn test_pack_roundtrip_and_listing() {
        let temp_dir = TempDir::new().unwrap();
        let repo = LocalRepository::init(temp_dir.path()).unwrap();
        upload(&repo, "b.ebpack", b"second").unwrap();
        upload(&repo, "a.ebpack", b"first!").unwrap();

        let names: Vec<_> = repo.list_packs().unwrap().into_iter().map(|p| p.name).collect();
        assert_eq!(names, vec!["a.ebpack", "b.ebpack"]);

        let mut out = String::new();
        repo.open_pack("b.ebpack").unwrap().read_to_string(&mut out).unwrap();
        assert_eq!(out, "second");
        assert!(repo.open_pack("c.ebpack").err().unwrap().is_not_found());
    }

    #[test]
    fn test_dropped_upload_leaves_nothing() {
        let temp_dir = TempDir::new().unwrap();
        let repo = LocalRepository::init(temp_dir.path()).unwrap();
        let mut up = repo.create_pack("a").unwrap();
        up.write_all(b"partial").unwrap();
        drop(up);
        assert!(repo.list_packs().unwrap().is_empty());
        assert_eq!(fs::read_dir(temp_dir.path().join("uploads")).unwrap().count(), 0);
    }

    #[test]
    fn test_gc_fencing() {
        let temp_dir = TempDir::new().unwrap();
        let repo = LocalRepository::init(temp_dir.path()).unwrap();
        upload(&repo, "old", b"x").unwrap();

        let mut straddler = repo.create_pack("late").unwrap();
        straddler.write_all(b"y").unwrap();

        let epoch = repo.start_gc().unwrap();
        assert!(straddler.commit().unwrap_err().is_concurrency());
        upload(&repo, "compacted", b"z").unwrap();
        repo.remove_pack("old", epoch).unwrap();
        repo.stop_gc().unwrap();

        assert!(matches!(repo.remove_pack("compacted", epoch), Err(Error::GcNotRunning)));
        let names: Vec<_> = repo.list_packs().unwrap().into_iter().map(|p| p.name).collect();
        assert_eq!(names, vec!["compacted"]);

        // State survives reopening.
        let reopened = LocalRepository::open(temp_dir.path()).unwrap();
        assert_eq!(reopened.current_epoch().unwrap(), GcEpoch(epoch.0 + 1));
    }

    #[test]
    fn test_cas_tag() {
        let temp_dir = TempDir::new().unwrap();
        let repo = LocalRepository::init(temp_dir.path()).unwrap();
        let epoch = repo.current_epoch().unwrap();

        assert!(repo.cas_tag("default", None, "1:aa", epoch).unwrap());
        assert!(!repo.cas_tag("default", None, "1:bb", epoch).unwrap());
        assert!(repo.cas_tag("default", Some("1:aa"), "1:bb", epoch).unwrap());
        assert_eq!(repo.get_tag("default").unwrap(), "1:bb");
        assert_eq!(repo.list_tags().unwrap(), vec!["default".to_string()]);
        assert!(repo.get_tag("missing").unwrap_err().is_not_found());
        assert!(repo.cas_tag("../escape", None, "x", epoch).is_err());
    }
}

//! Store tunables and their `key=value` file format.

use crate::error::{Error, Result};
use std::fs;
use std::path::{Path, PathBuf};

const MIB: u64 = 1024 * 1024;

/// Tunables shared by the store, caches and collector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    /// Working-set size after which the open pack is flushed.
    pub flush_threshold: u64,
    /// Number of pack readers kept open.
    pub open_packs: usize,
    /// Budget of the in-process blob cache.
    pub mem_cache_size: u64,
    /// Budget of the persistent blob cache.
    pub disk_cache_size: u64,
    /// Packs larger than this are left alone by the collector when fully live.
    pub gc_skip_threshold: u64,
    /// Size at which the collector rotates to a new compacted pack.
    pub gc_pack_size: u64,
    /// Directory for cached pack indexes and pack spool files. Without it,
    /// indexes are always fetched from the repository.
    pub cache_dir: Option<PathBuf>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            flush_threshold: 128 * MIB,
            open_packs: 5,
            mem_cache_size: 64 * MIB,
            disk_cache_size: 1024 * MIB,
            gc_skip_threshold: 120 * MIB,
            gc_pack_size: 128 * MIB,
            cache_dir: None,
        }
    }
}

impl StoreConfig {
    /// Load a config file. Missing keys keep their defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())?;
        Self::parse(&content)
    }

    /// Parse `key=value` lines. Blank lines and `#` comments are ignored;
    /// unknown keys are rejected.
    pub fn parse(content: &str) -> Result<Self> {
        let mut config = Self::default();

        for (lineno, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let (key, value) = line.split_once('=').ok_or_else(|| {
                Error::config(format!("line {}: expected key=value", lineno + 1))
            })?;
            let (key, value) = (key.trim(), value.trim());

            match key {
                "flush_threshold" => config.flush_threshold = parse_size(value)?,
                "open_packs" => {
                    config.open_packs = value
                        .parse()
                        .map_err(|_| Error::config(format!("open_packs: bad count {:?}", value)))?;
                    if config.open_packs == 0 {
                        return Err(Error::config("open_packs must be at least 1"));
                    }
                }
                "mem_cache_size" => config.mem_cache_size = parse_size(value)?,
                "disk_cache_size" => config.disk_cache_size = parse_size(value)?,
                "gc_skip_threshold" => config.gc_skip_threshold = parse_size(value)?,
                "gc_pack_size" => config.gc_pack_size = parse_size(value)?,
                "cache_dir" => config.cache_dir = Some(PathBuf::from(value)),
                _ => {
                    return Err(Error::config(format!(
                        "line {}: unknown key {:?}",
                        lineno + 1,
                        key
                    )));
                }
            }
        }

        Ok(config)
    }
}

/// Parse a byte size with an optional `K`, `M` or `G` suffix (powers of 1024).
pub fn parse_size(value: &str) -> Result<u64> {
    let value = value.trim();
    let (digits, scale) = match value.char_indices().last() {
        Some((i, 'K' | 'k')) => (&value[..i], 1024),
        Some((i, 'M' | 'm')) => (&value[..i], MIB),
        Some((i, 'G' | 'g')) => (&value[..i], 1024 * MIB),
        _ => (value, 1),
    };
    digits
        .trim()
        .parse::<u64>()
        .ok()
        .and_then(|n| n.checked_mul(scale))
        .ok_or_else(|| Error::config(format!("bad size {:?}", value)))
}

//! # Hoard Core
//!
//! An encrypted, content-addressed backup store.
//!
//! Byte streams are split into hash trees of bounded-size blobs, each
//! addressed by its BLAKE3 digest. Blobs are deduplicated, compressed and
//! batched into encrypted pack files kept in a remote repository. A
//! mark-sweep collector rewrites packs to drop blobs no tag can reach.
//!
//! ## Features
//!
//! - Seekable hash trees over arbitrary streams
//! - Append-only packs with a sorted footer index, encrypted in counter mode
//! - Deduplicating store writer with batched, fenced pack uploads
//! - Persistent and in-process blob caches, and a cache daemon protocol
//! - Signed tags whose refs chain every earlier snapshot
//! - Garbage collection with epoch fencing against concurrent writers
//!
//! ## Example
//!
//! ```no_run
//! use hoard_core::crypt::load_key_file;
//! use hoard_core::dir::write_dir;
//! use hoard_core::refs::commit_tag;
//! use hoard_core::remote::{LocalRepository, PackRepository};
//! use hoard_core::store::{ContentWriter, StoreWriter};
//! use hoard_core::{StoreConfig, htree};
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let repo = Arc::new(LocalRepository::init("./my-repo")?);
//! let keys = load_key_file(Path::new("./my-repo.key"))?;
//! let store = StoreWriter::open(repo.clone(), keys.pack.clone(), &StoreConfig::default())?;
//!
//! // Store a stream and read it back
//! let handle = htree::write_all(&store, b"hello, hoard")?;
//! assert_eq!(htree::read_all(&store, &handle)?, b"hello, hoard");
//!
//! // Record an (empty) snapshot under a signed tag
//! let root = write_dir(&store, Vec::new())?;
//! let epoch = repo.current_epoch()?;
//! commit_tag(&*repo, &store, &keys.refs, "default", root, 0, epoch)?;
//!
//! // Publish the open pack
//! store.close()?;
//! # Ok(())
//! # }
//! ```

mod config;
mod digest;
mod error;

pub mod cache;
pub mod crypt;
pub mod dir;
pub mod gc;
pub mod htree;
pub mod pack;
pub mod refs;
pub mod remote;
pub mod store;

pub use config::{StoreConfig, parse_size};
pub use digest::{DIGEST_SIZE, Digest};
pub use error::{Error, Result};
pub use gc::{GcOptions, GcStats};
pub use htree::TreeHandle;

//! Error types for hoard_core.

use thiserror::Error;

/// Result type alias using hoard_core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while reading or writing the store.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error on local disk or on the remote repository stream.
    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// Digest absent from the working set and every known pack.
    #[error("Object not found: {digest}")]
    ObjectNotFound { digest: String },

    /// Pack is not (or no longer) present in the remote repository.
    #[error("Pack not found: {name}")]
    PackNotFound { name: String },

    /// Tag is not present in the remote repository.
    #[error("Tag not found: {name}")]
    TagNotFound { name: String },

    /// Malformed hash-tree node.
    #[error("Corrupt hash tree node: {reason}")]
    CorruptNode { reason: String },

    /// Malformed pack header, footer or entry.
    #[error("Corrupt pack: {reason}")]
    CorruptPack { reason: String },

    /// Ciphertext that cannot be decoded.
    #[error("Corrupt ciphertext: {reason}")]
    CorruptCiphertext { reason: String },

    /// Malformed snapshot ref blob.
    #[error("Corrupt ref: {reason}")]
    CorruptRef { reason: String },

    /// Tag value whose signature does not verify under the repository key.
    #[error("Bad tag signature: {reason}")]
    BadSignature { reason: String },

    /// Invalid digest format or encoding.
    #[error("Invalid digest: {reason}")]
    InvalidDigest { reason: String },

    /// Invalid textual tree handle.
    #[error("Invalid tree handle: {reason}")]
    InvalidTreeHandle { reason: String },

    /// Invalid directory entry.
    #[error("Invalid directory entry: {reason}")]
    InvalidDirEntry { reason: String },

    /// Invalid pack or tag name.
    #[error("Invalid name: {reason}")]
    InvalidName { reason: String },

    /// Value does not fit the container it is written to.
    #[error("Value too large: {reason}")]
    ValueTooLarge { reason: String },

    /// Hash tree would need more levels than supported.
    #[error("Hash tree exceeds {levels} levels")]
    TreeTooDeep { levels: usize },

    /// Compression or decompression failure.
    #[error("Compression error: {reason}")]
    Compression { reason: String },

    /// Persistent cache database failure.
    #[error("Cache database error: {source}")]
    Cache {
        #[from]
        source: redb::Error,
    },

    /// Malformed cache daemon request or reply, or a remote-side failure.
    #[error("Cache protocol error: {reason}")]
    Rpc { reason: String },

    /// A collection started (or finished) since this operation began.
    #[error("Concurrent garbage collection, operation failed: {reason}")]
    GcConflict { reason: String },

    /// Pack removal attempted outside of a collection.
    #[error("Garbage collection not running")]
    GcNotRunning,

    /// Invalid configuration file or value.
    #[error("Invalid configuration: {reason}")]
    Config { reason: String },

    /// Local repository directory is missing or malformed.
    #[error("Invalid repository at {path}: {reason}")]
    InvalidRepository {
        path: std::path::PathBuf,
        reason: String,
    },
}

impl Error {
    /// Create an ObjectNotFound error.
    pub fn object_not_found(digest: impl Into<String>) -> Self {
        Error::ObjectNotFound {
            digest: digest.into(),
        }
    }

    /// Create a PackNotFound error.
    pub fn pack_not_found(name: impl Into<String>) -> Self {
        Error::PackNotFound { name: name.into() }
    }

    /// Create a TagNotFound error.
    pub fn tag_not_found(name: impl Into<String>) -> Self {
        Error::TagNotFound { name: name.into() }
    }

    /// Create a CorruptNode error.
    pub fn corrupt_node(reason: impl Into<String>) -> Self {
        Error::CorruptNode {
            reason: reason.into(),
        }
    }

    /// Create a CorruptPack error.
    pub fn corrupt_pack(reason: impl Into<String>) -> Self {
        Error::CorruptPack {
            reason: reason.into(),
        }
    }

    /// Create a CorruptCiphertext error.
    pub fn corrupt_ciphertext(reason: impl Into<String>) -> Self {
        Error::CorruptCiphertext {
            reason: reason.into(),
        }
    }

    /// Create a CorruptRef error.
    pub fn corrupt_ref(reason: impl Into<String>) -> Self {
        Error::CorruptRef {
            reason: reason.into(),
        }
    }

    /// Create a BadSignature error.
    pub fn bad_signature(reason: impl Into<String>) -> Self {
        Error::BadSignature {
            reason: reason.into(),
        }
    }

    /// Create an InvalidDigest error.
    pub fn invalid_digest(reason: impl Into<String>) -> Self {
        Error::InvalidDigest {
            reason: reason.into(),
        }
    }

    /// Create an InvalidTreeHandle error.
    pub fn invalid_tree_handle(reason: impl Into<String>) -> Self {
        Error::InvalidTreeHandle {
            reason: reason.into(),
        }
    }

    /// Create an InvalidDirEntry error.
    pub fn invalid_dir_entry(reason: impl Into<String>) -> Self {
        Error::InvalidDirEntry {
            reason: reason.into(),
        }
    }

    /// Create an InvalidName error.
    pub fn invalid_name(reason: impl Into<String>) -> Self {
        Error::InvalidName {
            reason: reason.into(),
        }
    }

    /// Create a ValueTooLarge error.
    pub fn value_too_large(reason: impl Into<String>) -> Self {
        Error::ValueTooLarge {
            reason: reason.into(),
        }
    }

    /// Create a Compression error.
    pub fn compression(reason: impl Into<String>) -> Self {
        Error::Compression {
            reason: reason.into(),
        }
    }

    /// Create an Rpc error.
    pub fn rpc(reason: impl Into<String>) -> Self {
        Error::Rpc {
            reason: reason.into(),
        }
    }

    /// Create a GcConflict error.
    pub fn gc_conflict(reason: impl Into<String>) -> Self {
        Error::GcConflict {
            reason: reason.into(),
        }
    }

    /// Create a Config error.
    pub fn config(reason: impl Into<String>) -> Self {
        Error::Config {
            reason: reason.into(),
        }
    }

    /// Create an InvalidRepository error.
    pub fn invalid_repository(
        path: impl Into<std::path::PathBuf>,
        reason: impl Into<String>,
    ) -> Self {
        Error::InvalidRepository {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Whether the error means "absent", which callers may report or retry.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::ObjectNotFound { .. } | Error::PackNotFound { .. } | Error::TagNotFound { .. }
        )
    }

    /// Whether the error means data on disk or on the wire is malformed.
    pub fn is_corrupt(&self) -> bool {
        matches!(
            self,
            Error::CorruptNode { .. }
                | Error::CorruptPack { .. }
                | Error::CorruptCiphertext { .. }
                | Error::CorruptRef { .. }
                | Error::BadSignature { .. }
        )
    }

    /// Whether the error came from epoch fencing, so a retry may succeed.
    pub fn is_concurrency(&self) -> bool {
        matches!(self, Error::GcConflict { .. } | Error::GcNotRunning)
    }
}

// Additional From implementations for external error types

impl From<tempfile::PersistError> for Error {
    fn from(err: tempfile::PersistError) -> Self {
        Error::Io { source: err.error }
    }
}

impl From<redb::DatabaseError> for Error {
    fn from(err: redb::DatabaseError) -> Self {
        Error::Cache { source: err.into() }
    }
}

impl From<redb::TransactionError> for Error {
    fn from(err: redb::TransactionError) -> Self {
        Error::Cache { source: err.into() }
    }
}

impl From<redb::TableError> for Error {
    fn from(err: redb::TableError) -> Self {
        Error::Cache { source: err.into() }
    }
}

impl From<redb::StorageError> for Error {
    fn from(err: redb::StorageError) -> Self {
        Error::Cache { source: err.into() }
    }
}

impl From<redb::CommitError> for Error {
    fn from(err: redb::CommitError) -> Self {
        Error::Cache { source: err.into() }
    }
}

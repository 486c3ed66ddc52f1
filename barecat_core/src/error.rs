//! Error taxonomy for the archive engine.
//!
//! Every fallible public operation returns [`crate::Result`], which
//! bubbles up [`BarecatError`]. Variants carry the offending archive
//! path (where one exists) and enough context to diagnose the failure
//! without re-running the operation.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BarecatError {
    /// No file or directory exists at the given archive path.
    #[error("no such file or directory in archive: {path:?}")]
    NotFound { path: String },

    /// An insertion collided with an existing entry.
    #[error("entry already exists in archive: {path:?}")]
    AlreadyExists { path: String },

    /// A file operation was applied to a directory.
    #[error("is a directory: {path:?}")]
    IsADirectory { path: String },

    /// A directory operation was applied to a file.
    #[error("not a directory: {path:?}")]
    NotADirectory { path: String },

    /// `rmdir` on a directory that still has children.
    #[error("directory not empty: {path:?}")]
    DirectoryNotEmpty { path: String },

    /// Stored and recomputed CRC32C disagree for a file's bytes.
    #[error(
        "crc32c mismatch for {path:?} (shard {shard}, offset {offset}): \
         expected {expected:#010x}, found {actual:#010x}"
    )]
    CrcMismatch {
        path: String,
        shard: u32,
        offset: u64,
        expected: u32,
        actual: u32,
    },

    /// The index failed its own integrity check or violates an
    /// archive invariant (counter mismatch, overlapping ranges, ...).
    #[error("index integrity violation: {detail}")]
    Integrity { detail: String },

    /// A write was attempted on an archive opened read-only.
    #[error("archive is open read-only")]
    ReadOnly,

    /// A second writer tried to open an archive that is already
    /// write-locked.
    #[error("another writer holds the archive lock: {path}")]
    WriterLocked { path: PathBuf },

    /// A shard file referenced by the index is absent on disk.
    #[error("shard {shard} missing on disk: {shard_path}")]
    ShardMissing { shard: u32, shard_path: PathBuf },

    /// Streaming ingest failed partway; the partial bytes have been
    /// rolled back from the shard.
    #[error("ingest of {path:?} failed and was rolled back")]
    IngestFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The on-disk schema version is not handled by this build; the
    /// archive must be migrated first.
    #[error("unsupported schema version {major}.{minor} (this build reads 0.x up to 0.3)")]
    UnsupportedSchema { major: i64, minor: i64 },

    /// The given string is not a valid archive path.
    #[error("invalid archive path {path:?}: {reason}")]
    InvalidPath { path: String, reason: &'static str },

    /// A long-running operation observed its cancellation flag.
    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl BarecatError {
    pub(crate) fn not_found(path: impl Into<String>) -> Self {
        BarecatError::NotFound { path: path.into() }
    }

    pub(crate) fn already_exists(path: impl Into<String>) -> Self {
        BarecatError::AlreadyExists { path: path.into() }
    }

    /// True for the errors a reader can hit on a damaged archive, as
    /// opposed to usage errors.
    pub fn is_integrity(&self) -> bool {
        matches!(
            self,
            BarecatError::CrcMismatch { .. }
                | BarecatError::Integrity { .. }
                | BarecatError::ShardMissing { .. }
        )
    }
}

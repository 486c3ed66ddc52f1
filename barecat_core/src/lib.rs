//! # Barecat core
//!
//! An archive engine for storing millions of small named blobs with
//! fast random access by path. Bytes live back-to-back in append-only
//! *shard* files; metadata lives in one SQLite *index* that maps each
//! path to `(shard, offset, size, crc32c, attrs)` and keeps aggregate
//! statistics on every directory.
//!
//! ## Layers
//! 1. `paths` / `crc` – pure helpers (path algebra, streaming CRC32C).
//! 2. `shard` – the shard files: placement, rotation, raw I/O.
//! 3. `index` – the relational store: schema, triggers, migrations.
//! 4. `store` – the [`Barecat`] facade applications use.
//! 5. `defrag` / `reshard` / `verify` / `merge` – maintenance passes
//!    layered on the facade.
//!
//! The engine is single-writer, multi-reader: one writable facade per
//! archive (enforced with a file lock), any number of read-only ones.
//! Reader threads each take their own facade via
//! [`Barecat::new_reader`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

pub mod crc;
pub mod defrag;
pub mod entry;
pub mod error;
pub mod index;
pub mod merge;
pub mod paths;
mod reshard;
pub mod shard;
mod store;
pub mod verify;

pub use defrag::DefragReport;
pub use entry::{DirEntry, EntryMeta, FileEntry, Stat};
pub use error::BarecatError;
pub use index::{FileOrder, migration};
pub use merge::{DuplicatePolicy, MergeOptions, merge_copy, merge_symlink};
pub use shard::OpenMode;
pub use store::{Barecat, BarecatOptions, EmitChunks, FileHandle, ShardUsage, Walk};
pub use verify::{VerifyIssue, VerifyReport};

/// Crate-wide result alias that bubbles up [`BarecatError`].
pub type Result<T, E = BarecatError> = std::result::Result<T, E>;

/// Cooperative cancellation flag for long operations (verify, defrag,
/// reshard, merge, bulk import). Clone it into the worker; `cancel()`
/// from anywhere. Operations check at least between files and between
/// gap fills; cancellation aborts the in-flight transaction only, so
/// previously committed work is preserved.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    pub(crate) fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(BarecatError::Cancelled)
        } else {
            Ok(())
        }
    }
}

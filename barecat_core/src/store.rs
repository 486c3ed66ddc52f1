//! The path-addressed facade over index + shard store.
//!
//! [`Barecat`] exclusively owns the index connection and the shard
//! descriptors of one archive for its lifetime. Writers additionally
//! hold an exclusive advisory lock on a sidecar lock file, so a single
//! archive has at most one writer at a time while readers open freely.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use fs4::fs_std::FileExt;
use tracing::{debug, info, warn};

use crate::crc::crc32c_of;
use crate::entry::{DirEntry, EntryMeta, FileEntry, Stat};
use crate::index::{FileOrder, Index};
use crate::paths;
use crate::shard::{COPY_CHUNK, OpenMode, ShardStore, shard_path};
use crate::{BarecatError, Result};

/// Builder for opening an archive.
///
/// ```no_run
/// use barecat_core::Barecat;
///
/// let store = Barecat::options()
///     .writable()
///     .shard_size_limit(64 * 1024 * 1024)
///     .open("photos.barecat")?;
/// # Ok::<(), barecat_core::BarecatError>(())
/// ```
#[derive(Debug, Clone)]
pub struct BarecatOptions {
    mode: OpenMode,
    overwrite: bool,
    shard_size_limit: Option<u64>,
}

impl Default for BarecatOptions {
    fn default() -> Self {
        Self {
            mode: OpenMode::ReadOnly,
            overwrite: false,
            shard_size_limit: None,
        }
    }
}

impl BarecatOptions {
    pub fn read_only(mut self) -> Self {
        self.mode = OpenMode::ReadOnly;
        self
    }

    /// Read-write: creates the archive when absent.
    pub fn writable(mut self) -> Self {
        self.mode = OpenMode::ReadWrite;
        self
    }

    /// Append-only: existing bytes are immutable.
    pub fn append_only(mut self) -> Self {
        self.mode = OpenMode::Append;
        self
    }

    /// Start fresh, deleting any archive already at the base path.
    pub fn overwrite(mut self) -> Self {
        self.overwrite = true;
        self
    }

    /// Rotation limit for new shards. Stored in the archive config;
    /// files already on disk are untouched until `reshard`.
    pub fn shard_size_limit(mut self, limit: u64) -> Self {
        self.shard_size_limit = Some(limit);
        self
    }

    pub fn open(self, base: impl AsRef<Path>) -> Result<Barecat> {
        Barecat::open_with(base.as_ref(), self)
    }
}

/// One archive: a SQLite index at the base path plus numbered shard
/// files next to it.
#[derive(Debug)]
pub struct Barecat {
    base: PathBuf,
    index: Index,
    shards: ShardStore,
    mode: OpenMode,
    // Held for the writer's lifetime; dropping releases the lock.
    _writer_lock: Option<File>,
}

impl Barecat {
    pub fn options() -> BarecatOptions {
        BarecatOptions::default()
    }

    /// Opens an existing archive read-only.
    pub fn open(base: impl AsRef<Path>) -> Result<Self> {
        Self::options().read_only().open(base)
    }

    /// Opens read-write, creating the archive when absent.
    pub fn open_writable(base: impl AsRef<Path>) -> Result<Self> {
        Self::options().writable().open(base)
    }

    /// Creates a fresh archive, failing if one already exists.
    pub fn create(base: impl AsRef<Path>) -> Result<Self> {
        let base = base.as_ref();
        if base.exists() {
            return Err(BarecatError::already_exists(base.display().to_string()));
        }
        Self::options().writable().open(base)
    }

    fn open_with(base: &Path, opts: BarecatOptions) -> Result<Self> {
        let writer_lock = if opts.mode.writable() {
            Some(acquire_writer_lock(base)?)
        } else {
            None
        };

        if opts.overwrite && opts.mode.writable() {
            remove_archive_files(base)?;
        }

        let index = Index::open(base, !opts.mode.writable(), opts.mode.writable())?;
        if let Some(limit) = opts.shard_size_limit {
            if !opts.mode.writable() {
                return Err(BarecatError::ReadOnly);
            }
            index.set_shard_size_limit(limit)?;
        }
        let limit = index.shard_size_limit()?;
        let shards = ShardStore::open(base, opts.mode, limit)?;

        info!(archive = %base.display(), mode = ?opts.mode, "opened archive");
        Ok(Self {
            base: base.to_path_buf(),
            index,
            shards,
            mode: opts.mode,
            _writer_lock: writer_lock,
        })
    }

    pub fn base_path(&self) -> &Path {
        &self.base
    }

    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    pub fn readonly(&self) -> bool {
        !self.mode.writable()
    }

    /// A fresh read-only view with its own index connection and shard
    /// descriptors. Hand one to each reader thread; `Barecat` itself
    /// is not shareable across threads.
    pub fn new_reader(&self) -> Result<Barecat> {
        Self::options().read_only().open(&self.base)
    }

    pub(crate) fn index(&self) -> &Index {
        &self.index
    }

    pub(crate) fn shards(&self) -> &ShardStore {
        &self.shards
    }

    pub(crate) fn shards_mut(&mut self) -> &mut ShardStore {
        &mut self.shards
    }

    fn require_writable(&self) -> Result<()> {
        if self.mode.writable() {
            Ok(())
        } else {
            Err(BarecatError::ReadOnly)
        }
    }

    // ------------------------------------------------------------------
    // Mapping-style contract
    // ------------------------------------------------------------------

    /// Reads a whole file and verifies its checksum.
    pub fn get(&self, path: &str) -> Result<Vec<u8>> {
        let path = paths::normalize_nonroot(path)?;
        let entry = self.lookup_file_typed(&path)?;
        let bytes = self.shards.read(entry.shard, entry.offset, entry.size)?;
        if let Some(expected) = entry.crc32c {
            let actual = crc32c_of(&bytes);
            if actual != expected {
                return Err(BarecatError::CrcMismatch {
                    path,
                    shard: entry.shard,
                    offset: entry.offset,
                    expected,
                    actual,
                });
            }
        }
        Ok(bytes)
    }

    /// Adds a new file; fails with AlreadyExists when the path is
    /// taken.
    pub fn put(&mut self, path: &str, bytes: &[u8]) -> Result<()> {
        self.put_with(path, bytes, EntryMeta::default(), false)
    }

    /// Adds a file, replacing any existing entry (the old bytes become
    /// a hole in their shard).
    pub fn put_overwrite(&mut self, path: &str, bytes: &[u8]) -> Result<()> {
        self.put_with(path, bytes, EntryMeta::default(), true)
    }

    /// Full-control insert: metadata and overwrite behavior.
    ///
    /// Ordering per the crash-resilience contract: bytes are appended
    /// and flushed to the shard first, then one index transaction
    /// deletes the old row (if overwriting), inserts the new one and
    /// propagates statistics. A crash in between leaves orphan tail
    /// bytes but intact invariants.
    pub fn put_with(
        &mut self,
        path: &str,
        bytes: &[u8],
        meta: EntryMeta,
        overwrite: bool,
    ) -> Result<()> {
        self.require_writable()?;
        let path = paths::normalize_nonroot(path)?;
        self.check_file_insertable(&path, overwrite)?;
        let old = self.index.try_lookup_file(&path)?;

        let placement = self.shards.append(bytes)?;
        let entry = FileEntry {
            path: path.clone(),
            shard: placement.shard,
            offset: placement.offset,
            size: placement.size,
            crc32c: Some(placement.crc32c),
            meta,
        };

        let txn = self.index.conn().unchecked_transaction()?;
        if old.is_some() {
            self.index.delete_file(&path)?;
        }
        self.index.insert_file(&entry)?;
        txn.commit()?;

        if let Some(old) = old {
            let _ = self.shards.punch_hole(old.shard, old.offset, old.size);
        }
        Ok(())
    }

    /// Removes a file entry. The bytes stay behind as a hole (punched
    /// out where the platform supports it) until defrag reclaims them;
    /// a hole at the very tail of a shard is truncated away directly.
    pub fn delete(&mut self, path: &str) -> Result<FileEntry> {
        self.require_writable()?;
        let path = paths::normalize_nonroot(path)?;
        if !self.index.file_exists(&path)? && self.index.dir_exists(&path)? {
            return Err(BarecatError::IsADirectory { path });
        }
        let entry = self.index.delete_file(&path)?;

        let shard_len = self.shards.shard_len(entry.shard).unwrap_or(0);
        if entry.size > 0 && entry.end_offset() == shard_len {
            self.shards.truncate(entry.shard, entry.offset)?;
        } else {
            let _ = self
                .shards
                .punch_hole(entry.shard, entry.offset, entry.size);
        }
        Ok(entry)
    }

    /// File-only predicate (directories do not count).
    pub fn contains(&self, path: &str) -> Result<bool> {
        let path = paths::normalize_nonroot(path)?;
        self.index.file_exists(&path)
    }

    // ------------------------------------------------------------------
    // Filesystem-style contract
    // ------------------------------------------------------------------

    /// Opens a seekable read handle on a file.
    ///
    /// Handle reads are raw range reads and do NOT verify the
    /// checksum; only whole-file [`Barecat::get`] does.
    pub fn open_file(&self, path: &str) -> Result<FileHandle> {
        let path = paths::normalize_nonroot(path)?;
        let entry = self.lookup_file_typed(&path)?;
        let shard_file = shard_path(&self.base, entry.shard);
        let file = File::open(&shard_file).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                BarecatError::ShardMissing {
                    shard: entry.shard,
                    shard_path: shard_file.clone(),
                }
            } else {
                e.into()
            }
        })?;
        Ok(FileHandle {
            file,
            start: entry.offset,
            size: entry.size,
            pos: 0,
        })
    }

    /// Child entry names (directories and files interleaved), in path
    /// order.
    pub fn listdir(&self, path: &str) -> Result<Vec<String>> {
        let path = paths::normalize(path)?;
        self.require_dir(&path)?;
        self.index.listdir(&path)
    }

    /// Lazy top-down traversal from `top`, yielding
    /// `(dirpath, subdir_names, file_names)` per visited directory.
    /// The iterator queries as it goes and must not outlive writes to
    /// the archive.
    pub fn walk(&self, top: &str) -> Result<Walk<'_>> {
        let top = paths::normalize(top)?;
        self.require_dir(&top)?;
        Ok(Walk {
            store: self,
            pending: vec![top].into(),
        })
    }

    /// Shell-style glob over the whole archive. Matches both files and
    /// directories; results come back in path order.
    pub fn glob(&self, pattern: &str, recursive: bool) -> Result<Vec<String>> {
        let re = paths::compile_glob(pattern, recursive)?;
        let prefix = paths::glob_literal_prefix(pattern);
        let mut out = Vec::new();
        for p in self.index.dir_paths_under(prefix)? {
            if re.is_match(&p) {
                out.push(p);
            }
        }
        for p in self.index.file_paths_under(prefix)? {
            if re.is_match(&p) {
                out.push(p);
            }
        }
        out.sort_unstable();
        Ok(out)
    }

    pub fn exists(&self, path: &str) -> Result<bool> {
        let path = paths::normalize(path)?;
        Ok(self.index.file_exists(&path)? || self.index.dir_exists(&path)?)
    }

    pub fn is_file(&self, path: &str) -> Result<bool> {
        let path = paths::normalize(path)?;
        self.index.file_exists(&path)
    }

    pub fn is_dir(&self, path: &str) -> Result<bool> {
        let path = paths::normalize(path)?;
        self.index.dir_exists(&path)
    }

    pub fn stat(&self, path: &str) -> Result<Stat> {
        let path = paths::normalize(path)?;
        if let Some(f) = self.index.try_lookup_file(&path)? {
            return Ok(Stat::File(f));
        }
        if let Some(d) = self.index.try_lookup_dir(&path)? {
            return Ok(Stat::Dir(d));
        }
        Err(BarecatError::not_found(path))
    }

    /// Creates a directory entry. Ancestors materialize automatically.
    pub fn mkdir(&mut self, path: &str, exist_ok: bool) -> Result<()> {
        self.require_writable()?;
        let path = paths::normalize_nonroot(path)?;
        if self.index.file_exists(&path)? {
            return Err(BarecatError::NotADirectory { path });
        }
        if self.index.dir_exists(&path)? {
            if exist_ok {
                return Ok(());
            }
            return Err(BarecatError::already_exists(path));
        }
        self.check_ancestors_are_dirs(&path)?;
        self.index.insert_dir(&path, &EntryMeta::default())
    }

    /// Removes an empty directory.
    pub fn rmdir(&mut self, path: &str) -> Result<()> {
        self.require_writable()?;
        let path = paths::normalize_nonroot(path)?;
        if !self.index.dir_exists(&path)? {
            if self.index.file_exists(&path)? {
                return Err(BarecatError::NotADirectory { path });
            }
            return Err(BarecatError::not_found(path));
        }
        self.index.delete_dir(&path)
    }

    /// Recursively removes a directory (or a single file).
    pub fn rmtree(&mut self, path: &str) -> Result<()> {
        self.require_writable()?;
        let path = paths::normalize_nonroot(path)?;
        if self.index.file_exists(&path)? {
            self.delete(&path)?;
            return Ok(());
        }
        if !self.index.dir_exists(&path)? {
            return Err(BarecatError::not_found(path));
        }

        let files = self.collect_files_under(&path)?;
        let mut dirs = self.index.dir_paths_under(&path)?;
        dirs.push(path.clone());
        dirs.sort_unstable_by_key(|d| std::cmp::Reverse(paths::depth(d)));

        let txn = self.index.conn().unchecked_transaction()?;
        for f in &files {
            self.index.delete_file(&f.path)?;
        }
        for d in &dirs {
            self.index.delete_dir(d)?;
        }
        txn.commit()?;

        for f in &files {
            let _ = self.shards.punch_hole(f.shard, f.offset, f.size);
        }
        debug!(path = %path, removed_files = files.len(), "rmtree done");
        Ok(())
    }

    /// Renames a file or a whole directory subtree. Relationally this
    /// is delete-then-insert inside one transaction, so the stat
    /// triggers see both sides of the move.
    pub fn rename(&mut self, src: &str, dst: &str) -> Result<()> {
        self.require_writable()?;
        let src = paths::normalize_nonroot(src)?;
        let dst = paths::normalize_nonroot(dst)?;
        if src == dst {
            return Ok(());
        }
        if self.exists(&dst)? {
            return Err(BarecatError::already_exists(dst));
        }
        self.check_ancestors_are_dirs(&dst)?;

        if let Some(entry) = self.index.try_lookup_file(&src)? {
            let txn = self.index.conn().unchecked_transaction()?;
            self.index.delete_file(&src)?;
            self.index.insert_file(&FileEntry {
                path: dst,
                ..entry
            })?;
            txn.commit()?;
            return Ok(());
        }

        if !self.index.dir_exists(&src)? {
            return Err(BarecatError::not_found(src));
        }
        if dst.starts_with(&format!("{src}/")) {
            return Err(BarecatError::InvalidPath {
                path: dst,
                reason: "cannot move a directory underneath itself",
            });
        }

        let files = self.collect_files_under(&src)?;
        let mut dir_entries: Vec<DirEntry> = vec![self.index.lookup_dir(&src)?];
        for d in self.index.dir_paths_under(&src)? {
            dir_entries.push(self.index.lookup_dir(&d)?);
        }

        let txn = self.index.conn().unchecked_transaction()?;
        for f in &files {
            self.index.delete_file(&f.path)?;
        }
        let mut deepest_first = dir_entries.clone();
        deepest_first.sort_unstable_by_key(|d| std::cmp::Reverse(paths::depth(&d.path)));
        for d in &deepest_first {
            self.index.delete_dir(&d.path)?;
        }
        dir_entries.sort_unstable_by_key(|d| paths::depth(&d.path));
        for d in &dir_entries {
            let new_path = rewrite_prefix(&d.path, &src, &dst);
            self.index.insert_dir(&new_path, &d.meta)?;
        }
        for f in &files {
            let new_path = rewrite_prefix(&f.path, &src, &dst);
            self.index.insert_file(&FileEntry {
                path: new_path,
                ..f.clone()
            })?;
        }
        txn.commit()?;
        debug!(src = %src, moved_files = files.len(), "directory renamed");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Streaming ingress / egress
    // ------------------------------------------------------------------

    /// Pulls bytes from `reader` in chunks, streaming them straight to
    /// the shard store. A failure mid-stream truncates the shard back
    /// to the pre-call length and surfaces as IngestFailed.
    pub fn ingest(
        &mut self,
        path: &str,
        meta: EntryMeta,
        reader: &mut dyn Read,
    ) -> Result<FileEntry> {
        self.require_writable()?;
        let path = paths::normalize_nonroot(path)?;
        self.check_file_insertable(&path, false)?;

        let placement = match self.shards.append_stream(reader) {
            Ok(p) => p,
            Err(BarecatError::Io(source)) => {
                return Err(BarecatError::IngestFailed { path, source });
            }
            Err(e) => return Err(e),
        };

        let entry = FileEntry {
            path,
            shard: placement.shard,
            offset: placement.offset,
            size: placement.size,
            crc32c: Some(placement.crc32c),
            meta,
        };
        self.index.insert_file(&entry)?;
        Ok(entry)
    }

    /// Size plus a lazy chunk source for streaming a file out, for
    /// tar/zip-style adapters. Chunks are raw range reads (no CRC).
    pub fn emit(&self, path: &str) -> Result<(u64, EmitChunks)> {
        let handle = self.open_file(path)?;
        let size = handle.size;
        Ok((size, EmitChunks { handle }))
    }

    // ------------------------------------------------------------------
    // Bulk mode
    // ------------------------------------------------------------------

    /// Switches live stat propagation off for a mass import.
    pub fn begin_bulk(&mut self) -> Result<()> {
        self.require_writable()?;
        self.index.set_use_triggers(false)?;
        debug!("bulk mode: triggers off");
        Ok(())
    }

    /// Ends bulk mode: rebuilds every directory counter bottom-up and
    /// re-enables live propagation.
    pub fn end_bulk(&mut self) -> Result<()> {
        self.require_writable()?;
        self.index.rebuild_stats()?;
        self.index.set_use_triggers(true)?;
        debug!("bulk mode: stats rebuilt, triggers on");
        Ok(())
    }

    /// Runs `f` between [`begin_bulk`](Self::begin_bulk) and
    /// [`end_bulk`](Self::end_bulk). Stats are rebuilt even when `f`
    /// fails, so invariants hold afterwards either way.
    pub fn with_bulk_writes<T>(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<T>,
    ) -> Result<T> {
        self.begin_bulk()?;
        let result = f(self);
        let end = self.end_bulk();
        let value = result?;
        end?;
        Ok(value)
    }

    // ------------------------------------------------------------------
    // Aggregates & config
    // ------------------------------------------------------------------

    /// Number of live files, from the root's tree counter.
    pub fn num_files(&self) -> Result<u64> {
        Ok(self.index.lookup_dir("")?.num_files_tree)
    }

    /// Total logical bytes, from the root's tree counter.
    pub fn total_size(&self) -> Result<u64> {
        Ok(self.index.lookup_dir("")?.size_tree)
    }

    pub fn num_dirs(&self) -> Result<u64> {
        self.index.num_dirs()
    }

    pub fn shard_size_limit(&self) -> Result<u64> {
        self.index.shard_size_limit()
    }

    /// Persists a new rotation limit. Existing shards keep their
    /// layout until `reshard` runs.
    pub fn set_shard_size_limit(&mut self, limit: u64) -> Result<()> {
        self.require_writable()?;
        self.index.set_shard_size_limit(limit)?;
        self.shards.set_limit(limit);
        Ok(())
    }

    /// Updates POSIX metadata on an existing file or directory.
    pub fn set_meta(&mut self, path: &str, meta: EntryMeta) -> Result<()> {
        self.require_writable()?;
        let path = paths::normalize(path)?;
        if self.index.file_exists(&path)? {
            self.index.update_file_meta(&path, &meta)
        } else if self.index.dir_exists(&path)? {
            self.index.update_dir_meta(&path, &meta)
        } else {
            Err(BarecatError::not_found(path))
        }
    }

    /// Per-shard physical accounting: on-disk length, live bytes, and
    /// hole bytes, for `du`-style consumers.
    pub fn shard_stats(&self) -> Result<Vec<ShardUsage>> {
        let mut out = Vec::new();
        for shard in crate::shard::existing_shards(&self.base)? {
            let length = self.shards.shard_len(shard)?;
            let used: u64 = self
                .index
                .files_in_shard(shard)?
                .iter()
                .map(|f| f.size)
                .sum();
            out.push(ShardUsage {
                shard,
                length,
                used_bytes: used,
                gap_bytes: length.saturating_sub(used),
            });
        }
        Ok(out)
    }

    /// Iterates every file entry in the chosen order.
    pub fn iter_files(&self, order: FileOrder) -> crate::index::FileIter<'_> {
        self.index.iter_files(order)
    }

    // ------------------------------------------------------------------
    // Internal helpers
    // ------------------------------------------------------------------

    fn lookup_file_typed(&self, path: &str) -> Result<FileEntry> {
        match self.index.try_lookup_file(path)? {
            Some(entry) => Ok(entry),
            None if self.index.dir_exists(path)? => Err(BarecatError::IsADirectory {
                path: path.to_string(),
            }),
            None => Err(BarecatError::not_found(path)),
        }
    }

    fn require_dir(&self, path: &str) -> Result<()> {
        if self.index.dir_exists(path)? {
            return Ok(());
        }
        if self.index.file_exists(path)? {
            return Err(BarecatError::NotADirectory {
                path: path.to_string(),
            });
        }
        Err(BarecatError::not_found(path))
    }

    fn check_file_insertable(&self, path: &str, overwrite: bool) -> Result<()> {
        if self.index.dir_exists(path)? {
            return Err(BarecatError::IsADirectory {
                path: path.to_string(),
            });
        }
        if !overwrite && self.index.file_exists(path)? {
            return Err(BarecatError::already_exists(path));
        }
        self.check_ancestors_are_dirs(path)
    }

    /// Rejects paths that would force a directory on top of an
    /// existing file (e.g. adding `a/b` while `a` is a file).
    fn check_ancestors_are_dirs(&self, path: &str) -> Result<()> {
        for anc in paths::ancestors(path) {
            if anc.is_empty() {
                break;
            }
            if self.index.file_exists(anc)? {
                return Err(BarecatError::NotADirectory {
                    path: anc.to_string(),
                });
            }
        }
        Ok(())
    }

    fn collect_files_under(&self, dir: &str) -> Result<Vec<FileEntry>> {
        let mut files = Vec::new();
        for p in self.index.file_paths_under(dir)? {
            files.push(self.index.lookup_file(&p)?);
        }
        Ok(files)
    }
}

/// Physical usage of one shard file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardUsage {
    pub shard: u32,
    pub length: u64,
    pub used_bytes: u64,
    pub gap_bytes: u64,
}

/// Seekable read handle over one file's byte range. Owns its own
/// descriptor on the shard file, so handles outlive no locks and can
/// be used alongside further facade calls.
#[derive(Debug)]
pub struct FileHandle {
    file: File,
    start: u64,
    size: u64,
    pos: u64,
}

impl FileHandle {
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Current position within the file, like `Seek::stream_position`
    /// without the io plumbing.
    pub fn tell(&self) -> u64 {
        self.pos
    }
}

impl Read for FileHandle {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.pos >= self.size {
            return Ok(0);
        }
        let remaining = self.size - self.pos;
        let n = buf.len().min(remaining as usize);
        self.file.seek(SeekFrom::Start(self.start + self.pos))?;
        let read = self.file.read(&mut buf[..n])?;
        self.pos += read as u64;
        Ok(read)
    }
}

impl Seek for FileHandle {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        let new_pos: i64 = match pos {
            SeekFrom::Start(p) => p as i64,
            SeekFrom::End(d) => self.size as i64 + d,
            SeekFrom::Current(d) => self.pos as i64 + d,
        };
        if new_pos < 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "seek before start of file",
            ));
        }
        self.pos = (new_pos as u64).min(self.size);
        Ok(self.pos)
    }
}

/// Chunked byte source returned by [`Barecat::emit`].
pub struct EmitChunks {
    handle: FileHandle,
}

impl Iterator for EmitChunks {
    type Item = std::io::Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.handle.pos >= self.handle.size {
            return None;
        }
        let mut buf = vec![0u8; COPY_CHUNK];
        match self.handle.read(&mut buf) {
            Ok(0) => None,
            Ok(n) => {
                buf.truncate(n);
                Some(Ok(buf))
            }
            Err(e) => Some(Err(e)),
        }
    }
}

/// Lazy top-down directory traversal; see [`Barecat::walk`].
pub struct Walk<'a> {
    store: &'a Barecat,
    pending: std::collections::VecDeque<String>,
}

impl Iterator for Walk<'_> {
    type Item = Result<(String, Vec<String>, Vec<String>)>;

    fn next(&mut self) -> Option<Self::Item> {
        let dir = self.pending.pop_front()?;
        match self.store.index.dir_children(&dir) {
            Ok((subdirs, files)) => {
                // Depth-first preorder: children go to the front in
                // listing order.
                for name in subdirs.iter().rev() {
                    let child = if dir.is_empty() {
                        name.clone()
                    } else {
                        format!("{dir}/{name}")
                    };
                    self.pending.push_front(child);
                }
                Some(Ok((dir, subdirs, files)))
            }
            Err(e) => {
                self.pending.clear();
                Some(Err(e))
            }
        }
    }
}

fn rewrite_prefix(path: &str, src: &str, dst: &str) -> String {
    if path == src {
        dst.to_string()
    } else {
        format!("{dst}/{}", &path[src.len() + 1..])
    }
}

fn lock_file_path(base: &Path) -> PathBuf {
    let mut name = base
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".lock");
    base.with_file_name(name)
}

fn acquire_writer_lock(base: &Path) -> Result<File> {
    if let Some(dir) = base.parent()
        && !dir.as_os_str().is_empty()
    {
        std::fs::create_dir_all(dir)?;
    }
    let lock_path = lock_file_path(base);
    let file = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(&lock_path)?;
    if !file.try_lock_exclusive()? {
        return Err(BarecatError::WriterLocked { path: lock_path });
    }
    Ok(file)
}

fn remove_archive_files(base: &Path) -> Result<()> {
    for shard in crate::shard::existing_shards(base)? {
        std::fs::remove_file(shard_path(base, shard))?;
    }
    for suffix in ["", "-wal", "-shm"] {
        let mut name = base
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(suffix);
        let p = base.with_file_name(name);
        if p.exists() {
            std::fs::remove_file(&p)?;
        }
    }
    warn!(archive = %base.display(), "existing archive overwritten");
    Ok(())
}

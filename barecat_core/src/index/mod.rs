//! The relational index: path → (shard, offset, size, crc32c, attrs).
//!
//! One SQLite database per archive. The schema lives in [`schema`],
//! migrations from older layouts in [`migration`]. All statement text
//! goes through `prepare_cached`, so hot paths reuse compiled
//! statements across calls.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::{Connection, OpenFlags, OptionalExtension, Row, params};
use tracing::{debug, info};

use crate::entry::{DirEntry, EntryMeta, FileEntry};
use crate::paths;
use crate::{BarecatError, Result};

pub mod migration;
pub mod schema;

pub use schema::{DEFAULT_SHARD_SIZE_LIMIT, SCHEMA_MAJOR, SCHEMA_MINOR};

const ITER_BATCH: usize = 1024;

const FILE_COLUMNS: &str = r#"path, shard, "offset", size, crc32c, mode, uid, gid, mtime_ns"#;
const DIR_COLUMNS: &str =
    "path, num_subdirs, num_files, num_files_tree, size_tree, mode, uid, gid, mtime_ns";

/// Orderings for whole-archive file iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileOrder {
    /// Insertion order (rowid).
    Insertion,
    /// Lexicographic by path, ascending.
    PathAsc,
    /// Lexicographic by path, descending.
    PathDesc,
    /// `(shard, offset)` ascending — the physical layout order.
    Address,
    /// One random permutation per iterator.
    Random,
}

/// Open handle on the index database of one archive.
#[derive(Debug)]
pub struct Index {
    conn: Connection,
    path: PathBuf,
    readonly: bool,
}

impl Index {
    /// Opens (or, with `create`, initializes) the index at `path`.
    pub fn open(path: &Path, readonly: bool, create: bool) -> Result<Self> {
        let existed = path.exists();
        if readonly && !existed {
            return Err(BarecatError::not_found(path.display().to_string()));
        }
        let flags = if readonly {
            OpenFlags::SQLITE_OPEN_READ_ONLY
        } else if create {
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE
        } else {
            OpenFlags::SQLITE_OPEN_READ_WRITE
        };
        let conn = Connection::open_with_flags(path, flags)?;
        conn.busy_timeout(Duration::from_secs(10))?;
        conn.pragma_update(None, "recursive_triggers", "ON")?;
        if !readonly {
            // journal_mode reports the resulting mode as a row.
            let _mode: String =
                conn.query_row("PRAGMA journal_mode = WAL", [], |r| r.get(0))?;
            conn.pragma_update(None, "synchronous", "NORMAL")?;
        }

        if !existed {
            schema::initialize(&conn)?;
            info!(index = %path.display(), "created fresh index");
        } else {
            check_version(&conn, readonly)?;
        }

        Ok(Self {
            conn,
            path: path.to_path_buf(),
            readonly,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn readonly(&self) -> bool {
        self.readonly
    }

    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }

    // ------------------------------------------------------------------
    // Config
    // ------------------------------------------------------------------

    pub fn config_int(&self, key: &str) -> Result<Option<i64>> {
        let v = self
            .conn
            .prepare_cached("SELECT value_int FROM config WHERE key = ?1")?
            .query_row([key], |r| r.get(0))
            .optional()?;
        Ok(v)
    }

    pub fn config_text(&self, key: &str) -> Result<Option<String>> {
        let v = self
            .conn
            .prepare_cached("SELECT value_text FROM config WHERE key = ?1")?
            .query_row([key], |r| r.get(0))
            .optional()?;
        Ok(v)
    }

    pub fn set_config_int(&self, key: &str, value: i64) -> Result<()> {
        self.conn
            .prepare_cached(
                "INSERT INTO config (key, value_int) VALUES (?1, ?2)
                 ON CONFLICT (key) DO UPDATE SET value_int = excluded.value_int",
            )?
            .execute(params![key, value])?;
        Ok(())
    }

    pub fn schema_version(&self) -> Result<(i64, i64)> {
        Ok((
            self.config_int("schema_version_major")?.unwrap_or(0),
            self.config_int("schema_version_minor")?.unwrap_or(0),
        ))
    }

    pub fn use_triggers(&self) -> Result<bool> {
        Ok(self.config_int("use_triggers")?.unwrap_or(1) == 1)
    }

    pub fn set_use_triggers(&self, on: bool) -> Result<()> {
        self.set_config_int("use_triggers", i64::from(on))
    }

    pub fn shard_size_limit(&self) -> Result<u64> {
        Ok(self
            .config_int("shard_size_limit")?
            .unwrap_or(DEFAULT_SHARD_SIZE_LIMIT) as u64)
    }

    pub fn set_shard_size_limit(&self, limit: u64) -> Result<()> {
        self.set_config_int("shard_size_limit", limit.min(i64::MAX as u64) as i64)
    }

    // ------------------------------------------------------------------
    // Lookups
    // ------------------------------------------------------------------

    pub fn try_lookup_file(&self, path: &str) -> Result<Option<FileEntry>> {
        let row = self
            .conn
            .prepare_cached(&format!(
                "SELECT {FILE_COLUMNS} FROM files WHERE path = ?1"
            ))?
            .query_row([path], file_from_row)
            .optional()?;
        Ok(row)
    }

    pub fn lookup_file(&self, path: &str) -> Result<FileEntry> {
        self.try_lookup_file(path)?
            .ok_or_else(|| BarecatError::not_found(path))
    }

    pub fn try_lookup_dir(&self, path: &str) -> Result<Option<DirEntry>> {
        let row = self
            .conn
            .prepare_cached(&format!("SELECT {DIR_COLUMNS} FROM dirs WHERE path = ?1"))?
            .query_row([path], dir_from_row)
            .optional()?;
        Ok(row)
    }

    pub fn lookup_dir(&self, path: &str) -> Result<DirEntry> {
        self.try_lookup_dir(path)?
            .ok_or_else(|| BarecatError::not_found(path))
    }

    pub fn file_exists(&self, path: &str) -> Result<bool> {
        Ok(self.try_lookup_file(path)?.is_some())
    }

    pub fn dir_exists(&self, path: &str) -> Result<bool> {
        Ok(self.try_lookup_dir(path)?.is_some())
    }

    // ------------------------------------------------------------------
    // Mutation
    // ------------------------------------------------------------------

    /// Inserts a file row; the stat triggers materialize ancestor
    /// directories and propagate counters (unless bulk mode switched
    /// them off).
    pub fn insert_file(&self, entry: &FileEntry) -> Result<()> {
        if self.file_exists(&entry.path)? {
            return Err(BarecatError::already_exists(&entry.path));
        }
        self.conn
            .prepare_cached(
                r#"INSERT INTO files (path, shard, "offset", size, crc32c, mode, uid, gid, mtime_ns)
                   VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"#,
            )?
            .execute(params![
                entry.path,
                entry.shard as i64,
                entry.offset as i64,
                entry.size as i64,
                entry.crc32c.map(|c| c as i64),
                entry.meta.mode.map(|m| m as i64),
                entry.meta.uid.map(|u| u as i64),
                entry.meta.gid.map(|g| g as i64),
                entry.meta.mtime_ns,
            ])?;
        Ok(())
    }

    /// Deletes a file row and returns it; counters un-propagate via
    /// the delete trigger.
    pub fn delete_file(&self, path: &str) -> Result<FileEntry> {
        let entry = self.lookup_file(path)?;
        self.conn
            .prepare_cached("DELETE FROM files WHERE path = ?1")?
            .execute([path])?;
        Ok(entry)
    }

    /// Rewrites a file's physical location after defrag/reshard moved
    /// its bytes. Size does not change, so no stats are touched.
    pub fn update_placement(&self, path: &str, shard: u32, offset: u64) -> Result<()> {
        let n = self
            .conn
            .prepare_cached(r#"UPDATE files SET shard = ?2, "offset" = ?3 WHERE path = ?1"#)?
            .execute(params![path, shard as i64, offset as i64])?;
        if n == 0 {
            return Err(BarecatError::not_found(path));
        }
        Ok(())
    }

    /// Metadata-only update; bypasses the stat triggers on purpose.
    pub fn update_file_meta(&self, path: &str, meta: &EntryMeta) -> Result<()> {
        let n = self
            .conn
            .prepare_cached(
                "UPDATE files SET mode = ?2, uid = ?3, gid = ?4, mtime_ns = ?5 WHERE path = ?1",
            )?
            .execute(params![
                path,
                meta.mode.map(|m| m as i64),
                meta.uid.map(|u| u as i64),
                meta.gid.map(|g| g as i64),
                meta.mtime_ns,
            ])?;
        if n == 0 {
            return Err(BarecatError::not_found(path));
        }
        Ok(())
    }

    pub fn update_dir_meta(&self, path: &str, meta: &EntryMeta) -> Result<()> {
        let n = self
            .conn
            .prepare_cached(
                "UPDATE dirs SET mode = ?2, uid = ?3, gid = ?4, mtime_ns = ?5 WHERE path = ?1",
            )?
            .execute(params![
                path,
                meta.mode.map(|m| m as i64),
                meta.uid.map(|u| u as i64),
                meta.gid.map(|g| g as i64),
                meta.mtime_ns,
            ])?;
        if n == 0 {
            return Err(BarecatError::not_found(path));
        }
        Ok(())
    }

    /// Explicit mkdir. Fails with AlreadyExists on a duplicate path.
    pub fn insert_dir(&self, path: &str, meta: &EntryMeta) -> Result<()> {
        if self.dir_exists(path)? {
            return Err(BarecatError::already_exists(path));
        }
        self.conn
            .prepare_cached(
                "INSERT INTO dirs (path, mode, uid, gid, mtime_ns) VALUES (?1, ?2, ?3, ?4, ?5)",
            )?
            .execute(params![
                path,
                meta.mode.map(|m| m as i64),
                meta.uid.map(|u| u as i64),
                meta.gid.map(|g| g as i64),
                meta.mtime_ns,
            ])?;
        Ok(())
    }

    /// Materializes a directory if absent; a no-op (and no trigger
    /// firing) when it already exists.
    pub fn ensure_dir(&self, path: &str) -> Result<()> {
        self.conn
            .prepare_cached("INSERT OR IGNORE INTO dirs (path) VALUES (?1)")?
            .execute([path])?;
        Ok(())
    }

    /// `rmdir`: requires the directory to be empty.
    pub fn delete_dir(&self, path: &str) -> Result<()> {
        let dir = self.lookup_dir(path)?;
        if dir.num_subdirs > 0 || dir.num_files > 0 {
            return Err(BarecatError::DirectoryNotEmpty {
                path: path.to_string(),
            });
        }
        self.conn
            .prepare_cached("DELETE FROM dirs WHERE path = ?1")?
            .execute([path])?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Listing
    // ------------------------------------------------------------------

    /// Child entry names (files and subdirectories interleaved), in
    /// path order.
    pub fn listdir(&self, dir: &str) -> Result<Vec<String>> {
        let names = self
            .conn
            .prepare_cached(
                "SELECT path FROM files WHERE parent = ?1
                 UNION ALL
                 SELECT path FROM dirs WHERE parent = ?1
                 ORDER BY path",
            )?
            .query_map([dir], |r| r.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(names
            .iter()
            .map(|p| paths::basename(p).to_string())
            .collect())
    }

    /// Subdirectory and file names of one directory, separately, both
    /// in path order. The shape `walk` wants.
    pub fn dir_children(&self, dir: &str) -> Result<(Vec<String>, Vec<String>)> {
        let subdirs = self
            .conn
            .prepare_cached("SELECT path FROM dirs WHERE parent = ?1 ORDER BY path")?
            .query_map([dir], |r| r.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        let files = self
            .conn
            .prepare_cached("SELECT path FROM files WHERE parent = ?1 ORDER BY path")?
            .query_map([dir], |r| r.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok((
            subdirs
                .iter()
                .map(|p| paths::basename(p).to_string())
                .collect(),
            files
                .iter()
                .map(|p| paths::basename(p).to_string())
                .collect(),
        ))
    }

    /// File paths strictly under `prefix` (the whole archive for the
    /// root), in path order.
    pub fn file_paths_under(&self, prefix: &str) -> Result<Vec<String>> {
        self.paths_under("files", prefix)
    }

    /// Directory paths strictly under `prefix`, in path order.
    pub fn dir_paths_under(&self, prefix: &str) -> Result<Vec<String>> {
        self.paths_under("dirs", prefix)
    }

    fn paths_under(&self, table: &str, prefix: &str) -> Result<Vec<String>> {
        if prefix.is_empty() {
            let mut stmt = self.conn.prepare_cached(&format!(
                "SELECT path FROM {table} WHERE path != '' ORDER BY path"
            ))?;
            let rows = stmt
                .query_map([], |r| r.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            return Ok(rows);
        }
        // '/' + 1 == '0' in byte order, so [p||'/', p||'0') spans
        // exactly the subtree of p.
        let mut stmt = self.conn.prepare_cached(&format!(
            "SELECT path FROM {table} WHERE path > ?1 || '/' AND path < ?1 || '0' ORDER BY path"
        ))?;
        let rows = stmt
            .query_map([prefix], |r| r.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // ------------------------------------------------------------------
    // Whole-archive iteration
    // ------------------------------------------------------------------

    /// Iterates every file entry in the given order. The iterator
    /// pages through the table with keyset queries; it observes a
    /// consistent view as long as the single writer does not mutate
    /// concurrently (the ownership model guarantees that).
    pub fn iter_files(&self, order: FileOrder) -> FileIter<'_> {
        FileIter {
            index: self,
            order,
            state: IterState::Start,
            buf: VecDeque::new(),
            done: false,
        }
    }

    /// Iterates every non-root directory entry in path order.
    pub fn iter_dirs(&self) -> DirIter<'_> {
        DirIter {
            index: self,
            last: None,
            buf: VecDeque::new(),
            done: false,
        }
    }

    pub fn num_files(&self) -> Result<u64> {
        let n: i64 = self
            .conn
            .prepare_cached("SELECT COUNT(*) FROM files")?
            .query_row([], |r| r.get(0))?;
        Ok(n as u64)
    }

    pub fn num_dirs(&self) -> Result<u64> {
        let n: i64 = self
            .conn
            .prepare_cached("SELECT COUNT(*) FROM dirs")?
            .query_row([], |r| r.get(0))?;
        Ok(n as u64)
    }

    // ------------------------------------------------------------------
    // Physical layout queries
    // ------------------------------------------------------------------

    /// Shard numbers referenced by at least one live file, ascending.
    pub fn referenced_shards(&self) -> Result<Vec<u32>> {
        let rows = self
            .conn
            .prepare_cached("SELECT DISTINCT shard FROM files ORDER BY shard")?
            .query_map([], |r| r.get::<_, i64>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows.into_iter().map(|s| s as u32).collect())
    }

    /// Highest referenced byte in a shard, if any file lives there.
    pub fn max_end_offset(&self, shard: u32) -> Result<Option<u64>> {
        let v: Option<i64> = self
            .conn
            .prepare_cached(r#"SELECT MAX("offset" + size) FROM files WHERE shard = ?1"#)?
            .query_row([shard as i64], |r| r.get(0))?;
        Ok(v.map(|v| v as u64))
    }

    /// Files in one shard in offset order.
    pub fn files_in_shard(&self, shard: u32) -> Result<Vec<FileEntry>> {
        let rows = self
            .conn
            .prepare_cached(&format!(
                r#"SELECT {FILE_COLUMNS} FROM files WHERE shard = ?1 ORDER BY "offset", size, path"#
            ))?
            .query_map([shard as i64], file_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Internal gaps of one shard: `(gap_start, gap_size)` pairs from
    /// the windowed lead-offset query, including a gap at the head of
    /// the shard when the first file does not start at zero. The
    /// trailing gap (bytes past the last file) is not included; the
    /// caller derives it from the shard length.
    pub fn shard_gaps(&self, shard: u32) -> Result<Vec<(u64, u64)>> {
        let mut gaps = Vec::new();
        // Zero-size files occupy no bytes and are ignored here; they
        // may share any address.
        let first: Option<i64> = self
            .conn
            .prepare_cached(r#"SELECT MIN("offset") FROM files WHERE shard = ?1 AND size > 0"#)?
            .query_row([shard as i64], |r| r.get(0))?;
        match first {
            None => return Ok(gaps),
            Some(first) if first > 0 => gaps.push((0, first as u64)),
            _ => {}
        }
        // The running maximum of end offsets keeps the computation
        // honest even for pathological (overlapping) layouts.
        let rows = self
            .conn
            .prepare_cached(
                r#"SELECT gap_start, next_off - gap_start AS gap_size FROM (
                       SELECT MAX("offset" + size) OVER
                                  (ORDER BY "offset", size
                                   ROWS BETWEEN UNBOUNDED PRECEDING AND CURRENT ROW)
                                  AS gap_start,
                              LEAD("offset") OVER (ORDER BY "offset", size) AS next_off
                       FROM files WHERE shard = ?1 AND size > 0
                   ) WHERE next_off > gap_start
                   ORDER BY gap_start"#,
            )?
            .query_map([shard as i64], |r| {
                Ok((r.get::<_, i64>(0)? as u64, r.get::<_, i64>(1)? as u64))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        gaps.extend(rows);
        Ok(gaps)
    }

    // ------------------------------------------------------------------
    // Stats rebuild (bulk mode exit)
    // ------------------------------------------------------------------

    /// Recomputes every directory counter from scratch: materializes
    /// missing ancestor directories, then rebuilds `num_subdirs` /
    /// `num_files` from adjacency and the tree aggregates bottom-up by
    /// directory depth. Runs with triggers disabled and restores the
    /// previous flag afterwards.
    pub fn rebuild_stats(&mut self) -> Result<()> {
        rebuild_stats_on(&mut self.conn)
    }

    /// `PRAGMA integrity_check` verbatim; `["ok"]` on a healthy file.
    pub fn integrity_check(&self) -> Result<Vec<String>> {
        let rows = self
            .conn
            .prepare("PRAGMA integrity_check")?
            .query_map([], |r| r.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

/// Shared with the migration path, which rebuilds over a raw
/// connection before an [`Index`] can be opened on the archive.
pub(crate) fn rebuild_stats_on(conn: &mut Connection) -> Result<()> {
    let triggers_were_on: i64 = conn
        .query_row(
            "SELECT value_int FROM config WHERE key = 'use_triggers'",
            [],
            |r| r.get(0),
        )
        .optional()?
        .unwrap_or(1);
    let txn = conn.transaction()?;
    // The flag change rides in the same transaction, so a failed
    // rebuild leaves the previous trigger setting intact.
    txn.execute(
        "UPDATE config SET value_int = 0 WHERE key = 'use_triggers'",
        [],
    )?;

    txn.execute("INSERT OR IGNORE INTO dirs (path) VALUES ('')", [])?;
    // Materialize ancestors one level per round until fixpoint.
    loop {
        let inserted = txn.execute(
            "INSERT OR IGNORE INTO dirs (path)
             SELECT parent FROM files WHERE parent IS NOT NULL
             UNION
             SELECT parent FROM dirs WHERE parent IS NOT NULL",
            [],
        )?;
        if inserted == 0 {
            break;
        }
    }

    txn.execute(
        "UPDATE dirs SET
             num_subdirs = (SELECT COUNT(*) FROM dirs c WHERE c.parent = dirs.path),
             num_files   = (SELECT COUNT(*) FROM files f WHERE f.parent = dirs.path)",
        [],
    )?;

    let max_depth: i64 = txn.query_row(
        "SELECT COALESCE(MAX(length(path) - length(replace(path, '/', '')) + (path != '')), 0)
         FROM dirs",
        [],
        |r| r.get(0),
    )?;
    for depth in (0..=max_depth).rev() {
        txn.execute(
            "UPDATE dirs SET
                 num_files_tree = num_files
                     + COALESCE((SELECT SUM(c.num_files_tree) FROM dirs c
                                 WHERE c.parent = dirs.path), 0),
                 size_tree = COALESCE((SELECT SUM(f.size) FROM files f
                                       WHERE f.parent = dirs.path), 0)
                     + COALESCE((SELECT SUM(c.size_tree) FROM dirs c
                                 WHERE c.parent = dirs.path), 0)
             WHERE length(path) - length(replace(path, '/', '')) + (path != '') = ?1",
            [depth],
        )?;
    }

    txn.execute(
        "UPDATE config SET value_int = ?1 WHERE key = 'use_triggers'",
        [triggers_were_on],
    )?;
    txn.commit()?;
    debug!("directory statistics rebuilt");
    Ok(())
}

fn check_version(conn: &Connection, readonly: bool) -> Result<()> {
    let has_config: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'config'",
        [],
        |r| r.get(0),
    )?;
    if has_config == 0 {
        // Pre-versioned layout; only migration may touch it.
        return Err(BarecatError::UnsupportedSchema { major: 0, minor: 0 });
    }
    let get = |key: &str| -> Result<Option<i64>> {
        Ok(conn
            .query_row(
                "SELECT value_int FROM config WHERE key = ?1",
                [key],
                |r| r.get(0),
            )
            .optional()?)
    };
    let major = get("schema_version_major")?.unwrap_or(0);
    let minor = get("schema_version_minor")?.unwrap_or(2);
    if major != SCHEMA_MAJOR {
        return Err(BarecatError::UnsupportedSchema { major, minor });
    }
    // Backward-compatible minors are readable; writing requires the
    // current trigger set, i.e. a migrated archive.
    if !readonly && minor < SCHEMA_MINOR {
        return Err(BarecatError::UnsupportedSchema { major, minor });
    }
    Ok(())
}

fn file_from_row(row: &Row<'_>) -> rusqlite::Result<FileEntry> {
    Ok(FileEntry {
        path: row.get(0)?,
        shard: row.get::<_, i64>(1)? as u32,
        offset: row.get::<_, i64>(2)? as u64,
        size: row.get::<_, i64>(3)? as u64,
        crc32c: row.get::<_, Option<i64>>(4)?.map(|c| c as u32),
        meta: EntryMeta {
            mode: row.get::<_, Option<i64>>(5)?.map(|m| m as u32),
            uid: row.get::<_, Option<i64>>(6)?.map(|u| u as u32),
            gid: row.get::<_, Option<i64>>(7)?.map(|g| g as u32),
            mtime_ns: row.get(8)?,
        },
    })
}

fn dir_from_row(row: &Row<'_>) -> rusqlite::Result<DirEntry> {
    Ok(DirEntry {
        path: row.get(0)?,
        num_subdirs: row.get::<_, i64>(1)? as u64,
        num_files: row.get::<_, i64>(2)? as u64,
        num_files_tree: row.get::<_, i64>(3)? as u64,
        size_tree: row.get::<_, i64>(4)? as u64,
        meta: EntryMeta {
            mode: row.get::<_, Option<i64>>(5)?.map(|m| m as u32),
            uid: row.get::<_, Option<i64>>(6)?.map(|u| u as u32),
            gid: row.get::<_, Option<i64>>(7)?.map(|g| g as u32),
            mtime_ns: row.get(8)?,
        },
    })
}

enum IterState {
    Start,
    AfterRowid(i64),
    AfterPath(String),
    AfterAddress { shard: i64, offset: i64, path: String },
    RandomQueue(VecDeque<String>),
}

/// Paged iterator over file entries; see [`Index::iter_files`].
pub struct FileIter<'a> {
    index: &'a Index,
    order: FileOrder,
    state: IterState,
    buf: VecDeque<FileEntry>,
    done: bool,
}

impl FileIter<'_> {
    fn refill(&mut self) -> Result<()> {
        let conn = &self.index.conn;
        match (&self.order, &mut self.state) {
            (FileOrder::Random, IterState::Start) => {
                let paths = conn
                    .prepare(r#"SELECT path FROM files ORDER BY random()"#)?
                    .query_map([], |r| r.get::<_, String>(0))?
                    .collect::<rusqlite::Result<VecDeque<_>>>()?;
                self.state = IterState::RandomQueue(paths);
                return self.refill();
            }
            (FileOrder::Random, IterState::RandomQueue(queue)) => {
                while self.buf.len() < ITER_BATCH {
                    let Some(path) = queue.pop_front() else {
                        self.done = true;
                        break;
                    };
                    if let Some(entry) = self.index.try_lookup_file(&path)? {
                        self.buf.push_back(entry);
                    }
                }
                return Ok(());
            }
            _ => {}
        }

        let batch: Vec<FileEntry> = match (&self.order, &self.state) {
            (FileOrder::Insertion, state) => {
                let after = match state {
                    IterState::AfterRowid(r) => *r,
                    _ => i64::MIN,
                };
                let sql = format!(
                    "SELECT {FILE_COLUMNS}, rowid FROM files WHERE rowid > ?1
                     ORDER BY rowid LIMIT {ITER_BATCH}"
                );
                let mut stmt = conn.prepare_cached(&sql)?;
                let rows = stmt
                    .query_map([after], |r| Ok((file_from_row(r)?, r.get::<_, i64>(9)?)))?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                if let Some((_, rowid)) = rows.last() {
                    self.state = IterState::AfterRowid(*rowid);
                }
                rows.into_iter().map(|(e, _)| e).collect()
            }
            (FileOrder::PathAsc | FileOrder::PathDesc, state) => {
                let asc = self.order == FileOrder::PathAsc;
                let (cmp, dir) = if asc { (">", "ASC") } else { ("<", "DESC") };
                let after = match state {
                    IterState::AfterPath(p) => Some(p.clone()),
                    _ => None,
                };
                let sql = match &after {
                    Some(_) => format!(
                        "SELECT {FILE_COLUMNS} FROM files WHERE path {cmp} ?1
                         ORDER BY path {dir} LIMIT {ITER_BATCH}"
                    ),
                    None => format!(
                        "SELECT {FILE_COLUMNS} FROM files ORDER BY path {dir} LIMIT {ITER_BATCH}"
                    ),
                };
                let mut stmt = conn.prepare_cached(&sql)?;
                let rows = match &after {
                    Some(p) => stmt.query_map([p.as_str()], file_from_row)?,
                    None => stmt.query_map([], file_from_row)?,
                }
                .collect::<rusqlite::Result<Vec<_>>>()?;
                if let Some(last) = rows.last() {
                    self.state = IterState::AfterPath(last.path.clone());
                }
                rows
            }
            (FileOrder::Address, state) => {
                let after = match state {
                    IterState::AfterAddress { shard, offset, path } => {
                        Some((*shard, *offset, path.clone()))
                    }
                    _ => None,
                };
                let sql = match &after {
                    Some(_) => format!(
                        r#"SELECT {FILE_COLUMNS} FROM files
                           WHERE (shard, "offset", path) > (?1, ?2, ?3)
                           ORDER BY shard, "offset", path LIMIT {ITER_BATCH}"#
                    ),
                    None => format!(
                        r#"SELECT {FILE_COLUMNS} FROM files
                           ORDER BY shard, "offset", path LIMIT {ITER_BATCH}"#
                    ),
                };
                let mut stmt = conn.prepare_cached(&sql)?;
                let rows = match &after {
                    Some((s, o, p)) => stmt.query_map(params![s, o, p], file_from_row)?,
                    None => stmt.query_map([], file_from_row)?,
                }
                .collect::<rusqlite::Result<Vec<_>>>()?;
                if let Some(last) = rows.last() {
                    self.state = IterState::AfterAddress {
                        shard: last.shard as i64,
                        offset: last.offset as i64,
                        path: last.path.clone(),
                    };
                }
                rows
            }
            (FileOrder::Random, _) => unreachable!("handled above"),
        };
        if batch.len() < ITER_BATCH {
            self.done = true;
        }
        self.buf.extend(batch);
        Ok(())
    }
}

impl Iterator for FileIter<'_> {
    type Item = Result<FileEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buf.is_empty() && !self.done {
            if let Err(e) = self.refill() {
                self.done = true;
                return Some(Err(e));
            }
        }
        self.buf.pop_front().map(Ok)
    }
}

/// Paged iterator over non-root directory entries, path ascending.
pub struct DirIter<'a> {
    index: &'a Index,
    last: Option<String>,
    buf: VecDeque<DirEntry>,
    done: bool,
}

impl DirIter<'_> {
    fn refill(&mut self) -> Result<()> {
        let conn = &self.index.conn;
        let sql = match &self.last {
            Some(_) => format!(
                "SELECT {DIR_COLUMNS} FROM dirs WHERE path > ?1 AND path != ''
                 ORDER BY path LIMIT {ITER_BATCH}"
            ),
            None => format!(
                "SELECT {DIR_COLUMNS} FROM dirs WHERE path != ''
                 ORDER BY path LIMIT {ITER_BATCH}"
            ),
        };
        let mut stmt = conn.prepare_cached(&sql)?;
        let rows = match &self.last {
            Some(p) => stmt.query_map([p.as_str()], dir_from_row)?,
            None => stmt.query_map([], dir_from_row)?,
        }
        .collect::<rusqlite::Result<Vec<_>>>()?;
        if let Some(last) = rows.last() {
            self.last = Some(last.path.clone());
        }
        if rows.len() < ITER_BATCH {
            self.done = true;
        }
        self.buf.extend(rows);
        Ok(())
    }
}

impl Iterator for DirIter<'_> {
    type Item = Result<DirEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buf.is_empty() && !self.done {
            if let Err(e) = self.refill() {
                self.done = true;
                return Some(Err(e));
            }
        }
        self.buf.pop_front().map(Ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh() -> (tempfile::TempDir, Index) {
        let dir = tempfile::tempdir().unwrap();
        let idx = Index::open(&dir.path().join("index.db"), false, true).unwrap();
        (dir, idx)
    }

    fn file(path: &str, size: u64) -> FileEntry {
        FileEntry {
            path: path.to_string(),
            shard: 0,
            offset: 0,
            size,
            crc32c: None,
            meta: EntryMeta::default(),
        }
    }

    #[test]
    fn insert_propagates_to_ancestors() {
        let (_dir, idx) = fresh();
        idx.insert_file(&file("x/y/z.bin", 1000)).unwrap();

        let root = idx.lookup_dir("").unwrap();
        assert_eq!(root.num_files_tree, 1);
        assert_eq!(root.size_tree, 1000);
        assert_eq!(root.num_subdirs, 1);

        let x = idx.lookup_dir("x").unwrap();
        assert_eq!(x.num_subdirs, 1);
        assert_eq!(x.num_files, 0);
        assert_eq!(x.num_files_tree, 1);

        let xy = idx.lookup_dir("x/y").unwrap();
        assert_eq!(xy.num_files, 1);
        assert_eq!(xy.size_tree, 1000);
    }

    #[test]
    fn delete_unwinds_counters() {
        let (_dir, idx) = fresh();
        idx.insert_file(&file("a/b.bin", 10)).unwrap();
        idx.insert_file(&file("a/c.bin", 20)).unwrap();
        idx.delete_file("a/b.bin").unwrap();

        let a = idx.lookup_dir("a").unwrap();
        assert_eq!(a.num_files, 1);
        assert_eq!(a.size_tree, 20);
        let root = idx.lookup_dir("").unwrap();
        assert_eq!(root.num_files_tree, 1);
        assert_eq!(root.size_tree, 20);
    }

    #[test]
    fn duplicate_insert_rejected() {
        let (_dir, idx) = fresh();
        idx.insert_file(&file("a.txt", 1)).unwrap();
        let err = idx.insert_file(&file("a.txt", 1)).unwrap_err();
        assert!(matches!(err, BarecatError::AlreadyExists { .. }));
    }

    #[test]
    fn rmdir_requires_empty() {
        let (_dir, idx) = fresh();
        idx.insert_file(&file("d/f.txt", 1)).unwrap();
        let err = idx.delete_dir("d").unwrap_err();
        assert!(matches!(err, BarecatError::DirectoryNotEmpty { .. }));
        idx.delete_file("d/f.txt").unwrap();
        idx.delete_dir("d").unwrap();
        assert!(!idx.dir_exists("d").unwrap());
    }

    #[test]
    fn bulk_rebuild_matches_triggers() {
        let (_dir, mut idx) = fresh();
        idx.set_use_triggers(false).unwrap();
        idx.insert_file(&file("p/q/a.bin", 5)).unwrap();
        idx.insert_file(&file("p/q/b.bin", 7)).unwrap();
        idx.insert_file(&file("p/c.bin", 11)).unwrap();
        // No dirs materialized, no counters yet.
        assert!(!idx.dir_exists("p/q").unwrap());

        idx.rebuild_stats().unwrap();
        assert!(idx.use_triggers().unwrap());

        let root = idx.lookup_dir("").unwrap();
        assert_eq!(root.num_files_tree, 3);
        assert_eq!(root.size_tree, 23);
        let p = idx.lookup_dir("p").unwrap();
        assert_eq!(p.num_files, 1);
        assert_eq!(p.num_subdirs, 1);
        assert_eq!(p.num_files_tree, 3);
        assert_eq!(p.size_tree, 23);
        let q = idx.lookup_dir("p/q").unwrap();
        assert_eq!(q.num_files, 2);
        assert_eq!(q.size_tree, 12);
    }

    #[test]
    fn address_iteration_pages_in_order() {
        let (_dir, idx) = fresh();
        for i in 0..10 {
            let mut f = file(&format!("f{i:02}"), 4);
            f.shard = (i % 3) as u32;
            f.offset = (i * 16) as u64;
            idx.insert_file(&f).unwrap();
        }
        let addrs: Vec<(u32, u64)> = idx
            .iter_files(FileOrder::Address)
            .map(|f| f.map(|f| (f.shard, f.offset)))
            .collect::<Result<_>>()
            .unwrap();
        let mut sorted = addrs.clone();
        sorted.sort_unstable();
        assert_eq!(addrs, sorted);
        assert_eq!(addrs.len(), 10);
    }

    #[test]
    fn listdir_interleaves_dirs_and_files() {
        let (_dir, idx) = fresh();
        idx.insert_file(&file("a.txt", 1)).unwrap();
        idx.insert_file(&file("b/c.txt", 1)).unwrap();
        idx.insert_file(&file("z.txt", 1)).unwrap();
        assert_eq!(idx.listdir("").unwrap(), vec!["a.txt", "b", "z.txt"]);
    }

    #[test]
    fn unknown_config_keys_survive() {
        let (_dir, mut idx) = fresh();
        idx.set_config_int("somebody_elses_key", 42).unwrap();
        idx.rebuild_stats().unwrap();
        assert_eq!(idx.config_int("somebody_elses_key").unwrap(), Some(42));
    }
}

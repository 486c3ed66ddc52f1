//! Migration of older on-disk layouts to schema 0.3.
//!
//! Two lineages exist in the wild:
//!
//! * **pre-versioned** (no `config` table): the index is rebuilt from
//!   scratch next to the old one, file checksums are computed from the
//!   shard bytes (parallel across files) and the new database is
//!   renamed over the old;
//! * **0.2**: same tables, but the stat triggers were buggy on
//!   directory move/delete (`num_files` is a direct-child counter and
//!   was wrongly propagated through ancestors). The triggers are
//!   dropped and recreated and every counter is rebuilt bottom-up.
//!
//! Migration is idempotent: running it on a 0.3 archive is a no-op.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use rayon::prelude::*;
use rusqlite::{Connection, OptionalExtension, params};
use tracing::{debug, info};

use crate::index::{rebuild_stats_on, schema};
use crate::shard::shard_path;
use crate::{BarecatError, Result};

/// Schema generation found on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaGeneration {
    /// No `config` table at all.
    PreVersioned,
    /// `config` exists but the version is below 0.3.
    V0_2,
    /// Current.
    V0_3,
}

/// Inspects the index database without upgrading anything.
pub fn detect(index_path: &Path) -> Result<SchemaGeneration> {
    let conn = Connection::open_with_flags(
        index_path,
        rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY,
    )?;
    detect_on(&conn)
}

fn detect_on(conn: &Connection) -> Result<SchemaGeneration> {
    let has_config: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'config'",
        [],
        |r| r.get(0),
    )?;
    if has_config == 0 {
        return Ok(SchemaGeneration::PreVersioned);
    }
    let get = |key: &str| -> Result<Option<i64>> {
        Ok(conn
            .query_row("SELECT value_int FROM config WHERE key = ?1", [key], |r| {
                r.get(0)
            })
            .optional()?)
    };
    let major = get("schema_version_major")?.unwrap_or(0);
    let minor = get("schema_version_minor")?.unwrap_or(2);
    if major != schema::SCHEMA_MAJOR || minor > schema::SCHEMA_MINOR {
        return Err(BarecatError::UnsupportedSchema { major, minor });
    }
    if minor < schema::SCHEMA_MINOR {
        Ok(SchemaGeneration::V0_2)
    } else {
        Ok(SchemaGeneration::V0_3)
    }
}

/// Upgrades the archive at base path `base` (index database at `base`
/// itself) to schema 0.3. No-op when already current.
pub fn migrate(base: &Path) -> Result<()> {
    let generation = detect(base)?;
    match generation {
        SchemaGeneration::V0_3 => {
            debug!(index = %base.display(), "schema already 0.3, nothing to migrate");
            Ok(())
        }
        SchemaGeneration::V0_2 => migrate_0_2(base),
        SchemaGeneration::PreVersioned => migrate_preversioned(base),
    }
}

fn migrate_0_2(base: &Path) -> Result<()> {
    info!(index = %base.display(), "migrating 0.2 index in place");
    let mut conn = Connection::open(base)?;
    conn.pragma_update(None, "recursive_triggers", "ON")?;

    // Drop every trigger on files/dirs, buggy 0.2 ones included.
    let trigger_names: Vec<String> = conn
        .prepare(
            "SELECT name FROM sqlite_master
             WHERE type = 'trigger' AND tbl_name IN ('files', 'dirs')",
        )?
        .query_map([], |r| r.get(0))?
        .collect::<rusqlite::Result<_>>()?;
    for name in &trigger_names {
        conn.execute_batch(&format!("DROP TRIGGER IF EXISTS \"{name}\""))?;
    }

    ensure_column(&conn, "files", "crc32c", "INTEGER")?;
    ensure_column(&conn, "files", "mtime_ns", "INTEGER")?;
    ensure_column(&conn, "dirs", "num_subdirs", "INTEGER NOT NULL DEFAULT 0")?;
    ensure_column(&conn, "dirs", "num_files", "INTEGER NOT NULL DEFAULT 0")?;
    ensure_column(&conn, "dirs", "num_files_tree", "INTEGER NOT NULL DEFAULT 0")?;
    ensure_column(&conn, "dirs", "size_tree", "INTEGER NOT NULL DEFAULT 0")?;
    ensure_column(&conn, "dirs", "mtime_ns", "INTEGER")?;

    conn.execute(
        "INSERT OR IGNORE INTO config (key, value_int) VALUES ('use_triggers', 1)",
        [],
    )?;
    conn.execute(
        "INSERT OR IGNORE INTO config (key, value_int) VALUES ('shard_size_limit', ?1)",
        [schema::DEFAULT_SHARD_SIZE_LIMIT],
    )?;
    conn.execute_batch(&schema::trigger_sql())?;
    rebuild_stats_on(&mut conn)?;

    conn.execute(
        "INSERT INTO config (key, value_int) VALUES ('schema_version_minor', ?1)
         ON CONFLICT (key) DO UPDATE SET value_int = excluded.value_int",
        [schema::SCHEMA_MINOR],
    )?;
    conn.execute(
        "INSERT OR IGNORE INTO config (key, value_int) VALUES ('schema_version_major', ?1)",
        [schema::SCHEMA_MAJOR],
    )?;
    info!("0.2 -> 0.3 migration complete");
    Ok(())
}

fn migrate_preversioned(base: &Path) -> Result<()> {
    info!(index = %base.display(), "rebuilding pre-versioned index");
    let tmp = tmp_index_path(base);
    if tmp.exists() {
        std::fs::remove_file(&tmp)?;
    }

    {
        let old = Connection::open_with_flags(
            base,
            rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY,
        )?;
        let mut new = Connection::open(&tmp)?;
        new.pragma_update(None, "recursive_triggers", "ON")?;
        schema::initialize(&new)?;
        new.execute(
            "UPDATE config SET value_int = 0 WHERE key = 'use_triggers'",
            [],
        )?;

        copy_preversioned_rows(&old, &mut new)?;
        backfill_checksums(base, &mut new)?;
        rebuild_stats_on(&mut new)?;
        new.execute(
            "UPDATE config SET value_int = 1 WHERE key = 'use_triggers'",
            [],
        )?;
    }

    // Replace the old database, journal files included.
    for suffix in ["-wal", "-shm"] {
        let side = sibling(base, suffix);
        if side.exists() {
            std::fs::remove_file(&side)?;
        }
    }
    std::fs::remove_file(base)?;
    std::fs::rename(&tmp, base)?;
    info!("pre-versioned -> 0.3 migration complete");
    Ok(())
}

fn copy_preversioned_rows(old: &Connection, new: &mut Connection) -> Result<()> {
    let file_cols = table_columns(old, "files")?;
    let dir_cols = table_columns(old, "dirs")?;

    let sel = |cols: &[String], name: &str, quoted: &str| -> String {
        if cols.iter().any(|c| c == name) {
            quoted.to_string()
        } else {
            "NULL".to_string()
        }
    };

    let txn = new.transaction()?;
    {
        let sql = format!(
            r#"SELECT path, shard, "offset", size, {}, {}, {}, {} FROM files"#,
            sel(&file_cols, "mode", "mode"),
            sel(&file_cols, "uid", "uid"),
            sel(&file_cols, "gid", "gid"),
            sel(&file_cols, "mtime_ns", "mtime_ns"),
        );
        let mut read = old.prepare(&sql)?;
        let mut insert = txn.prepare(
            r#"INSERT INTO files (path, shard, "offset", size, mode, uid, gid, mtime_ns)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"#,
        )?;
        let mut rows = read.query([])?;
        while let Some(row) = rows.next()? {
            insert.execute(params![
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, Option<i64>>(4)?,
                row.get::<_, Option<i64>>(5)?,
                row.get::<_, Option<i64>>(6)?,
                row.get::<_, Option<i64>>(7)?,
            ])?;
        }
    }
    if !dir_cols.is_empty() {
        let sql = format!(
            "SELECT path, {}, {}, {}, {} FROM dirs",
            sel(&dir_cols, "mode", "mode"),
            sel(&dir_cols, "uid", "uid"),
            sel(&dir_cols, "gid", "gid"),
            sel(&dir_cols, "mtime_ns", "mtime_ns"),
        );
        let mut read = old.prepare(&sql)?;
        let mut insert = txn.prepare(
            "INSERT OR IGNORE INTO dirs (path, mode, uid, gid, mtime_ns)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )?;
        let mut rows = read.query([])?;
        while let Some(row) = rows.next()? {
            insert.execute(params![
                row.get::<_, String>(0)?,
                row.get::<_, Option<i64>>(1)?,
                row.get::<_, Option<i64>>(2)?,
                row.get::<_, Option<i64>>(3)?,
                row.get::<_, Option<i64>>(4)?,
            ])?;
        }
    }
    txn.commit()?;
    Ok(())
}

/// Computes CRC32C for every copied file from the shard bytes. Work is
/// chunked and spread across the rayon pool; each chunk opens its own
/// shard descriptors so threads never share a file position.
fn backfill_checksums(base: &Path, new: &mut Connection) -> Result<()> {
    struct Item {
        path: String,
        shard: u32,
        offset: u64,
        size: u64,
    }

    let items: Vec<Item> = {
        let mut stmt =
            new.prepare(r#"SELECT path, shard, "offset", size FROM files ORDER BY shard, "offset""#)?;
        let rows = stmt.query_map([], |r| {
            Ok(Item {
                path: r.get(0)?,
                shard: r.get::<_, i64>(1)? as u32,
                offset: r.get::<_, i64>(2)? as u64,
                size: r.get::<_, i64>(3)? as u64,
            })
        })?;
        rows.collect::<rusqlite::Result<_>>()?
    };
    if items.is_empty() {
        return Ok(());
    }

    let chunk_size = items.len().div_ceil(rayon::current_num_threads()).max(1);
    let checksums: Vec<Result<Vec<(String, u32)>>> = items
        .par_chunks(chunk_size)
        .map(|chunk| {
            let mut open: Option<(u32, File)> = None;
            let mut out = Vec::with_capacity(chunk.len());
            let mut buf = vec![0u8; crate::shard::COPY_CHUNK];
            for item in chunk {
                if !matches!(&open, Some((shard, _)) if *shard == item.shard) {
                    let f = File::open(shard_path(base, item.shard)).map_err(|_| {
                        BarecatError::ShardMissing {
                            shard: item.shard,
                            shard_path: shard_path(base, item.shard),
                        }
                    })?;
                    open = Some((item.shard, f));
                }
                let (_, file) = open.as_mut().expect("opened above");
                file.seek(SeekFrom::Start(item.offset))?;
                let mut crc = crate::crc::Crc32c::new();
                let mut remaining = item.size;
                while remaining > 0 {
                    let n = buf.len().min(remaining as usize);
                    file.read_exact(&mut buf[..n])?;
                    crc.update(&buf[..n]);
                    remaining -= n as u64;
                }
                out.push((item.path.clone(), crc.finalize()));
            }
            Ok(out)
        })
        .collect();

    let txn = new.transaction()?;
    {
        let mut update = txn.prepare("UPDATE files SET crc32c = ?2 WHERE path = ?1")?;
        for chunk in checksums {
            for (path, crc) in chunk? {
                update.execute(params![path, crc as i64])?;
            }
        }
    }
    txn.commit()?;
    Ok(())
}

fn ensure_column(conn: &Connection, table: &str, column: &str, decl: &str) -> Result<()> {
    if !table_columns(conn, table)?.iter().any(|c| c == column) {
        conn.execute_batch(&format!("ALTER TABLE {table} ADD COLUMN {column} {decl}"))?;
    }
    Ok(())
}

fn table_columns(conn: &Connection, table: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let cols = stmt
        .query_map([], |r| r.get::<_, String>(1))?
        .collect::<rusqlite::Result<_>>()?;
    Ok(cols)
}

fn tmp_index_path(base: &Path) -> std::path::PathBuf {
    sibling(base, ".migrate-tmp")
}

fn sibling(base: &Path, suffix: &str) -> std::path::PathBuf {
    let mut name = base
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(suffix);
    base.with_file_name(name)
}

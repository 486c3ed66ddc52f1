//! SQL schema for the index database.
//!
//! Three tables: `files`, `dirs`, `config`. The `parent` columns are
//! generated virtual columns derived from `path` (dirname of the
//! path; NULL for the root directory, `''` for top-level entries).
//! Directory statistics are maintained by the cascading triggers
//! below, each guarded by the `use_triggers` config flag so the bulk
//! loader can switch live propagation off.

use rusqlite::Connection;

use crate::Result;

/// Current on-disk schema version.
pub const SCHEMA_MAJOR: i64 = 0;
pub const SCHEMA_MINOR: i64 = 3;

/// Effectively unbounded shard size.
pub const DEFAULT_SHARD_SIZE_LIMIT: i64 = i64::MAX;

pub(crate) const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS config (
    key TEXT PRIMARY KEY NOT NULL,
    value_text TEXT,
    value_int INTEGER
);

CREATE TABLE IF NOT EXISTS files (
    path TEXT PRIMARY KEY NOT NULL CHECK (path != ''),
    parent TEXT GENERATED ALWAYS AS (
        CASE WHEN instr(path, '/') = 0 THEN ''
             ELSE rtrim(rtrim(path, replace(path, '/', '')), '/')
        END
    ) VIRTUAL,
    shard INTEGER NOT NULL DEFAULT 0,
    "offset" INTEGER NOT NULL DEFAULT 0,
    size INTEGER NOT NULL DEFAULT 0,
    crc32c INTEGER,
    mode INTEGER,
    uid INTEGER,
    gid INTEGER,
    mtime_ns INTEGER
);

CREATE TABLE IF NOT EXISTS dirs (
    path TEXT PRIMARY KEY NOT NULL,
    parent TEXT GENERATED ALWAYS AS (
        CASE WHEN path = '' THEN NULL
             WHEN instr(path, '/') = 0 THEN ''
             ELSE rtrim(rtrim(path, replace(path, '/', '')), '/')
        END
    ) VIRTUAL,
    num_subdirs INTEGER NOT NULL DEFAULT 0,
    num_files INTEGER NOT NULL DEFAULT 0,
    num_files_tree INTEGER NOT NULL DEFAULT 0,
    size_tree INTEGER NOT NULL DEFAULT 0,
    mode INTEGER,
    uid INTEGER,
    gid INTEGER,
    mtime_ns INTEGER
);

CREATE INDEX IF NOT EXISTS idx_files_parent ON files (parent);
CREATE INDEX IF NOT EXISTS idx_files_address ON files (shard, "offset");
CREATE INDEX IF NOT EXISTS idx_dirs_parent ON dirs (parent);
"#;

/// Recursive dirname expression used by the ancestor walks inside the
/// triggers; mirrors the generated `parent` columns.
macro_rules! ancestor_cte {
    ($start:expr) => {
        concat!(
            "WITH RECURSIVE anc (p) AS ( \
                 SELECT ",
            $start,
            " UNION ALL \
                 SELECT CASE WHEN instr(p, '/') = 0 THEN '' \
                             ELSE rtrim(rtrim(p, replace(p, '/', '')), '/') \
                        END \
                 FROM anc WHERE p != '' \
             ) SELECT p FROM anc"
        )
    };
}

const TRIGGER_GUARD: &str = "(SELECT value_int FROM config WHERE key = 'use_triggers') = 1";

/// Stat-propagation triggers:
///
/// * file insert: materialize the ancestor chain, bump `num_files` on
///   the direct parent, bump `num_files_tree`/`size_tree` on every
///   strict ancestor up to the root;
/// * file delete: symmetric decrement;
/// * dir insert/delete: touch only the direct parent's `num_subdirs`
///   (a deletable directory is empty, so there is no tree transfer).
///
/// Moves and overwrites are expressed as delete + insert inside one
/// transaction, so no UPDATE triggers exist. Metadata-only UPDATEs
/// (mode, mtime) deliberately bypass all of this.
pub(crate) fn trigger_sql() -> String {
    format!(
        r#"
CREATE TRIGGER IF NOT EXISTS trg_dirs_insert
AFTER INSERT ON dirs
WHEN NEW.path != '' AND {guard}
BEGIN
    -- Conflict clauses inside a trigger body inherit the outer
    -- statement's policy, so the ancestor materialization is guarded
    -- with NOT EXISTS rather than OR IGNORE.
    INSERT INTO dirs (path)
    SELECT NEW.parent
    WHERE NOT EXISTS (SELECT 1 FROM dirs WHERE path = NEW.parent);
    UPDATE dirs SET num_subdirs = num_subdirs + 1 WHERE path = NEW.parent;
END;

CREATE TRIGGER IF NOT EXISTS trg_dirs_delete
AFTER DELETE ON dirs
WHEN OLD.path != '' AND {guard}
BEGIN
    UPDATE dirs SET num_subdirs = num_subdirs - 1 WHERE path = OLD.parent;
END;

CREATE TRIGGER IF NOT EXISTS trg_files_insert
AFTER INSERT ON files
WHEN {guard}
BEGIN
    INSERT INTO dirs (path)
    SELECT NEW.parent
    WHERE NOT EXISTS (SELECT 1 FROM dirs WHERE path = NEW.parent);
    UPDATE dirs SET num_files = num_files + 1 WHERE path = NEW.parent;
    UPDATE dirs
       SET num_files_tree = num_files_tree + 1,
           size_tree = size_tree + NEW.size
     WHERE path IN ({anc_new});
END;

CREATE TRIGGER IF NOT EXISTS trg_files_delete
AFTER DELETE ON files
WHEN {guard}
BEGIN
    UPDATE dirs SET num_files = num_files - 1 WHERE path = OLD.parent;
    UPDATE dirs
       SET num_files_tree = num_files_tree - 1,
           size_tree = size_tree - OLD.size
     WHERE path IN ({anc_old});
END;
"#,
        guard = TRIGGER_GUARD,
        anc_new = ancestor_cte!("NEW.parent"),
        anc_old = ancestor_cte!("OLD.parent"),
    )
}

pub(crate) const DROP_TRIGGERS: &str = r#"
DROP TRIGGER IF EXISTS trg_dirs_insert;
DROP TRIGGER IF EXISTS trg_dirs_delete;
DROP TRIGGER IF EXISTS trg_files_insert;
DROP TRIGGER IF EXISTS trg_files_delete;
"#;

/// Creates tables, indexes and triggers, seeds the config defaults
/// and the root directory row. Idempotent.
pub(crate) fn initialize(conn: &Connection) -> Result<()> {
    conn.execute_batch(CREATE_TABLES)?;
    conn.execute_batch(&trigger_sql())?;
    conn.execute(
        "INSERT OR IGNORE INTO config (key, value_int) VALUES ('use_triggers', 1)",
        [],
    )?;
    conn.execute(
        "INSERT OR IGNORE INTO config (key, value_int) VALUES ('shard_size_limit', ?1)",
        [DEFAULT_SHARD_SIZE_LIMIT],
    )?;
    conn.execute(
        "INSERT OR IGNORE INTO config (key, value_int) VALUES ('schema_version_major', ?1)",
        [SCHEMA_MAJOR],
    )?;
    conn.execute(
        "INSERT OR IGNORE INTO config (key, value_int) VALUES ('schema_version_minor', ?1)",
        [SCHEMA_MINOR],
    )?;
    conn.execute("INSERT OR IGNORE INTO dirs (path) VALUES ('')", [])?;
    Ok(())
}

//! Integrity verification.
//!
//! Full mode reads every file's bytes and recomputes its checksum, on
//! top of the index-side checks. Quick mode never touches file bytes:
//! it validates the database, the counter invariants and that every
//! referenced shard exists and covers its highest referenced byte.

use std::fmt;

use tracing::info;

use crate::crc::Crc32c;
use crate::index::FileOrder;
use crate::shard::COPY_CHUNK;
use crate::{Barecat, CancelToken, Result};

/// One problem found by verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyIssue {
    /// Stored and recomputed CRC32C disagree.
    CrcMismatch {
        path: String,
        shard: u32,
        offset: u64,
        expected: u32,
        actual: u32,
    },
    /// A referenced shard file is missing on disk.
    ShardMissing { shard: u32 },
    /// A shard file is shorter than its highest referenced byte.
    ShardTooShort {
        shard: u32,
        needed: u64,
        actual: u64,
    },
    /// Bytes past the highest referenced offset (e.g. an append that
    /// never got its index row committed). Harmless; defrag reclaims.
    OrphanTail { shard: u32, bytes: u64 },
    /// Two live files overlap in a shard.
    Overlap {
        shard: u32,
        first: String,
        second: String,
    },
    /// A parent link points at a directory entry that does not exist.
    MissingParent { path: String, parent: String },
    /// A directory counter disagrees with a recount.
    CounterMismatch { path: String, detail: String },
    /// The storage engine's own integrity check failed.
    DatabaseCorrupt { detail: String },
    /// A file's bytes could not be read at all.
    Unreadable { path: String, detail: String },
}

impl fmt::Display for VerifyIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VerifyIssue::CrcMismatch {
                path,
                shard,
                offset,
                expected,
                actual,
            } => write!(
                f,
                "crc mismatch {path:?} (shard {shard} offset {offset}): \
                 expected {expected:#010x}, found {actual:#010x}"
            ),
            VerifyIssue::ShardMissing { shard } => write!(f, "shard {shard} missing"),
            VerifyIssue::ShardTooShort {
                shard,
                needed,
                actual,
            } => write!(f, "shard {shard} too short: {actual} < {needed}"),
            VerifyIssue::OrphanTail { shard, bytes } => {
                write!(f, "shard {shard} has {bytes} orphan tail bytes")
            }
            VerifyIssue::Overlap {
                shard,
                first,
                second,
            } => write!(f, "files {first:?} and {second:?} overlap in shard {shard}"),
            VerifyIssue::MissingParent { path, parent } => {
                write!(f, "{path:?} has no parent directory entry {parent:?}")
            }
            VerifyIssue::CounterMismatch { path, detail } => {
                write!(f, "directory {path:?} counters wrong: {detail}")
            }
            VerifyIssue::DatabaseCorrupt { detail } => {
                write!(f, "index database corrupt: {detail}")
            }
            VerifyIssue::Unreadable { path, detail } => {
                write!(f, "cannot read {path:?}: {detail}")
            }
        }
    }
}

/// Outcome of a verification pass. `ok()` means nothing was found.
#[derive(Debug, Default)]
pub struct VerifyReport {
    pub issues: Vec<VerifyIssue>,
    pub files_checked: u64,
    pub bytes_checked: u64,
}

impl VerifyReport {
    pub fn ok(&self) -> bool {
        self.issues.is_empty()
    }
}

impl Barecat {
    /// Quick check: database integrity, counter invariants, shard
    /// presence and length coverage. No file bytes are read.
    pub fn verify_quick(&self) -> Result<VerifyReport> {
        let mut report = VerifyReport::default();
        self.check_database(&mut report)?;
        self.check_counters(&mut report)?;
        self.check_parents(&mut report)?;
        self.check_overlaps(&mut report)?;
        self.check_shard_lengths(&mut report)?;
        info!(issues = report.issues.len(), "quick verify done");
        Ok(report)
    }

    /// Full check: everything quick mode does, plus a checksum
    /// recompute over every file's bytes, in address order.
    pub fn verify_full(&self, cancel: &CancelToken) -> Result<VerifyReport> {
        let mut report = self.verify_quick()?;

        let mut buf = vec![0u8; COPY_CHUNK];
        for entry in self.iter_files(FileOrder::Address) {
            cancel.check()?;
            let entry = entry?;

            let mut crc = Crc32c::new();
            let mut pos = entry.offset;
            let mut remaining = entry.size;
            let mut failed = false;
            while remaining > 0 {
                let n = buf.len().min(remaining as usize);
                match self.shards().read_into(entry.shard, pos, &mut buf[..n]) {
                    Ok(()) => {
                        crc.update(&buf[..n]);
                        pos += n as u64;
                        remaining -= n as u64;
                    }
                    Err(e) => {
                        report.issues.push(VerifyIssue::Unreadable {
                            path: entry.path.clone(),
                            detail: e.to_string(),
                        });
                        failed = true;
                        break;
                    }
                }
            }
            if failed {
                continue;
            }
            report.files_checked += 1;
            report.bytes_checked += entry.size;
            if let Some(expected) = entry.crc32c {
                let actual = crc.finalize();
                if actual != expected {
                    report.issues.push(VerifyIssue::CrcMismatch {
                        path: entry.path.clone(),
                        shard: entry.shard,
                        offset: entry.offset,
                        expected,
                        actual,
                    });
                }
            }
        }
        info!(
            issues = report.issues.len(),
            files = report.files_checked,
            "full verify done"
        );
        Ok(report)
    }

    fn check_database(&self, report: &mut VerifyReport) -> Result<()> {
        for line in self.index().integrity_check()? {
            if line != "ok" {
                report
                    .issues
                    .push(VerifyIssue::DatabaseCorrupt { detail: line });
            }
        }
        Ok(())
    }

    /// Recounts `num_files`/`num_subdirs` per directory and the tree
    /// aggregates from child rows, comparing against the stored
    /// counters.
    fn check_counters(&self, report: &mut VerifyReport) -> Result<()> {
        let conn = self.index().conn();
        let mut stmt = conn.prepare(
            "SELECT d.path,
                    d.num_files,
                    (SELECT COUNT(*) FROM files f WHERE f.parent = d.path),
                    d.num_subdirs,
                    (SELECT COUNT(*) FROM dirs c WHERE c.parent = d.path),
                    d.num_files_tree,
                    d.num_files + COALESCE((SELECT SUM(c.num_files_tree) FROM dirs c
                                            WHERE c.parent = d.path), 0),
                    d.size_tree,
                    COALESCE((SELECT SUM(f.size) FROM files f WHERE f.parent = d.path), 0)
                        + COALESCE((SELECT SUM(c.size_tree) FROM dirs c
                                    WHERE c.parent = d.path), 0)
             FROM dirs d",
        )?;
        let rows = stmt.query_map([], |r| {
            Ok((
                r.get::<_, String>(0)?,
                [
                    ("num_files", r.get::<_, i64>(1)?, r.get::<_, i64>(2)?),
                    ("num_subdirs", r.get::<_, i64>(3)?, r.get::<_, i64>(4)?),
                    ("num_files_tree", r.get::<_, i64>(5)?, r.get::<_, i64>(6)?),
                    ("size_tree", r.get::<_, i64>(7)?, r.get::<_, i64>(8)?),
                ],
            ))
        })?;
        for row in rows {
            let (path, checks) = row?;
            for (name, stored, actual) in checks {
                if stored != actual {
                    report.issues.push(VerifyIssue::CounterMismatch {
                        path: path.clone(),
                        detail: format!("{name} stored {stored}, recounted {actual}"),
                    });
                }
            }
        }
        Ok(())
    }

    fn check_parents(&self, report: &mut VerifyReport) -> Result<()> {
        let conn = self.index().conn();
        let mut stmt = conn.prepare(
            "SELECT path, parent FROM files f
             WHERE NOT EXISTS (SELECT 1 FROM dirs d WHERE d.path = f.parent)
             UNION ALL
             SELECT path, parent FROM dirs x
             WHERE x.parent IS NOT NULL
               AND NOT EXISTS (SELECT 1 FROM dirs d WHERE d.path = x.parent)",
        )?;
        let rows = stmt.query_map([], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
        })?;
        for row in rows {
            let (path, parent) = row?;
            report.issues.push(VerifyIssue::MissingParent { path, parent });
        }
        Ok(())
    }

    /// Adjacent-pair overlap scan per shard. Zero-size files are
    /// excluded up front: they may legitimately share an address.
    fn check_overlaps(&self, report: &mut VerifyReport) -> Result<()> {
        let conn = self.index().conn();
        let mut stmt = conn.prepare(
            r#"SELECT shard, path, next_path FROM (
                   SELECT shard, path,
                          "offset" + size AS end_off,
                          LEAD("offset") OVER w AS next_off,
                          LEAD(path) OVER w AS next_path
                   FROM files WHERE size > 0
                   WINDOW w AS (PARTITION BY shard ORDER BY "offset", path)
               ) WHERE next_off IS NOT NULL AND next_off < end_off"#,
        )?;
        let rows = stmt.query_map([], |r| {
            Ok((
                r.get::<_, i64>(0)? as u32,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
            ))
        })?;
        for row in rows {
            let (shard, first, second) = row?;
            report.issues.push(VerifyIssue::Overlap {
                shard,
                first,
                second,
            });
        }
        Ok(())
    }

    fn check_shard_lengths(&self, report: &mut VerifyReport) -> Result<()> {
        for shard in self.index().referenced_shards()? {
            let needed = self.index().max_end_offset(shard)?.unwrap_or(0);
            match self.shards().shard_len(shard) {
                Ok(actual) if actual < needed => {
                    report.issues.push(VerifyIssue::ShardTooShort {
                        shard,
                        needed,
                        actual,
                    });
                }
                Ok(actual) if actual > needed => {
                    report.issues.push(VerifyIssue::OrphanTail {
                        shard,
                        bytes: actual - needed,
                    });
                }
                Ok(_) => {}
                Err(crate::BarecatError::ShardMissing { shard, .. }) => {
                    report.issues.push(VerifyIssue::ShardMissing { shard });
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

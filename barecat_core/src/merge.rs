//! Merging archives: byte-copying merge and symlink merge.
//!
//! Copy mode re-appends every source file through the output facade
//! (bulk mode, stats rebuilt once at the end). Symlink mode copies no
//! bytes at all: output shards are symlinks to the source shards,
//! renumbered so numbers never collide, and a fresh index cites the
//! renumbered shards at unchanged offsets.

use std::path::Path;

use tracing::{debug, info};

use crate::entry::FileEntry;
use crate::index::FileOrder;
use crate::{Barecat, BarecatError, CancelToken, Result};

/// What to do when two sources (or a source and the output) carry the
/// same path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DuplicatePolicy {
    /// Abort the merge with AlreadyExists.
    #[default]
    Fail,
    /// Keep the first-seen entry, bytes and metadata both; later
    /// duplicates are skipped.
    IgnoreKeepFirst,
}

#[derive(Debug, Clone, Default)]
pub struct MergeOptions {
    pub policy: DuplicatePolicy,
    /// Append into an existing output archive instead of creating a
    /// fresh one. Rejected in symlink mode.
    pub append: bool,
    /// Rotation limit recorded on the output.
    pub shard_size_limit: Option<u64>,
    /// Only merge entries under this path prefix (one per source, or
    /// empty for everything) — the engine side of `subset`.
    pub source_prefix: Option<String>,
}

/// Byte-copying merge of `sources` into the archive at `output`.
pub fn merge_copy<P: AsRef<Path>>(
    sources: &[P],
    output: &Path,
    opts: &MergeOptions,
    cancel: &CancelToken,
) -> Result<()> {
    let mut out = open_output(output, opts)?;
    info!(sources = sources.len(), output = %output.display(), "copy merge");

    out.begin_bulk()?;
    let merge_result = (|| -> Result<()> {
        for src_path in sources {
            let src = Barecat::open(src_path.as_ref())?;
            copy_dirs(&src, &mut out, opts)?;
            for entry in collect_in_address_order(&src, opts)? {
                cancel.check()?;
                if out.contains(&entry.path)? {
                    match opts.policy {
                        DuplicatePolicy::Fail => {
                            return Err(BarecatError::already_exists(&entry.path));
                        }
                        DuplicatePolicy::IgnoreKeepFirst => {
                            debug!(path = %entry.path, "duplicate skipped");
                            continue;
                        }
                    }
                }
                let mut reader = src.open_file(&entry.path)?;
                out.ingest(&entry.path, entry.meta, &mut reader)?;
            }
        }
        Ok(())
    })();
    let end = out.end_bulk();
    merge_result?;
    end?;
    info!("copy merge complete");
    Ok(())
}

/// Symlink merge: barecat sources only, no byte copies, no appending
/// into an existing output.
pub fn merge_symlink<P: AsRef<Path>>(
    sources: &[P],
    output: &Path,
    opts: &MergeOptions,
    cancel: &CancelToken,
) -> Result<()> {
    if opts.append {
        return Err(BarecatError::InvalidPath {
            path: output.display().to_string(),
            reason: "symlink merge cannot append into an existing archive",
        });
    }
    let mut out = open_output(output, opts)?;
    info!(sources = sources.len(), output = %output.display(), "symlink merge");

    out.begin_bulk()?;
    let merge_result = (|| -> Result<()> {
        let mut next_shard: u32 = 0;
        for src_path in sources {
            let src_path = src_path.as_ref();
            let src = Barecat::open(src_path)?;
            copy_dirs(&src, &mut out, opts)?;

            // Renumber this source's shards into the output namespace.
            let src_shards = crate::shard::existing_shards(src_path)?;
            let mut mapping = std::collections::HashMap::new();
            for shard in src_shards {
                let target = crate::shard::shard_path(output, next_shard);
                let source_file = absolute(&crate::shard::shard_path(src_path, shard))?;
                link_shard(&source_file, &target)?;
                mapping.insert(shard, next_shard);
                next_shard += 1;
            }

            for entry in collect_in_address_order(&src, opts)? {
                cancel.check()?;
                if out.contains(&entry.path)? {
                    match opts.policy {
                        DuplicatePolicy::Fail => {
                            return Err(BarecatError::already_exists(&entry.path));
                        }
                        DuplicatePolicy::IgnoreKeepFirst => continue,
                    }
                }
                let shard = *mapping.get(&entry.shard).ok_or_else(|| {
                    BarecatError::ShardMissing {
                        shard: entry.shard,
                        shard_path: crate::shard::shard_path(src_path, entry.shard),
                    }
                })?;
                out.index().insert_file(&FileEntry { shard, ..entry })?;
            }
        }
        Ok(())
    })();
    let end = out.end_bulk();
    merge_result?;
    end?;

    out.shards_mut().refresh_cursor()?;
    info!("symlink merge complete");
    Ok(())
}

fn open_output(output: &Path, opts: &MergeOptions) -> Result<Barecat> {
    let mut builder = Barecat::options().writable();
    if !opts.append && output.exists() {
        return Err(BarecatError::already_exists(output.display().to_string()));
    }
    if let Some(limit) = opts.shard_size_limit {
        builder = builder.shard_size_limit(limit);
    }
    builder.open(output)
}

/// Source files in `(shard, offset)` order, filtered by the optional
/// subtree prefix.
fn collect_in_address_order(src: &Barecat, opts: &MergeOptions) -> Result<Vec<FileEntry>> {
    let mut out = Vec::new();
    for entry in src.iter_files(FileOrder::Address) {
        let entry = entry?;
        if let Some(prefix) = &opts.source_prefix
            && !prefix.is_empty()
            && entry.path != *prefix
            && !entry.path.starts_with(&format!("{prefix}/"))
        {
            continue;
        }
        out.push(entry);
    }
    Ok(out)
}

/// Copies directory entries (with their metadata) that do not exist in
/// the output yet; keep-first applies to directory metadata too.
fn copy_dirs(src: &Barecat, out: &mut Barecat, opts: &MergeOptions) -> Result<()> {
    for dir in src.index().iter_dirs() {
        let dir = dir?;
        if let Some(prefix) = &opts.source_prefix
            && !prefix.is_empty()
            && dir.path != *prefix
            && !dir.path.starts_with(&format!("{prefix}/"))
        {
            continue;
        }
        if !out.index().dir_exists(&dir.path)? {
            out.index().insert_dir(&dir.path, &dir.meta)?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn link_shard(source: &Path, target: &Path) -> Result<()> {
    std::os::unix::fs::symlink(source, target)?;
    Ok(())
}

#[cfg(not(unix))]
fn link_shard(_source: &Path, _target: &Path) -> Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "symlink merge requires a unix platform",
    )
    .into())
}

fn absolute(path: &Path) -> Result<std::path::PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

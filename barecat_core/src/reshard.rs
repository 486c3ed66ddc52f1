//! Resharding: reflowing archive bytes across new shard boundaries.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::index::FileOrder;
use crate::shard::{COPY_CHUNK, shard_path};
use crate::{Barecat, BarecatError, CancelToken, Result};

fn new_shard_path(base: &Path, shard: u32) -> PathBuf {
    let mut name = base
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(format!("-shard-new-{shard:05}"));
    base.with_file_name(name)
}

struct Repack {
    path: String,
    shard: u32,
    offset: u64,
}

impl Barecat {
    /// Repacks every file under a new shard size limit.
    ///
    /// Bytes are copied in address order into sibling `-shard-new-*`
    /// files, which are then renamed over the originals; the index
    /// rows are rewritten afterwards in one transaction and the new
    /// limit is persisted. Oversized files still get a shard of their
    /// own, as on the append path.
    pub fn reshard(&mut self, new_limit: u64, cancel: &CancelToken) -> Result<()> {
        if self.mode() != crate::shard::OpenMode::ReadWrite {
            return Err(BarecatError::ReadOnly);
        }
        let base = self.base_path().to_path_buf();
        info!(archive = %base.display(), new_limit, "resharding");

        let mut plan: Vec<Repack> = Vec::new();
        let mut out: Option<(u32, File)> = None;
        let mut out_shard: u32 = 0;
        let mut out_len: u64 = 0;
        let mut buf = vec![0u8; COPY_CHUNK];

        let entries = self
            .iter_files(FileOrder::Address)
            .collect::<Result<Vec<_>>>()?;
        for entry in entries {
            cancel.check()?;
            if out_len > 0 && out_len + entry.size > new_limit {
                out_shard += 1;
                out_len = 0;
                out = None;
            }
            if !matches!(&out, Some((n, _)) if *n == out_shard) {
                let f = OpenOptions::new()
                    .create(true)
                    .truncate(true)
                    .write(true)
                    .open(new_shard_path(&base, out_shard))?;
                out = Some((out_shard, f));
            }
            let (_, dst) = out.as_mut().expect("opened above");

            let mut remaining = entry.size;
            let mut src_pos = entry.offset;
            while remaining > 0 {
                let n = buf.len().min(remaining as usize);
                self.shards().read_into(entry.shard, src_pos, &mut buf[..n])?;
                dst.write_all(&buf[..n])?;
                src_pos += n as u64;
                remaining -= n as u64;
            }

            plan.push(Repack {
                path: entry.path,
                shard: out_shard,
                offset: out_len,
            });
            out_len += entry.size;
        }
        if let Some((_, f)) = &mut out {
            f.flush()?;
        }
        drop(out);

        let new_count = if plan.is_empty() { 0 } else { out_shard + 1 };
        debug!(files = plan.len(), new_shards = new_count, "repack written");

        // Swap the new files in, then drop old shards beyond the new
        // count.
        for shard in 0..new_count {
            std::fs::rename(new_shard_path(&base, shard), shard_path(&base, shard))?;
        }
        for shard in crate::shard::existing_shards(&base)? {
            if shard >= new_count {
                self.shards_mut().remove_shard_file(shard)?;
            }
        }

        let txn = self.index().conn().unchecked_transaction()?;
        for r in &plan {
            self.index().update_placement(&r.path, r.shard, r.offset)?;
        }
        txn.commit()?;

        self.set_shard_size_limit(new_limit)?;
        self.shards_mut().refresh_cursor()?;
        info!("reshard complete");
        Ok(())
    }
}

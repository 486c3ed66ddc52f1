//! Defragmentation: compacting the holes that deletions leave behind.
//!
//! Full mode slides every file (contiguous runs move as one block
//! copy) down to the next free position in its shard and truncates the
//! tails. Quick mode works under a deadline, filling earlier gaps with
//! trailing files so tails can be truncated without a full rewrite.

use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::entry::FileEntry;
use crate::{Barecat, BarecatError, CancelToken, Result};

/// What a defrag pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DefragReport {
    pub moved_files: u64,
    pub moved_bytes: u64,
    pub reclaimed_bytes: u64,
}

/// A maximal run of physically contiguous files in one shard.
#[derive(Debug)]
struct Run {
    start: u64,
    len: u64,
    files: Vec<FileEntry>,
}

fn contiguous_runs(files: Vec<FileEntry>) -> Vec<Run> {
    let mut runs: Vec<Run> = Vec::new();
    for f in files {
        match runs.last_mut() {
            Some(run) if run.start + run.len == f.offset => {
                run.len += f.size;
                run.files.push(f);
            }
            _ => runs.push(Run {
                start: f.offset,
                len: f.size,
                files: vec![f],
            }),
        }
    }
    runs
}

impl Barecat {
    /// Full defragmentation. Requires read-write mode. Idempotent: a
    /// compact shard is left untouched.
    ///
    /// Bytes move before the index rows update, and old bytes are only
    /// overwritten once nothing references them, so an interrupted
    /// pass leaves a consistent (partially compacted) archive.
    pub fn defrag(&mut self, cancel: &CancelToken) -> Result<DefragReport> {
        if self.mode() != crate::shard::OpenMode::ReadWrite {
            return Err(BarecatError::ReadOnly);
        }
        let mut report = DefragReport::default();

        for shard in crate::shard::existing_shards(self.base_path())? {
            cancel.check()?;
            let files = self.index().files_in_shard(shard)?;
            let mut cursor: u64 = 0;

            for run in contiguous_runs(files) {
                cancel.check()?;
                if run.start == cursor {
                    cursor += run.len;
                    continue;
                }
                debug_assert!(run.start > cursor);
                self.shards_mut()
                    .copy_range(shard, run.start, shard, cursor, run.len)?;

                let delta = run.start - cursor;
                let txn = self.index().conn().unchecked_transaction()?;
                for f in &run.files {
                    self.index()
                        .update_placement(&f.path, shard, f.offset - delta)?;
                }
                txn.commit()?;

                report.moved_files += run.files.len() as u64;
                report.moved_bytes += run.len;
                cursor += run.len;
                debug!(shard, delta, run_len = run.len, "run compacted");
            }

            let shard_len = self.shards().shard_len(shard)?;
            if shard_len > cursor {
                self.shards_mut().truncate(shard, cursor)?;
                report.reclaimed_bytes += shard_len - cursor;
            }
        }

        self.remove_trailing_empty_shards()?;
        info!(?report, "full defrag complete");
        Ok(report)
    }

    /// Opportunistic defragmentation under a time budget: repeatedly
    /// takes the largest trailing file that fits an earlier gap in its
    /// shard, moves it into the earliest such gap and truncates the
    /// freed tail. Stops at the deadline, leaving shards partially
    /// compacted.
    pub fn defrag_quick(
        &mut self,
        budget: Duration,
        cancel: &CancelToken,
    ) -> Result<DefragReport> {
        if self.mode() != crate::shard::OpenMode::ReadWrite {
            return Err(BarecatError::ReadOnly);
        }
        let deadline = Instant::now() + budget;
        let mut report = DefragReport::default();

        loop {
            cancel.check()?;
            if Instant::now() >= deadline {
                debug!("quick defrag deadline reached");
                break;
            }
            let Some((file, gap_start)) = self.best_gap_fill()? else {
                break;
            };

            self.shards_mut()
                .copy_range(file.shard, file.offset, file.shard, gap_start, file.size)?;
            self.index()
                .update_placement(&file.path, file.shard, gap_start)?;

            let new_end = self.index().max_end_offset(file.shard)?.unwrap_or(0);
            let shard_len = self.shards().shard_len(file.shard)?;
            if shard_len > new_end {
                self.shards_mut().truncate(file.shard, new_end)?;
                report.reclaimed_bytes += shard_len - new_end;
            }
            report.moved_files += 1;
            report.moved_bytes += file.size;
        }

        info!(?report, "quick defrag finished");
        Ok(report)
    }

    /// Largest trailing file (across shards) that fits into a gap
    /// below it in the same shard, paired with the earliest such gap.
    fn best_gap_fill(&self) -> Result<Option<(FileEntry, u64)>> {
        let mut best: Option<(FileEntry, u64)> = None;
        for shard in self.index().referenced_shards()? {
            let files = self.index().files_in_shard(shard)?;
            let Some(tail) = files.last().filter(|f| f.size > 0) else {
                continue;
            };
            let gaps = self.index().shard_gaps(shard)?;
            let fit = gaps
                .iter()
                .find(|(start, len)| *len >= tail.size && start + tail.size <= tail.offset);
            if let Some((start, _)) = fit
                && best.as_ref().is_none_or(|(b, _)| tail.size > b.size)
            {
                best = Some((tail.clone(), *start));
            }
        }
        Ok(best)
    }

    /// Drops empty shard files above the highest shard that still
    /// holds data, then re-derives the append cursor.
    fn remove_trailing_empty_shards(&mut self) -> Result<()> {
        let highest_used = self.index().referenced_shards()?.last().copied();
        let mut removed = false;
        for shard in crate::shard::existing_shards(self.base_path())? {
            let beyond = match highest_used {
                Some(h) => shard > h,
                None => shard > 0,
            };
            if beyond && self.shards().shard_len(shard)? == 0 {
                self.shards_mut().remove_shard_file(shard)?;
                removed = true;
            }
        }
        if removed {
            self.shards_mut().refresh_cursor()?;
        }
        Ok(())
    }
}

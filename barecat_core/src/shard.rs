//! Shard files: append-only containers for raw file bytes.
//!
//! An archive at base path `B` keeps its payload in `B-shard-00000`,
//! `B-shard-00001`, ... Each file's bytes occupy one contiguous range
//! in exactly one shard; the index maps paths to `(shard, offset,
//! size)`. Shards are append-oriented: deletions leave holes that the
//! defragmenter reclaims later.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::crc::Crc32c;
use crate::{BarecatError, Result};

/// Chunk size for streaming appends and shard-to-shard copies.
pub(crate) const COPY_CHUNK: usize = 64 * 1024;

/// How the shard store (and the facade above it) was opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Existing bytes are immutable; no appends.
    ReadOnly,
    /// Appends only; existing bytes are immutable.
    Append,
    /// Arbitrary seeks and rewrites (defrag, reshard).
    ReadWrite,
}

impl OpenMode {
    pub fn writable(self) -> bool {
        !matches!(self, OpenMode::ReadOnly)
    }
}

/// Location and checksum of freshly appended bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardPlacement {
    pub shard: u32,
    pub offset: u64,
    pub size: u64,
    pub crc32c: u32,
}

/// Path of shard `k` for an archive based at `base`.
pub fn shard_path(base: &Path, shard: u32) -> PathBuf {
    let mut name = base
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(format!("-shard-{shard:05}"));
    base.with_file_name(name)
}

/// Shard numbers that exist on disk for `base`, ascending.
pub fn existing_shards(base: &Path) -> Result<Vec<u32>> {
    let dir = base.parent().filter(|p| !p.as_os_str().is_empty());
    let dir: &Path = dir.unwrap_or_else(|| Path::new("."));
    let stem = match base.file_name().and_then(|n| n.to_str()) {
        Some(s) => s,
        None => return Ok(Vec::new()),
    };
    let prefix = format!("{stem}-shard-");

    let mut shards = Vec::new();
    if !dir.exists() {
        return Ok(shards);
    }
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Some(num) = name.strip_prefix(&prefix)
            && let Ok(k) = num.parse::<u32>()
        {
            shards.push(k);
        }
    }
    shards.sort_unstable();
    Ok(shards)
}

/// Owns the shard files of one archive.
///
/// Not thread-shareable: each reader thread is expected to hold its
/// own `ShardStore` (the facade's per-thread reader contexts do this),
/// which also gives it its own file descriptors.
#[derive(Debug)]
pub struct ShardStore {
    base: PathBuf,
    mode: OpenMode,
    limit: u64,
    current: u32,
    current_len: u64,
    handles: RefCell<HashMap<u32, File>>,
}

impl ShardStore {
    /// Opens the shard set for `base`. In writable modes the current
    /// shard is the highest-numbered one on disk (shard 0 is created
    /// on first append if none exist).
    pub fn open(base: &Path, mode: OpenMode, limit: u64) -> Result<Self> {
        let shards = existing_shards(base)?;
        let current = shards.last().copied().unwrap_or(0);
        let current_len = match shards.last() {
            Some(&k) => std::fs::metadata(shard_path(base, k))?.len(),
            None => 0,
        };
        debug!(
            base = %base.display(),
            ?mode,
            current,
            current_len,
            "opened shard store"
        );
        Ok(Self {
            base: base.to_path_buf(),
            mode,
            limit,
            current,
            current_len,
            handles: RefCell::new(HashMap::new()),
        })
    }

    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Highest shard number currently being appended to.
    pub fn current_shard(&self) -> u32 {
        self.current
    }

    /// Updates the rotation limit (persisted separately in the index).
    pub fn set_limit(&mut self, limit: u64) {
        self.limit = limit;
    }

    pub fn shard_file_path(&self, shard: u32) -> PathBuf {
        shard_path(&self.base, shard)
    }

    /// Length of a shard file on disk, or `ShardMissing`.
    pub fn shard_len(&self, shard: u32) -> Result<u64> {
        let path = self.shard_file_path(shard);
        match std::fs::metadata(&path) {
            Ok(m) => Ok(m.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(BarecatError::ShardMissing {
                    shard,
                    shard_path: path,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    fn open_handle(&self, shard: u32, create: bool) -> Result<()> {
        let mut handles = self.handles.borrow_mut();
        if handles.contains_key(&shard) {
            return Ok(());
        }
        let path = self.shard_file_path(shard);
        let mut opts = OpenOptions::new();
        opts.read(true);
        if self.mode.writable() {
            opts.write(true).create(create);
        }
        let file = match opts.open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(BarecatError::ShardMissing {
                    shard,
                    shard_path: path,
                });
            }
            Err(e) => return Err(e.into()),
        };
        handles.insert(shard, file);
        Ok(())
    }

    fn with_handle<T>(
        &self,
        shard: u32,
        create: bool,
        f: impl FnOnce(&mut File) -> std::io::Result<T>,
    ) -> Result<T> {
        self.open_handle(shard, create)?;
        let mut handles = self.handles.borrow_mut();
        let file = handles.get_mut(&shard).expect("handle just opened");
        f(file).map_err(Into::into)
    }

    fn require_writable(&self) -> Result<()> {
        if self.mode.writable() {
            Ok(())
        } else {
            Err(BarecatError::ReadOnly)
        }
    }

    /// Starts a new shard if appending `incoming` bytes would push the
    /// current shard past the limit. A non-empty current shard always
    /// rotates; an empty one accepts the file whole even when it is
    /// larger than the limit (files never split across shards).
    fn make_room(&mut self, incoming: u64) -> Result<()> {
        if self.current_len > 0 && self.current_len.saturating_add(incoming) > self.limit {
            self.rotate()?;
        }
        Ok(())
    }

    fn rotate(&mut self) -> Result<()> {
        self.current += 1;
        self.current_len = 0;
        // Create the file eagerly so "current = highest on disk"
        // holds for a store reopened mid-rotation.
        self.with_handle(self.current, true, |f| f.set_len(0))?;
        debug!(shard = self.current, "rotated to new shard");
        Ok(())
    }

    /// Appends a whole buffer to the current shard.
    pub fn append(&mut self, bytes: &[u8]) -> Result<ShardPlacement> {
        self.require_writable()?;
        self.make_room(bytes.len() as u64)?;

        let shard = self.current;
        let offset = self.current_len;
        self.with_handle(shard, true, |f| {
            f.seek(SeekFrom::Start(offset))?;
            f.write_all(bytes)?;
            f.flush()
        })?;
        self.current_len += bytes.len() as u64;

        Ok(ShardPlacement {
            shard,
            offset,
            size: bytes.len() as u64,
            crc32c: crate::crc::crc32c_of(bytes),
        })
    }

    /// Streams a reader into the current shard, checksumming as it
    /// goes. On any read or write error the shard is truncated back to
    /// its pre-call length and the error is returned.
    ///
    /// The total size is unknown up front, so rotation is decided
    /// after the fact: if the stream overflowed the limit of a shard
    /// that already held other bytes, the fresh bytes are relocated
    /// into a new shard of their own.
    pub fn append_stream(&mut self, reader: &mut dyn Read) -> Result<ShardPlacement> {
        self.require_writable()?;

        let shard = self.current;
        let offset = self.current_len;
        let mut crc = Crc32c::new();
        let mut written: u64 = 0;

        self.open_handle(shard, true)?;
        let stream_result: std::io::Result<()> = (|| {
            let mut handles = self.handles.borrow_mut();
            let file = handles.get_mut(&shard).expect("handle just opened");
            file.seek(SeekFrom::Start(offset))?;
            let mut buf = [0u8; COPY_CHUNK];
            loop {
                let n = reader.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                file.write_all(&buf[..n])?;
                crc.update(&buf[..n]);
                written += n as u64;
            }
            file.flush()
        })();

        if let Err(e) = stream_result {
            // Roll the shard back so no orphan bytes remain.
            let _ = self.with_handle(shard, false, |f| f.set_len(offset));
            return Err(e.into());
        }

        self.current_len = offset + written;

        if offset > 0 && self.current_len > self.limit {
            return self.relocate_tail(shard, offset, written, crc.finalize());
        }

        Ok(ShardPlacement {
            shard,
            offset,
            size: written,
            crc32c: crc.finalize(),
        })
    }

    /// Moves bytes that overflowed a shared shard into a fresh shard.
    fn relocate_tail(
        &mut self,
        shard: u32,
        offset: u64,
        size: u64,
        crc32c: u32,
    ) -> Result<ShardPlacement> {
        debug!(shard, offset, size, "stream overflowed shard limit, relocating");
        self.current = shard;
        self.current_len = offset + size;
        self.rotate()?;
        let dest = self.current;

        self.copy_range(shard, offset, dest, 0, size)?;
        self.with_handle(shard, false, |f| f.set_len(offset))?;
        self.current_len = size;

        Ok(ShardPlacement {
            shard: dest,
            offset: 0,
            size,
            crc32c,
        })
    }

    /// Reads exactly `size` bytes at `(shard, offset)`.
    pub fn read(&self, shard: u32, offset: u64, size: u64) -> Result<Vec<u8>> {
        let len = usize::try_from(size).map_err(|_| BarecatError::Integrity {
            detail: format!("file of {size} bytes does not fit in memory"),
        })?;
        let mut buf = vec![0u8; len];
        self.read_into(shard, offset, &mut buf)?;
        Ok(buf)
    }

    /// Reads into a caller buffer; fails with an integrity error when
    /// the shard is shorter than the referenced range.
    pub fn read_into(&self, shard: u32, offset: u64, buf: &mut [u8]) -> Result<()> {
        let res = self.with_handle(shard, false, |f| {
            f.seek(SeekFrom::Start(offset))?;
            f.read_exact(buf)
        });
        match res {
            Err(BarecatError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                Err(BarecatError::Integrity {
                    detail: format!(
                        "shard {shard} too short for range [{offset}, {})",
                        offset + buf.len() as u64
                    ),
                })
            }
            other => other,
        }
    }

    /// Writes at an arbitrary position. Read-write mode only; used by
    /// the defragmenter.
    pub fn write_at(&mut self, shard: u32, offset: u64, bytes: &[u8]) -> Result<()> {
        if self.mode != OpenMode::ReadWrite {
            return Err(BarecatError::ReadOnly);
        }
        self.with_handle(shard, false, |f| {
            f.seek(SeekFrom::Start(offset))?;
            f.write_all(bytes)?;
            f.flush()
        })?;
        if shard == self.current {
            self.current_len = self.current_len.max(offset + bytes.len() as u64);
        }
        Ok(())
    }

    /// Chunked copy between (or within) shards. Within one shard the
    /// destination must not be above the source, which is all the
    /// defragmenter's downward moves need.
    pub fn copy_range(
        &mut self,
        src_shard: u32,
        src_offset: u64,
        dst_shard: u32,
        dst_offset: u64,
        size: u64,
    ) -> Result<()> {
        debug_assert!(src_shard != dst_shard || dst_offset <= src_offset);
        let mut buf = vec![0u8; COPY_CHUNK.min(size as usize).max(1)];
        let mut copied: u64 = 0;
        while copied < size {
            let n = buf.len().min((size - copied) as usize);
            self.read_into(src_shard, src_offset + copied, &mut buf[..n])?;
            self.require_writable()?;
            self.with_handle(dst_shard, true, |f| {
                f.seek(SeekFrom::Start(dst_offset + copied))?;
                f.write_all(&buf[..n])
            })?;
            copied += n as u64;
        }
        if dst_shard == self.current {
            self.current_len = self.current_len.max(dst_offset + size);
        }
        Ok(())
    }

    /// Truncates a shard. Keeps the append cursor consistent when the
    /// current shard shrinks.
    pub fn truncate(&mut self, shard: u32, new_len: u64) -> Result<()> {
        self.require_writable()?;
        self.with_handle(shard, false, |f| f.set_len(new_len))?;
        if shard == self.current {
            self.current_len = new_len;
        }
        debug!(shard, new_len, "truncated shard");
        Ok(())
    }

    /// Best-effort hole punch: deallocates the byte range without
    /// changing the shard's apparent length. No-op where unsupported.
    #[cfg(target_os = "linux")]
    pub fn punch_hole(&self, shard: u32, offset: u64, size: u64) -> Result<()> {
        if size == 0 {
            return Ok(());
        }
        self.with_handle(shard, false, |f| {
            use rustix::fs::FallocateFlags;
            match rustix::fs::fallocate(
                &*f,
                FallocateFlags::PUNCH_HOLE | FallocateFlags::KEEP_SIZE,
                offset,
                size,
            ) {
                Ok(()) => {}
                Err(e) => {
                    warn!(shard, offset, size, error = %e, "hole punch unsupported, leaving bytes");
                }
            }
            Ok(())
        })
    }

    #[cfg(not(target_os = "linux"))]
    pub fn punch_hole(&self, _shard: u32, _offset: u64, _size: u64) -> Result<()> {
        Ok(())
    }

    /// Removes a shard file from disk and drops its cached handle.
    pub fn remove_shard_file(&mut self, shard: u32) -> Result<()> {
        self.require_writable()?;
        self.handles.borrow_mut().remove(&shard);
        let path = self.shard_file_path(shard);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Re-derives the append cursor from disk, after maintenance that
    /// rewrote shard files behind the store's back.
    pub fn refresh_cursor(&mut self) -> Result<()> {
        self.handles.borrow_mut().clear();
        let shards = existing_shards(&self.base)?;
        self.current = shards.last().copied().unwrap_or(0);
        self.current_len = match shards.last() {
            Some(&k) => std::fs::metadata(self.shard_file_path(k))?.len(),
            None => 0,
        };
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(dir: &Path, limit: u64) -> ShardStore {
        ShardStore::open(&dir.join("arch"), OpenMode::ReadWrite, limit).unwrap()
    }

    #[test]
    fn shard_naming_is_zero_padded() {
        let p = shard_path(Path::new("/tmp/data/arch"), 7);
        assert_eq!(p, Path::new("/tmp/data/arch-shard-00007"));
    }

    #[test]
    fn rotation_at_limit() {
        let tmp = tempfile::tempdir().unwrap();
        let mut s = store(tmp.path(), 100);

        let a = s.append(&[1u8; 60]).unwrap();
        let b = s.append(&[2u8; 50]).unwrap();
        let c = s.append(&[3u8; 70]).unwrap();

        assert_eq!((a.shard, a.offset), (0, 0));
        assert_eq!((b.shard, b.offset), (1, 0));
        assert_eq!((c.shard, c.offset), (2, 0));
    }

    #[test]
    fn oversized_file_gets_own_shard() {
        let tmp = tempfile::tempdir().unwrap();
        let mut s = store(tmp.path(), 100);

        let small = s.append(&[0u8; 10]).unwrap();
        let big = s.append(&[1u8; 250]).unwrap();
        assert_eq!(small.shard, 0);
        assert_eq!((big.shard, big.offset, big.size), (1, 0, 250));

        // The oversized shard is full; the next append rotates again.
        let next = s.append(&[2u8; 10]).unwrap();
        assert_eq!((next.shard, next.offset), (2, 0));
    }

    #[test]
    fn stream_rollback_on_error() {
        struct FailAfter(usize);
        impl Read for FailAfter {
            fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
                if self.0 == 0 {
                    return Err(std::io::Error::other("stream died"));
                }
                let n = self.0.min(buf.len());
                buf[..n].fill(0xab);
                self.0 -= n;
                Ok(n)
            }
        }

        let tmp = tempfile::tempdir().unwrap();
        let mut s = store(tmp.path(), u64::MAX);
        s.append(&[7u8; 16]).unwrap();

        let err = s.append_stream(&mut FailAfter(40)).unwrap_err();
        assert!(matches!(err, BarecatError::Io(_)));
        assert_eq!(s.shard_len(0).unwrap(), 16);

        // The store stays usable after a rollback.
        let p = s.append(&[9u8; 4]).unwrap();
        assert_eq!((p.shard, p.offset), (0, 16));
    }

    #[test]
    fn read_back_and_crc() {
        let tmp = tempfile::tempdir().unwrap();
        let mut s = store(tmp.path(), u64::MAX);
        let data = b"payload bytes".to_vec();
        let p = s.append(&data).unwrap();
        assert_eq!(s.read(p.shard, p.offset, p.size).unwrap(), data);
        assert_eq!(p.crc32c, crate::crc::crc32c_of(&data));
    }

    #[test]
    fn reopen_resumes_highest_shard() {
        let tmp = tempfile::tempdir().unwrap();
        let base = tmp.path().join("arch");
        {
            let mut s = ShardStore::open(&base, OpenMode::ReadWrite, 100).unwrap();
            s.append(&[0u8; 60]).unwrap();
            s.append(&[0u8; 60]).unwrap(); // rotates to shard 1
        }
        let mut s = ShardStore::open(&base, OpenMode::Append, 100).unwrap();
        assert_eq!(s.current_shard(), 1);
        let p = s.append(&[0u8; 10]).unwrap();
        assert_eq!((p.shard, p.offset), (1, 60));
    }
}

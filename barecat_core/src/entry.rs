//! Index row types shared across the engine.

/// Optional POSIX-style metadata carried on files and directories.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EntryMeta {
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub mtime_ns: Option<i64>,
}

/// A live file entry: where its bytes sit and what they should hash to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub path: String,
    pub shard: u32,
    pub offset: u64,
    pub size: u64,
    pub crc32c: Option<u32>,
    pub meta: EntryMeta,
}

impl FileEntry {
    /// First byte past this file in its shard.
    pub fn end_offset(&self) -> u64 {
        self.offset + self.size
    }
}

/// A directory entry with its aggregate tree statistics.
///
/// `num_subdirs` and `num_files` count direct children only;
/// `num_files_tree` and `size_tree` aggregate the whole subtree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub path: String,
    pub num_subdirs: u64,
    pub num_files: u64,
    pub num_files_tree: u64,
    pub size_tree: u64,
    pub meta: EntryMeta,
}

/// Result of [`crate::Barecat::stat`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stat {
    File(FileEntry),
    Dir(DirEntry),
}

impl Stat {
    pub fn is_dir(&self) -> bool {
        matches!(self, Stat::Dir(_))
    }

    /// File size, or the subtree byte total for a directory.
    pub fn size(&self) -> u64 {
        match self {
            Stat::File(f) => f.size,
            Stat::Dir(d) => d.size_tree,
        }
    }

    pub fn meta(&self) -> &EntryMeta {
        match self {
            Stat::File(f) => &f.meta,
            Stat::Dir(d) => &d.meta,
        }
    }
}

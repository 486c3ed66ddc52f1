use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;

use barecat_core::{Barecat, BarecatError, EntryMeta, Stat};

fn scratch() -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().expect("tempdir");
    let base = dir.path().join("test.barecat");
    (dir, base)
}

fn shard_len(base: &std::path::Path, shard: u32) -> u64 {
    let path = barecat_core::shard::shard_path(base, shard);
    std::fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

/// A fresh archive is empty: no children under the root, zeroed tree
/// statistics.
#[test]
fn empty_archive_listing() {
    let (_dir, base) = scratch();
    let store = Barecat::open_writable(&base).expect("create");

    assert!(store.listdir("").expect("listdir root").is_empty());
    assert_eq!(store.num_files().unwrap(), 0);
    assert_eq!(store.total_size().unwrap(), 0);
}

#[test]
fn single_file_round_trip() {
    let (_dir, base) = scratch();
    let mut store = Barecat::open_writable(&base).unwrap();

    store.put("a.txt", b"hello").unwrap();
    assert_eq!(store.get("a.txt").unwrap(), b"hello");
    assert_eq!(store.listdir("").unwrap(), vec!["a.txt"]);
    assert_eq!(store.total_size().unwrap(), 5);
    assert_eq!(store.num_files().unwrap(), 1);
    assert_eq!(shard_len(&base, 0), 5);
}

#[test]
fn nested_directory_propagation() {
    let (_dir, base) = scratch();
    let mut store = Barecat::open_writable(&base).unwrap();

    store.put("x/y/z.bin", &vec![0u8; 1000]).unwrap();

    assert_eq!(store.listdir("").unwrap(), vec!["x"]);
    assert_eq!(store.listdir("x").unwrap(), vec!["y"]);
    assert_eq!(store.listdir("x/y").unwrap(), vec!["z.bin"]);

    let root = match store.stat("").unwrap() {
        Stat::Dir(d) => d,
        _ => panic!("root is a directory"),
    };
    assert_eq!(root.num_files_tree, 1);
    assert_eq!(root.size_tree, 1000);
    assert_eq!(root.num_subdirs, 1);

    let x = match store.stat("x").unwrap() {
        Stat::Dir(d) => d,
        _ => panic!(),
    };
    assert_eq!(x.num_subdirs, 1);

    let xy = match store.stat("x/y").unwrap() {
        Stat::Dir(d) => d,
        _ => panic!(),
    };
    assert_eq!(xy.num_files, 1);
}

/// Rotation at the shard size limit: a file never splits, and one that
/// would overflow a non-empty shard starts the next one.
#[test]
fn shard_rotation_at_limit() {
    let (_dir, base) = scratch();
    let mut store = Barecat::options()
        .writable()
        .shard_size_limit(100)
        .open(&base)
        .unwrap();

    store.put("f1", &vec![1u8; 60]).unwrap();
    store.put("f2", &vec![2u8; 50]).unwrap();
    store.put("f3", &vec![3u8; 70]).unwrap();

    let addr = |store: &Barecat, p: &str| match store.stat(p).unwrap() {
        Stat::File(f) => (f.shard, f.offset),
        _ => panic!(),
    };
    assert_eq!(addr(&store, "f1"), (0, 0));
    assert_eq!(addr(&store, "f2"), (1, 0));
    assert_eq!(addr(&store, "f3"), (2, 0));

    // Larger than the limit: still a single shard, all to itself.
    store.put("big", &vec![9u8; 300]).unwrap();
    let (shard, offset) = addr(&store, "big");
    assert_eq!(offset, 0);
    assert_eq!(shard_len(&base, shard), 300);
}

#[test]
fn overwrite_is_delete_plus_append() {
    let (_dir, base) = scratch();
    let mut store = Barecat::open_writable(&base).unwrap();

    store.put("doc", b"first version").unwrap();
    let err = store.put("doc", b"second").unwrap_err();
    assert!(matches!(err, BarecatError::AlreadyExists { .. }));

    store.put_overwrite("doc", b"second").unwrap();
    assert_eq!(store.get("doc").unwrap(), b"second");
    assert_eq!(store.num_files().unwrap(), 1);
    assert_eq!(store.total_size().unwrap(), 6);
}

#[test]
fn zero_byte_files_may_share_an_address() {
    let (_dir, base) = scratch();
    let mut store = Barecat::open_writable(&base).unwrap();

    store.put("marker1", b"").unwrap();
    store.put("marker2", b"").unwrap();
    assert_eq!(store.get("marker1").unwrap(), b"");
    assert_eq!(store.get("marker2").unwrap(), b"");
    assert!(store.verify_quick().unwrap().ok());
}

#[test]
fn handle_reads_and_seeks() {
    let (_dir, base) = scratch();
    let mut store = Barecat::open_writable(&base).unwrap();
    store.put("pad", &vec![0xaa; 16]).unwrap();
    store.put("data", b"abcdefghij").unwrap();

    let mut handle = store.open_file("data").unwrap();
    assert_eq!(handle.size(), 10);

    let mut buf = [0u8; 4];
    handle.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"abcd");
    assert_eq!(handle.tell(), 4);

    handle.seek(SeekFrom::End(-3)).unwrap();
    let mut rest = Vec::new();
    handle.read_to_end(&mut rest).unwrap();
    assert_eq!(rest, b"hij");

    // Reads never cross the file's range into neighboring bytes.
    handle.seek(SeekFrom::Start(8)).unwrap();
    let mut tail = Vec::new();
    handle.read_to_end(&mut tail).unwrap();
    assert_eq!(tail, b"ij");
}

#[test]
fn listdir_walk_and_glob() {
    let (_dir, base) = scratch();
    let mut store = Barecat::open_writable(&base).unwrap();
    for (path, data) in [
        ("readme.md", &b"hi"[..]),
        ("src/main.rs", b"fn main() {}"),
        ("src/util/io.rs", b"pub fn noop() {}"),
        ("assets/logo.png", b"\x89PNG"),
    ] {
        store.put(path, data).unwrap();
    }

    assert_eq!(store.listdir("").unwrap(), vec!["assets", "readme.md", "src"]);
    assert_eq!(store.listdir("src").unwrap(), vec!["main.rs", "util"]);

    let visits: Vec<_> = store
        .walk("")
        .unwrap()
        .collect::<barecat_core::Result<Vec<_>>>()
        .unwrap();
    assert_eq!(visits[0].0, "");
    let visited_dirs: Vec<&str> = visits.iter().map(|(d, _, _)| d.as_str()).collect();
    assert_eq!(visited_dirs, vec!["", "assets", "src", "src/util"]);
    assert_eq!(visits[2].2, vec!["main.rs"]);

    assert_eq!(
        store.glob("src/*.rs", false).unwrap(),
        vec!["src/main.rs"]
    );
    assert_eq!(
        store.glob("**/*.rs", true).unwrap(),
        vec!["src/main.rs", "src/util/io.rs"]
    );
    assert_eq!(store.glob("*", false).unwrap().len(), 3);
}

#[test]
fn mkdir_rmdir_and_type_errors() {
    let (_dir, base) = scratch();
    let mut store = Barecat::open_writable(&base).unwrap();

    store.mkdir("empty", false).unwrap();
    assert!(store.is_dir("empty").unwrap());
    let err = store.mkdir("empty", false).unwrap_err();
    assert!(matches!(err, BarecatError::AlreadyExists { .. }));
    store.mkdir("empty", true).unwrap();

    store.put("d/f.txt", b"x").unwrap();
    let err = store.rmdir("d").unwrap_err();
    assert!(matches!(err, BarecatError::DirectoryNotEmpty { .. }));

    // A file cannot act as a directory.
    let err = store.put("d/f.txt/inner", b"y").unwrap_err();
    assert!(matches!(err, BarecatError::NotADirectory { .. }));
    let err = store.listdir("d/f.txt").unwrap_err();
    assert!(matches!(err, BarecatError::NotADirectory { .. }));
    let err = store.get("d").unwrap_err();
    assert!(matches!(err, BarecatError::IsADirectory { .. }));

    store.rmdir("empty").unwrap();
    assert!(!store.exists("empty").unwrap());
}

#[test]
fn rename_file_and_directory() {
    let (_dir, base) = scratch();
    let mut store = Barecat::open_writable(&base).unwrap();
    store.put("old/a.bin", &vec![1u8; 10]).unwrap();
    store.put("old/deep/b.bin", &vec![2u8; 20]).unwrap();
    store.put("top.txt", b"t").unwrap();

    store.rename("top.txt", "renamed.txt").unwrap();
    assert_eq!(store.get("renamed.txt").unwrap(), b"t");
    assert!(!store.contains("top.txt").unwrap());

    store.rename("old", "new").unwrap();
    assert_eq!(store.get("new/a.bin").unwrap(), vec![1u8; 10]);
    assert_eq!(store.get("new/deep/b.bin").unwrap(), vec![2u8; 20]);
    assert!(!store.exists("old").unwrap());

    // Stats survived the move.
    let root = match store.stat("").unwrap() {
        Stat::Dir(d) => d,
        _ => panic!(),
    };
    assert_eq!(root.num_files_tree, 3);
    assert_eq!(root.size_tree, 31);
    let new = match store.stat("new").unwrap() {
        Stat::Dir(d) => d,
        _ => panic!(),
    };
    assert_eq!(new.num_files_tree, 2);
    assert_eq!(new.size_tree, 30);
    assert!(store.verify_quick().unwrap().ok());
}

#[test]
fn rmtree_removes_subtree_and_updates_stats() {
    let (_dir, base) = scratch();
    let mut store = Barecat::open_writable(&base).unwrap();
    store.put("keep.txt", b"k").unwrap();
    store.put("gone/a", &vec![0u8; 100]).unwrap();
    store.put("gone/sub/b", &vec![0u8; 50]).unwrap();

    store.rmtree("gone").unwrap();
    assert!(!store.exists("gone").unwrap());
    assert_eq!(store.num_files().unwrap(), 1);
    assert_eq!(store.total_size().unwrap(), 1);
    assert!(store.verify_quick().unwrap().ok());
}

#[test]
fn bulk_import_rebuilds_statistics() {
    let (_dir, base) = scratch();
    let mut store = Barecat::open_writable(&base).unwrap();

    store
        .with_bulk_writes(|s| {
            for i in 0..200 {
                s.put(&format!("batch/{:03}/item.bin", i % 10), &vec![0u8; 10])
                    .or_else(|e| match e {
                        BarecatError::AlreadyExists { .. } => Ok(()),
                        other => Err(other),
                    })?;
            }
            Ok(())
        })
        .unwrap();

    assert_eq!(store.num_files().unwrap(), 10);
    assert_eq!(store.total_size().unwrap(), 100);
    assert!(store.verify_quick().unwrap().ok());
}

#[test]
fn ingest_streams_and_rolls_back_on_failure() {
    let (_dir, base) = scratch();
    let mut store = Barecat::open_writable(&base).unwrap();
    store.put("before", &vec![5u8; 32]).unwrap();

    let entry = store
        .ingest(
            "streamed.bin",
            EntryMeta {
                mtime_ns: Some(1_700_000_000_000_000_000),
                ..Default::default()
            },
            &mut &b"streamed contents"[..],
        )
        .unwrap();
    assert_eq!(entry.size, 17);
    assert_eq!(store.get("streamed.bin").unwrap(), b"streamed contents");

    struct Dies(usize);
    impl Read for Dies {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.0 == 0 {
                return Err(std::io::Error::other("network went away"));
            }
            let n = self.0.min(buf.len());
            self.0 -= n;
            buf[..n].fill(1);
            Ok(n)
        }
    }

    let len_before = shard_len(&base, 0);
    let err = store
        .ingest("partial.bin", EntryMeta::default(), &mut Dies(100))
        .unwrap_err();
    assert!(matches!(err, BarecatError::IngestFailed { .. }));
    assert!(!store.contains("partial.bin").unwrap());
    assert_eq!(shard_len(&base, 0), len_before);
    assert!(store.verify_quick().unwrap().ok());
}

#[test]
fn emit_streams_bytes_out() {
    let (_dir, base) = scratch();
    let mut store = Barecat::open_writable(&base).unwrap();
    let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
    store.put("big.bin", &payload).unwrap();

    let (size, chunks) = store.emit("big.bin").unwrap();
    assert_eq!(size, payload.len() as u64);
    let mut collected = Vec::new();
    for chunk in chunks {
        collected.extend_from_slice(&chunk.unwrap());
    }
    assert_eq!(collected, payload);
}

#[test]
fn readers_coexist_with_a_writer() {
    let (_dir, base) = scratch();
    let mut store = Barecat::open_writable(&base).unwrap();
    store.put("shared.txt", b"visible").unwrap();

    // A second writer is locked out while the first is open.
    let err = Barecat::open_writable(&base).unwrap_err();
    assert!(matches!(err, BarecatError::WriterLocked { .. }));

    // Read-only contexts open freely; one per reader thread.
    let reader = store.new_reader().unwrap();
    let handle = std::thread::spawn(move || reader.get("shared.txt").unwrap());
    assert_eq!(handle.join().unwrap(), b"visible");

    let err = store.new_reader().unwrap().put("nope", b"").unwrap_err();
    assert!(matches!(err, BarecatError::ReadOnly));
}

#[test]
fn metadata_round_trips() {
    let (_dir, base) = scratch();
    let mut store = Barecat::open_writable(&base).unwrap();
    let meta = EntryMeta {
        mode: Some(0o644),
        uid: Some(1000),
        gid: Some(1000),
        mtime_ns: Some(1_699_999_999_123_456_789),
    };
    store.put_with("cfg/settings.toml", b"[x]\n", meta, false).unwrap();

    match store.stat("cfg/settings.toml").unwrap() {
        Stat::File(f) => {
            assert_eq!(f.meta, meta);
            assert_eq!(f.size, 4);
            assert!(f.crc32c.is_some());
        }
        _ => panic!(),
    }

    let updated = EntryMeta {
        mode: Some(0o600),
        ..meta
    };
    store.set_meta("cfg/settings.toml", updated).unwrap();
    match store.stat("cfg/settings.toml").unwrap() {
        Stat::File(f) => assert_eq!(f.meta.mode, Some(0o600)),
        _ => panic!(),
    }
}

#[test]
fn invalid_paths_are_rejected() {
    let (_dir, base) = scratch();
    let mut store = Barecat::open_writable(&base).unwrap();

    assert!(matches!(
        store.put("", b"x").unwrap_err(),
        BarecatError::InvalidPath { .. }
    ));
    assert!(matches!(
        store.put("a/../b", b"x").unwrap_err(),
        BarecatError::InvalidPath { .. }
    ));
    // Slash runs and edge slashes normalize away.
    store.put("/a//b/", b"x").unwrap();
    assert!(store.contains("a/b").unwrap());
}

use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use barecat_core::{
    Barecat, BarecatError, CancelToken, DuplicatePolicy, FileOrder, MergeOptions, Stat,
    VerifyIssue, merge_copy, merge_symlink,
};

fn scratch() -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().expect("tempdir");
    let base = dir.path().join("arch.barecat");
    (dir, base)
}

fn shard_len(base: &Path, shard: u32) -> u64 {
    std::fs::metadata(barecat_core::shard::shard_path(base, shard))
        .map(|m| m.len())
        .unwrap_or(0)
}

fn file_addr(store: &Barecat, path: &str) -> (u32, u64) {
    match store.stat(path).unwrap() {
        Stat::File(f) => (f.shard, f.offset),
        _ => panic!("{path} is a file"),
    }
}

/// Deleting leaves a hole; full defrag slides the survivor down and
/// truncates the shard.
#[test]
fn deletion_hole_then_defrag_compacts() {
    let (_dir, base) = scratch();
    let mut store = Barecat::open_writable(&base).unwrap();
    store.put("a", &vec![1u8; 100]).unwrap();
    let b_bytes: Vec<u8> = (0..50u8).collect();
    store.put("b", &b_bytes).unwrap();

    store.delete("a").unwrap();
    assert_eq!(store.get("b").unwrap(), b_bytes);
    // The hole remains on disk: 150 bytes with the first 100 dead.
    assert_eq!(shard_len(&base, 0), 150);

    let report = store.defrag(&CancelToken::new()).unwrap();
    assert_eq!(report.moved_files, 1);
    assert_eq!(file_addr(&store, "b"), (0, 0));
    assert_eq!(shard_len(&base, 0), 50);
    assert_eq!(store.get("b").unwrap(), b_bytes);
    assert!(store.verify_full(&CancelToken::new()).unwrap().ok());
}

#[test]
fn defrag_is_idempotent() {
    let (_dir, base) = scratch();
    let mut store = Barecat::open_writable(&base).unwrap();
    for i in 0..20 {
        store.put(&format!("f{i:02}"), &vec![i as u8; 64]).unwrap();
    }
    for i in (0..20).step_by(3) {
        store.delete(&format!("f{i:02}")).unwrap();
    }

    store.defrag(&CancelToken::new()).unwrap();
    let layout_once: Vec<_> = store
        .iter_files(FileOrder::Address)
        .map(|f| f.map(|f| (f.path.clone(), f.shard, f.offset)))
        .collect::<barecat_core::Result<_>>()
        .unwrap();
    let len_once = shard_len(&base, 0);

    let report = store.defrag(&CancelToken::new()).unwrap();
    assert_eq!(report.moved_files, 0);
    let layout_twice: Vec<_> = store
        .iter_files(FileOrder::Address)
        .map(|f| f.map(|f| (f.path.clone(), f.shard, f.offset)))
        .collect::<barecat_core::Result<_>>()
        .unwrap();
    assert_eq!(layout_once, layout_twice);
    assert_eq!(shard_len(&base, 0), len_once);

    // Zero internal gaps: each file starts where the previous ended.
    let mut expected_offset = 0;
    for (_, _, offset) in &layout_once {
        assert_eq!(*offset, expected_offset);
        expected_offset += 64;
    }
}

#[test]
fn quick_defrag_fills_gaps_within_budget() {
    let (_dir, base) = scratch();
    let mut store = Barecat::open_writable(&base).unwrap();
    store.put("head", &vec![1u8; 400]).unwrap();
    store.put("mid", &vec![2u8; 100]).unwrap();
    store.put("tail", &vec![3u8; 300]).unwrap();
    store.delete("head").unwrap();

    // "tail" (300 bytes) fits the 400-byte hole at offset 0; the
    // freed tail then lets "mid" slide into the remaining gap.
    let report = store
        .defrag_quick(Duration::from_secs(5), &CancelToken::new())
        .unwrap();
    assert!(report.moved_files >= 1);
    assert_eq!(file_addr(&store, "tail"), (0, 0));
    assert_eq!(store.get("tail").unwrap(), vec![3u8; 300]);
    assert_eq!(store.get("mid").unwrap(), vec![2u8; 100]);
    // Tails truncated down to the last live byte.
    assert_eq!(shard_len(&base, 0), 400);
    assert!(store.verify_full(&CancelToken::new()).unwrap().ok());
}

#[test]
fn reshard_repacks_under_new_limit() {
    let (_dir, base) = scratch();
    let mut store = Barecat::options()
        .writable()
        .shard_size_limit(1000)
        .open(&base)
        .unwrap();
    let mut payloads = Vec::new();
    for i in 0..8 {
        let data = vec![i as u8; 90];
        store.put(&format!("part{i}"), &data).unwrap();
        payloads.push((format!("part{i}"), data));
    }
    // Everything fits one shard under the old limit.
    assert_eq!(shard_len(&base, 0), 720);

    store.reshard(200, &CancelToken::new()).unwrap();

    for shard in barecat_core::shard::existing_shards(&base).unwrap() {
        assert!(shard_len(&base, shard) <= 200, "shard {shard} over limit");
    }
    for (path, data) in &payloads {
        assert_eq!(&store.get(path).unwrap(), data);
    }
    assert_eq!(store.shard_size_limit().unwrap(), 200);
    assert!(store.verify_full(&CancelToken::new()).unwrap().ok());

    // A file above the limit still lands in a shard of its own.
    store.put("oversize", &vec![7u8; 450]).unwrap();
    store.reshard(100, &CancelToken::new()).unwrap();
    let (shard, offset) = file_addr(&store, "oversize");
    assert_eq!(offset, 0);
    assert_eq!(shard_len(&base, shard), 450);
}

/// Flipping one byte on disk is caught by `get` and reported (with the
/// exact path) by full verification.
#[test]
fn crc_mismatch_is_detected() {
    let (_dir, base) = scratch();
    let mut store = Barecat::open_writable(&base).unwrap();
    store.put("ok.bin", &vec![9u8; 64]).unwrap();
    store.put("victim.bin", b"untampered contents").unwrap();
    let (shard, offset) = file_addr(&store, "victim.bin");
    drop(store);

    let shard_file = barecat_core::shard::shard_path(&base, shard);
    let mut f = std::fs::OpenOptions::new()
        .write(true)
        .open(&shard_file)
        .unwrap();
    f.seek(SeekFrom::Start(offset)).unwrap();
    f.write_all(b"U").unwrap();
    drop(f);

    let store = Barecat::open(&base).unwrap();
    let err = store.get("victim.bin").unwrap_err();
    assert!(matches!(err, BarecatError::CrcMismatch { .. }));
    assert_eq!(store.get("ok.bin").unwrap(), vec![9u8; 64]);

    let report = store.verify_full(&CancelToken::new()).unwrap();
    let bad_paths: Vec<&str> = report
        .issues
        .iter()
        .filter_map(|i| match i {
            VerifyIssue::CrcMismatch { path, .. } => Some(path.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(bad_paths, vec!["victim.bin"]);
}

#[test]
fn quick_verify_spots_missing_and_short_shards() {
    let (_dir, base) = scratch();
    let mut store = Barecat::open_writable(&base).unwrap();
    store.put("a/data.bin", &vec![4u8; 128]).unwrap();
    assert!(store.verify_quick().unwrap().ok());
    drop(store);

    // Truncate the shard behind the engine's back.
    let shard_file = barecat_core::shard::shard_path(&base, 0);
    std::fs::OpenOptions::new()
        .write(true)
        .open(&shard_file)
        .unwrap()
        .set_len(64)
        .unwrap();
    let store = Barecat::open(&base).unwrap();
    let report = store.verify_quick().unwrap();
    assert!(report
        .issues
        .iter()
        .any(|i| matches!(i, VerifyIssue::ShardTooShort { shard: 0, .. })));
    drop(store);

    std::fs::remove_file(&shard_file).unwrap();
    let store = Barecat::open(&base).unwrap();
    let report = store.verify_quick().unwrap();
    assert!(report
        .issues
        .iter()
        .any(|i| matches!(i, VerifyIssue::ShardMissing { shard: 0 })));
}

#[test]
fn verify_full_is_repeatable_on_healthy_archive() {
    let (_dir, base) = scratch();
    let mut store = Barecat::open_writable(&base).unwrap();
    for i in 0..30 {
        store
            .put(&format!("dir{}/file{i}", i % 4), &vec![i as u8; 100 + i])
            .unwrap();
    }
    for _ in 0..3 {
        let report = store.verify_full(&CancelToken::new()).unwrap();
        assert!(report.ok(), "issues: {:?}", report.issues);
        assert_eq!(report.files_checked, 30);
    }
}

#[test]
fn cancellation_aborts_between_files() {
    let (_dir, base) = scratch();
    let mut store = Barecat::open_writable(&base).unwrap();
    for i in 0..10 {
        store.put(&format!("f{i}"), &vec![0u8; 10]).unwrap();
    }
    let cancel = CancelToken::new();
    cancel.cancel();
    let err = store.verify_full(&cancel).unwrap_err();
    assert!(matches!(err, BarecatError::Cancelled));
    let err = store.defrag(&cancel).unwrap_err();
    assert!(matches!(err, BarecatError::Cancelled));
}

fn build_source(dir: &Path, name: &str, files: &[(&str, &[u8])]) -> PathBuf {
    let base = dir.join(name);
    let mut store = Barecat::options()
        .writable()
        .shard_size_limit(256)
        .open(&base)
        .unwrap();
    for (path, data) in files {
        store.put(path, data).unwrap();
    }
    base
}

#[test]
fn merge_copy_combines_archives() {
    let (dir, _) = scratch();
    let a = build_source(dir.path(), "a.barecat", &[("x/1.bin", b"one"), ("shared", b"A")]);
    let b = build_source(dir.path(), "b.barecat", &[("y/2.bin", b"two"), ("shared", b"B")]);
    let out = dir.path().join("merged.barecat");

    // Colliding path fails under the default policy.
    let err = merge_copy(
        &[&a, &b],
        &out,
        &MergeOptions::default(),
        &CancelToken::new(),
    )
    .unwrap_err();
    assert!(matches!(err, BarecatError::AlreadyExists { .. }));
    std::fs::remove_file(&out).ok();
    for shard in barecat_core::shard::existing_shards(&out).unwrap() {
        std::fs::remove_file(barecat_core::shard::shard_path(&out, shard)).ok();
    }

    let opts = MergeOptions {
        policy: DuplicatePolicy::IgnoreKeepFirst,
        ..Default::default()
    };
    merge_copy(&[&a, &b], &out, &opts, &CancelToken::new()).unwrap();

    let merged = Barecat::open(&out).unwrap();
    assert_eq!(merged.get("x/1.bin").unwrap(), b"one");
    assert_eq!(merged.get("y/2.bin").unwrap(), b"two");
    // Keep-first: the copy from source `a` wins.
    assert_eq!(merged.get("shared").unwrap(), b"A");
    assert_eq!(merged.num_files().unwrap(), 3);
    assert!(merged.verify_full(&CancelToken::new()).unwrap().ok());
}

#[cfg(unix)]
#[test]
fn merge_symlink_preserves_bytes_without_copying() {
    let (dir, _) = scratch();
    let payload_a: Vec<u8> = (0..200u8).collect();
    let a = build_source(dir.path(), "a.barecat", &[("data/a.bin", &payload_a)]);
    let b = build_source(dir.path(), "b.barecat", &[("data/b.bin", b"bee")]);
    let out = dir.path().join("linked.barecat");

    merge_symlink(
        &[&a, &b],
        &out,
        &MergeOptions::default(),
        &CancelToken::new(),
    )
    .unwrap();

    let merged = Barecat::open(&out).unwrap();
    assert_eq!(merged.get("data/a.bin").unwrap(), payload_a);
    assert_eq!(merged.get("data/b.bin").unwrap(), b"bee");

    // Output shards are symlinks, renumbered without collisions.
    let out_shards = barecat_core::shard::existing_shards(&out).unwrap();
    assert_eq!(out_shards.len(), 2);
    for shard in out_shards {
        let p = barecat_core::shard::shard_path(&out, shard);
        assert!(std::fs::symlink_metadata(&p).unwrap().file_type().is_symlink());
    }

    // Appending into an existing output is rejected in symlink mode.
    let err = merge_symlink(
        &[&a],
        &out,
        &MergeOptions {
            append: true,
            ..Default::default()
        },
        &CancelToken::new(),
    )
    .unwrap_err();
    assert!(matches!(err, BarecatError::InvalidPath { .. }));
}

#[test]
fn merge_with_prefix_extracts_a_subset() {
    let (dir, _) = scratch();
    let a = build_source(
        dir.path(),
        "full.barecat",
        &[
            ("keep/one.bin", b"1"),
            ("keep/two.bin", b"22"),
            ("drop/three.bin", b"333"),
        ],
    );
    let out = dir.path().join("subset.barecat");

    let opts = MergeOptions {
        source_prefix: Some("keep".to_string()),
        ..Default::default()
    };
    merge_copy(&[&a], &out, &opts, &CancelToken::new()).unwrap();

    let subset = Barecat::open(&out).unwrap();
    assert_eq!(subset.num_files().unwrap(), 2);
    assert!(subset.contains("keep/one.bin").unwrap());
    assert!(!subset.exists("drop").unwrap());
    assert_eq!(subset.total_size().unwrap(), 3);
}

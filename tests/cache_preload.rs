//! Integration tests for preloading the metadata cache from a packed item
//! file.

use std::io::Write;
use std::path::PathBuf;

use dpufs::cache::{preload_from_file, CacheError, CacheTable, PACKED_ITEM_BYTES};

/// Unique scratch path per test.
fn scratch_file(test_name: &str) -> PathBuf {
    let mut path = std::env::temp_dir();
    path.push(format!(
        "dpufs_preload_{}_{}_{}",
        test_name,
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos()
    ));
    path
}

fn write_items(path: &PathBuf, items: &[(u64, u64)]) {
    let mut file = std::fs::File::create(path).unwrap();
    for (key, value) in items {
        file.write_all(&key.to_le_bytes()).unwrap();
        file.write_all(&value.to_le_bytes()).unwrap();
    }
}

#[test]
fn test_preload_round_trip_across_chunks() {
    // 2500 items spans multiple read chunks (1000 items per chunk).
    let items: Vec<(u64, u64)> = (0..2500u64).map(|k| (k + 1, k * 7)).collect();
    let path = scratch_file("round_trip");
    write_items(&path, &items);

    let table = CacheTable::new(10).unwrap();
    let loaded = preload_from_file(&table, &path).unwrap();
    assert_eq!(loaded, items.len());

    for (key, value) in &items {
        assert_eq!(table.lookup(*key), Some(*value), "key {key}");
    }

    std::fs::remove_file(&path).unwrap();
}

#[test]
fn test_preload_rejects_truncated_file() {
    let path = scratch_file("truncated");
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(&[0u8; PACKED_ITEM_BYTES + 3]).unwrap();
    drop(file);

    let table = CacheTable::new(4).unwrap();
    let err = preload_from_file(&table, &path).unwrap_err();
    assert!(matches!(err, CacheError::TruncatedPreload(3)));

    std::fs::remove_file(&path).unwrap();
}

#[test]
fn test_preload_missing_file() {
    let table = CacheTable::new(4).unwrap();
    let err = preload_from_file(&table, &scratch_file("missing")).unwrap_err();
    assert!(matches!(err, CacheError::Io(_)));
}

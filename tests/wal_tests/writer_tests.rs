//! Tests for WAL Writer
//!
//! These tests verify:
//! - Writing batches to the WAL
//! - LSN generation and sequencing
//! - Sync strategies (EveryWrite, EveryNEntries, EveryInterval)
//! - File rotation and removal of flushed files
//! - Integration with reader

use std::path::PathBuf;
use std::time::Duration;

use cellar::config::WalSyncStrategy;
use cellar::wal::{list_log_files, log_file_path, Operation, WalReader, WalWriter};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_temp_wal() -> (TempDir, PathBuf) {
    let temp_dir = TempDir::new().unwrap();
    let wal_dir = temp_dir.path().join("wal");
    (temp_dir, wal_dir)
}

fn put(row: &str, value: &str) -> Vec<Operation> {
    vec![Operation::Put {
        row: row.as_bytes().to_vec(),
        family: "cf".to_string(),
        qualifier: b"q".to_vec(),
        value: value.as_bytes().to_vec(),
    }]
}

fn read_lsns(path: &std::path::Path) -> Vec<u64> {
    WalReader::open(path)
        .unwrap()
        .entries()
        .map(|e| e.unwrap().lsn)
        .collect()
}

// =============================================================================
// Basic Writing Tests
// =============================================================================

#[test]
fn test_write_single_entry() {
    let (_temp, wal_dir) = setup_temp_wal();

    let mut writer = WalWriter::open(&wal_dir, 1, WalSyncStrategy::EveryWrite).unwrap();
    let lsn = writer.append(10, &put("row1", "value1")).unwrap();

    assert_eq!(lsn, 1);
    assert_eq!(writer.current_lsn(), 2);
    assert_eq!(writer.last_lsn(), 1);
    assert_eq!(writer.path(), log_file_path(&wal_dir, 1).as_path());
}

#[test]
fn test_lsn_sequential() {
    let (_temp, wal_dir) = setup_temp_wal();

    let mut writer = WalWriter::open(&wal_dir, 1, WalSyncStrategy::EveryWrite).unwrap();
    let lsns: Vec<u64> = (0..100)
        .map(|i| writer.append(i, &put(&format!("row{}", i), "v")).unwrap())
        .collect();

    for (i, lsn) in lsns.iter().enumerate() {
        assert_eq!(*lsn, (i + 1) as u64);
    }
}

#[test]
fn test_open_continues_at_given_lsn() {
    let (_temp, wal_dir) = setup_temp_wal();

    let mut writer = WalWriter::open(&wal_dir, 42, WalSyncStrategy::EveryWrite).unwrap();
    assert_eq!(writer.append(1, &put("a", "1")).unwrap(), 42);
    assert!(log_file_path(&wal_dir, 42).exists());
}

#[test]
fn test_zero_lsn_is_bumped_to_one() {
    let (_temp, wal_dir) = setup_temp_wal();

    let mut writer = WalWriter::open(&wal_dir, 0, WalSyncStrategy::EveryWrite).unwrap();
    assert_eq!(writer.last_lsn(), 0);
    assert_eq!(writer.append(1, &put("a", "1")).unwrap(), 1);
}

// =============================================================================
// Sync Strategy Tests
// =============================================================================

#[test]
fn test_sync_every_write() {
    let (_temp, wal_dir) = setup_temp_wal();

    let mut writer = WalWriter::open(&wal_dir, 1, WalSyncStrategy::EveryWrite).unwrap();

    writer.append(1, &put("k1", "v1")).unwrap();
    assert_eq!(writer.uncommitted_count(), 0);

    writer.append(2, &put("k2", "v2")).unwrap();
    assert_eq!(writer.uncommitted_count(), 0);
}

#[test]
fn test_sync_every_n_entries() {
    let (_temp, wal_dir) = setup_temp_wal();

    let mut writer = WalWriter::open(&wal_dir, 1, WalSyncStrategy::EveryNEntries { count: 5 }).unwrap();

    // Write 4 entries - should not sync yet
    for i in 0..4 {
        writer.append(i, &put(&format!("k{}", i), "v")).unwrap();
    }
    assert_eq!(writer.uncommitted_count(), 4);

    // 5th entry should trigger sync
    writer.append(5, &put("k5", "v")).unwrap();
    assert_eq!(writer.uncommitted_count(), 0);

    writer.append(6, &put("k6", "v")).unwrap();
    assert_eq!(writer.uncommitted_count(), 1);

    writer.sync().unwrap();
    assert_eq!(writer.uncommitted_count(), 0);
}

// =============================================================================
// Rotation Tests
// =============================================================================

#[test]
fn test_rotate_starts_new_file() {
    let (_temp, wal_dir) = setup_temp_wal();

    let mut writer = WalWriter::open(&wal_dir, 1, WalSyncStrategy::EveryWrite).unwrap();
    writer.append(1, &put("a", "1")).unwrap();
    writer.append(2, &put("b", "2")).unwrap();

    assert_eq!(writer.rotate().unwrap(), 2);
    writer.append(3, &put("c", "3")).unwrap();

    let files = list_log_files(&wal_dir).unwrap();
    let firsts: Vec<u64> = files.iter().map(|(lsn, _)| *lsn).collect();
    assert_eq!(firsts, vec![1, 3]);

    assert_eq!(read_lsns(&files[0].1), vec![1, 2]);
    assert_eq!(read_lsns(&files[1].1), vec![3]);
}

#[test]
fn test_rotate_empty_file_is_noop() {
    let (_temp, wal_dir) = setup_temp_wal();

    let mut writer = WalWriter::open(&wal_dir, 5, WalSyncStrategy::EveryWrite).unwrap();
    assert_eq!(writer.rotate().unwrap(), 4);
    assert_eq!(writer.rotate().unwrap(), 4);

    assert_eq!(list_log_files(&wal_dir).unwrap().len(), 1);
}

#[test]
fn test_remove_obsolete_keeps_unflushed_files() {
    let (_temp, wal_dir) = setup_temp_wal();

    let mut writer = WalWriter::open(&wal_dir, 1, WalSyncStrategy::EveryWrite).unwrap();
    writer.append(1, &put("a", "1")).unwrap(); // file 1: lsn 1..=2
    writer.append(2, &put("b", "2")).unwrap();
    writer.rotate().unwrap();
    writer.append(3, &put("c", "3")).unwrap(); // file 3: lsn 3..=4
    writer.append(4, &put("d", "4")).unwrap();
    writer.rotate().unwrap();
    writer.append(5, &put("e", "5")).unwrap(); // active file 5

    // Checkpoint inside the second file only frees the first
    assert_eq!(writer.remove_obsolete(3).unwrap(), 1);
    let firsts: Vec<u64> = list_log_files(&wal_dir).unwrap().iter().map(|(l, _)| *l).collect();
    assert_eq!(firsts, vec![3, 5]);

    // The active file is never removed
    assert_eq!(writer.remove_obsolete(100).unwrap(), 1);
    let firsts: Vec<u64> = list_log_files(&wal_dir).unwrap().iter().map(|(l, _)| *l).collect();
    assert_eq!(firsts, vec![5]);
}

// =============================================================================
// Reader Integration Tests
// =============================================================================

#[test]
fn test_write_then_read() {
    let (_temp, wal_dir) = setup_temp_wal();

    {
        let mut writer = WalWriter::open(&wal_dir, 1, WalSyncStrategy::EveryWrite).unwrap();
        writer.append(100, &put("alpha", "1")).unwrap();
        writer
            .append(
                101,
                &[Operation::Delete {
                    row: b"alpha".to_vec(),
                    family: "cf".to_string(),
                    qualifier: b"q".to_vec(),
                }],
            )
            .unwrap();
    }

    let entries: Vec<_> = WalReader::open(&log_file_path(&wal_dir, 1))
        .unwrap()
        .entries()
        .collect::<Result<_, _>>()
        .unwrap();

    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].timestamp, 100);
    assert_eq!(entries[0].operations, put("alpha", "1"));
    assert!(matches!(entries[1].operations[0], Operation::Delete { .. }));
}

#[test]
fn test_reopen_appends_to_existing_file() {
    let (_temp, wal_dir) = setup_temp_wal();

    {
        let mut writer = WalWriter::open(&wal_dir, 1, WalSyncStrategy::EveryWrite).unwrap();
        writer.append(1, &put("a", "1")).unwrap();
    }
    {
        // Same starting LSN means the same file name
        let mut writer = WalWriter::open(&wal_dir, 1, WalSyncStrategy::EveryWrite).unwrap();
        writer.rotate().unwrap();
    }

    assert_eq!(read_lsns(&log_file_path(&wal_dir, 1)), vec![1]);
}

#[test]
fn test_unsynced_entries_flushed_on_sync() {
    let (_temp, wal_dir) = setup_temp_wal();

    let mut writer = WalWriter::open(&wal_dir, 1, WalSyncStrategy::EveryNEntries { count: 1000 }).unwrap();
    for i in 0..10 {
        writer.append(i, &put(&format!("row{}", i), "v")).unwrap();
    }
    writer.sync().unwrap();

    assert_eq!(read_lsns(&log_file_path(&wal_dir, 1)).len(), 10);
}

#[test]
fn test_appended_entries_readable_before_sync() {
    let (_temp, wal_dir) = setup_temp_wal();

    let mut writer = WalWriter::open(&wal_dir, 1, WalSyncStrategy::EveryNEntries { count: 1000 }).unwrap();
    for i in 0..3 {
        writer.append(i, &put(&format!("row{}", i), "v")).unwrap();
    }
    assert_eq!(writer.uncommitted_count(), 3);

    // Already handed to the OS: a crashed process would not lose them
    assert_eq!(read_lsns(&log_file_path(&wal_dir, 1)), vec![1, 2, 3]);
    std::mem::forget(writer);
    assert_eq!(read_lsns(&log_file_path(&wal_dir, 1)), vec![1, 2, 3]);
}

#[test]
fn test_sync_every_interval() {
    let (_temp, wal_dir) = setup_temp_wal();

    let interval = Duration::from_millis(20);
    let mut writer = WalWriter::open(&wal_dir, 1, WalSyncStrategy::EveryInterval { interval }).unwrap();

    writer.append(1, &put("a", "v")).unwrap();
    assert_eq!(writer.uncommitted_count(), 1);
    assert!(!writer.sync_if_older_than(Duration::from_secs(3600)).unwrap());
    assert_eq!(writer.uncommitted_count(), 1);

    // The next append after the interval syncs everything
    std::thread::sleep(interval * 2);
    writer.append(2, &put("b", "v")).unwrap();
    assert_eq!(writer.uncommitted_count(), 0);

    writer.append(3, &put("c", "v")).unwrap();
    std::thread::sleep(interval * 2);
    assert!(writer.sync_if_older_than(interval).unwrap());
    assert_eq!(writer.uncommitted_count(), 0);
    // Nothing pending
    assert!(!writer.sync_if_older_than(Duration::ZERO).unwrap());
}

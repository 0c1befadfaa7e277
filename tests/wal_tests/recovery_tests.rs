//! Tests for WAL Recovery
//!
//! These tests verify:
//! - Recovery from a clean WAL (no corruption)
//! - Recovery from an empty or missing WAL directory
//! - Recovery with partial writes (truncated tail)
//! - Recovery with corrupted entries (CRC mismatch)
//! - Checkpoint filtering and sequence gaps
//! - Verify mode (stats only, nothing repaired)

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use cellar::config::WalSyncStrategy;
use cellar::wal::{list_log_files, log_file_path, Operation, WalEntry, WalRecovery, WalWriter};
use tempfile::TempDir;

/// Offset of a payload byte inside a serialized entry
const HEADER_BYTE_IN_PAYLOAD: usize = cellar::wal::HEADER_SIZE + 1;

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_temp_wal() -> (TempDir, PathBuf) {
    let temp_dir = TempDir::new().unwrap();
    let wal_dir = temp_dir.path().join("wal");
    fs::create_dir_all(&wal_dir).unwrap();
    (temp_dir, wal_dir)
}

fn put(i: usize) -> Vec<Operation> {
    vec![Operation::Put {
        row: format!("row{}", i).into_bytes(),
        family: "cf".to_string(),
        qualifier: b"q".to_vec(),
        value: format!("value{}", i).into_bytes(),
    }]
}

/// Write entries using WalWriter (produces a well-formed WAL)
fn write_entries_via_writer(dir: &Path, count: usize) {
    let mut writer = WalWriter::open(dir, 1, WalSyncStrategy::EveryWrite).unwrap();
    for i in 0..count {
        writer.append(i as u64 + 1, &put(i)).unwrap();
    }
}

/// Write raw serialized entries directly to a file (for crafting corruption)
fn write_raw_entries(path: &Path, entries: &[WalEntry]) {
    let mut file = File::create(path).unwrap();
    for entry in entries {
        file.write_all(&entry.serialize().unwrap()).unwrap();
    }
    file.sync_all().unwrap();
}

fn lsns(entries: &[WalEntry]) -> Vec<u64> {
    entries.iter().map(|e| e.lsn).collect()
}

// =============================================================================
// Clean Recovery Tests
// =============================================================================

#[test]
fn test_recover_clean_wal() {
    let (_temp, wal_dir) = setup_temp_wal();
    write_entries_via_writer(&wal_dir, 10);

    let (entries, result) = WalRecovery::recover(&wal_dir, 0).unwrap();

    assert_eq!(entries.len(), 10);
    assert_eq!(result.entries_recovered, 10);
    assert_eq!(result.entries_corrupted, 0);
    assert_eq!(result.last_lsn, 10);
    assert!(!result.was_truncated);
    assert_eq!(lsns(&entries), (1..=10).collect::<Vec<_>>());
    assert_eq!(entries[3].operations, put(3));
}

#[test]
fn test_recover_empty_dir() {
    let (_temp, wal_dir) = setup_temp_wal();

    let (entries, result) = WalRecovery::recover(&wal_dir, 0).unwrap();
    assert!(entries.is_empty());
    assert_eq!(result.last_lsn, 0);
}

#[test]
fn test_recover_missing_dir() {
    let temp = TempDir::new().unwrap();

    let (entries, result) = WalRecovery::recover(&temp.path().join("nope"), 0).unwrap();
    assert!(entries.is_empty());
    assert_eq!(result, Default::default());
}

#[test]
fn test_empty_file_anchors_sequence() {
    let (_temp, wal_dir) = setup_temp_wal();
    WalWriter::open(&wal_dir, 42, WalSyncStrategy::EveryWrite).unwrap();

    let (entries, result) = WalRecovery::recover(&wal_dir, 0).unwrap();
    assert!(entries.is_empty());
    assert_eq!(result.last_lsn, 41);
}

#[test]
fn test_recover_across_rotated_files() {
    let (_temp, wal_dir) = setup_temp_wal();
    {
        let mut writer = WalWriter::open(&wal_dir, 1, WalSyncStrategy::EveryWrite).unwrap();
        for i in 0..3 {
            writer.append(i as u64, &put(i)).unwrap();
        }
        writer.rotate().unwrap();
        for i in 3..5 {
            writer.append(i as u64, &put(i)).unwrap();
        }
    }

    let (entries, result) = WalRecovery::recover(&wal_dir, 0).unwrap();
    assert_eq!(lsns(&entries), vec![1, 2, 3, 4, 5]);
    assert_eq!(result.files_set_aside, 0);
}

// =============================================================================
// Checkpoint Tests
// =============================================================================

#[test]
fn test_checkpoint_skips_flushed_entries() {
    let (_temp, wal_dir) = setup_temp_wal();
    write_entries_via_writer(&wal_dir, 10);

    let (entries, result) = WalRecovery::recover(&wal_dir, 6).unwrap();

    assert_eq!(lsns(&entries), vec![7, 8, 9, 10]);
    assert_eq!(result.entries_skipped, 6);
    assert_eq!(result.entries_recovered, 4);
    assert_eq!(result.last_lsn, 10);
}

#[test]
fn test_checkpoint_past_end_returns_nothing() {
    let (_temp, wal_dir) = setup_temp_wal();
    write_entries_via_writer(&wal_dir, 3);

    let (entries, result) = WalRecovery::recover(&wal_dir, u64::MAX).unwrap();
    assert!(entries.is_empty());
    assert_eq!(result.last_lsn, 3);
}

// =============================================================================
// Damage Tests
// =============================================================================

#[test]
fn test_recover_truncated_tail() {
    let (_temp, wal_dir) = setup_temp_wal();
    write_entries_via_writer(&wal_dir, 5);

    let path = log_file_path(&wal_dir, 1);
    let full_len = fs::metadata(&path).unwrap().len();
    {
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(full_len - 3).unwrap();
    }

    let (entries, result) = WalRecovery::recover(&wal_dir, 0).unwrap();
    assert_eq!(lsns(&entries), vec![1, 2, 3, 4]);
    assert!(result.was_truncated);
    assert_eq!(result.entries_corrupted, 0);

    // The torn record was cut off; a second pass is clean
    let (entries, result) = WalRecovery::recover(&wal_dir, 0).unwrap();
    assert_eq!(entries.len(), 4);
    assert!(!result.was_truncated);
}

#[test]
fn test_recover_corrupted_last_entry() {
    let (_temp, wal_dir) = setup_temp_wal();
    let path = log_file_path(&wal_dir, 1);

    let good: Vec<WalEntry> = (0..3).map(|i| WalEntry::new(i + 1, i, put(i as usize))).collect();
    let mut bytes: Vec<u8> = good.iter().flat_map(|e| e.serialize().unwrap()).collect();
    let mut bad = WalEntry::new(4, 4, put(4)).serialize().unwrap();
    let last = bad.len() - 1;
    bad[last] ^= 0xFF;
    bytes.extend_from_slice(&bad);
    fs::write(&path, &bytes).unwrap();

    let (entries, result) = WalRecovery::recover(&wal_dir, 0).unwrap();
    assert_eq!(lsns(&entries), vec![1, 2, 3]);
    assert_eq!(result.entries_corrupted, 1);
    assert!(result.was_truncated);
    assert_eq!(result.last_lsn, 3);
}

#[test]
fn test_corruption_in_middle_sets_later_files_aside() {
    let (_temp, wal_dir) = setup_temp_wal();

    let mut second = WalEntry::new(2, 2, put(2)).serialize().unwrap();
    second[HEADER_BYTE_IN_PAYLOAD] ^= 0xFF;
    let first = WalEntry::new(1, 1, put(1)).serialize().unwrap();
    let third = WalEntry::new(3, 3, put(3)).serialize().unwrap();
    fs::write(log_file_path(&wal_dir, 1), [first, second, third].concat()).unwrap();
    write_raw_entries(&log_file_path(&wal_dir, 4), &[WalEntry::new(4, 4, put(4))]);

    let (entries, result) = WalRecovery::recover(&wal_dir, 0).unwrap();
    assert_eq!(lsns(&entries), vec![1]);
    assert_eq!(result.entries_corrupted, 1);
    assert_eq!(result.files_set_aside, 1);

    // The later file no longer counts as a log file
    let remaining: Vec<u64> = list_log_files(&wal_dir).unwrap().iter().map(|(l, _)| *l).collect();
    assert_eq!(remaining, vec![1]);
    assert!(wal_dir.join(format!("wal_{:020}.orphan", 4)).exists());
}

#[test]
fn test_sequence_gap_sets_files_aside() {
    let (_temp, wal_dir) = setup_temp_wal();
    write_raw_entries(
        &log_file_path(&wal_dir, 1),
        &[WalEntry::new(1, 1, put(1)), WalEntry::new(2, 2, put(2))],
    );
    write_raw_entries(&log_file_path(&wal_dir, 10), &[WalEntry::new(10, 10, put(10))]);

    let (entries, result) = WalRecovery::recover(&wal_dir, 0).unwrap();
    assert_eq!(lsns(&entries), vec![1, 2]);
    assert_eq!(result.files_set_aside, 1);
    assert_eq!(result.last_lsn, 2);
}

// =============================================================================
// Verify Mode Tests
// =============================================================================

#[test]
fn test_verify_does_not_repair() {
    let (_temp, wal_dir) = setup_temp_wal();
    write_entries_via_writer(&wal_dir, 4);

    let path = log_file_path(&wal_dir, 1);
    let damaged_len = fs::metadata(&path).unwrap().len() - 2;
    OpenOptions::new().write(true).open(&path).unwrap().set_len(damaged_len).unwrap();

    let result = WalRecovery::verify(&wal_dir).unwrap();
    assert!(result.was_truncated);
    assert_eq!(result.last_lsn, 3);
    assert_eq!(result.entries_recovered, 3);

    // Still damaged
    assert_eq!(fs::metadata(&path).unwrap().len(), damaged_len);
    assert!(WalRecovery::verify(&wal_dir).unwrap().was_truncated);
}

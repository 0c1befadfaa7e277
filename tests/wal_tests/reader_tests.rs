//! Tests for WAL Reader
//!
//! These tests verify:
//! - Reading entries from a WAL file
//! - Iterator functionality
//! - Torn tail and corrupt record classification
//! - Empty file handling

use std::fs::{self, File};
use std::io::Write;
use std::path::PathBuf;

use cellar::wal::{Operation, WalEntry, WalReader, WalRecord, HEADER_SIZE};
use cellar::CellarError;
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_temp_wal() -> (TempDir, PathBuf) {
    let temp_dir = TempDir::new().unwrap();
    let wal_path = temp_dir.path().join("wal_00000000000000000001.log");
    (temp_dir, wal_path)
}

fn write_entries_to_wal(path: &PathBuf, entries: &[WalEntry]) {
    let mut file = File::create(path).unwrap();
    for entry in entries {
        file.write_all(&entry.serialize().unwrap()).unwrap();
    }
    file.sync_all().unwrap();
}

fn entry(lsn: u64, row: &str) -> WalEntry {
    WalEntry::new(
        lsn,
        lsn * 10,
        vec![Operation::Put {
            row: row.as_bytes().to_vec(),
            family: "cf".to_string(),
            qualifier: b"q".to_vec(),
            value: b"v".to_vec(),
        }],
    )
}

// =============================================================================
// Basic Reading Tests
// =============================================================================

#[test]
fn test_read_empty_file() {
    let (_temp, wal_path) = setup_temp_wal();
    File::create(&wal_path).unwrap();

    let mut reader = WalReader::open(&wal_path).unwrap();
    assert!(reader.next_record().unwrap().is_none());
    assert_eq!(reader.valid_offset(), 0);
}

#[test]
fn test_read_multiple_entries() {
    let (_temp, wal_path) = setup_temp_wal();
    let entries = vec![entry(1, "a"), entry(2, "b"), entry(3, "c")];
    write_entries_to_wal(&wal_path, &entries);

    let read: Vec<WalEntry> = WalReader::open(&wal_path)
        .unwrap()
        .entries()
        .collect::<Result<_, _>>()
        .unwrap();

    assert_eq!(read, entries);
}

#[test]
fn test_valid_offset_tracks_records() {
    let (_temp, wal_path) = setup_temp_wal();
    let first = entry(1, "a");
    write_entries_to_wal(&wal_path, &[first.clone(), entry(2, "b")]);

    let mut reader = WalReader::open(&wal_path).unwrap();
    assert!(matches!(reader.next_record().unwrap(), Some(WalRecord::Entry(_))));
    assert_eq!(reader.valid_offset(), first.serialize().unwrap().len() as u64);
    assert_eq!(reader.path(), wal_path.as_path());
}

// =============================================================================
// Damage Tests
// =============================================================================

#[test]
fn test_partial_header_is_torn_tail() {
    let (_temp, wal_path) = setup_temp_wal();
    let mut bytes = entry(1, "a").serialize().unwrap();
    bytes.extend_from_slice(&[0u8; HEADER_SIZE - 4]);
    fs::write(&wal_path, &bytes).unwrap();

    let mut reader = WalReader::open(&wal_path).unwrap();
    assert!(matches!(reader.next_record().unwrap(), Some(WalRecord::Entry(_))));
    assert!(matches!(reader.next_record().unwrap(), Some(WalRecord::TornTail)));
}

#[test]
fn test_partial_payload_is_torn_tail() {
    let (_temp, wal_path) = setup_temp_wal();
    let bytes = entry(1, "a").serialize().unwrap();
    fs::write(&wal_path, &bytes[..bytes.len() - 1]).unwrap();

    let mut reader = WalReader::open(&wal_path).unwrap();
    assert!(matches!(reader.next_record().unwrap(), Some(WalRecord::TornTail)));

    // The iterator ends quietly at a torn tail
    assert_eq!(WalReader::open(&wal_path).unwrap().entries().count(), 0);
}

#[test]
fn test_bad_checksum_is_corrupt() {
    let (_temp, wal_path) = setup_temp_wal();
    let mut bytes = entry(1, "a").serialize().unwrap();
    bytes.extend(entry(2, "b").serialize().unwrap());
    let last = bytes.len() - 1;
    bytes[last] ^= 0x01;
    fs::write(&wal_path, &bytes).unwrap();

    let mut reader = WalReader::open(&wal_path).unwrap();
    assert!(matches!(reader.next_record().unwrap(), Some(WalRecord::Entry(_))));
    assert!(matches!(reader.next_record().unwrap(), Some(WalRecord::Corrupt { lsn: 2 })));

    let results: Vec<_> = WalReader::open(&wal_path).unwrap().entries().collect();
    assert_eq!(results.len(), 2);
    assert!(results[0].is_ok());
    assert!(matches!(results[1], Err(CellarError::WalCorruption(_))));
}

#[test]
fn test_oversized_length_is_torn_tail() {
    let (_temp, wal_path) = setup_temp_wal();
    let mut bytes = entry(1, "a").serialize().unwrap();
    // Length field claims more than the file holds
    bytes[12..16].copy_from_slice(&u32::MAX.to_le_bytes());
    fs::write(&wal_path, &bytes).unwrap();

    let mut reader = WalReader::open(&wal_path).unwrap();
    assert!(matches!(reader.next_record().unwrap(), Some(WalRecord::TornTail)));
    assert_eq!(reader.valid_offset(), 0);
}

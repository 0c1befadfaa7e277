//! Tests for segment files
//!
//! These tests verify:
//! - Building and reading segments (single and multi-block)
//! - Point lookups at a read timestamp, tombstones, version lists
//! - Bloom filter and row range metadata
//! - Range iteration
//! - Corruption detection (header, footer, data blocks)
//! - Obsolete file cleanup

use std::fs::{self, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;

use cellar::encoding::{encode_key, encode_row_start};
use cellar::storage::segment::{parse_segment_id, segment_path};
use cellar::storage::{SegmentBuilder, SegmentMeta, SegmentReader};
use cellar::{CellKey, CellValue, CellarError};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn key(row: &str, qualifier: &str, ts: u64) -> CellKey {
    CellKey::new(row.as_bytes(), "cf", qualifier.as_bytes(), ts)
}

fn value(v: &str) -> CellValue {
    CellValue::Put(v.as_bytes().to_vec())
}

fn build(dir: &Path, id: u64, block_size: usize, cells: &[(CellKey, CellValue)]) -> (SegmentMeta, Arc<SegmentReader>) {
    let path = segment_path(dir, id);
    let mut builder = SegmentBuilder::new(&path, id, block_size, 10).unwrap();
    for (k, v) in cells {
        builder.add(k, v).unwrap();
    }
    let meta = builder.finish().unwrap();
    let reader = Arc::new(SegmentReader::open(&path, id).unwrap());
    (meta, reader)
}

/// 200 rows, one column each, written at timestamp 1
fn many_rows() -> Vec<(CellKey, CellValue)> {
    (0..200)
        .map(|i| (key(&format!("row{:04}", i), "q", 1), value(&format!("value{}", i))))
        .collect()
}

fn flip_byte(path: &Path, offset: u64) {
    let mut file = OpenOptions::new().read(true).write(true).open(path).unwrap();
    let mut byte = [0u8; 1];
    file.seek(SeekFrom::Start(offset)).unwrap();
    std::io::Read::read_exact(&mut file, &mut byte).unwrap();
    file.seek(SeekFrom::Start(offset)).unwrap();
    file.write_all(&[byte[0] ^ 0xFF]).unwrap();
    file.sync_all().unwrap();
}

// =============================================================================
// Build & Read Tests
// =============================================================================

#[test]
fn test_build_and_lookup() {
    let temp = TempDir::new().unwrap();
    let cells = vec![
        (key("row1", "age", 10), value("25")),
        (key("row1", "name", 10), value("Alice")),
        (key("row2", "name", 11), value("Bob")),
    ];
    let (meta, reader) = build(temp.path(), 1, 4096, &cells);

    assert_eq!(meta.id, 1);
    assert_eq!(meta.entry_count, 3);
    assert_eq!(meta.tombstone_count, 0);
    assert_eq!(meta.min_row, b"row1".to_vec());
    assert_eq!(meta.max_row, b"row2".to_vec());
    assert_eq!(meta.min_timestamp, 10);
    assert_eq!(meta.max_timestamp, 11);
    assert_eq!(meta.file_size, fs::metadata(segment_path(temp.path(), 1)).unwrap().len());

    assert_eq!(reader.entry_count(), 3);
    assert_eq!(
        reader.lookup(b"row1", "cf", b"name", u64::MAX).unwrap(),
        Some((10, value("Alice")))
    );
    assert_eq!(reader.lookup(b"row1", "cf", b"city", u64::MAX).unwrap(), None);
    assert_eq!(reader.lookup(b"row3", "cf", b"name", u64::MAX).unwrap(), None);
    assert_eq!(reader.lookup(b"row2", "other", b"name", u64::MAX).unwrap(), None);
}

#[test]
fn test_lookup_respects_read_timestamp() {
    let temp = TempDir::new().unwrap();
    let cells = vec![
        (key("r", "q", 30), CellValue::Tombstone),
        (key("r", "q", 20), value("v20")),
        (key("r", "q", 10), value("v10")),
    ];
    let (meta, reader) = build(temp.path(), 1, 4096, &cells);
    assert_eq!(meta.tombstone_count, 1);

    assert_eq!(reader.lookup(b"r", "cf", b"q", u64::MAX).unwrap(), Some((30, CellValue::Tombstone)));
    assert_eq!(reader.lookup(b"r", "cf", b"q", 25).unwrap(), Some((20, value("v20"))));
    assert_eq!(reader.lookup(b"r", "cf", b"q", 10).unwrap(), Some((10, value("v10"))));
    assert_eq!(reader.lookup(b"r", "cf", b"q", 9).unwrap(), None);

    let stamps: Vec<u64> = reader
        .versions(b"r", "cf", b"q", 25)
        .unwrap()
        .into_iter()
        .map(|(ts, _)| ts)
        .collect();
    assert_eq!(stamps, vec![20, 10]);
}

#[test]
fn test_multi_block_segment() {
    let temp = TempDir::new().unwrap();
    let cells = many_rows();
    let (meta, reader) = build(temp.path(), 7, 256, &cells);

    assert_eq!(meta.entry_count, 200);
    for i in [0, 1, 57, 128, 199] {
        let row = format!("row{:04}", i);
        let found = reader.lookup(row.as_bytes(), "cf", b"q", u64::MAX).unwrap();
        assert_eq!(found, Some((1, value(&format!("value{}", i)))), "row {}", row);
    }

    let all = reader.read_all().unwrap();
    assert_eq!(all, cells);
}

#[test]
fn test_empty_segment() {
    let temp = TempDir::new().unwrap();
    let (meta, reader) = build(temp.path(), 3, 4096, &[]);

    assert_eq!(meta.entry_count, 0);
    assert_eq!(meta.min_timestamp, 0);
    assert!(meta.min_row.is_empty() && meta.max_row.is_empty());
    assert_eq!(reader.lookup(b"r", "cf", b"q", u64::MAX).unwrap(), None);
    assert!(reader.read_all().unwrap().is_empty());
}

#[test]
fn test_values_with_nul_bytes_and_empty_values() {
    let temp = TempDir::new().unwrap();
    let cells = vec![
        (CellKey::new(b"\0r".to_vec(), "cf", b"\0".to_vec(), 5), CellValue::Put(Vec::new())),
        (CellKey::new(b"\0r".to_vec(), "cf", b"\0\0".to_vec(), 5), CellValue::Put(vec![0, 0, 1])),
    ];
    let (_, reader) = build(temp.path(), 1, 4096, &cells);

    assert_eq!(
        reader.lookup(b"\0r", "cf", b"\0", u64::MAX).unwrap(),
        Some((5, CellValue::Put(Vec::new())))
    );
    assert_eq!(reader.read_all().unwrap(), cells);
}

#[test]
fn test_out_of_order_add_rejected() {
    let temp = TempDir::new().unwrap();
    let path = segment_path(temp.path(), 1);
    let mut builder = SegmentBuilder::new(&path, 1, 4096, 10).unwrap();

    builder.add(&key("b", "q", 1), &value("v")).unwrap();
    let err = builder.add(&key("a", "q", 1), &value("v")).unwrap_err();
    assert!(matches!(err, CellarError::Storage(_)));

    // Same key twice is also out of order
    let err = builder.add(&key("b", "q", 1), &value("v")).unwrap_err();
    assert!(matches!(err, CellarError::Storage(_)));

    builder.abandon();
    assert!(!path.exists());
}

// =============================================================================
// Filter & Metadata Tests
// =============================================================================

#[test]
fn test_bloom_filter_has_no_false_negatives() {
    let temp = TempDir::new().unwrap();
    let (_, reader) = build(temp.path(), 1, 4096, &many_rows());

    for i in 0..200 {
        assert!(reader.may_contain_row(format!("row{:04}", i).as_bytes()));
    }
    let false_positives = (0..1000)
        .filter(|i| reader.may_contain_row(format!("absent{}", i).as_bytes()))
        .count();
    assert!(false_positives < 100, "too many false positives: {}", false_positives);
}

#[test]
fn test_meta_row_range() {
    let temp = TempDir::new().unwrap();
    let (meta, _) = build(temp.path(), 1, 4096, &many_rows());

    assert_eq!(meta.min_row, b"row0000".to_vec());
    assert_eq!(meta.max_row, b"row0199".to_vec());
}

#[test]
fn test_segment_file_names() {
    let dir = Path::new("/data/segments");
    let path = segment_path(dir, 42);
    assert_eq!(path, dir.join("seg_000042.sst"));
    assert_eq!(parse_segment_id(&path), Some(42));
    assert_eq!(parse_segment_id(Path::new("seg_000042.tmp")), None);
    assert_eq!(parse_segment_id(Path::new("MANIFEST")), None);
}

// =============================================================================
// Iteration Tests
// =============================================================================

#[test]
fn test_iter_range() {
    let temp = TempDir::new().unwrap();
    let (_, reader) = build(temp.path(), 1, 256, &many_rows());

    let start = encode_row_start(b"row0050");
    let end = encode_row_start(b"row0060");
    let rows: Vec<Vec<u8>> = reader
        .iter_range(Some(start), Some(end))
        .map(|r| r.unwrap().0.row)
        .collect();

    let expected: Vec<Vec<u8>> = (50..60).map(|i| format!("row{:04}", i).into_bytes()).collect();
    assert_eq!(rows, expected);
}

#[test]
fn test_iter_range_open_ended() {
    let temp = TempDir::new().unwrap();
    let (_, reader) = build(temp.path(), 1, 256, &many_rows());

    let start = encode_key(&key("row0195", "q", 1));
    let count = reader.iter_range(Some(start), None).count();
    assert_eq!(count, 5);

    let end = encode_row_start(b"row0003");
    assert_eq!(reader.iter_range(None, Some(end)).count(), 3);
}

// =============================================================================
// Corruption Tests
// =============================================================================

#[test]
fn test_bad_header_magic_detected() {
    let temp = TempDir::new().unwrap();
    build(temp.path(), 1, 4096, &many_rows());
    let path = segment_path(temp.path(), 1);
    flip_byte(&path, 0);

    let err = SegmentReader::open(&path, 1).unwrap_err();
    assert!(err.is_corruption());
    assert!(matches!(err, CellarError::CorruptSegment { segment_id: 1, .. }));
}

#[test]
fn test_truncated_file_detected() {
    let temp = TempDir::new().unwrap();
    build(temp.path(), 1, 4096, &many_rows());
    let path = segment_path(temp.path(), 1);
    let len = fs::metadata(&path).unwrap().len();
    OpenOptions::new().write(true).open(&path).unwrap().set_len(len - 10).unwrap();

    assert!(SegmentReader::open(&path, 1).unwrap_err().is_corruption());

    OpenOptions::new().write(true).open(&path).unwrap().set_len(20).unwrap();
    assert!(SegmentReader::open(&path, 1).unwrap_err().is_corruption());
}

#[test]
fn test_index_corruption_detected() {
    let temp = TempDir::new().unwrap();
    build(temp.path(), 1, 4096, &many_rows());
    let path = segment_path(temp.path(), 1);

    // Last byte before the footer belongs to the Bloom filter block
    let len = fs::metadata(&path).unwrap().len();
    flip_byte(&path, len - 41);

    assert!(SegmentReader::open(&path, 1).unwrap_err().is_corruption());
}

#[test]
fn test_data_block_corruption_detected_on_read() {
    let temp = TempDir::new().unwrap();
    build(temp.path(), 1, 256, &many_rows());
    let path = segment_path(temp.path(), 1);

    // Inside the first data block, right after the 14-byte header
    flip_byte(&path, 20);
    let reader = Arc::new(SegmentReader::open(&path, 1).unwrap());

    let err = reader.lookup(b"row0000", "cf", b"q", u64::MAX).unwrap_err();
    assert!(err.is_corruption());

    // Iteration yields the error once, then stops
    let results: Vec<_> = reader.iter().collect();
    assert_eq!(results.len(), 1);
    assert!(results[0].is_err());

    // Other blocks are still readable
    assert!(reader.lookup(b"row0199", "cf", b"q", u64::MAX).unwrap().is_some());
}

// =============================================================================
// Lifecycle Tests
// =============================================================================

#[test]
fn test_obsolete_segment_removed_on_last_drop() {
    let temp = TempDir::new().unwrap();
    let (_, reader) = build(temp.path(), 1, 4096, &many_rows());
    let path = segment_path(temp.path(), 1);

    let held = Arc::clone(&reader);
    reader.mark_obsolete();
    assert!(held.is_obsolete());
    drop(reader);
    assert!(path.exists(), "file removed while still referenced");

    // A held reader keeps working
    assert!(held.lookup(b"row0001", "cf", b"q", u64::MAX).unwrap().is_some());
    drop(held);
    assert!(!path.exists());
}

#[test]
fn test_live_segment_kept_on_drop() {
    let temp = TempDir::new().unwrap();
    let (_, reader) = build(temp.path(), 1, 4096, &many_rows());
    drop(reader);
    assert!(segment_path(temp.path(), 1).exists());
}

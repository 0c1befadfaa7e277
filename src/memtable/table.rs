//! MemTable implementation
//!
//! BTreeMap-based memtable with RwLock for concurrency.

use std::collections::{BTreeMap, VecDeque};
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::encoding::{CellKey, CellValue};

/// Entries copied out per read-lock acquisition during scans
const SCAN_CHUNK: usize = 256;

/// In-memory table for recent writes
pub struct MemTable {
    /// Every cell version, ordered by key
    data: RwLock<BTreeMap<CellKey, CellValue>>,
    /// Approximate payload size in bytes
    size: AtomicUsize,
    /// Highest WAL LSN applied to this table (flush checkpoint)
    last_lsn: AtomicU64,
}

impl MemTable {
    /// Create a new empty MemTable
    pub fn new() -> Self {
        Self {
            data: RwLock::new(BTreeMap::new()),
            size: AtomicUsize::new(0),
            last_lsn: AtomicU64::new(0),
        }
    }

    /// Insert a value at (row, family, qualifier, timestamp)
    ///
    /// Returns the new total size.
    pub fn put(&self, key: CellKey, value: Vec<u8>) -> usize {
        let mut data = self.data.write();
        self.insert_locked(&mut data, key, CellValue::Put(value));
        self.size()
    }

    /// Insert a tombstone masking every version at or below `timestamp`
    ///
    /// Returns the new total size.
    pub fn delete(&self, row: Vec<u8>, family: String, qualifier: Vec<u8>, timestamp: u64) -> usize {
        let key = CellKey {
            row,
            family,
            qualifier,
            timestamp,
        };
        let mut data = self.data.write();
        self.insert_locked(&mut data, key, CellValue::Tombstone);
        self.size()
    }

    /// Insert a whole batch under a single write lock
    ///
    /// Readers observe either none or all of the batch.
    pub fn apply<I>(&self, cells: I, lsn: u64) -> usize
    where
        I: IntoIterator<Item = (CellKey, CellValue)>,
    {
        let mut data = self.data.write();
        for (key, value) in cells {
            self.insert_locked(&mut data, key, value);
        }
        self.last_lsn.fetch_max(lsn, Ordering::SeqCst);
        self.size()
    }

    fn insert_locked(&self, data: &mut BTreeMap<CellKey, CellValue>, key: CellKey, value: CellValue) {
        let key_size = key.payload_size();
        let value_size = value.payload_size();
        match data.insert(key, value) {
            Some(old) => {
                // Same key: only the value part changes
                self.size.fetch_sub(old.payload_size(), Ordering::Relaxed);
                self.size.fetch_add(value_size, Ordering::Relaxed);
            }
            None => {
                self.size.fetch_add(key_size + value_size, Ordering::Relaxed);
            }
        }
    }

    /// Newest version of a column with timestamp <= `read_ts`
    pub fn get(&self, row: &[u8], family: &str, qualifier: &[u8], read_ts: u64) -> Option<(u64, CellValue)> {
        let seek = CellKey::new(row, family, qualifier, read_ts);
        let data = self.data.read();
        let (key, value) = data.range((Bound::Included(&seek), Bound::Unbounded)).next()?;
        if key.same_column(&seek) {
            Some((key.timestamp, value.clone()))
        } else {
            None
        }
    }

    /// Every version of a column with timestamp <= `read_ts`, newest first
    pub fn versions(&self, row: &[u8], family: &str, qualifier: &[u8], read_ts: u64) -> Vec<(u64, CellValue)> {
        let seek = CellKey::new(row, family, qualifier, read_ts);
        let data = self.data.read();
        data.range((Bound::Included(&seek), Bound::Unbounded))
            .take_while(|(key, _)| key.same_column(&seek))
            .map(|(key, value)| (key.timestamp, value.clone()))
            .collect()
    }

    /// Lazily scan rows in `[start_row, end_row)`; `None` means unbounded
    pub fn scan(self: &Arc<Self>, start_row: &[u8], end_row: Option<&[u8]>) -> MemTableScan {
        self.scan_from(ScanCursor {
            next: Bound::Included(CellKey::row_start(start_row)),
            end_row: end_row.map(|r| r.to_vec()),
        })
    }

    /// Scan every entry in key order
    pub fn scan_all(self: &Arc<Self>) -> MemTableScan {
        self.scan_from(ScanCursor {
            next: Bound::Unbounded,
            end_row: None,
        })
    }

    /// Resume a scan from a cursor returned by [`MemTableScan::cursor`]
    pub fn scan_from(self: &Arc<Self>, cursor: ScanCursor) -> MemTableScan {
        MemTableScan {
            table: Arc::clone(self),
            cursor,
            buffer: VecDeque::new(),
            exhausted: false,
            resume: None,
        }
    }

    /// Get approximate payload size in bytes
    pub fn size(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    /// Get entry count (every version and tombstone counts)
    pub fn entry_count(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    /// Check if should flush (size >= limit)
    pub fn should_flush(&self, size_limit: usize) -> bool {
        self.size() >= size_limit
    }

    /// Highest LSN applied through [`MemTable::apply`]
    pub fn last_lsn(&self) -> u64 {
        self.last_lsn.load(Ordering::SeqCst)
    }

    /// Highest cell timestamp held (0 when empty)
    pub fn max_timestamp(&self) -> u64 {
        self.data.read().keys().map(|k| k.timestamp).max().unwrap_or(0)
    }
}

impl Default for MemTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Position of a memtable scan; resumable after the scan is dropped
#[derive(Debug, Clone)]
pub struct ScanCursor {
    next: Bound<CellKey>,
    end_row: Option<Vec<u8>>,
}

/// Lazy iterator over MemTable entries
///
/// Entries are copied out in chunks under the read lock, so writers are
/// only blocked for one chunk at a time.
pub struct MemTableScan {
    table: Arc<MemTable>,
    /// Where the next chunk starts
    cursor: ScanCursor,
    buffer: VecDeque<(CellKey, CellValue)>,
    exhausted: bool,
    /// Position right after the last entry handed out
    resume: Option<ScanCursor>,
}

impl MemTableScan {
    /// Cursor positioned after the last entry returned
    pub fn cursor(&self) -> ScanCursor {
        match &self.resume {
            Some(cursor) => cursor.clone(),
            None => self.cursor_before_buffer(),
        }
    }

    fn cursor_before_buffer(&self) -> ScanCursor {
        match self.buffer.front() {
            Some((key, _)) => ScanCursor {
                next: Bound::Included(key.clone()),
                end_row: self.cursor.end_row.clone(),
            },
            None => self.cursor.clone(),
        }
    }

    fn fill(&mut self) {
        let data = self.table.data.read();
        let range = data.range((self.cursor.next.clone(), Bound::Unbounded));

        let mut taken = 0;
        for (key, value) in range {
            if let Some(end) = &self.cursor.end_row {
                if key.row.as_slice() >= end.as_slice() {
                    self.exhausted = true;
                    break;
                }
            }
            self.buffer.push_back((key.clone(), value.clone()));
            taken += 1;
            if taken == SCAN_CHUNK {
                break;
            }
        }
        if taken < SCAN_CHUNK {
            self.exhausted = true;
        }
        if let Some((last, _)) = self.buffer.back() {
            self.cursor.next = Bound::Excluded(last.clone());
        }
    }
}

impl Iterator for MemTableScan {
    type Item = (CellKey, CellValue);

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.exhausted {
            self.fill();
        }
        let (key, value) = self.buffer.pop_front()?;
        self.resume = Some(ScanCursor {
            next: Bound::Excluded(key.clone()),
            end_row: self.cursor.end_row.clone(),
        });
        Some((key, value))
    }
}

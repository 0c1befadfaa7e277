//! Query Module
//!
//! Point reads and row-grouped range scans over a consistent snapshot of
//! a table: memtables plus the segment list, filtered at a read timestamp.
//!
//! ## Read path
//! ```text
//!   read_ts ──► active memtable ─┐
//!               frozen memtable ─┼─► newest visible version per column
//!               segments (new→old)┘
//! ```
//! A segment that fails its checksum during a read is quarantined; the read
//! continues against the remaining sources and is counted as partial.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{error, warn};

use crate::encoding::{encode_row_start, Cell, CellKey, CellValue};
use crate::error::{CellarError, Result};
use crate::memtable::MemTable;
use crate::storage::{CellIterator, MergeIterator, SegmentSnapshot, SegmentStore};

// =============================================================================
// Scan Parameters
// =============================================================================

/// Range scan request
///
/// Rows in `[start_row, stop_row)` in byte order. Empty family and column
/// sets select everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Scan {
    start_row: Vec<u8>,
    stop_row: Option<Vec<u8>>,
    families: BTreeSet<String>,
    columns: BTreeSet<(String, Vec<u8>)>,
    limit: Option<usize>,
}

impl Scan {
    /// Scan the whole table
    pub fn new() -> Self {
        Self::default()
    }

    /// Scan `[start, stop)`; an empty `stop` means unbounded
    pub fn range(start: impl Into<Vec<u8>>, stop: impl Into<Vec<u8>>) -> Self {
        let stop = stop.into();
        Self {
            start_row: start.into(),
            stop_row: if stop.is_empty() { None } else { Some(stop) },
            ..Self::default()
        }
    }

    pub fn with_start_row(mut self, row: impl Into<Vec<u8>>) -> Self {
        self.start_row = row.into();
        self
    }

    pub fn with_stop_row(mut self, row: impl Into<Vec<u8>>) -> Self {
        self.stop_row = Some(row.into());
        self
    }

    /// Restrict to a whole column family
    pub fn add_family(mut self, family: impl Into<String>) -> Self {
        self.families.insert(family.into());
        self
    }

    /// Restrict to one column
    pub fn add_column(mut self, family: impl Into<String>, qualifier: impl Into<Vec<u8>>) -> Self {
        self.columns.insert((family.into(), qualifier.into()));
        self
    }

    /// Return at most `rows` rows
    pub fn with_limit(mut self, rows: usize) -> Self {
        self.limit = Some(rows);
        self
    }

    pub fn start_row(&self) -> &[u8] {
        &self.start_row
    }

    pub fn stop_row(&self) -> Option<&[u8]> {
        self.stop_row.as_deref()
    }

    pub fn limit(&self) -> Option<usize> {
        self.limit
    }

    /// Families named by the family or column filters
    pub fn referenced_families(&self) -> impl Iterator<Item = &str> {
        self.families
            .iter()
            .map(|f| f.as_str())
            .chain(self.columns.iter().map(|(f, _)| f.as_str()))
    }

    fn selects(&self, key: &CellKey) -> bool {
        if self.families.is_empty() && self.columns.is_empty() {
            return true;
        }
        if self.families.contains(&key.family) {
            return true;
        }
        self.columns
            .contains(&(key.family.clone(), key.qualifier.clone()))
    }
}

// =============================================================================
// Rows
// =============================================================================

/// Visible cells of one row, ordered by family then qualifier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    pub key: Vec<u8>,
    pub cells: Vec<Cell>,
}

impl Row {
    pub fn cell(&self, family: &str, qualifier: &[u8]) -> Option<&Cell> {
        self.cells
            .iter()
            .find(|c| c.family == family && c.qualifier == qualifier)
    }

    /// Value of one column
    pub fn value(&self, family: &str, qualifier: &[u8]) -> Option<&[u8]> {
        self.cell(family, qualifier).map(|c| c.value.as_slice())
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}

// =============================================================================
// Read View
// =============================================================================

/// Consistent snapshot for one read
pub(crate) struct ReadView {
    pub table: String,
    pub read_ts: u64,
    /// Active first, then frozen
    pub memtables: Vec<Arc<MemTable>>,
    /// Newest first
    pub segments: SegmentSnapshot,
    pub store: Arc<SegmentStore>,
    pub partial_reads: Arc<AtomicU64>,
}

impl ReadView {
    /// Quarantine the segment behind a corruption error
    ///
    /// Returns `false` for errors that are not segment corruption.
    fn absorb(&self, err: &CellarError) -> bool {
        let (segment_id, reason) = match err {
            CellarError::CorruptSegment { segment_id, reason } => (*segment_id, reason.as_str()),
            _ => return false,
        };
        self.partial_reads.fetch_add(1, Ordering::Relaxed);
        warn!(table = %self.table, segment = segment_id, reason, "Read hit a corrupt segment, result is partial");
        if let Err(e) = self.store.quarantine(segment_id, reason) {
            error!(table = %self.table, segment = segment_id, error = %e, "Failed to quarantine segment");
        }
        true
    }

    /// Newest visible, non-deleted version of a column
    pub fn get_cell(&self, row: &[u8], family: &str, qualifier: &[u8]) -> Result<Option<Cell>> {
        let mut best: Option<(u64, CellValue)> = None;
        let mut consider = |ts: u64, value: CellValue| {
            let better = match &best {
                None => true,
                Some((best_ts, best_value)) => {
                    ts > *best_ts || (ts == *best_ts && value.is_tombstone() && !best_value.is_tombstone())
                }
            };
            if better {
                best = Some((ts, value));
            }
        };

        for memtable in &self.memtables {
            if let Some((ts, value)) = memtable.get(row, family, qualifier, self.read_ts) {
                consider(ts, value);
            }
        }
        for segment in self.segments.iter() {
            match segment.lookup(row, family, qualifier, self.read_ts) {
                Ok(Some((ts, value))) => consider(ts, value),
                Ok(None) => {}
                Err(e) if self.absorb(&e) => {}
                Err(e) => return Err(e),
            }
        }

        Ok(match best {
            Some((ts, CellValue::Put(value))) => Some(Cell {
                row: row.to_vec(),
                family: family.to_string(),
                qualifier: qualifier.to_vec(),
                timestamp: ts,
                value,
            }),
            _ => None,
        })
    }

    /// Up to `max` visible versions, newest first, stopping at a delete
    pub fn get_versions(&self, row: &[u8], family: &str, qualifier: &[u8], max: usize) -> Result<Vec<Cell>> {
        let mut all: Vec<(u64, CellValue)> = Vec::new();
        for memtable in &self.memtables {
            all.extend(memtable.versions(row, family, qualifier, self.read_ts));
        }
        for segment in self.segments.iter() {
            match segment.versions(row, family, qualifier, self.read_ts) {
                Ok(found) => all.extend(found),
                Err(e) if self.absorb(&e) => {}
                Err(e) => return Err(e),
            }
        }

        // Newest first; at equal timestamps the tombstone sorts first and wins
        all.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| b.1.is_tombstone().cmp(&a.1.is_tombstone())));
        all.dedup_by_key(|(ts, _)| *ts);

        let mut cells = Vec::new();
        for (ts, value) in all {
            if cells.len() >= max {
                break;
            }
            match value {
                CellValue::Tombstone => break,
                CellValue::Put(value) => cells.push(Cell {
                    row: row.to_vec(),
                    family: family.to_string(),
                    qualifier: qualifier.to_vec(),
                    timestamp: ts,
                    value,
                }),
            }
        }
        Ok(cells)
    }

    /// All visible columns of one row
    pub fn get_row(self, row: &[u8]) -> Result<Option<Row>> {
        let mut stop = row.to_vec();
        stop.push(0x00);
        let scan = Scan::new().with_start_row(row).with_stop_row(stop).with_limit(1);
        self.scan(scan).next().transpose()
    }

    /// Lazy row iterator over `scan`
    pub fn scan(self, scan: Scan) -> RowScanner {
        let start = scan.start_row.clone();
        let stop = scan.stop_row.clone();

        let mut sources: Vec<CellIterator> = Vec::with_capacity(self.memtables.len() + self.segments.len());
        for memtable in &self.memtables {
            sources.push(Box::new(memtable.scan(&start, stop.as_deref()).map(Ok::<_, CellarError>)));
        }
        let seek = encode_row_start(&start);
        let end = stop.as_deref().map(encode_row_start);
        for segment in self.segments.iter() {
            sources.push(Box::new(segment.iter_range(Some(seek.clone()), end.clone())));
        }

        RowScanner {
            merge: MergeIterator::new(sources),
            view: self,
            scan,
            current: None,
            last_column: None,
            rows_returned: 0,
            partial: false,
            done: false,
        }
    }
}

// =============================================================================
// Row Scanner
// =============================================================================

/// Lazy iterator of rows produced by a scan
///
/// Each item is one row with the newest visible version of every selected
/// column. Rows whose columns are all deleted are skipped.
pub struct RowScanner {
    merge: MergeIterator,
    view: ReadView,
    scan: Scan,
    /// Row being assembled
    current: Option<Row>,
    /// Column of the last cell seen, to skip older versions
    last_column: Option<CellKey>,
    rows_returned: usize,
    partial: bool,
    done: bool,
}

impl RowScanner {
    /// True once a corrupt segment was skipped during this scan
    pub fn is_partial(&self) -> bool {
        self.partial
    }

    /// Read timestamp of the snapshot
    pub fn read_timestamp(&self) -> u64 {
        self.view.read_ts
    }

    fn limit_reached(&self) -> bool {
        self.scan.limit.map(|l| self.rows_returned >= l).unwrap_or(false)
    }

    fn emit(&mut self, row: Row) -> Option<Result<Row>> {
        self.rows_returned += 1;
        if self.limit_reached() {
            self.done = true;
        }
        Some(Ok(row))
    }
}

impl Iterator for RowScanner {
    type Item = Result<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.limit_reached() {
            return None;
        }

        loop {
            let (key, value) = match self.merge.next() {
                Some(Ok(cell)) => cell,
                Some(Err(e)) => {
                    if self.view.absorb(&e) {
                        self.partial = true;
                        continue;
                    }
                    self.done = true;
                    return Some(Err(e));
                }
                None => {
                    self.done = true;
                    return match self.current.take() {
                        Some(row) if !row.is_empty() => self.emit(row),
                        _ => None,
                    };
                }
            };

            if key.timestamp > self.view.read_ts {
                continue;
            }
            // Only the newest visible version of a column counts
            if self.last_column.as_ref().map(|c| c.same_column(&key)).unwrap_or(false) {
                continue;
            }
            self.last_column = Some(key.clone());

            // Row boundary: hand out the finished row
            let finished = match &self.current {
                Some(row) if row.key != key.row => self.current.take(),
                _ => None,
            };
            if self.current.is_none() {
                self.current = Some(Row {
                    key: key.row.clone(),
                    cells: Vec::new(),
                });
            }

            if let (CellValue::Put(v), true) = (&value, self.scan.selects(&key)) {
                if let Some(row) = self.current.as_mut() {
                    row.cells.push(Cell::from_parts(key, v.clone()));
                }
            }

            if let Some(row) = finished {
                if !row.is_empty() {
                    return self.emit(row);
                }
            }
        }
    }
}

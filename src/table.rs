//! Table Module
//!
//! One column-family table: coordinates its WAL, memtables and segments.
//!
//! ## Responsibilities
//! - Assign timestamps and serialize mutations through the WAL
//! - Apply batches to the active memtable atomically
//! - Freeze and flush memtables into segments
//! - Run compactions against the segment store
//! - Replay the WAL on open
//! - Track the table state (active, flushing, compacting, disabled,
//!   read-only, deleting)

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam::channel::Sender;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::catalog::TableDescriptor;
use crate::compaction::{self, now_micros, CompactionHandle, CompactionOutcome};
use crate::config::Config;
use crate::encoding::Cell;
use crate::error::{CellarError, Result};
use crate::maintenance::MaintenanceTask;
use crate::memtable::MemTable;
use crate::query::{ReadView, Row, RowScanner, Scan};
use crate::storage::{SegmentMeta, SegmentStore};
use crate::wal::{Operation, WalRecovery, WalWriter};

/// Externally visible state of a table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableState {
    Active,
    Flushing,
    Compacting,
    Disabled,
    /// A WAL write failed; reads work, writes are rejected until
    /// [`Table::remount_wal`] succeeds
    ReadOnly,
    Deleting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Active,
    Disabled,
    Deleting,
}

struct MemTables {
    active: Arc<MemTable>,
    /// Memtable being written to a segment
    frozen: Option<Arc<MemTable>>,
}

/// Resets a flag when dropped
struct FlagGuard<'a>(&'a AtomicBool);

impl<'a> FlagGuard<'a> {
    fn set(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

// =============================================================================
// Row Mutation
// =============================================================================

/// Atomic batch of changes to one row
///
/// Every operation shares one timestamp and becomes visible at once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowMutation {
    row: Vec<u8>,
    operations: Vec<Operation>,
}

impl RowMutation {
    pub fn new(row: impl Into<Vec<u8>>) -> Self {
        Self {
            row: row.into(),
            operations: Vec::new(),
        }
    }

    pub fn put(mut self, family: impl Into<String>, qualifier: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        self.operations.push(Operation::Put {
            row: self.row.clone(),
            family: family.into(),
            qualifier: qualifier.into(),
            value: value.into(),
        });
        self
    }

    pub fn delete(mut self, family: impl Into<String>, qualifier: impl Into<Vec<u8>>) -> Self {
        self.operations.push(Operation::Delete {
            row: self.row.clone(),
            family: family.into(),
            qualifier: qualifier.into(),
        });
        self
    }

    pub fn row(&self) -> &[u8] {
        &self.row
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

// =============================================================================
// Table
// =============================================================================

/// A column-family table
///
/// ## Concurrency Model: Single-Writer / Multiple-Reader (SWMR)
///
/// - **Writes**: serialized by `write_lock`; WAL append, then memtable
///   apply, then `committed` is published
/// - **Reads**: no table lock; a read captures `committed`, then the
///   memtables, then the segment list, and ignores newer cells
/// - **Flush**: `flush_lock`; the memtable swap takes `write_lock` briefly
/// - **Compaction**: `compaction_lock`; never blocks reads or writes
pub struct Table {
    name: String,
    families: Vec<String>,
    config: Config,
    dir: PathBuf,
    wal_dir: PathBuf,

    /// `None` after a WAL failure (read-only)
    wal: Mutex<Option<WalWriter>>,
    memtables: RwLock<MemTables>,
    segments: Arc<SegmentStore>,

    write_lock: Mutex<()>,
    flush_lock: Mutex<()>,
    compaction_lock: Mutex<()>,

    /// Last timestamp handed out
    clock: AtomicU64,
    /// Newest timestamp whose batch is fully applied
    committed: AtomicU64,

    lifecycle: RwLock<Lifecycle>,
    read_only: AtomicBool,
    flushing: AtomicBool,
    compacting: AtomicBool,
    compaction: CompactionHandle,
    partial_reads: Arc<AtomicU64>,

    maintenance: Option<Sender<MaintenanceTask>>,
}

impl Table {
    // =========================================================================
    // Internal Path Constants
    // =========================================================================
    const WAL_DIR: &'static str = "wal";
    const SEGMENT_DIR: &'static str = "segments";

    /// Open or create a table in `dir`
    ///
    /// On startup:
    /// 1. Open the segment store (manifest + live segments)
    /// 2. Replay WAL entries newer than the flush checkpoint into the memtable
    /// 3. Continue the WAL at the next LSN
    pub fn open(
        descriptor: &TableDescriptor,
        dir: &Path,
        config: &Config,
        maintenance: Option<Sender<MaintenanceTask>>,
    ) -> Result<Self> {
        let wal_dir = dir.join(Self::WAL_DIR);
        let segment_dir = dir.join(Self::SEGMENT_DIR);
        fs::create_dir_all(&wal_dir)?;

        let segments = SegmentStore::open(&segment_dir, config.block_size, config.bloom_bits_per_key)?;
        let checkpoint = segments.flushed_lsn();
        let mut max_ts = segments.live_metas().iter().map(|m| m.max_timestamp).max().unwrap_or(0);

        let (entries, recovery) = WalRecovery::recover(&wal_dir, checkpoint)?;
        if recovery.was_truncated || recovery.entries_corrupted > 0 || recovery.files_set_aside > 0 {
            warn!(
                table = %descriptor.name,
                corrupted = recovery.entries_corrupted,
                set_aside = recovery.files_set_aside,
                truncated = recovery.was_truncated,
                "WAL recovery repaired damage"
            );
        }

        let memtable = Arc::new(MemTable::new());
        for entry in &entries {
            let cells = entry.operations.iter().map(|op| op.to_cell(entry.timestamp));
            memtable.apply(cells, entry.lsn);
            max_ts = max_ts.max(entry.timestamp);
        }

        let next_lsn = recovery.last_lsn.max(checkpoint) + 1;
        let wal = WalWriter::open(&wal_dir, next_lsn, config.wal_sync_strategy)?;

        info!(
            table = %descriptor.name,
            replayed = recovery.entries_recovered,
            segments = segments.segment_count(),
            next_lsn,
            "Table opened"
        );

        let lifecycle = if descriptor.enabled {
            Lifecycle::Active
        } else {
            Lifecycle::Disabled
        };

        Ok(Self {
            name: descriptor.name.clone(),
            families: descriptor.families.clone(),
            config: config.clone(),
            dir: dir.to_path_buf(),
            wal_dir,
            wal: Mutex::new(Some(wal)),
            memtables: RwLock::new(MemTables {
                active: memtable,
                frozen: None,
            }),
            segments: Arc::new(segments),
            write_lock: Mutex::new(()),
            flush_lock: Mutex::new(()),
            compaction_lock: Mutex::new(()),
            clock: AtomicU64::new(max_ts),
            committed: AtomicU64::new(max_ts),
            lifecycle: RwLock::new(lifecycle),
            read_only: AtomicBool::new(false),
            flushing: AtomicBool::new(false),
            compacting: AtomicBool::new(false),
            compaction: CompactionHandle::new(),
            partial_reads: Arc::new(AtomicU64::new(0)),
            maintenance,
        })
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Write one cell
    pub fn put(&self, row: &[u8], family: &str, qualifier: &[u8], value: &[u8]) -> Result<()> {
        self.write_batch(vec![Operation::Put {
            row: row.to_vec(),
            family: family.to_string(),
            qualifier: qualifier.to_vec(),
            value: value.to_vec(),
        }])
        .map(|_| ())
    }

    /// Write several columns of one row atomically
    pub fn put_row(&self, row: &[u8], columns: &[(&str, &[u8], &[u8])]) -> Result<u64> {
        let mutation = columns
            .iter()
            .fold(RowMutation::new(row), |m, (family, qualifier, value)| {
                m.put(*family, *qualifier, *value)
            });
        self.mutate(mutation)
    }

    /// Apply a row mutation atomically, returning its timestamp
    pub fn mutate(&self, mutation: RowMutation) -> Result<u64> {
        self.write_batch(mutation.operations)
    }

    /// Delete every version of a column
    pub fn delete(&self, row: &[u8], family: &str, qualifier: &[u8]) -> Result<()> {
        self.write_batch(vec![Operation::Delete {
            row: row.to_vec(),
            family: family.to_string(),
            qualifier: qualifier.to_vec(),
        }])
        .map(|_| ())
    }

    /// Delete every visible column of a row
    ///
    /// Returns the number of columns deleted.
    pub fn delete_row(&self, row: &[u8]) -> Result<usize> {
        self.check_writable()?;
        let (count, memtable_full) = {
            // Held across the read so no column can appear in between
            let _guard = self.write_lock.lock();
            let visible = self.read_view()?.get_row(row)?;
            let operations: Vec<Operation> = visible
                .map(|r| r.cells)
                .unwrap_or_default()
                .into_iter()
                .map(|cell| Operation::Delete {
                    row: cell.row,
                    family: cell.family,
                    qualifier: cell.qualifier,
                })
                .collect();
            if operations.is_empty() {
                return Ok(0);
            }
            let (_, memtable_full) = self.append_locked(&operations)?;
            (operations.len(), memtable_full)
        };
        self.after_write(memtable_full);
        Ok(count)
    }

    fn write_batch(&self, operations: Vec<Operation>) -> Result<u64> {
        if operations.is_empty() {
            return Err(CellarError::InvalidArgument("empty mutation".to_string()));
        }
        self.check_writable()?;
        for op in &operations {
            if !self.has_family(op.family()) {
                return Err(CellarError::UnknownFamily {
                    table: self.name.clone(),
                    family: op.family().to_string(),
                });
            }
        }

        let (timestamp, flush) = {
            let _guard = self.write_lock.lock();
            self.append_locked(&operations)?
        };
        self.after_write(flush);
        Ok(timestamp)
    }

    /// WAL append + memtable apply; caller holds `write_lock`
    ///
    /// Returns the batch timestamp and whether the memtable is full.
    fn append_locked(&self, operations: &[Operation]) -> Result<(u64, bool)> {
        // State may have changed while waiting for the lock
        self.check_writable()?;

        let timestamp = self.next_timestamp();
        let lsn = {
            let mut wal = self.wal.lock();
            let writer = wal
                .as_mut()
                .ok_or_else(|| CellarError::ReadOnly(self.name.clone()))?;
            match writer.append(timestamp, operations) {
                Ok(lsn) => lsn,
                Err(e) => {
                    *wal = None;
                    return Err(self.handle_wal_failure(e));
                }
            }
        };

        let active = Arc::clone(&self.memtables.read().active);
        let size = active.apply(operations.iter().map(|op| op.to_cell(timestamp)), lsn);
        self.committed.store(timestamp, Ordering::SeqCst);

        Ok((timestamp, size >= self.config.memtable_size_limit))
    }

    /// Switch to read-only after a failed WAL append
    fn handle_wal_failure(&self, err: CellarError) -> CellarError {
        self.read_only.store(true, Ordering::SeqCst);
        error!(table = %self.name, error = %err, "WAL append failed, table is now read-only");
        CellarError::WalWrite(err.to_string())
    }

    fn after_write(&self, memtable_full: bool) {
        if !memtable_full {
            return;
        }
        if self.schedule(MaintenanceTask::Flush(self.name.clone())) {
            return;
        }
        // No background worker: flush inline. The write itself is durable.
        if let Err(e) = self.flush() {
            error!(table = %self.name, error = %e, "Inline flush failed");
        }
    }

    /// Hybrid clock: wall-clock microseconds, strictly increasing
    fn next_timestamp(&self) -> u64 {
        let last = self.clock.load(Ordering::SeqCst);
        let ts = now_micros().max(last + 1);
        self.clock.store(ts, Ordering::SeqCst);
        ts
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub(crate) fn read_view(&self) -> Result<ReadView> {
        self.check_readable()?;
        // Flush installs its segment under the write lock, so the read
        // point, memtables and segment list all come from one state
        let (read_ts, memtables, segments) = {
            let tables = self.memtables.read();
            let read_ts = self.committed.load(Ordering::SeqCst);
            let mut list = vec![Arc::clone(&tables.active)];
            list.extend(tables.frozen.clone());
            (read_ts, list, self.segments.snapshot())
        };
        Ok(ReadView {
            table: self.name.clone(),
            read_ts,
            memtables,
            segments,
            store: Arc::clone(&self.segments),
            partial_reads: Arc::clone(&self.partial_reads),
        })
    }

    /// Newest visible value of a column
    pub fn get(&self, row: &[u8], family: &str, qualifier: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.get_cell(row, family, qualifier)?.map(|c| c.value))
    }

    /// Newest visible version of a column, with its timestamp
    pub fn get_cell(&self, row: &[u8], family: &str, qualifier: &[u8]) -> Result<Option<Cell>> {
        self.check_family(family)?;
        self.read_view()?.get_cell(row, family, qualifier)
    }

    /// Up to `max` versions of a column, newest first
    pub fn get_versions(&self, row: &[u8], family: &str, qualifier: &[u8], max: usize) -> Result<Vec<Cell>> {
        self.check_family(family)?;
        self.read_view()?.get_versions(row, family, qualifier, max)
    }

    /// Every visible column of a row
    pub fn get_row(&self, row: &[u8]) -> Result<Option<Row>> {
        self.read_view()?.get_row(row)
    }

    /// Lazy scan over a row range
    pub fn scan(&self, scan: Scan) -> Result<RowScanner> {
        for family in scan.referenced_families() {
            self.check_family(family)?;
        }
        Ok(self.read_view()?.scan(scan))
    }

    // =========================================================================
    // Flush & Compaction
    // =========================================================================

    /// Write the memtable to a new segment
    ///
    /// A memtable left frozen by an earlier failed flush is written first.
    pub fn flush(&self) -> Result<()> {
        let _flush = self.flush_lock.lock();
        // Checked under the lock: delete waits on it before removing files
        self.check_not_deleting()?;
        let _state = FlagGuard::set(&self.flushing);

        let leftover = self.memtables.read().frozen.clone();
        let frozen = match leftover {
            Some(frozen) => frozen,
            None => match self.freeze()? {
                Some(frozen) => frozen,
                None => return Ok(()),
            },
        };

        let checkpoint = frozen.last_lsn();
        let built = self.segments.build_segment(&frozen)?;
        let meta = built.as_ref().map(|(meta, _)| meta.clone());
        {
            // Readers capture memtables and segments under this lock, so
            // they see the frozen memtable or its segment, never neither
            let mut tables = self.memtables.write();
            self.segments.install_flushed(built, checkpoint)?;
            tables.frozen = None;
        }

        if let Some(wal) = self.wal.lock().as_ref() {
            wal.remove_obsolete(self.segments.flushed_lsn())?;
        }

        if let Some(meta) = meta {
            debug!(
                table = %self.name,
                segment = meta.id,
                entries = meta.entry_count,
                checkpoint,
                "Memtable flushed"
            );
        }

        if self.needs_compaction() {
            self.schedule(MaintenanceTask::Compact {
                table: self.name.clone(),
                attempt: 0,
            });
        }
        Ok(())
    }

    /// Swap in an empty memtable; the full one becomes frozen
    fn freeze(&self) -> Result<Option<Arc<MemTable>>> {
        let _guard = self.write_lock.lock();
        let mut tables = self.memtables.write();
        if tables.active.is_empty() {
            return Ok(None);
        }
        // Entries after this point land in a new log file
        if let Some(wal) = self.wal.lock().as_mut() {
            wal.rotate()?;
        }
        let frozen = std::mem::replace(&mut tables.active, Arc::new(MemTable::new()));
        tables.frozen = Some(Arc::clone(&frozen));
        Ok(Some(frozen))
    }

    /// Compact segments; `major` merges all of them
    ///
    /// Returns `Ok(None)` when there is nothing to do.
    pub fn compact(&self, major: bool) -> Result<Option<CompactionOutcome>> {
        let _compaction = self.compaction_lock.lock();
        self.check_not_deleting()?;
        self.compaction.reset();
        let _state = FlagGuard::set(&self.compacting);

        let outcome = compaction::compact(&self.segments, &self.config.compaction, &self.compaction, major)?;
        if let Some(done) = &outcome {
            info!(
                table = %self.name,
                inputs = done.inputs.len(),
                outputs = done.outputs.len(),
                major = done.major,
                entries_read = done.entries_read,
                entries_written = done.entries_written,
                "Compaction installed"
            );
        }
        Ok(outcome)
    }

    /// Handle to abort a running compaction
    pub fn compaction_handle(&self) -> CompactionHandle {
        self.compaction.clone()
    }

    /// Active memtable has reached the flush threshold
    pub fn memtable_full(&self) -> bool {
        self.memtables.read().active.should_flush(self.config.memtable_size_limit)
    }

    pub fn needs_compaction(&self) -> bool {
        self.segments.segment_count() >= self.config.compaction.trigger
    }

    fn schedule(&self, task: MaintenanceTask) -> bool {
        match &self.maintenance {
            Some(sender) => sender.send(task).is_ok(),
            None => false,
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Reopen the WAL after a write failure
    ///
    /// Damaged tails are repaired and writing continues in a new file.
    pub fn remount_wal(&self) -> Result<()> {
        self.check_not_deleting()?;
        let _guard = self.write_lock.lock();
        let mut wal = self.wal.lock();
        if wal.is_some() {
            return Ok(());
        }

        let result = WalRecovery::recover(&self.wal_dir, u64::MAX)?.1;
        let applied = {
            let tables = self.memtables.read();
            tables
                .frozen
                .as_ref()
                .map(|f| f.last_lsn())
                .unwrap_or(0)
                .max(tables.active.last_lsn())
        };
        let next_lsn = result
            .last_lsn
            .max(applied)
            .max(self.segments.flushed_lsn())
            + 1;
        *wal = Some(WalWriter::open(&self.wal_dir, next_lsn, self.config.wal_sync_strategy)?);
        self.read_only.store(false, Ordering::SeqCst);

        info!(table = %self.name, next_lsn, "WAL remounted, table writable again");
        Ok(())
    }

    pub(crate) fn set_enabled(&self, enabled: bool) -> Result<()> {
        let mut lifecycle = self.lifecycle.write();
        match *lifecycle {
            Lifecycle::Deleting => Err(CellarError::TableDeleting(self.name.clone())),
            _ => {
                *lifecycle = if enabled {
                    Lifecycle::Active
                } else {
                    Lifecycle::Disabled
                };
                Ok(())
            }
        }
    }

    /// Reject new work and wait for in-flight flush and compaction
    pub(crate) fn begin_delete(&self) {
        *self.lifecycle.write() = Lifecycle::Deleting;
        self.compaction.abort();
        let _flush = self.flush_lock.lock();
        let _compaction = self.compaction_lock.lock();
        let _guard = self.write_lock.lock();
        self.wal.lock().take();
    }

    /// fsync the WAL
    pub fn sync_wal(&self) -> Result<()> {
        if let Some(wal) = self.wal.lock().as_mut() {
            wal.sync()?;
        }
        Ok(())
    }

    /// fsync WAL entries that have waited longer than the sync strategy allows
    ///
    /// Returns whether a sync happened.
    pub fn sync_wal_if_due(&self) -> Result<bool> {
        let max_age = self.config.wal_sync_strategy.max_unsynced_age();
        match self.wal.lock().as_mut() {
            Some(wal) => wal.sync_if_older_than(max_age),
            None => Ok(false),
        }
    }

    pub fn state(&self) -> TableState {
        match *self.lifecycle.read() {
            Lifecycle::Deleting => return TableState::Deleting,
            Lifecycle::Disabled => return TableState::Disabled,
            Lifecycle::Active => {}
        }
        if self.read_only.load(Ordering::SeqCst) {
            TableState::ReadOnly
        } else if self.flushing.load(Ordering::SeqCst) {
            TableState::Flushing
        } else if self.compacting.load(Ordering::SeqCst) {
            TableState::Compacting
        } else {
            TableState::Active
        }
    }

    fn check_not_deleting(&self) -> Result<()> {
        if *self.lifecycle.read() == Lifecycle::Deleting {
            return Err(CellarError::TableDeleting(self.name.clone()));
        }
        Ok(())
    }

    fn check_readable(&self) -> Result<()> {
        match *self.lifecycle.read() {
            Lifecycle::Active => Ok(()),
            Lifecycle::Disabled => Err(CellarError::TableDisabled(self.name.clone())),
            Lifecycle::Deleting => Err(CellarError::TableDeleting(self.name.clone())),
        }
    }

    fn check_writable(&self) -> Result<()> {
        self.check_readable()?;
        if self.read_only.load(Ordering::SeqCst) {
            return Err(CellarError::ReadOnly(self.name.clone()));
        }
        Ok(())
    }

    fn check_family(&self, family: &str) -> Result<()> {
        if self.has_family(family) {
            return Ok(());
        }
        Err(CellarError::UnknownFamily {
            table: self.name.clone(),
            family: family.to_string(),
        })
    }

    fn has_family(&self, family: &str) -> bool {
        self.families.iter().any(|f| f == family)
    }

    // =========================================================================
    // Accessors (for testing and debugging)
    // =========================================================================

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn families(&self) -> &[String] {
        &self.families
    }

    /// Root directory of the table
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn segment_count(&self) -> usize {
        self.segments.segment_count()
    }

    /// Metadata of live segments, oldest first
    pub fn segments(&self) -> Vec<SegmentMeta> {
        self.segments.live_metas()
    }

    pub fn quarantined_segments(&self) -> Vec<u64> {
        self.segments.quarantined()
    }

    /// Reads that skipped a corrupt segment
    pub fn partial_reads(&self) -> u64 {
        self.partial_reads.load(Ordering::Relaxed)
    }

    /// Payload bytes buffered in the active memtable
    pub fn memtable_size(&self) -> usize {
        self.memtables.read().active.size()
    }

    pub fn memtable_entry_count(&self) -> usize {
        self.memtables.read().active.entry_count()
    }

    /// WAL checkpoint covered by segments
    pub fn flushed_lsn(&self) -> u64 {
        self.segments.flushed_lsn()
    }

    /// Timestamp of the newest committed write
    pub fn committed_timestamp(&self) -> u64 {
        self.committed.load(Ordering::SeqCst)
    }
}

impl Drop for Table {
    fn drop(&mut self) {
        if let Some(wal) = self.wal.get_mut().as_mut() {
            if let Err(e) = wal.sync() {
                warn!(table = %self.name, error = %e, "Failed to sync WAL on close");
            }
        }
    }
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Table")
            .field("name", &self.name)
            .field("families", &self.families)
            .field("state", &self.state())
            .finish()
    }
}

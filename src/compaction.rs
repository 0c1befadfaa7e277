//! Compaction Module
//!
//! Size-tiered merging of segments.
//!
//! ## Policy
//! Once a table holds `trigger` or more segments, the `max_inputs` smallest
//! are merged into new segments (a *minor* compaction). A *major* compaction
//! merges every live segment and is the only kind that may purge tombstones,
//! because only then is every older version guaranteed to be in the inputs.
//!
//! ## Version retention
//! Cells of a column arrive newest first. The newest cell is kept. An older
//! put is kept while fewer than `max_versions` puts were kept, or while the
//! cell shadowing it is younger than `version_retention`. Everything below a
//! tombstone is dropped; the tombstone itself is dropped only by a major
//! compaction once it is older than `tombstone_grace`.

use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, warn};

use crate::config::CompactionConfig;
use crate::encoding::{CellKey, CellValue};
use crate::error::{CellarError, Result};
use crate::storage::segment::segment_path;
use crate::storage::{CellIterator, MergeIterator, SegmentBuilder, SegmentMeta, SegmentStore};

/// Cooperative abort switch for a running compaction
#[derive(Debug, Clone, Default)]
pub struct CompactionHandle {
    aborted: Arc<AtomicBool>,
}

impl CompactionHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the running (or next) compaction to stop at the next merge step
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    pub(crate) fn reset(&self) {
        self.aborted.store(false, Ordering::SeqCst);
    }
}

/// Summary of a finished compaction
#[derive(Debug, Clone)]
pub struct CompactionOutcome {
    pub inputs: Vec<u64>,
    pub outputs: Vec<SegmentMeta>,
    pub major: bool,
    pub entries_read: u64,
    pub entries_written: u64,
}

/// Select segments to merge
///
/// `metas` is the live list, oldest first. Returns the chosen IDs and
/// whether the selection covers every segment (major).
pub fn pick_inputs(metas: &[SegmentMeta], config: &CompactionConfig, major: bool) -> Option<(Vec<u64>, bool)> {
    if major {
        if metas.is_empty() {
            return None;
        }
        return Some((metas.iter().map(|m| m.id).collect(), true));
    }
    if metas.len() < config.trigger {
        return None;
    }

    let mut by_size: Vec<&SegmentMeta> = metas.iter().collect();
    by_size.sort_by_key(|m| (m.file_size, m.id));
    let chosen: Vec<u64> = by_size.iter().take(config.max_inputs).map(|m| m.id).collect();
    let covers_all = chosen.len() == metas.len();
    Some((chosen, covers_all))
}

/// Per-column retention decisions over a newest-first stream
pub struct VersionFilter {
    major: bool,
    now_micros: u64,
    max_versions: usize,
    retention_micros: u64,
    grace_micros: u64,
    column: Option<CellKey>,
    kept_puts: usize,
    /// Timestamp of the previous cell of the column
    shadow_ts: u64,
    masked: bool,
}

impl VersionFilter {
    pub fn new(major: bool, now_micros: u64, config: &CompactionConfig) -> Self {
        Self {
            major,
            now_micros,
            max_versions: config.max_versions,
            retention_micros: config.version_retention.as_micros() as u64,
            grace_micros: config.tombstone_grace.as_micros() as u64,
            column: None,
            kept_puts: 0,
            shadow_ts: 0,
            masked: false,
        }
    }

    /// Whether `key` survives the compaction
    pub fn admit(&mut self, key: &CellKey, value: &CellValue) -> bool {
        let first = match &self.column {
            Some(column) if column.same_column(key) => false,
            _ => {
                self.column = Some(key.clone());
                self.kept_puts = 0;
                self.masked = false;
                true
            }
        };

        if self.masked {
            return false;
        }

        if value.is_tombstone() {
            self.masked = true;
            let expired = self.now_micros.saturating_sub(key.timestamp) > self.grace_micros;
            return !(self.major && expired);
        }

        let keep = first
            || self.kept_puts < self.max_versions
            || self.now_micros.saturating_sub(self.shadow_ts) < self.retention_micros;
        self.shadow_ts = key.timestamp;
        if keep {
            self.kept_puts += 1;
        }
        keep
    }
}

/// Current wall clock in microseconds
pub(crate) fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// Run one compaction over `store`
///
/// Returns `Ok(None)` when the policy selects nothing. On abort or failure
/// partial outputs are removed and the live segments are left untouched.
/// An input that turns out to be corrupt is quarantined and the compaction
/// starts over without it.
pub fn compact(
    store: &SegmentStore,
    config: &CompactionConfig,
    handle: &CompactionHandle,
    major: bool,
) -> Result<Option<CompactionOutcome>> {
    loop {
        match compact_once(store, config, handle, major) {
            Err(CellarError::CorruptSegment { segment_id, reason }) => {
                // Each pass removes a live segment, so this terminates
                if !store.quarantine(segment_id, &reason)? {
                    return Err(CellarError::corrupt_segment(segment_id, reason));
                }
                warn!(
                    dir = %store.dir().display(),
                    segment = segment_id,
                    reason = %reason,
                    "Compaction input corrupt, retrying without it"
                );
            }
            other => return other,
        }
    }
}

fn compact_once(
    store: &SegmentStore,
    config: &CompactionConfig,
    handle: &CompactionHandle,
    major: bool,
) -> Result<Option<CompactionOutcome>> {
    let metas = store.live_metas();
    let (ids, major) = match pick_inputs(&metas, config, major) {
        Some(selection) => selection,
        None => return Ok(None),
    };

    // Snapshot is newest first, which is the order the merge expects
    let snapshot = store.snapshot();
    let inputs: Vec<_> = snapshot.iter().filter(|r| ids.contains(&r.id())).cloned().collect();
    if inputs.len() != ids.len() {
        return Err(CellarError::Storage("compaction inputs changed".to_string()));
    }

    debug!(
        dir = %store.dir().display(),
        inputs = ?ids,
        major,
        "Starting compaction"
    );

    let sources: Vec<CellIterator> = inputs.iter().map(|r| Box::new(r.iter()) as CellIterator).collect();
    let mut merge = MergeIterator::new(sources);
    let mut filter = VersionFilter::new(major, now_micros(), config);

    let mut builder: Option<SegmentBuilder> = None;
    let mut outputs: Vec<SegmentMeta> = Vec::new();
    let mut entries_read = 0u64;
    let mut entries_written = 0u64;

    let merged = merge_into(
        store,
        config,
        handle,
        &mut merge,
        &mut filter,
        &mut builder,
        &mut outputs,
        &mut entries_read,
        &mut entries_written,
    );
    drop(inputs);

    let installed = merged.and_then(|()| {
        let added = outputs
            .iter()
            .map(|meta| Ok((meta.clone(), store.open_reader(meta)?)))
            .collect::<Result<Vec<_>>>()?;
        store.install(&ids, added, None)
    });

    if let Err(e) = installed {
        if let Some(b) = builder.take() {
            b.abandon();
        }
        for meta in &outputs {
            let _ = fs::remove_file(segment_path(store.dir(), meta.id));
        }
        return Err(e);
    }

    debug!(
        dir = %store.dir().display(),
        inputs = ids.len(),
        outputs = outputs.len(),
        entries_read,
        entries_written,
        "Compaction finished"
    );

    Ok(Some(CompactionOutcome {
        inputs: ids,
        outputs,
        major,
        entries_read,
        entries_written,
    }))
}

#[allow(clippy::too_many_arguments)]
fn merge_into(
    store: &SegmentStore,
    config: &CompactionConfig,
    handle: &CompactionHandle,
    merge: &mut MergeIterator,
    filter: &mut VersionFilter,
    builder: &mut Option<SegmentBuilder>,
    outputs: &mut Vec<SegmentMeta>,
    entries_read: &mut u64,
    entries_written: &mut u64,
) -> Result<()> {
    for item in merge {
        if handle.is_aborted() {
            return Err(CellarError::CompactionAborted);
        }
        let (key, value) = item?;
        *entries_read += 1;
        if !filter.admit(&key, &value) {
            continue;
        }

        if builder.is_none() {
            *builder = Some(store.new_builder()?);
        }
        let full = match builder.as_mut() {
            Some(b) => {
                b.add(&key, &value)?;
                *entries_written += 1;
                b.estimated_size() >= config.max_segment_size
            }
            None => false,
        };
        // Split output at the size limit
        if full {
            if let Some(b) = builder.take() {
                outputs.push(b.finish()?);
            }
        }
    }

    if let Some(last) = builder.take() {
        outputs.push(last.finish()?);
    }
    Ok(())
}

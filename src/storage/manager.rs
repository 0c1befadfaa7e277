//! Segment Store
//!
//! Owns the live segment set of one table and coordinates flushes,
//! compaction installs and quarantine.
//!
//! ## Responsibilities
//! - Open live segments listed in the manifest on startup
//! - Remove segment files a crash left behind
//! - Create new segments from memtable flushes
//! - Swap compaction outputs in atomically
//! - Move corrupt segments into `quarantine/`

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::fsutil::sync_dir;
use crate::memtable::MemTable;
use crate::CellarError;

use super::manifest::ManifestState;
use super::segment::{parse_segment_id, segment_path, SegmentBuilder, SegmentMeta, SegmentReader};

/// Immutable view of the live segments, newest first
pub type SegmentSnapshot = Arc<Vec<Arc<SegmentReader>>>;

const QUARANTINE_DIR: &str = "quarantine";

/// Manages the segment layer of one table
///
/// ## Concurrency:
/// - `segments`: copy-on-write list; readers clone the `Arc` and never block
///   installs
/// - `manifest`: serializes every change to the segment set
/// - All methods use `&self`
#[derive(Debug)]
pub struct SegmentStore {
    /// Directory where segments are stored
    dir: PathBuf,
    block_size: usize,
    bloom_bits_per_key: usize,

    /// Open segment readers, ordered newest → oldest
    segments: RwLock<SegmentSnapshot>,

    /// Last persisted manifest
    manifest: Mutex<ManifestState>,
}

impl SegmentStore {
    /// Open or create the segment directory
    ///
    /// On startup:
    /// 1. Load the manifest (missing means empty)
    /// 2. Open a reader for every live segment; corrupt ones are quarantined
    /// 3. Delete segment files the manifest does not list
    pub fn open(dir: &Path, block_size: usize, bloom_bits_per_key: usize) -> Result<Self> {
        fs::create_dir_all(dir)?;

        let mut state = ManifestState::load(dir)?;
        let mut dirty = false;

        // Open readers for each live segment
        let mut live = Vec::with_capacity(state.segments.len());
        let mut kept = Vec::with_capacity(state.segments.len());
        for meta in &state.segments {
            let path = segment_path(dir, meta.id);
            match SegmentReader::open(&path, meta.id) {
                Ok(reader) => {
                    live.push(Arc::new(reader));
                    kept.push(meta.clone());
                }
                Err(e) if e.is_corruption() || is_not_found(&e) => {
                    warn!(segment = meta.id, error = %e, "Segment failed verification on open, quarantining");
                    move_to_quarantine(dir, meta.id)?;
                    state.quarantined.push(meta.id);
                    dirty = true;
                }
                Err(e) => return Err(e),
            }
        }
        state.segments = kept;

        // Remove files left behind by an interrupted flush or compaction
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if !path.is_file() {
                continue;
            }
            if let Some(id) = parse_segment_id(&path) {
                state.next_segment_id = state.next_segment_id.max(id + 1);
                if !state.contains(id) {
                    debug!(segment = id, "Removing unreferenced segment file");
                    fs::remove_file(&path)?;
                }
            }
        }

        if dirty {
            state.persist(dir)?;
        }

        live.reverse();
        info!(
            dir = %dir.display(),
            segments = live.len(),
            flushed_lsn = state.flushed_lsn,
            "Segment store opened"
        );

        Ok(Self {
            dir: dir.to_path_buf(),
            block_size,
            bloom_bits_per_key,
            segments: RwLock::new(Arc::new(live)),
            manifest: Mutex::new(state),
        })
    }

    /// Current live segments, newest first
    pub fn snapshot(&self) -> SegmentSnapshot {
        Arc::clone(&self.segments.read())
    }

    /// Start a new segment with a fresh ID
    pub fn new_builder(&self) -> Result<SegmentBuilder> {
        let id = {
            let mut state = self.manifest.lock();
            let id = state.next_segment_id;
            state.next_segment_id += 1;
            id
        };
        SegmentBuilder::new(&segment_path(&self.dir, id), id, self.block_size, self.bloom_bits_per_key)
    }

    /// Open a finished segment for reading
    pub fn open_reader(&self, meta: &SegmentMeta) -> Result<Arc<SegmentReader>> {
        Ok(Arc::new(SegmentReader::open(&segment_path(&self.dir, meta.id), meta.id)?))
    }

    /// Flush a MemTable to a new segment
    ///
    /// `flushed_lsn` becomes the WAL checkpoint once the segment is
    /// installed. An empty memtable only advances the checkpoint.
    pub fn flush(&self, memtable: &Arc<MemTable>, flushed_lsn: u64) -> Result<Option<SegmentMeta>> {
        let built = self.build_segment(memtable)?;
        let meta = built.as_ref().map(|(meta, _)| meta.clone());
        self.install_flushed(built, flushed_lsn)?;
        Ok(meta)
    }

    /// Write a memtable to a segment file without installing it
    ///
    /// Returns `None` for an empty memtable.
    pub fn build_segment(&self, memtable: &Arc<MemTable>) -> Result<Option<(SegmentMeta, Arc<SegmentReader>)>> {
        if memtable.is_empty() {
            return Ok(None);
        }

        let mut builder = self.new_builder()?;
        for (key, value) in memtable.scan_all() {
            if let Err(e) = builder.add(&key, &value) {
                builder.abandon();
                return Err(e);
            }
        }
        let meta = builder.finish()?;
        let reader = match self.open_reader(&meta) {
            Ok(reader) => reader,
            Err(e) => {
                let _ = fs::remove_file(segment_path(&self.dir, meta.id));
                return Err(e);
            }
        };
        debug!(segment = meta.id, entries = meta.entry_count, bytes = meta.file_size, "Flushed memtable");
        Ok(Some((meta, reader)))
    }

    /// Install a segment from [`build_segment`](Self::build_segment) and
    /// advance the WAL checkpoint
    ///
    /// The file is removed if the install fails.
    pub fn install_flushed(&self, built: Option<(SegmentMeta, Arc<SegmentReader>)>, flushed_lsn: u64) -> Result<()> {
        let id = built.as_ref().map(|(meta, _)| meta.id);
        let result = self.install(&[], built.into_iter().collect(), Some(flushed_lsn));
        if let (Err(_), Some(id)) = (&result, id) {
            let _ = fs::remove_file(segment_path(&self.dir, id));
        }
        result
    }

    /// Atomically replace `removed` segments with `added`
    ///
    /// The manifest is persisted before the in-memory list changes; if that
    /// fails nothing changes. Removed segments are deleted once no reader
    /// holds them.
    pub fn install(
        &self,
        removed: &[u64],
        added: Vec<(SegmentMeta, Arc<SegmentReader>)>,
        flushed_lsn: Option<u64>,
    ) -> Result<()> {
        let mut state = self.manifest.lock();

        if let Some(missing) = removed.iter().find(|id| !state.contains(**id)) {
            return Err(CellarError::Storage(format!(
                "segment {} is no longer live",
                missing
            )));
        }

        let mut next = state.clone();
        // Outputs take the place of the oldest input; flushes append
        let position = next
            .segments
            .iter()
            .position(|m| removed.contains(&m.id))
            .unwrap_or(next.segments.len());
        next.segments.retain(|m| !removed.contains(&m.id));
        for (offset, (meta, _)) in added.iter().enumerate() {
            next.segments.insert(position + offset, meta.clone());
        }
        if let Some(lsn) = flushed_lsn {
            next.flushed_lsn = next.flushed_lsn.max(lsn);
        }
        next.persist(&self.dir)?;
        *state = next;

        // Manifest is durable, swap the reader list
        let mut segments = self.segments.write();
        let mut readers: Vec<Arc<SegmentReader>> = Vec::with_capacity(state.segments.len());
        for meta in state.segments.iter().rev() {
            if let Some((_, r)) = added.iter().find(|(m, _)| m.id == meta.id) {
                readers.push(Arc::clone(r));
            } else if let Some(r) = segments.iter().find(|r| r.id() == meta.id) {
                readers.push(Arc::clone(r));
            }
        }
        for reader in segments.iter().filter(|r| removed.contains(&r.id())) {
            reader.mark_obsolete();
        }
        *segments = Arc::new(readers);
        Ok(())
    }

    /// Take a segment out of service after it failed verification
    ///
    /// Returns `false` if the segment was no longer live.
    pub fn quarantine(&self, id: u64, reason: &str) -> Result<bool> {
        let mut state = self.manifest.lock();
        if !state.contains(id) {
            return Ok(false);
        }

        let mut next = state.clone();
        next.segments.retain(|m| m.id != id);
        next.quarantined.push(id);
        next.persist(&self.dir)?;
        *state = next;

        let mut segments = self.segments.write();
        let remaining: Vec<_> = segments.iter().filter(|r| r.id() != id).cloned().collect();
        *segments = Arc::new(remaining);
        drop(segments);

        move_to_quarantine(&self.dir, id)?;
        warn!(segment = id, reason, dir = %self.dir.display(), "Segment quarantined");
        Ok(true)
    }

    /// WAL checkpoint covered by live segments
    pub fn flushed_lsn(&self) -> u64 {
        self.manifest.lock().flushed_lsn
    }

    /// Metadata of live segments, oldest first
    pub fn live_metas(&self) -> Vec<SegmentMeta> {
        self.manifest.lock().segments.clone()
    }

    /// IDs of quarantined segments
    pub fn quarantined(&self) -> Vec<u64> {
        self.manifest.lock().quarantined.clone()
    }

    /// Get the number of live segments
    pub fn segment_count(&self) -> usize {
        self.segments.read().len()
    }

    /// Total bytes of live segment files
    pub fn total_size(&self) -> u64 {
        self.manifest.lock().segments.iter().map(|m| m.file_size).sum()
    }

    /// Get the segment directory path
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

fn is_not_found(e: &CellarError) -> bool {
    matches!(e, CellarError::Io(io) if io.kind() == std::io::ErrorKind::NotFound)
}

fn move_to_quarantine(dir: &Path, id: u64) -> Result<()> {
    let source = segment_path(dir, id);
    if !source.exists() {
        return Ok(());
    }
    let target_dir = dir.join(QUARANTINE_DIR);
    fs::create_dir_all(&target_dir)?;
    let target = segment_path(&target_dir, id);
    fs::rename(&source, &target)?;
    sync_dir(dir)?;
    Ok(())
}

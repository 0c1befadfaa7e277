//! Table manifest
//!
//! Records which segments are live, the next segment ID and the WAL
//! checkpoint covered by segments. Rewritten atomically on every flush,
//! compaction and quarantine.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{CellarError, Result};
use crate::fsutil::{read_framed, write_framed};

use super::segment::SegmentMeta;

const MANIFEST_MAGIC: &[u8; 4] = b"CLMF";
const MANIFEST_VERSION: u16 = 1;
const MANIFEST_FILE: &str = "MANIFEST";

/// Persistent segment-set state of one table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestState {
    pub next_segment_id: u64,
    /// Every WAL entry with LSN <= this is contained in a live segment
    pub flushed_lsn: u64,
    /// Live segments, oldest first
    pub segments: Vec<SegmentMeta>,
    /// Segments moved aside after failing verification
    pub quarantined: Vec<u64>,
}

impl Default for ManifestState {
    fn default() -> Self {
        Self {
            next_segment_id: 1,
            flushed_lsn: 0,
            segments: Vec::new(),
            quarantined: Vec::new(),
        }
    }
}

impl ManifestState {
    pub fn path(dir: &Path) -> PathBuf {
        dir.join(MANIFEST_FILE)
    }

    /// Load from `dir`; a missing manifest yields the empty state
    pub fn load(dir: &Path) -> Result<Self> {
        match read_framed::<ManifestState>(&Self::path(dir), MANIFEST_MAGIC, MANIFEST_VERSION)? {
            None => Ok(Self::default()),
            Some(Ok(state)) => Ok(state),
            Some(Err(e)) => Err(CellarError::Storage(format!(
                "manifest {} unreadable: {}",
                Self::path(dir).display(),
                e
            ))),
        }
    }

    /// Atomically replace the manifest in `dir`
    pub fn persist(&self, dir: &Path) -> Result<()> {
        write_framed(&Self::path(dir), MANIFEST_MAGIC, MANIFEST_VERSION, self)
    }

    pub fn contains(&self, id: u64) -> bool {
        self.segments.iter().any(|m| m.id == id)
    }
}

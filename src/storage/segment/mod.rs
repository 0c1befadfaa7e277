//! Segment Module
//!
//! Immutable on-disk sorted run of cells, produced by flush or compaction.
//!
//! ## File Format
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │ Header (14 bytes)                                       │
//! │   Magic: "CLSG" (4) | Version: u16 (2) | Count: u64 (8) │
//! ├─────────────────────────────────────────────────────────┤
//! │ Data Blocks (~block_size each)                          │
//! │   [KeyLen: u32][ValLen: u32][Key][Value]                │
//! │   ... repeated for each entry ...                       │
//! │   (ValLen = u32::MAX means tombstone, no value bytes)   │
//! │   [BlockCRC: u32]                                       │
//! ├─────────────────────────────────────────────────────────┤
//! │ Index Block (one handle per data block)                 │
//! │   [KeyLen: u32][Offset: u64][Len: u32][FirstKey]        │
//! ├─────────────────────────────────────────────────────────┤
//! │ Bloom Block (row keys)                                  │
//! ├─────────────────────────────────────────────────────────┤
//! │ Footer (40 bytes)                                       │
//! │   IndexOffset: u64 | IndexLen: u64 | BloomOffset: u64   │
//! │   BloomLen: u64 | MetaCRC: u32 | Magic (4)              │
//! └─────────────────────────────────────────────────────────┘
//! ```
//! Keys are encoded with [`crate::encoding::encode_key`], so blocks and the
//! index are ordered by plain byte comparison.

mod builder;
mod iterator;
mod reader;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub use builder::SegmentBuilder;
pub use iterator::SegmentIterator;
pub use reader::SegmentReader;

// =============================================================================
// Shared Constants (used by builder, reader, iterator)
// =============================================================================

/// Magic bytes identifying a CellarDB segment file
pub(crate) const MAGIC: &[u8; 4] = b"CLSG";

/// Current segment format version
pub(crate) const VERSION: u16 = 1;

/// Header size: Magic (4) + Version (2) + EntryCount (8) = 14 bytes
pub(crate) const HEADER_SIZE: u64 = 14;

/// Footer size: 4 × u64 + MetaCRC (4) + Magic (4) = 40 bytes
pub(crate) const FOOTER_SIZE: u64 = 40;

/// Per-block CRC trailer
pub(crate) const BLOCK_TRAILER: u64 = 4;

/// Sentinel value indicating a tombstone
pub(crate) const TOMBSTONE_MARKER: u32 = u32::MAX;

/// Location of one data block
#[derive(Debug, Clone)]
pub(crate) struct BlockHandle {
    /// Encoded key of the first entry in the block
    pub first_key: Vec<u8>,
    pub offset: u64,
    /// Length including the CRC trailer
    pub len: u32,
}

// =============================================================================
// Segment Metadata
// =============================================================================

/// Segment descriptor, persisted in the table manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentMeta {
    pub id: u64,
    /// Number of cells (versions and tombstones)
    pub entry_count: u64,
    pub tombstone_count: u64,
    /// File size in bytes
    pub file_size: u64,
    /// Smallest row key (for range filtering)
    pub min_row: Vec<u8>,
    /// Largest row key (for range filtering)
    pub max_row: Vec<u8>,
    pub min_timestamp: u64,
    pub max_timestamp: u64,
}

/// "seg_000042.sst" for id 42
pub fn segment_path(dir: &Path, id: u64) -> PathBuf {
    dir.join(format!("seg_{:06}.sst", id))
}

/// Parse segment ID from filename
/// "seg_000042.sst" → Some(42)
pub fn parse_segment_id(path: &Path) -> Option<u64> {
    if path.extension()? != "sst" {
        return None;
    }
    let name = path.file_stem()?.to_string_lossy();
    name.strip_prefix("seg_")?.parse().ok()
}

//! Storage Module
//!
//! Persistent storage layer: immutable segments plus the manifest that
//! tracks which of them are live.
//!
//! ## Responsibilities
//! - Persist cells to disk in sorted, block-indexed segments
//! - Point lookups through Bloom filter and block index
//! - Range scans merged across memtables and segments
//! - Quarantine of segments that fail checksum verification
//!
//! See [`segment`] for the file format.

pub mod bloom;
mod manager;
mod manifest;
mod merge;
pub mod segment;

pub use bloom::BloomFilter;
pub use manager::{SegmentSnapshot, SegmentStore};
pub use manifest::ManifestState;
pub use merge::{CellIterator, MergeIterator};
pub use segment::{SegmentBuilder, SegmentIterator, SegmentMeta, SegmentReader};

//! MemTable Module
//!
//! In-memory data structure for recent writes.
//!
//! ## Responsibilities
//! - Fast reads and writes in memory
//! - Single-writer/multi-reader access pattern
//! - Track payload size for flush triggers
//! - Ordered, restartable iteration for flushes and scans
//!
//! ## Data Structure Choice
//! BTreeMap keyed by [`CellKey`](crate::encoding::CellKey) wrapped in RwLock:
//! - Ordered by row, family, qualifier, then newest timestamp first
//! - Every version is its own entry; tombstones are ordinary entries
//! - Readers filter by timestamp, so writes never block on scans

mod table;

pub use table::{MemTable, MemTableScan, ScanCursor};

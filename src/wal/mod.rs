//! Write-Ahead Log (WAL) Module
//!
//! Provides durability guarantees through append-only logging.
//!
//! ## Responsibilities
//! - Append mutation batches before they become visible
//! - CRC32 checksums for corruption detection
//! - Log Sequence Numbers (LSN) for ordering and flush checkpoints
//! - File rotation so flushed prefixes can be deleted
//! - Crash recovery and replay
//!
//! ## Directory Layout
//! ```text
//! wal/
//!   wal_00000000000000000001.log   (sealed, LSN 1..=41)
//!   wal_00000000000000000042.log   (active)
//! ```
//!
//! ## File Format
//! ```text
//! ┌─────────────────────────────────────────┐
//! │ Entry 1                                 │
//! │ ┌─────────┬─────────┬────────┬────────┐ │
//! │ │ LSN (8) │ CRC (4) │Len (4) │ Data   │ │
//! │ └─────────┴─────────┴────────┴────────┘ │
//! ├─────────────────────────────────────────┤
//! │ Entry 2                                 │
//! │ ┌─────────┬─────────┬────────┬────────┐ │
//! │ │ LSN (8) │ CRC (4) │Len (4) │ Data   │ │
//! │ └─────────┴─────────┴────────┴────────┘ │
//! └─────────────────────────────────────────┘
//! ```
//! Data is the bincode-encoded batch (timestamp + operations).

mod entry;
mod reader;
mod recovery;
mod writer;

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::Result;

pub use entry::{Operation, WalEntry, HEADER_SIZE};
pub use reader::{WalIterator, WalReader, WalRecord};
pub use recovery::{RecoveryResult, WalRecovery};
pub use writer::WalWriter;

/// Path of the log file whose first entry is `first_lsn`
pub fn log_file_path(dir: &Path, first_lsn: u64) -> PathBuf {
    dir.join(format!("wal_{:020}.log", first_lsn))
}

/// Parse the first LSN from a log file name
/// "wal_00000000000000000042.log" → Some(42)
fn parse_log_file(path: &Path) -> Option<u64> {
    if path.extension()? != "log" {
        return None;
    }
    let name = path.file_stem()?.to_string_lossy();
    name.strip_prefix("wal_")?.parse().ok()
}

/// All log files of a directory, ordered by first LSN
pub fn list_log_files(dir: &Path) -> Result<Vec<(u64, PathBuf)>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() {
            if let Some(lsn) = parse_log_file(&path) {
                files.push((lsn, path));
            }
        }
    }
    files.sort_by_key(|(lsn, _)| *lsn);
    Ok(files)
}

//! WAL Recovery
//!
//! Handles crash recovery by replaying the WAL directory.

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};

use crate::error::Result;

use super::reader::{WalReader, WalRecord};
use super::{list_log_files, WalEntry};

/// Handles WAL recovery after crash
pub struct WalRecovery;

/// Result of a recovery operation
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryResult {
    /// Number of entries returned for replay
    pub entries_recovered: u64,

    /// Number of corrupted entries skipped
    pub entries_corrupted: u64,

    /// Valid entries at or below the checkpoint (already in segments)
    pub entries_skipped: u64,

    /// Last valid LSN
    pub last_lsn: u64,

    /// Whether a file ended in a damaged record (removed when repairing)
    pub was_truncated: bool,

    /// Files after a break in the LSN sequence that were not replayed
    pub files_set_aside: u64,
}

impl WalRecovery {
    /// Recover entries newer than `checkpoint_lsn` from a WAL directory
    ///
    /// This will:
    /// 1. Read every log file in LSN order
    /// 2. Detect and skip corrupted entries
    /// 3. Truncate damaged tails
    /// 4. Set aside files that follow a gap in the LSN sequence
    /// 5. Return all valid entries in order
    pub fn recover(dir: &Path, checkpoint_lsn: u64) -> Result<(Vec<WalEntry>, RecoveryResult)> {
        Self::scan(dir, checkpoint_lsn, true)
    }

    /// Verify integrity of a WAL directory without modifying it
    pub fn verify(dir: &Path) -> Result<RecoveryResult> {
        let (_, result) = Self::scan(dir, 0, false)?;
        Ok(result)
    }

    fn scan(dir: &Path, checkpoint_lsn: u64, repair: bool) -> Result<(Vec<WalEntry>, RecoveryResult)> {
        let mut entries = Vec::new();
        let mut result = RecoveryResult::default();

        if !dir.exists() {
            return Ok((entries, result));
        }

        let files = list_log_files(dir)?;
        let mut seen_any = false;

        for (i, (first_lsn, path)) in files.iter().enumerate() {
            // A gap means the entries in between are gone; later files cannot be applied in order
            if seen_any && *first_lsn != result.last_lsn + 1 {
                tracing::warn!(
                    wal = %path.display(),
                    expected_lsn = result.last_lsn + 1,
                    found_lsn = first_lsn,
                    "WAL sequence gap, setting remaining files aside"
                );
                if repair {
                    for (_, rest) in &files[i..] {
                        set_aside(rest)?;
                    }
                }
                result.files_set_aside = (files.len() - i) as u64;
                break;
            }

            let mut reader = WalReader::open(path)?;
            loop {
                match reader.next_record()? {
                    None => break,
                    Some(WalRecord::Entry(entry)) => {
                        if result.last_lsn != 0 && entry.lsn <= result.last_lsn {
                            tracing::warn!(lsn = entry.lsn, "Out-of-order WAL entry ignored");
                            continue;
                        }
                        result.last_lsn = entry.lsn;
                        if entry.lsn <= checkpoint_lsn {
                            result.entries_skipped += 1;
                        } else {
                            result.entries_recovered += 1;
                            entries.push(entry);
                        }
                    }
                    Some(damage) => {
                        if let WalRecord::Corrupt { lsn } = damage {
                            tracing::warn!(wal = %path.display(), lsn, "Corrupt WAL entry");
                            result.entries_corrupted += 1;
                        }
                        result.was_truncated = true;
                        if repair {
                            truncate_at(path, reader.valid_offset())?;
                        }
                        break;
                    }
                }
            }
            // Empty files still anchor the sequence at their first LSN
            if !seen_any && result.last_lsn == 0 {
                result.last_lsn = first_lsn.saturating_sub(1);
            }
            seen_any = true;
        }

        Ok((entries, result))
    }
}

fn truncate_at(path: &Path, offset: u64) -> Result<()> {
    let file = OpenOptions::new().write(true).open(path)?;
    file.set_len(offset)?;
    file.sync_all()?;
    tracing::warn!(wal = %path.display(), offset, "Truncated damaged WAL tail");
    Ok(())
}

fn set_aside(path: &Path) -> Result<()> {
    let mut target = PathBuf::from(path);
    target.set_extension("orphan");
    fs::rename(path, &target)?;
    Ok(())
}

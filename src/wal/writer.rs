//! WAL Writer
//!
//! Handles appending entries to the active WAL file and rotating files.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::config::WalSyncStrategy;
use crate::error::Result;

use super::{list_log_files, log_file_path, Operation, WalEntry};

/// Writes entries to the newest file of a WAL directory
pub struct WalWriter {
    /// Directory holding every log file of the table
    dir: PathBuf,
    /// Path of the file currently appended to
    path: PathBuf,
    writer: BufWriter<File>,
    /// First LSN stored in the current file
    file_first_lsn: u64,
    /// LSN assigned to the next append
    next_lsn: u64,
    sync_strategy: WalSyncStrategy,
    /// Entries written since the last fsync
    uncommitted: usize,
    /// When the oldest unsynced entry was written
    unsynced_since: Option<Instant>,
}

impl WalWriter {
    /// Open (or create) the log file that starts at `next_lsn`
    pub fn open(dir: &Path, next_lsn: u64, sync_strategy: WalSyncStrategy) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let next_lsn = next_lsn.max(1);
        let path = log_file_path(dir, next_lsn);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        Ok(Self {
            dir: dir.to_path_buf(),
            path,
            writer: BufWriter::new(file),
            file_first_lsn: next_lsn,
            next_lsn,
            sync_strategy,
            uncommitted: 0,
            unsynced_since: None,
        })
    }

    /// Append a batch to the WAL, returning its LSN
    ///
    /// The entry always reaches the OS before this returns, so it survives
    /// a process crash. It is fsynced per the sync strategy.
    pub fn append(&mut self, timestamp: u64, operations: &[Operation]) -> Result<u64> {
        let lsn = self.next_lsn;
        let bytes = WalEntry::encode(lsn, timestamp, operations)?;
        self.writer.write_all(&bytes)?;
        self.writer.flush()?;
        self.next_lsn += 1;
        self.uncommitted += 1;
        let since = *self.unsynced_since.get_or_insert_with(Instant::now);

        let due = match self.sync_strategy {
            WalSyncStrategy::EveryWrite => true,
            WalSyncStrategy::EveryNEntries { count } => self.uncommitted >= count,
            WalSyncStrategy::EveryInterval { interval } => since.elapsed() >= interval,
        };
        if due {
            self.sync()?;
        }

        Ok(lsn)
    }

    /// Force sync to disk
    pub fn sync(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;
        self.uncommitted = 0;
        self.unsynced_since = None;
        Ok(())
    }

    /// fsync if the oldest unsynced entry is at least `max_age` old
    ///
    /// Returns whether a sync happened.
    pub fn sync_if_older_than(&mut self, max_age: Duration) -> Result<bool> {
        match self.unsynced_since {
            Some(since) if since.elapsed() >= max_age => {
                self.sync()?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Seal the current file and continue in a new one
    ///
    /// Returns the last LSN written before the rotation. A file with no
    /// entries is kept as the active file.
    pub fn rotate(&mut self) -> Result<u64> {
        self.sync()?;
        if self.next_lsn == self.file_first_lsn {
            return Ok(self.last_lsn());
        }

        let path = log_file_path(&self.dir, self.next_lsn);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        self.writer = BufWriter::new(file);
        self.path = path;
        self.file_first_lsn = self.next_lsn;

        tracing::debug!(wal = %self.path.display(), first_lsn = self.file_first_lsn, "Rotated WAL");
        Ok(self.last_lsn())
    }

    /// Delete sealed files whose entries are all at or below `checkpoint_lsn`
    ///
    /// Returns the number of files removed.
    pub fn remove_obsolete(&self, checkpoint_lsn: u64) -> Result<usize> {
        let files = list_log_files(&self.dir)?;
        let mut removed = 0;

        for (i, (first_lsn, path)) in files.iter().enumerate() {
            if *first_lsn >= self.file_first_lsn {
                break;
            }
            // A sealed file ends right before the next file starts
            let next_first = files
                .get(i + 1)
                .map(|(lsn, _)| *lsn)
                .unwrap_or(self.file_first_lsn);
            if next_first.saturating_sub(1) <= checkpoint_lsn {
                fs::remove_file(path)?;
                removed += 1;
            }
        }

        if removed > 0 {
            tracing::debug!(removed, checkpoint_lsn, "Removed obsolete WAL files");
        }
        Ok(removed)
    }

    /// Get the LSN the next append will receive
    pub fn current_lsn(&self) -> u64 {
        self.next_lsn
    }

    /// Get the LSN of the newest appended entry (0 if none)
    pub fn last_lsn(&self) -> u64 {
        self.next_lsn - 1
    }

    /// Entries written but not yet fsynced
    pub fn uncommitted_count(&self) -> usize {
        self.uncommitted
    }

    /// Path of the file currently appended to
    pub fn path(&self) -> &Path {
        &self.path
    }
}

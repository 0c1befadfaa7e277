//! WAL Reader
//!
//! Handles reading entries from a single WAL file.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use crate::error::{CellarError, Result};

use super::entry::{parse_header, MAX_PAYLOAD_SIZE};
use super::{WalEntry, HEADER_SIZE};

/// Outcome of reading one record
#[derive(Debug)]
pub enum WalRecord {
    /// A complete, checksummed entry
    Entry(WalEntry),

    /// The file ends inside a record (interrupted append)
    TornTail,

    /// A complete record whose checksum or payload is invalid
    Corrupt { lsn: u64 },
}

/// Reads entries from one WAL file
pub struct WalReader {
    path: PathBuf,
    file: BufReader<File>,
    file_len: u64,
    /// Offset right after the last valid record
    position: u64,
}

impl WalReader {
    /// Open a WAL file for reading
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let file_len = file.metadata()?.len();
        Ok(Self {
            path: path.to_path_buf(),
            file: BufReader::new(file),
            file_len,
            position: 0,
        })
    }

    /// Read the next record, or `None` at a clean end of file
    ///
    /// After `TornTail` or `Corrupt` the reader must not be used further.
    pub fn next_record(&mut self) -> Result<Option<WalRecord>> {
        let remaining = self.file_len - self.position;
        if remaining == 0 {
            return Ok(None);
        }
        if remaining < HEADER_SIZE as u64 {
            return Ok(Some(WalRecord::TornTail));
        }

        let mut header = [0u8; HEADER_SIZE];
        self.file.read_exact(&mut header)?;
        let (lsn, crc, len) = parse_header(&header);

        if len > MAX_PAYLOAD_SIZE || (len as u64) > remaining - HEADER_SIZE as u64 {
            return Ok(Some(WalRecord::TornTail));
        }

        let mut data = vec![0u8; len as usize];
        self.file.read_exact(&mut data)?;

        match WalEntry::from_payload(lsn, crc, &data) {
            Ok(entry) => {
                self.position += HEADER_SIZE as u64 + len as u64;
                Ok(Some(WalRecord::Entry(entry)))
            }
            Err(CellarError::WalCorruption(_)) => Ok(Some(WalRecord::Corrupt { lsn })),
            Err(e) => Err(e),
        }
    }

    /// Offset right after the last valid record
    pub fn valid_offset(&self) -> u64 {
        self.position
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Iterate over valid entries, stopping at the first damaged record
    pub fn entries(self) -> WalIterator {
        WalIterator {
            reader: self,
            done: false,
        }
    }
}

/// Iterator over WAL entries
pub struct WalIterator {
    reader: WalReader,
    done: bool,
}

impl Iterator for WalIterator {
    type Item = Result<WalEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.reader.next_record() {
            Ok(Some(WalRecord::Entry(entry))) => Some(Ok(entry)),
            Ok(Some(WalRecord::Corrupt { lsn })) => {
                self.done = true;
                Some(Err(CellarError::WalCorruption(format!(
                    "CRC mismatch in entry {} of {}",
                    lsn,
                    self.reader.path.display()
                ))))
            }
            Ok(Some(WalRecord::TornTail)) | Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

//! WAL Entry definitions
//!
//! Defines the structure of individual WAL log entries.

use serde::{Deserialize, Serialize};

use crate::encoding::{CellKey, CellValue};
use crate::error::{CellarError, Result};

/// Entry header: LSN (8) + CRC (4) + Len (4)
pub const HEADER_SIZE: usize = 16;

/// Upper bound on a single payload; larger lengths are treated as garbage
pub(crate) const MAX_PAYLOAD_SIZE: u32 = 256 * 1024 * 1024;

/// A single entry in the WAL: one atomically applied mutation batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalEntry {
    /// Log Sequence Number - monotonically increasing
    pub lsn: u64,

    /// Cell timestamp shared by every operation in the batch
    pub timestamp: u64,

    /// The operations to apply
    pub operations: Vec<Operation>,
}

/// Operations that can be logged
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    /// Write a cell value
    Put {
        row: Vec<u8>,
        family: String,
        qualifier: Vec<u8>,
        value: Vec<u8>,
    },

    /// Write a tombstone for a column
    Delete {
        row: Vec<u8>,
        family: String,
        qualifier: Vec<u8>,
    },
}

impl Operation {
    pub fn family(&self) -> &str {
        match self {
            Operation::Put { family, .. } | Operation::Delete { family, .. } => family,
        }
    }

    pub fn row(&self) -> &[u8] {
        match self {
            Operation::Put { row, .. } | Operation::Delete { row, .. } => row,
        }
    }

    /// Materialize the operation as a cell version at `timestamp`
    pub fn to_cell(&self, timestamp: u64) -> (CellKey, CellValue) {
        match self {
            Operation::Put {
                row,
                family,
                qualifier,
                value,
            } => (
                CellKey::new(row.clone(), family.clone(), qualifier.clone(), timestamp),
                CellValue::Put(value.clone()),
            ),
            Operation::Delete {
                row,
                family,
                qualifier,
            } => (
                CellKey::new(row.clone(), family.clone(), qualifier.clone(), timestamp),
                CellValue::Tombstone,
            ),
        }
    }
}

#[derive(Serialize)]
struct PayloadRef<'a> {
    timestamp: u64,
    operations: &'a [Operation],
}

#[derive(Deserialize)]
struct Payload {
    timestamp: u64,
    operations: Vec<Operation>,
}

impl WalEntry {
    pub fn new(lsn: u64, timestamp: u64, operations: Vec<Operation>) -> Self {
        Self {
            lsn,
            timestamp,
            operations,
        }
    }

    /// Frame a batch without taking ownership of it
    pub fn encode(lsn: u64, timestamp: u64, operations: &[Operation]) -> Result<Vec<u8>> {
        let data = bincode::serialize(&PayloadRef {
            timestamp,
            operations,
        })?;
        if data.len() > MAX_PAYLOAD_SIZE as usize {
            return Err(CellarError::WalWrite(format!(
                "batch of {} bytes exceeds the {} byte limit",
                data.len(),
                MAX_PAYLOAD_SIZE
            )));
        }

        let mut out = Vec::with_capacity(HEADER_SIZE + data.len());
        out.extend_from_slice(&lsn.to_le_bytes());
        out.extend_from_slice(&checksum(lsn, &data).to_le_bytes());
        out.extend_from_slice(&(data.len() as u32).to_le_bytes());
        out.extend_from_slice(&data);
        Ok(out)
    }

    /// Serialize to `[LSN][CRC][Len][payload]`
    pub fn serialize(&self) -> Result<Vec<u8>> {
        Self::encode(self.lsn, self.timestamp, &self.operations)
    }

    /// Deserialize one complete entry, validating length and CRC
    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(CellarError::WalCorruption(format!(
                "entry too short: {} bytes",
                bytes.len()
            )));
        }
        let mut header = [0u8; HEADER_SIZE];
        header.copy_from_slice(&bytes[..HEADER_SIZE]);
        let (lsn, crc, len) = parse_header(&header);

        let data = &bytes[HEADER_SIZE..];
        if data.len() != len as usize {
            return Err(CellarError::WalCorruption(format!(
                "entry {} declares {} payload bytes, found {}",
                lsn,
                len,
                data.len()
            )));
        }
        Self::from_payload(lsn, crc, data)
    }

    /// Validate and decode a payload whose header was already parsed
    pub(crate) fn from_payload(lsn: u64, crc: u32, data: &[u8]) -> Result<Self> {
        if checksum(lsn, data) != crc {
            return Err(CellarError::WalCorruption(format!(
                "CRC mismatch in entry {}",
                lsn
            )));
        }
        let payload: Payload = bincode::deserialize(data)
            .map_err(|e| CellarError::WalCorruption(format!("entry {}: {}", lsn, e)))?;

        Ok(Self {
            lsn,
            timestamp: payload.timestamp,
            operations: payload.operations,
        })
    }
}

/// Split a header into (lsn, crc, payload length)
pub(crate) fn parse_header(header: &[u8; HEADER_SIZE]) -> (u64, u32, u32) {
    let mut lsn = [0u8; 8];
    let mut crc = [0u8; 4];
    let mut len = [0u8; 4];
    lsn.copy_from_slice(&header[0..8]);
    crc.copy_from_slice(&header[8..12]);
    len.copy_from_slice(&header[12..16]);
    (
        u64::from_le_bytes(lsn),
        u32::from_le_bytes(crc),
        u32::from_le_bytes(len),
    )
}

/// CRC over the LSN and payload, so a record moved to another position fails too
fn checksum(lsn: u64, data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&lsn.to_le_bytes());
    hasher.update(data);
    hasher.finalize()
}

//! Encoding Module
//!
//! Cell types and the sortable on-disk key format.
//!
//! ## Key Format
//! ```text
//! ┌──────────────┬──────────────┬──────────────┬───────────────────────┐
//! │ row (esc)    │ family (esc) │ qualifier    │ !timestamp (8, BE)    │
//! │ .. 0x00 0x00 │ .. 0x00 0x00 │ .. 0x00 0x00 │                       │
//! └──────────────┴──────────────┴──────────────┴───────────────────────┘
//! ```
//! Each component escapes `0x00` as `0x00 0xFF` and ends with `0x00 0x00`,
//! so byte-wise comparison of encoded keys orders by row, family and
//! qualifier ascending. The timestamp is stored inverted, so newer versions
//! of a column sort first.

use std::cmp::Ordering;

use bytes::BufMut;

use crate::error::{CellarError, Result};

const ESCAPE: u8 = 0x00;
const ESCAPED_NUL: u8 = 0xFF;
const TERMINATOR: [u8; 2] = [0x00, 0x00];
const TIMESTAMP_LEN: usize = 8;

// =============================================================================
// Cell Types
// =============================================================================

/// Coordinates of one cell version
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CellKey {
    pub row: Vec<u8>,
    pub family: String,
    pub qualifier: Vec<u8>,
    pub timestamp: u64,
}

impl CellKey {
    pub fn new(
        row: impl Into<Vec<u8>>,
        family: impl Into<String>,
        qualifier: impl Into<Vec<u8>>,
        timestamp: u64,
    ) -> Self {
        Self {
            row: row.into(),
            family: family.into(),
            qualifier: qualifier.into(),
            timestamp,
        }
    }

    /// Smallest possible key of `row`
    pub fn row_start(row: &[u8]) -> Self {
        Self {
            row: row.to_vec(),
            family: String::new(),
            qualifier: Vec::new(),
            timestamp: u64::MAX,
        }
    }

    /// True when both keys address the same column (timestamps ignored)
    pub fn same_column(&self, other: &CellKey) -> bool {
        self.row == other.row && self.family == other.family && self.qualifier == other.qualifier
    }

    /// Rough in-memory footprint used for flush accounting
    pub fn payload_size(&self) -> usize {
        self.row.len() + self.family.len() + self.qualifier.len() + TIMESTAMP_LEN
    }
}

impl Ord for CellKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.row
            .cmp(&other.row)
            .then_with(|| self.family.as_bytes().cmp(other.family.as_bytes()))
            .then_with(|| self.qualifier.cmp(&other.qualifier))
            .then_with(|| other.timestamp.cmp(&self.timestamp))
    }
}

impl PartialOrd for CellKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Payload of one cell version
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CellValue {
    /// A live value
    Put(Vec<u8>),

    /// A delete marker masking this and all older versions
    Tombstone,
}

impl CellValue {
    pub fn is_tombstone(&self) -> bool {
        matches!(self, CellValue::Tombstone)
    }

    pub fn payload_size(&self) -> usize {
        match self {
            CellValue::Put(v) => v.len(),
            CellValue::Tombstone => 0,
        }
    }
}

/// A visible cell returned by reads
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cell {
    pub row: Vec<u8>,
    pub family: String,
    pub qualifier: Vec<u8>,
    pub timestamp: u64,
    pub value: Vec<u8>,
}

impl Cell {
    pub(crate) fn from_parts(key: CellKey, value: Vec<u8>) -> Self {
        Self {
            row: key.row,
            family: key.family,
            qualifier: key.qualifier,
            timestamp: key.timestamp,
            value,
        }
    }
}

// =============================================================================
// Encoding
// =============================================================================

fn put_component(buf: &mut Vec<u8>, component: &[u8]) {
    for &b in component {
        if b == ESCAPE {
            buf.put_u8(ESCAPE);
            buf.put_u8(ESCAPED_NUL);
        } else {
            buf.put_u8(b);
        }
    }
    buf.put_slice(&TERMINATOR);
}

/// Encode everything but the timestamp: the shared prefix of all versions of a column
pub fn encode_column_prefix(row: &[u8], family: &str, qualifier: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(row.len() + family.len() + qualifier.len() + 6 + TIMESTAMP_LEN);
    put_component(&mut buf, row);
    put_component(&mut buf, family.as_bytes());
    put_component(&mut buf, qualifier);
    buf
}

/// Encode a full key
pub fn encode_key(key: &CellKey) -> Vec<u8> {
    let mut buf = encode_column_prefix(&key.row, &key.family, &key.qualifier);
    buf.put_u64(u64::MAX - key.timestamp);
    buf
}

/// Seek key for the newest version of a column visible at `read_ts`
pub fn encode_seek(row: &[u8], family: &str, qualifier: &[u8], read_ts: u64) -> Vec<u8> {
    let mut buf = encode_column_prefix(row, family, qualifier);
    buf.put_u64(u64::MAX - read_ts);
    buf
}

/// Encoded lower bound of every key of `row`
pub fn encode_row_start(row: &[u8]) -> Vec<u8> {
    encode_key(&CellKey::row_start(row))
}

/// Split off one escaped component, returning it and the remaining input
fn take_component(input: &[u8]) -> Result<(Vec<u8>, &[u8])> {
    let mut out = Vec::new();
    let mut i = 0;
    while i < input.len() {
        let b = input[i];
        if b != ESCAPE {
            out.push(b);
            i += 1;
            continue;
        }
        match input.get(i + 1) {
            Some(&0x00) => return Ok((out, &input[i + 2..])),
            Some(&ESCAPED_NUL) => {
                out.push(0x00);
                i += 2;
            }
            _ => {
                return Err(CellarError::Serialization(
                    "malformed key component escape".to_string(),
                ))
            }
        }
    }
    Err(CellarError::Serialization("unterminated key component".to_string()))
}

/// Decode a full key produced by [`encode_key`]
pub fn decode_key(bytes: &[u8]) -> Result<CellKey> {
    let (row, rest) = take_component(bytes)?;
    let (family, rest) = take_component(rest)?;
    let (qualifier, rest) = take_component(rest)?;

    if rest.len() != TIMESTAMP_LEN {
        return Err(CellarError::Serialization(format!(
            "expected {} timestamp bytes, found {}",
            TIMESTAMP_LEN,
            rest.len()
        )));
    }
    let mut ts = [0u8; TIMESTAMP_LEN];
    ts.copy_from_slice(rest);
    let family = String::from_utf8(family)
        .map_err(|e| CellarError::Serialization(format!("family is not UTF-8: {}", e)))?;

    Ok(CellKey {
        row,
        family,
        qualifier,
        timestamp: u64::MAX - u64::from_be_bytes(ts),
    })
}

/// Decode only the row component of an encoded key
pub fn decode_row(bytes: &[u8]) -> Result<Vec<u8>> {
    take_component(bytes).map(|(row, _)| row)
}

//! Segment Reader
//!
//! Point lookups and block reads against one immutable segment file.

use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::encoding::{decode_key, encode_column_prefix, encode_seek, CellKey, CellValue};
use crate::error::{CellarError, Result};
use crate::storage::bloom::BloomFilter;

use super::{BlockHandle, SegmentIterator, BLOCK_TRAILER, FOOTER_SIZE, HEADER_SIZE, MAGIC, TOMBSTONE_MARKER, VERSION};

/// Raw entry as stored in a block: encoded key and value (`None` = tombstone)
pub(crate) type RawEntry = (Vec<u8>, Option<Vec<u8>>);

/// Reader for a single segment
///
/// The block index and Bloom filter stay in memory; data blocks are read on
/// demand and checksummed on every read.
pub struct SegmentReader {
    id: u64,
    path: PathBuf,
    file: Mutex<File>,
    index: Vec<BlockHandle>,
    bloom: BloomFilter,
    entry_count: u64,
    file_size: u64,
    /// Set once the segment is replaced; the file is removed on last drop
    obsolete: AtomicBool,
}

impl SegmentReader {
    /// Open a segment and load its index and Bloom filter
    ///
    /// Any structural problem is reported as [`CellarError::CorruptSegment`].
    pub fn open(path: &Path, id: u64) -> Result<Self> {
        let mut file = File::open(path)?;
        let file_size = file.metadata()?.len();
        let corrupt = |reason: &str| CellarError::corrupt_segment(id, reason);

        if file_size < HEADER_SIZE + FOOTER_SIZE {
            return Err(corrupt("file too small"));
        }

        let mut header = [0u8; HEADER_SIZE as usize];
        file.read_exact(&mut header)?;
        if &header[0..4] != MAGIC {
            return Err(corrupt("bad header magic"));
        }
        let version = u16::from_le_bytes([header[4], header[5]]);
        if version != VERSION {
            return Err(corrupt(&format!("unsupported version {}", version)));
        }
        let entry_count = u64::from_le_bytes(read_array(&header[6..14]));

        let mut footer = [0u8; FOOTER_SIZE as usize];
        file.seek(SeekFrom::Start(file_size - FOOTER_SIZE))?;
        file.read_exact(&mut footer)?;
        if &footer[36..40] != MAGIC {
            return Err(corrupt("bad footer magic"));
        }
        let index_offset = u64::from_le_bytes(read_array(&footer[0..8]));
        let index_len = u64::from_le_bytes(read_array(&footer[8..16]));
        let bloom_offset = u64::from_le_bytes(read_array(&footer[16..24]));
        let bloom_len = u64::from_le_bytes(read_array(&footer[24..32]));
        let meta_crc = u32::from_le_bytes(read_array(&footer[32..36]));

        let meta_end = file_size - FOOTER_SIZE;
        if index_offset < HEADER_SIZE
            || bloom_offset != index_offset.saturating_add(index_len)
            || bloom_offset.saturating_add(bloom_len) != meta_end
        {
            return Err(corrupt("footer offsets out of range"));
        }

        let mut meta = vec![0u8; (index_len + bloom_len) as usize];
        file.seek(SeekFrom::Start(index_offset))?;
        file.read_exact(&mut meta)?;
        if crc32fast::hash(&meta) != meta_crc {
            return Err(corrupt("index checksum mismatch"));
        }

        let (index_bytes, bloom_bytes) = meta.split_at(index_len as usize);
        let index = decode_index(index_bytes, index_offset).ok_or_else(|| corrupt("malformed block index"))?;
        let bloom = BloomFilter::decode(bloom_bytes).ok_or_else(|| corrupt("malformed bloom filter"))?;

        Ok(Self {
            id,
            path: path.to_path_buf(),
            file: Mutex::new(file),
            index,
            bloom,
            entry_count,
            file_size,
            obsolete: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn entry_count(&self) -> u64 {
        self.entry_count
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub(crate) fn block_count(&self) -> usize {
        self.index.len()
    }

    /// Bloom check on the row key; `false` means the row is absent
    pub fn may_contain_row(&self, row: &[u8]) -> bool {
        self.bloom.may_contain(row)
    }

    /// Read and verify one data block
    pub(crate) fn read_block(&self, block: usize) -> Result<Vec<RawEntry>> {
        let handle = &self.index[block];
        let mut buf = vec![0u8; handle.len as usize];
        {
            let mut file = self.file.lock();
            file.seek(SeekFrom::Start(handle.offset))?;
            file.read_exact(&mut buf).map_err(|e| match e.kind() {
                std::io::ErrorKind::UnexpectedEof => {
                    CellarError::corrupt_segment(self.id, format!("block {} truncated", block))
                }
                _ => CellarError::Io(e),
            })?;
        }

        let data_len = buf.len() - BLOCK_TRAILER as usize;
        let stored_crc = u32::from_le_bytes(read_array(&buf[data_len..]));
        if crc32fast::hash(&buf[..data_len]) != stored_crc {
            return Err(CellarError::corrupt_segment(
                self.id,
                format!("block {} checksum mismatch", block),
            ));
        }
        decode_block(&buf[..data_len])
            .ok_or_else(|| CellarError::corrupt_segment(self.id, format!("block {} malformed", block)))
    }

    /// Index of the block where a scan for `seek` should start
    pub(crate) fn block_for(&self, seek: &[u8]) -> usize {
        self.index
            .partition_point(|h| h.first_key.as_slice() <= seek)
            .saturating_sub(1)
    }

    /// Newest version of a column with timestamp <= `read_ts`
    pub fn lookup(&self, row: &[u8], family: &str, qualifier: &[u8], read_ts: u64) -> Result<Option<(u64, CellValue)>> {
        Ok(self.versions_limited(row, family, qualifier, read_ts, 1)?.into_iter().next())
    }

    /// Every version of a column with timestamp <= `read_ts`, newest first
    pub fn versions(&self, row: &[u8], family: &str, qualifier: &[u8], read_ts: u64) -> Result<Vec<(u64, CellValue)>> {
        self.versions_limited(row, family, qualifier, read_ts, usize::MAX)
    }

    fn versions_limited(
        &self,
        row: &[u8],
        family: &str,
        qualifier: &[u8],
        read_ts: u64,
        limit: usize,
    ) -> Result<Vec<(u64, CellValue)>> {
        let mut found = Vec::new();
        if self.index.is_empty() || !self.may_contain_row(row) {
            return Ok(found);
        }

        let prefix = encode_column_prefix(row, family, qualifier);
        let seek = encode_seek(row, family, qualifier, read_ts);

        for block in self.block_for(&seek)..self.index.len() {
            for (key, value) in self.read_block(block)? {
                if key < seek {
                    continue;
                }
                if !is_version_of(&key, &prefix) {
                    return Ok(found);
                }
                let timestamp = decode_key(&key)
                    .map_err(|e| CellarError::corrupt_segment(self.id, e.to_string()))?
                    .timestamp;
                let value = match value {
                    Some(v) => CellValue::Put(v),
                    None => CellValue::Tombstone,
                };
                found.push((timestamp, value));
                if found.len() >= limit {
                    return Ok(found);
                }
            }
        }
        Ok(found)
    }

    /// Iterate entries with encoded key in `[start, end)`
    pub fn iter_range(self: &Arc<Self>, start: Option<Vec<u8>>, end: Option<Vec<u8>>) -> SegmentIterator {
        let first_block = start.as_deref().map(|s| self.block_for(s)).unwrap_or(0);
        SegmentIterator::new(Arc::clone(self), first_block, start, end)
    }

    /// Iterate every entry
    pub fn iter(self: &Arc<Self>) -> SegmentIterator {
        self.iter_range(None, None)
    }

    /// Decode every cell into memory (small segments and tests)
    pub fn read_all(self: &Arc<Self>) -> Result<Vec<(CellKey, CellValue)>> {
        self.iter().collect()
    }

    /// Delete the file once the last reference is dropped
    pub fn mark_obsolete(&self) {
        self.obsolete.store(true, Ordering::SeqCst);
    }

    pub fn is_obsolete(&self) -> bool {
        self.obsolete.load(Ordering::SeqCst)
    }
}

impl Drop for SegmentReader {
    fn drop(&mut self) {
        if self.obsolete.load(Ordering::SeqCst) {
            match fs::remove_file(&self.path) {
                Ok(()) => tracing::debug!(segment = self.id, "Removed obsolete segment file"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!(segment = self.id, error = %e, "Failed to remove obsolete segment"),
            }
        }
    }
}

impl std::fmt::Debug for SegmentReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentReader")
            .field("id", &self.id)
            .field("entries", &self.entry_count)
            .field("blocks", &self.index.len())
            .finish()
    }
}

/// A key is a version of the column when it is the prefix plus a timestamp
fn is_version_of(key: &[u8], prefix: &[u8]) -> bool {
    key.len() == prefix.len() + 8 && key.starts_with(prefix)
}

fn read_array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[..N]);
    out
}

fn decode_index(mut bytes: &[u8], data_end: u64) -> Option<Vec<BlockHandle>> {
    let mut index = Vec::new();
    while !bytes.is_empty() {
        if bytes.len() < 16 {
            return None;
        }
        let key_len = u32::from_le_bytes(read_array(&bytes[0..4])) as usize;
        let offset = u64::from_le_bytes(read_array(&bytes[4..12]));
        let len = u32::from_le_bytes(read_array(&bytes[12..16]));
        bytes = &bytes[16..];
        if bytes.len() < key_len
            || (len as u64) <= BLOCK_TRAILER
            || offset < HEADER_SIZE
            || offset + len as u64 > data_end
        {
            return None;
        }
        index.push(BlockHandle {
            first_key: bytes[..key_len].to_vec(),
            offset,
            len,
        });
        bytes = &bytes[key_len..];
    }
    Some(index)
}

fn decode_block(mut bytes: &[u8]) -> Option<Vec<RawEntry>> {
    let mut entries = Vec::new();
    while !bytes.is_empty() {
        if bytes.len() < 8 {
            return None;
        }
        let key_len = u32::from_le_bytes(read_array(&bytes[0..4])) as usize;
        let val_len = u32::from_le_bytes(read_array(&bytes[4..8]));
        bytes = &bytes[8..];
        if bytes.len() < key_len {
            return None;
        }
        let key = bytes[..key_len].to_vec();
        bytes = &bytes[key_len..];

        let value = if val_len == TOMBSTONE_MARKER {
            None
        } else {
            let val_len = val_len as usize;
            if bytes.len() < val_len {
                return None;
            }
            let value = bytes[..val_len].to_vec();
            bytes = &bytes[val_len..];
            Some(value)
        };
        entries.push((key, value));
    }
    Some(entries)
}

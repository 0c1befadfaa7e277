//! Segment Builder
//!
//! Writes sorted cells to a new segment file, block by block.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use bytes::{BufMut, BytesMut};

use crate::encoding::{encode_key, CellKey, CellValue};
use crate::error::Result;
use crate::storage::bloom::BloomFilter;
use crate::CellarError;

use super::{BlockHandle, SegmentMeta, BLOCK_TRAILER, HEADER_SIZE, MAGIC, TOMBSTONE_MARKER, VERSION};

/// Builder for creating new segments from sorted cells
pub struct SegmentBuilder {
    id: u64,
    /// Output file path
    path: PathBuf,
    /// Buffered writer for performance
    writer: BufWriter<File>,
    block_size: usize,
    bloom_bits_per_key: usize,
    /// Block being filled
    block: BytesMut,
    block_first_key: Option<Vec<u8>>,
    /// One handle per finished block
    index: Vec<BlockHandle>,
    /// Current write position
    current_offset: u64,
    /// Last encoded key, for order checking
    last_key: Option<Vec<u8>>,
    /// Distinct row keys for the Bloom filter
    rows: Vec<Vec<u8>>,
    entry_count: u64,
    tombstone_count: u64,
    min_timestamp: u64,
    max_timestamp: u64,
}

impl SegmentBuilder {
    /// Create a new segment builder
    ///
    /// Writes header immediately; call `add()` in key order, then `finish()`
    /// to write the index, Bloom filter and footer.
    pub fn new(path: &Path, id: u64, block_size: usize, bloom_bits_per_key: usize) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;

        let mut writer = BufWriter::new(file);

        // Write header (entry_count placeholder, will be updated in finish)
        writer.write_all(MAGIC)?;
        writer.write_all(&VERSION.to_le_bytes())?;
        writer.write_all(&0u64.to_le_bytes())?;

        Ok(Self {
            id,
            path: path.to_path_buf(),
            writer,
            block_size,
            bloom_bits_per_key,
            block: BytesMut::with_capacity(block_size + 256),
            block_first_key: None,
            index: Vec::new(),
            current_offset: HEADER_SIZE,
            last_key: None,
            rows: Vec::new(),
            entry_count: 0,
            tombstone_count: 0,
            min_timestamp: u64::MAX,
            max_timestamp: 0,
        })
    }

    /// Add a cell (must be called in ascending key order)
    pub fn add(&mut self, key: &CellKey, value: &CellValue) -> Result<()> {
        let encoded = encode_key(key);
        if let Some(last) = &self.last_key {
            if encoded <= *last {
                return Err(CellarError::Storage(format!(
                    "segment {}: keys added out of order",
                    self.id
                )));
            }
        }

        if self.rows.last().map(|r| r.as_slice()) != Some(key.row.as_slice()) {
            self.rows.push(key.row.clone());
        }
        self.min_timestamp = self.min_timestamp.min(key.timestamp);
        self.max_timestamp = self.max_timestamp.max(key.timestamp);

        if self.block_first_key.is_none() {
            self.block_first_key = Some(encoded.clone());
        }

        // Entry: [key_len(4)][val_len(4)][key][value]
        self.block.put_u32_le(encoded.len() as u32);
        match value {
            CellValue::Put(v) => {
                self.block.put_u32_le(v.len() as u32);
                self.block.put_slice(&encoded);
                self.block.put_slice(v);
            }
            CellValue::Tombstone => {
                self.block.put_u32_le(TOMBSTONE_MARKER);
                self.block.put_slice(&encoded);
                self.tombstone_count += 1;
            }
        }

        self.last_key = Some(encoded);
        self.entry_count += 1;

        if self.block.len() >= self.block_size {
            self.finish_block()?;
        }
        Ok(())
    }

    /// Write the pending block followed by its CRC
    fn finish_block(&mut self) -> Result<()> {
        let first_key = match self.block_first_key.take() {
            Some(key) => key,
            None => return Ok(()),
        };
        let crc = crc32fast::hash(&self.block);
        self.writer.write_all(&self.block)?;
        self.writer.write_all(&crc.to_le_bytes())?;

        let len = self.block.len() as u64 + BLOCK_TRAILER;
        self.index.push(BlockHandle {
            first_key,
            offset: self.current_offset,
            len: len as u32,
        });
        self.current_offset += len;
        self.block.clear();
        Ok(())
    }

    /// Bytes written so far plus the pending block
    pub fn estimated_size(&self) -> u64 {
        self.current_offset + self.block.len() as u64
    }

    pub fn entry_count(&self) -> u64 {
        self.entry_count
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Finish building: write index, Bloom filter, footer, and return metadata
    pub fn finish(mut self) -> Result<SegmentMeta> {
        self.finish_block()?;

        // Index block: [key_len(4)][offset(8)][len(4)][key] per data block
        let mut index = BytesMut::new();
        for handle in &self.index {
            index.put_u32_le(handle.first_key.len() as u32);
            index.put_u64_le(handle.offset);
            index.put_u32_le(handle.len);
            index.put_slice(&handle.first_key);
        }
        let bloom = BloomFilter::build(
            self.rows.iter().map(|r| r.as_slice()),
            self.rows.len(),
            self.bloom_bits_per_key,
        )
        .encode();

        let mut meta_hasher = crc32fast::Hasher::new();
        meta_hasher.update(&index);
        meta_hasher.update(&bloom);
        let meta_crc = meta_hasher.finalize();

        let index_offset = self.current_offset;
        let bloom_offset = index_offset + index.len() as u64;
        self.writer.write_all(&index)?;
        self.writer.write_all(&bloom)?;

        // Footer
        self.writer.write_all(&index_offset.to_le_bytes())?;
        self.writer.write_all(&(index.len() as u64).to_le_bytes())?;
        self.writer.write_all(&bloom_offset.to_le_bytes())?;
        self.writer.write_all(&(bloom.len() as u64).to_le_bytes())?;
        self.writer.write_all(&meta_crc.to_le_bytes())?;
        self.writer.write_all(MAGIC)?;
        self.writer.flush()?;

        // Seek back and update entry count in header
        let mut file = self.writer.into_inner().map_err(|e| {
            CellarError::Storage(format!("Failed to flush segment: {}", e))
        })?;
        file.seek(SeekFrom::Start(6))?; // After magic + version
        file.write_all(&self.entry_count.to_le_bytes())?;
        file.sync_all()?;

        let file_size = file.metadata()?.len();

        Ok(SegmentMeta {
            id: self.id,
            entry_count: self.entry_count,
            tombstone_count: self.tombstone_count,
            file_size,
            min_row: self.rows.first().cloned().unwrap_or_default(),
            max_row: self.rows.last().cloned().unwrap_or_default(),
            min_timestamp: if self.entry_count == 0 { 0 } else { self.min_timestamp },
            max_timestamp: self.max_timestamp,
        })
    }

    /// Discard a partially written segment
    pub fn abandon(self) {
        let path = self.path.clone();
        drop(self.writer);
        if let Err(e) = fs::remove_file(&path) {
            tracing::warn!(segment = %path.display(), error = %e, "Failed to remove abandoned segment");
        }
    }
}

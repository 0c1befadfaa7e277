//! Segment Iterator
//!
//! Streams cells out of a segment one block at a time.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::encoding::{decode_key, CellKey, CellValue};
use crate::error::{CellarError, Result};

use super::reader::RawEntry;
use super::SegmentReader;

/// Iterator over a key range of one segment
///
/// Holds an `Arc` to the reader, so the file outlives a concurrent
/// compaction that replaces it. A corrupt block ends iteration after one
/// `Err` item.
pub struct SegmentIterator {
    reader: Arc<SegmentReader>,
    next_block: usize,
    entries: VecDeque<RawEntry>,
    /// Skip keys below this (only matters inside the first block)
    start: Option<Vec<u8>>,
    /// Stop at the first key >= this
    end: Option<Vec<u8>>,
    done: bool,
}

impl SegmentIterator {
    pub(crate) fn new(reader: Arc<SegmentReader>, first_block: usize, start: Option<Vec<u8>>, end: Option<Vec<u8>>) -> Self {
        Self {
            reader,
            next_block: first_block,
            entries: VecDeque::new(),
            start,
            end,
            done: false,
        }
    }

    pub fn segment_id(&self) -> u64 {
        self.reader.id()
    }
}

impl Iterator for SegmentIterator {
    type Item = Result<(CellKey, CellValue)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done {
                return None;
            }

            if let Some((key, value)) = self.entries.pop_front() {
                if let Some(start) = &self.start {
                    if key < *start {
                        continue;
                    }
                    self.start = None;
                }
                if let Some(end) = &self.end {
                    if key >= *end {
                        self.done = true;
                        return None;
                    }
                }
                let decoded = match decode_key(&key) {
                    Ok(k) => k,
                    Err(e) => {
                        self.done = true;
                        return Some(Err(CellarError::corrupt_segment(self.reader.id(), e.to_string())));
                    }
                };
                let value = match value {
                    Some(v) => CellValue::Put(v),
                    None => CellValue::Tombstone,
                };
                return Some(Ok((decoded, value)));
            }

            if self.next_block >= self.reader.block_count() {
                self.done = true;
                return None;
            }
            match self.reader.read_block(self.next_block) {
                Ok(entries) => {
                    self.entries = entries.into();
                    self.next_block += 1;
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

//! K-way merge over sorted cell sources
//!
//! Sources are ordered newest first (memtables, then segments newest to
//! oldest). When two sources hold the exact same key only one entry is
//! yielded: a tombstone wins over a put, otherwise the newer source wins.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::encoding::{CellKey, CellValue};
use crate::error::Result;

/// Boxed sorted source of cells
pub type CellIterator = Box<dyn Iterator<Item = Result<(CellKey, CellValue)>> + Send>;

struct HeapEntry {
    key: CellKey,
    value: CellValue,
    source: usize,
    iterator: CellIterator,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    // BinaryHeap is a max-heap: reverse so the smallest key pops first
    fn cmp(&self, other: &Self) -> Ordering {
        self.key
            .cmp(&other.key)
            .then_with(|| other.value.is_tombstone().cmp(&self.value.is_tombstone()))
            .then_with(|| self.source.cmp(&other.source))
            .reverse()
    }
}

/// Merges sorted sources into one sorted, de-duplicated stream
///
/// A source that fails is dropped after its error is yielded; the caller
/// decides whether to continue with the remaining sources.
pub struct MergeIterator {
    heap: BinaryHeap<HeapEntry>,
    /// Errors pulled while refilling, yielded before the next entry
    pending_errors: Vec<crate::CellarError>,
    latest_key: Option<CellKey>,
}

impl MergeIterator {
    pub fn new(iterators: Vec<CellIterator>) -> Self {
        let mut merge = Self {
            heap: BinaryHeap::new(),
            pending_errors: Vec::new(),
            latest_key: None,
        };
        for (source, iterator) in iterators.into_iter().enumerate() {
            merge.advance(source, iterator);
        }
        merge
    }

    fn advance(&mut self, source: usize, mut iterator: CellIterator) {
        match iterator.next() {
            Some(Ok((key, value))) => self.heap.push(HeapEntry {
                key,
                value,
                source,
                iterator,
            }),
            Some(Err(e)) => self.pending_errors.push(e),
            None => {}
        }
    }
}

impl Iterator for MergeIterator {
    type Item = Result<(CellKey, CellValue)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(e) = self.pending_errors.pop() {
                return Some(Err(e));
            }
            let entry = self.heap.pop()?;
            let HeapEntry {
                key,
                value,
                source,
                iterator,
            } = entry;
            self.advance(source, iterator);

            if self.latest_key.as_ref() == Some(&key) {
                continue;
            }
            self.latest_key = Some(key.clone());
            return Some(Ok((key, value)));
        }
    }
}

//! Sparse, in-memory, density-gated `{logical index -> byte position}` map.
//!
//! One instance per segment. Entries are only recorded every `density`-th
//! record (or the first record of the segment), so a full scan over a
//! single segment starting at the nearest indexed entry is bounded by
//! `density`.
//!
//! Grounded on the floor-lookup semantics of the teacher's mmap-backed
//! `IndexFileMut::key_lookup`, reimplemented over a `BTreeMap` since this
//! index is purely in-memory (spec §4.3) rather than a separate on-disk
//! file.

use std::collections::BTreeMap;
use std::num::NonZeroU64;

#[derive(Debug)]
pub struct SegmentIndex {
    density: NonZeroU64,
    entries: BTreeMap<u64, u64>,
}

impl SegmentIndex {
    pub fn new(density: NonZeroU64) -> Self {
        Self {
            density,
            entries: BTreeMap::new(),
        }
    }

    /// Record `(index, position)` if `index` falls on a density boundary or
    /// the map is still empty (first record of the segment).
    pub fn index_record(&mut self, index: u64, position: u64) {
        if self.entries.is_empty() || index % self.density.get() == 0 {
            self.entries.insert(index, position);
        }
    }

    /// Greatest entry with key `<= target`, or `None`.
    pub fn lookup(&self, target: u64) -> Option<(u64, u64)> {
        self.entries
            .range(..=target)
            .next_back()
            .map(|(&index, &position)| (index, position))
    }

    /// Remove every entry with key `> index`.
    pub fn delete_after(&mut self, index: u64) {
        let tail: Vec<u64> = self.entries.range(index + 1..).map(|(&k, _)| k).collect();
        for key in tail {
            self.entries.remove(&key);
        }
    }

    /// Remove every entry with key `< index`.
    pub fn delete_until(&mut self, index: u64) {
        let head: Vec<u64> = self.entries.range(..index).map(|(&k, _)| k).collect();
        for key in head {
            self.entries.remove(&key);
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

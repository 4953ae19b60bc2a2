// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Bounded snapshot history: a ring of mapping-database dumps plus the saved
//! register context, most-recent on top. Pushing past capacity evicts the
//! oldest record, which is the moment its exclusively-held pages become
//! eligible for release.

use std::collections::VecDeque;

use crate::phys::FrameId;
use crate::types::{VirtAddr, SNAPSHOT_DEPTH};

/// One checkpoint: the dumped resident set and the saved registers.
#[derive(Clone)]
pub struct SnapshotRecord {
    /// Epoch this snapshot was taken at.
    pub epoch: u32,
    /// Address-ordered dump of the mapping database.
    pub entries: Vec<(VirtAddr, FrameId)>,
    /// Saved instruction pointer.
    pub ip: u64,
    /// Saved stack pointer.
    pub sp: u64,
}

/// Fixed-depth ring of snapshot records.
pub struct SnapshotStore {
    records: VecDeque<SnapshotRecord>,
}

impl SnapshotStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self { records: VecDeque::with_capacity(SNAPSHOT_DEPTH) }
    }

    /// Pushes a record, returning the evicted oldest one once the ring is
    /// full.
    pub fn push(&mut self, record: SnapshotRecord) -> Option<SnapshotRecord> {
        let evicted =
            if self.records.len() == SNAPSHOT_DEPTH { self.records.pop_front() } else { None };
        self.records.push_back(record);
        evicted
    }

    /// Epoch of the most recent record.
    pub fn top_epoch(&self) -> Option<u32> {
        self.records.back().map(|record| record.epoch)
    }

    /// Removes and returns the most recent record.
    pub fn pop_newest(&mut self) -> Option<SnapshotRecord> {
        self.records.pop_back()
    }

    /// The most recent record.
    pub fn newest(&self) -> Option<&SnapshotRecord> {
        self.records.back()
    }

    /// Finds the record taken at `epoch`.
    pub fn find(&self, epoch: u32) -> Option<&SnapshotRecord> {
        self.records.iter().find(|record| record.epoch == epoch)
    }

    /// True if a record for `epoch` is retained.
    pub fn contains_epoch(&self, epoch: u32) -> bool {
        self.find(epoch).is_some()
    }

    /// Iterates records oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &SnapshotRecord> {
        self.records.iter()
    }

    /// Number of retained records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True when no snapshot is retained.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Discards every record.
    pub fn clear(&mut self) {
        self.records.clear();
    }
}

impl Default for SnapshotStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(epoch: u32) -> SnapshotRecord {
        SnapshotRecord { epoch, entries: Vec::new(), ip: epoch as u64, sp: 0 }
    }

    #[test]
    fn evicts_oldest_past_capacity() {
        let mut store = SnapshotStore::new();
        for epoch in 1..=SNAPSHOT_DEPTH as u32 {
            assert!(store.push(record(epoch)).is_none());
        }
        let evicted = store.push(record(SNAPSHOT_DEPTH as u32 + 1)).unwrap();
        assert_eq!(evicted.epoch, 1);
        assert_eq!(store.len(), SNAPSHOT_DEPTH);
        assert!(!store.contains_epoch(1));
        assert_eq!(store.top_epoch(), Some(SNAPSHOT_DEPTH as u32 + 1));
    }

    #[test]
    fn find_by_epoch() {
        let mut store = SnapshotStore::new();
        store.push(record(1));
        store.push(record(2));
        assert_eq!(store.find(1).unwrap().ip, 1);
        assert!(store.find(3).is_none());
    }
}

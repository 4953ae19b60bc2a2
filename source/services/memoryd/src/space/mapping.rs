// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! The per-space mapping database: ordered map from page-aligned virtual
//! address to physical frame. At most one live entry per address.

use std::collections::BTreeMap;

use crate::error::{MemError, Result};
use crate::phys::FrameId;
use crate::types::VirtAddr;

/// The resident set of one address space.
#[derive(Default, Clone)]
pub struct MappingDb {
    entries: BTreeMap<VirtAddr, FrameId>,
}

impl MappingDb {
    /// Creates an empty database.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new resident mapping.
    ///
    /// Re-inserting the same frame at the same address is a no-op; a
    /// different frame at an occupied address is rejected.
    pub fn insert(&mut self, vaddr: VirtAddr, frame: FrameId) -> Result<()> {
        debug_assert!(vaddr.is_page_aligned());
        match self.entries.get(&vaddr) {
            Some(existing) if *existing == frame => Ok(()),
            Some(_) => Err(MemError::AlreadyExists),
            None => {
                self.entries.insert(vaddr, frame);
                Ok(())
            }
        }
    }

    /// Atomically swaps the frame at `vaddr`, returning the previous one.
    /// Used only by the copy-on-write breakout.
    pub fn replace(&mut self, vaddr: VirtAddr, frame: FrameId) -> Option<FrameId> {
        self.entries.insert(vaddr, frame)
    }

    /// Removes and returns the entry at `vaddr`.
    pub fn remove(&mut self, vaddr: VirtAddr) -> Option<FrameId> {
        self.entries.remove(&vaddr)
    }

    /// Looks up the frame registered at `vaddr`.
    pub fn lookup(&self, vaddr: VirtAddr) -> Option<FrameId> {
        self.entries.get(&vaddr).copied()
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no mapping is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates entries in address order.
    pub fn iter(&self) -> impl Iterator<Item = (VirtAddr, FrameId)> + '_ {
        self.entries.iter().map(|(va, frame)| (*va, *frame))
    }

    /// Copies the whole database out, address-ordered.
    pub fn dump(&self) -> Vec<(VirtAddr, FrameId)> {
        self.iter().collect()
    }

    /// Replaces the whole database (snapshot restore).
    pub fn install(&mut self, entries: Vec<(VirtAddr, FrameId)>) {
        self.entries = entries.into_iter().collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(index: u32) -> FrameId {
        FrameId::new(index, 0)
    }

    #[test]
    fn at_most_one_entry_per_address() {
        let mut db = MappingDb::new();
        let va = VirtAddr::new(0x4000);
        db.insert(va, frame(1)).unwrap();
        db.insert(va, frame(1)).unwrap();
        assert_eq!(db.insert(va, frame(2)).unwrap_err(), MemError::AlreadyExists);
        assert_eq!(db.len(), 1);
        db.remove(va).unwrap();
        db.insert(va, frame(2)).unwrap();
        assert_eq!(db.lookup(va), Some(frame(2)));
    }

    #[test]
    fn replace_returns_previous_frame() {
        let mut db = MappingDb::new();
        let va = VirtAddr::new(0x5000);
        assert_eq!(db.replace(va, frame(3)), None);
        assert_eq!(db.replace(va, frame(4)), Some(frame(3)));
        assert_eq!(db.lookup(va), Some(frame(4)));
    }

    #[test]
    fn dump_is_address_ordered() {
        let mut db = MappingDb::new();
        db.insert(VirtAddr::new(0x9000), frame(2)).unwrap();
        db.insert(VirtAddr::new(0x3000), frame(1)).unwrap();
        let dump = db.dump();
        assert_eq!(dump[0].0, VirtAddr::new(0x3000));
        assert_eq!(dump[1].0, VirtAddr::new(0x9000));
    }
}

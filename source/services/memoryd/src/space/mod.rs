// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Address-space objects: resident threads, mapping database,
//! snapshot/restore (checkpoint-rollback) with generation-based reclaim
//! OWNERS: @runtime
//! PUBLIC API: AddressSpace, SpaceRegistry, SpaceHandle
//! INVARIANTS: One live mapping per address; a snapshot-pinned page is never
//! released while any retained generation references it

pub mod mapping;
pub mod registry;
pub mod snapshot;

pub use mapping::MappingDb;
pub use registry::{SpaceHandle, SpaceRegistry};
pub use snapshot::{SnapshotRecord, SnapshotStore};

use std::collections::BTreeSet;

use nexus_mem_abi::Rights;

use crate::error::{MemError, Result};
use crate::kernel::KernelPort;
use crate::phys::{FrameId, PageAllocator, PageClass, PageState};
use crate::types::{TaskId, VirtAddr, PAGE_SIZE};

/// Maximum resident threads per address space.
pub const MAX_THREADS: usize = 64;

/// Base of the per-thread UTCB window; one page per thread slot.
pub const UTCB_BASE: u64 = 0x3F00_0000;

/// Thread-slot bitmap plus the identities occupying each slot.
struct ThreadSlots {
    bitmap: u64,
    ids: [Option<TaskId>; MAX_THREADS],
}

impl ThreadSlots {
    fn new() -> Self {
        Self { bitmap: 0, ids: [None; MAX_THREADS] }
    }

    fn allocate(&mut self, id: TaskId) -> Option<usize> {
        if self.slot_of(id).is_some() {
            return None;
        }
        for slot in 0..MAX_THREADS {
            if self.bitmap & (1 << slot) == 0 {
                self.bitmap |= 1 << slot;
                self.ids[slot] = Some(id);
                return Some(slot);
            }
        }
        None
    }

    fn free(&mut self, id: TaskId) -> bool {
        if let Some(slot) = self.slot_of(id) {
            self.bitmap &= !(1 << slot);
            self.ids[slot] = None;
            true
        } else {
            false
        }
    }

    fn slot_of(&self, id: TaskId) -> Option<usize> {
        self.ids.iter().position(|entry| *entry == Some(id))
    }

    fn count(&self) -> usize {
        self.bitmap.count_ones() as usize
    }
}

/// One protection domain: its threads, resident set and snapshot history.
pub struct AddressSpace {
    root: TaskId,
    pager: TaskId,
    threads: ThreadSlots,
    map: MappingDb,
    snapshots: SnapshotStore,
    epoch: u32,
}

impl AddressSpace {
    /// Creates a space rooted at `root`, paged by `pager`.
    pub fn new(root: TaskId, pager: TaskId) -> Self {
        let mut threads = ThreadSlots::new();
        threads.allocate(root);
        Self {
            root,
            pager,
            threads,
            map: MappingDb::new(),
            snapshots: SnapshotStore::new(),
            epoch: 0,
        }
    }

    /// Root thread identity; also names the space.
    pub fn root(&self) -> TaskId {
        self.root
    }

    /// The pager resolving this space's faults.
    pub fn pager(&self) -> TaskId {
        self.pager
    }

    /// Current snapshot epoch.
    pub fn epoch(&self) -> u32 {
        self.epoch
    }

    /// The resident set.
    pub fn map(&self) -> &MappingDb {
        &self.map
    }

    /// Mutable access to the resident set.
    pub fn map_mut(&mut self) -> &mut MappingDb {
        &mut self.map
    }

    /// Retained snapshot records.
    pub fn snapshots(&self) -> &SnapshotStore {
        &self.snapshots
    }

    /// Registers a resident thread and returns its UTCB slot.
    pub fn attach_thread(&mut self, id: TaskId) -> Result<usize> {
        if self.threads.slot_of(id).is_some() {
            return Err(MemError::AlreadyExists);
        }
        self.threads.allocate(id).ok_or(MemError::OutOfRange)
    }

    /// Drops a resident thread; returns the number remaining.
    pub fn detach_thread(&mut self, id: TaskId) -> Result<usize> {
        if !self.threads.free(id) {
            return Err(MemError::InvalidThread);
        }
        Ok(self.threads.count())
    }

    /// True if `id` is the root or a resident thread of this space.
    pub fn is_resident(&self, id: TaskId) -> bool {
        self.threads.slot_of(id).is_some()
    }

    /// Number of resident threads (root included).
    pub fn thread_count(&self) -> usize {
        self.threads.count()
    }

    /// UTCB address of the thread occupying `slot`.
    pub fn utcb_of(slot: usize) -> VirtAddr {
        VirtAddr::new(UTCB_BASE + (slot * PAGE_SIZE) as u64)
    }

    /// Takes a checkpoint: write-protects every written page, stamps the new
    /// generation, and pushes the dumped resident set with `(ip, sp)` onto
    /// the snapshot ring. Returns the new generation.
    pub fn snapshot<K: KernelPort>(
        &mut self,
        pool: &mut PageAllocator,
        kernel: &mut K,
        ip: u64,
        sp: u64,
    ) -> Result<u32> {
        let epoch = self.epoch.saturating_add(1);
        let entries = self.map.dump();
        for (va, frame) in &entries {
            let page = pool.table_mut().get_mut(*frame)?;
            if page.class == PageClass::ConstZero {
                continue;
            }
            if page.access.contains(Rights::WRITE) {
                page.class = PageClass::Snapshot;
                let readonly = page.owner_rights.difference(Rights::WRITE);
                if page.state == PageState::Mapped {
                    kernel.protect(self.root, *va, 1, readonly)?;
                }
            }
            page.generation = epoch;
        }
        let evicted = self.snapshots.push(SnapshotRecord { epoch, entries, ip, sp });
        self.epoch = epoch;
        if let Some(evicted) = evicted {
            self.collect_evicted(pool, evicted)?;
        }
        log::debug!(target: "space", "snapshot generation {epoch} for space {:?}", self.root);
        Ok(epoch)
    }

    /// Rolls back to `target`: discards newer snapshots, reinstalls the
    /// recorded resident set, reclaims pages no retained generation
    /// references any more, and hands back the saved `(ip, sp)`.
    ///
    /// The target record stays on top of the ring, so restoring to the same
    /// point again remains possible.
    pub fn restore<K: KernelPort>(
        &mut self,
        pool: &mut PageAllocator,
        kernel: &mut K,
        target: u32,
    ) -> Result<(u64, u64)> {
        if target == 0 || !self.snapshots.contains_epoch(target) {
            return Err(MemError::NotFound);
        }
        let mut candidates: BTreeSet<FrameId> = BTreeSet::new();
        while self.snapshots.top_epoch().is_some_and(|epoch| epoch > target) {
            if let Some(record) = self.snapshots.pop_newest() {
                candidates.extend(record.entries.iter().map(|(_, frame)| *frame));
            }
        }
        let (ip, sp, restored) = {
            let record =
                self.snapshots.newest().ok_or(MemError::Internal("restore target vanished"))?;
            (record.ip, record.sp, record.entries.clone())
        };
        for (va, frame) in self.map.dump() {
            candidates.insert(frame);
            if let Ok(page) = pool.table().get(frame) {
                if page.state == PageState::Mapped {
                    kernel.unmap(self.root, va, 1)?;
                }
                if page.class == PageClass::ConstZero || page.owner != Some(self.root) {
                    pool.release_page(frame)?;
                }
            }
        }
        self.map.install(restored.clone());
        for (va, frame) in &restored {
            let page = pool.table_mut().get_mut(*frame)?;
            if page.class == PageClass::ConstZero || page.owner != Some(self.root) {
                page.refs += 1;
                continue;
            }
            page.destination = Some(*va);
            if page.state == PageState::Mapped {
                page.state = PageState::Unmapped;
            }
            if page.generation == target {
                page.generation = 0;
            }
        }
        let mut retain: BTreeSet<FrameId> = restored.iter().map(|(_, frame)| *frame).collect();
        for record in self.snapshots.iter() {
            retain.extend(record.entries.iter().map(|(_, frame)| *frame));
        }
        for frame in candidates {
            if retain.contains(&frame) {
                continue;
            }
            let Ok(page) = pool.table().get(frame) else { continue };
            if page.owner != Some(self.root) {
                continue;
            }
            if pool.release_orphan(frame)? {
                log::trace!(target: "space", "restore reclaimed frame {}", frame.index());
            }
        }
        self.epoch = target;
        log::debug!(target: "space", "restored generation {target} for space {:?}", self.root);
        Ok((ip, sp))
    }

    /// Discards the resident set and every snapshot, releasing the pages this
    /// space owns. Called when the last resident thread is torn down.
    pub fn teardown<K: KernelPort>(
        &mut self,
        pool: &mut PageAllocator,
        kernel: &mut K,
    ) -> Result<()> {
        let mut frames: BTreeSet<FrameId> = BTreeSet::new();
        for (va, frame) in self.map.dump() {
            frames.insert(frame);
            if let Ok(page) = pool.table().get(frame) {
                if page.state == PageState::Mapped {
                    kernel.unmap(self.root, va, 1)?;
                }
                if page.class == PageClass::ConstZero || page.owner != Some(self.root) {
                    pool.release_page(frame)?;
                }
            }
        }
        for record in self.snapshots.iter() {
            frames.extend(record.entries.iter().map(|(_, frame)| *frame));
        }
        self.snapshots.clear();
        self.map = MappingDb::new();
        for frame in frames {
            let Ok(page) = pool.table_mut().get_mut(frame) else { continue };
            if page.owner != Some(self.root) {
                continue;
            }
            if page.class == PageClass::Snapshot {
                page.class = PageClass::Plain;
            }
            pool.release_page(frame)?;
        }
        Ok(())
    }

    fn collect_evicted(
        &mut self,
        pool: &mut PageAllocator,
        evicted: SnapshotRecord,
    ) -> Result<()> {
        let mut retain: BTreeSet<FrameId> = self.map.iter().map(|(_, frame)| frame).collect();
        for record in self.snapshots.iter() {
            retain.extend(record.entries.iter().map(|(_, frame)| *frame));
        }
        let frames: BTreeSet<FrameId> = evicted.entries.iter().map(|(_, frame)| *frame).collect();
        let mut released = 0usize;
        for frame in frames {
            if retain.contains(&frame) {
                continue;
            }
            let Ok(page) = pool.table().get(frame) else { continue };
            if page.class != PageClass::Snapshot
                || !page.access.contains(Rights::WRITE)
                || page.owner != Some(self.root)
            {
                continue;
            }
            if pool.release_orphan(frame)? {
                released += 1;
            }
        }
        if released > 0 {
            log::debug!(
                target: "space",
                "evicting generation {} released {released} pages",
                evicted.epoch
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_slots_allocate_and_free() {
        let root = TaskId::new(10);
        let mut space = AddressSpace::new(root, TaskId::new(1));
        assert_eq!(space.thread_count(), 1);
        assert!(space.is_resident(root));
        let worker = TaskId::new(11);
        let slot = space.attach_thread(worker).unwrap();
        assert_eq!(slot, 1);
        assert_eq!(AddressSpace::utcb_of(slot), VirtAddr::new(UTCB_BASE + PAGE_SIZE as u64));
        assert_eq!(space.attach_thread(worker).unwrap_err(), MemError::AlreadyExists);
        assert_eq!(space.detach_thread(worker).unwrap(), 1);
        assert_eq!(space.detach_thread(worker).unwrap_err(), MemError::InvalidThread);
        assert_eq!(space.detach_thread(root).unwrap(), 0);
    }

    #[test]
    fn thread_slots_exhaust() {
        let mut space = AddressSpace::new(TaskId::new(1), TaskId::new(1));
        for i in 2..=MAX_THREADS as u64 {
            space.attach_thread(TaskId::new(i)).unwrap();
        }
        assert_eq!(
            space.attach_thread(TaskId::new(1000)).unwrap_err(),
            MemError::OutOfRange
        );
    }
}

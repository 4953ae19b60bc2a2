// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Page allocator over the buddy system.
//!
//! Counts are rounded up to the next power of two and ownership is stamped on
//! every page of the returned block. The pool also owns the shared zero page:
//! a single zero-filled, copy-on-write page mapped read-only into every space
//! that read-faults an anonymous address; it carries a permanent manager
//! reference and is never returned to the buddy.
//!
//! The whole pool sits behind one `parking_lot::Mutex` shared by every pager
//! instance; see DESIGN.md for the locking-model decision.

use std::sync::Arc;

use nexus_mem_abi::Rights;
use parking_lot::Mutex;

use crate::error::{MemError, Result};
use crate::phys::buddy::BuddyAllocator;
use crate::phys::descriptor::{PageClass, PageState, RegionKind};
use crate::phys::table::{FrameId, FrameTable};
use crate::types::{TaskId, MAX_OP_PAGES};

/// The shared physical pool handle handed to every pager.
pub type SharedPool = Arc<Mutex<PageAllocator>>;

/// What happened to a block on release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// The block went back to the buddy.
    Freed,
    /// References remain (sharers or snapshot generations); physical release
    /// is deferred until the last of them drops.
    Deferred,
}

/// Allocates and releases descriptor groups on top of the buddy allocator.
pub struct PageAllocator {
    table: FrameTable,
    buddy: BuddyAllocator,
    zero_page: FrameId,
}

impl PageAllocator {
    /// Primes the buddy from the seeded table and sets up the zero page.
    pub fn new(mut table: FrameTable) -> Result<Self> {
        let mut buddy = BuddyAllocator::new();
        buddy.prime(&mut table);
        let index = buddy.allocate(&mut table, 0)?;
        table.zero_frame(index);
        let page = table.page_mut(index);
        page.state = PageState::Allocated;
        page.class = PageClass::ConstZero;
        page.owner_rights = Rights::READ;
        page.group = 1;
        page.refs = 1;
        let zero_page = table
            .id_at(index)
            .ok_or(MemError::Internal("zero page outside table"))?;
        Ok(Self { table, buddy, zero_page })
    }

    /// Wraps a fresh pool in the shared handle.
    pub fn shared(table: FrameTable) -> Result<SharedPool> {
        Ok(Arc::new(Mutex::new(Self::new(table)?)))
    }

    /// Handle of the shared zero page.
    pub fn zero_page(&self) -> FrameId {
        self.zero_page
    }

    /// The underlying frame table.
    pub fn table(&self) -> &FrameTable {
        &self.table
    }

    /// Mutable access to the underlying frame table.
    pub fn table_mut(&mut self) -> &mut FrameTable {
        &mut self.table
    }

    /// Total pages currently in the buddy bins.
    pub fn free_pages(&self) -> usize {
        self.buddy.free_pages()
    }

    /// Blocks currently in the bin for `order`.
    pub fn bin_count(&self, order: usize) -> usize {
        self.buddy.bin_count(order)
    }

    /// Allocates `count` pages (rounded up to a power of two) for `owner` and
    /// returns the first page of the block.
    pub fn allocate(&mut self, owner: TaskId, count: usize) -> Result<FrameId> {
        if count == 0 {
            return Err(MemError::InvalidArgs);
        }
        if count > MAX_OP_PAGES {
            return Err(MemError::OutOfRange);
        }
        let rounded = count.next_power_of_two();
        let order = rounded.trailing_zeros() as usize;
        let head = self.buddy.allocate(&mut self.table, order)?;
        for i in head..head + rounded {
            let page = self.table.page_mut(i);
            page.state = PageState::Allocated;
            page.class = PageClass::Plain;
            page.owner = Some(owner);
            page.owner_rights = Rights::empty();
            page.sharer = None;
            page.sharer_rights = Rights::empty();
            page.destination = None;
            page.generation = 0;
            page.access = Rights::empty();
            page.refs += 1;
            page.group = rounded as u32;
        }
        log::trace!(target: "pool", "allocate {count} -> block {head} (order {order})");
        self.table.id_at(head).ok_or(MemError::Internal("allocated block outside table"))
    }

    /// Drops one reference from a single page and reclaims it once nothing
    /// holds it. Snapshot-pinned pages are left for generation GC; the zero
    /// page's permanent reference keeps it alive forever.
    pub fn release_page(&mut self, id: FrameId) -> Result<()> {
        let index = id.index();
        let page = self.table.get_mut(id)?;
        page.refs = page.refs.saturating_sub(1);
        if page.refs == 0
            && page.class != PageClass::Snapshot
            && page.class != PageClass::ConstZero
            && page.state != PageState::Free
        {
            self.free_page(index);
            self.try_reclaim_block(index)?;
        }
        Ok(())
    }

    /// Releases a whole reservation block: the owning reference of every
    /// member page is dropped, and the block returns to the buddy once no
    /// page of it is referenced any more.
    pub fn release_block(&mut self, id: FrameId) -> Result<ReleaseOutcome> {
        let head = {
            let page = self.table.get(id)?;
            if page.class == PageClass::ConstZero {
                return Err(MemError::Internal("release of the zero page"));
            }
            if page.state == PageState::Free {
                return Err(MemError::Internal("release of a free block"));
            }
            self.table.block_head(id.index())
        };
        let group = self.table.page(head).group as usize;
        for i in head..head + group {
            let page = self.table.page_mut(i);
            if page.state == PageState::Free {
                continue;
            }
            page.refs = page.refs.saturating_sub(1);
            if page.class == PageClass::Snapshot {
                // Generation GC reclaims these; the owner stamp stays so it
                // can tell whose snapshot held the page.
                continue;
            }
            if page.refs > 0 {
                page.owner = None;
                continue;
            }
            self.free_page(i);
        }
        if self.try_reclaim_block(head)? {
            Ok(ReleaseOutcome::Freed)
        } else {
            Ok(ReleaseOutcome::Deferred)
        }
    }

    /// Reclaims a page whose last snapshot reference was discarded. Returns
    /// false when the page is still held elsewhere.
    pub fn release_orphan(&mut self, id: FrameId) -> Result<bool> {
        let index = id.index();
        let page = self.table.get(id)?;
        if page.state == PageState::Free || page.class == PageClass::ConstZero {
            return Ok(false);
        }
        if page.refs > 1 {
            return Ok(false);
        }
        self.free_page(index);
        self.try_reclaim_block(index)?;
        Ok(true)
    }

    fn free_page(&mut self, index: usize) {
        let page = self.table.page_mut(index);
        page.reset();
        if page.region == RegionKind::Shared {
            page.region = RegionKind::Conventional;
        }
        self.table.bump_stamp(index);
    }

    fn try_reclaim_block(&mut self, index: usize) -> Result<bool> {
        let head = self.table.block_head(index);
        let group = self.table.page(head).group as usize;
        for i in head..head + group {
            let page = self.table.page(i);
            if page.state != PageState::Free || page.refs != 0 {
                return Ok(false);
            }
        }
        self.buddy.release(&mut self.table, head)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PhysAddr;

    fn pool(pages: usize) -> PageAllocator {
        PageAllocator::new(FrameTable::new(PhysAddr::new(0x8000_0000), pages)).unwrap()
    }

    const OWNER: TaskId = TaskId::new(7);

    #[test]
    fn counts_round_to_powers_of_two() {
        let mut pool = pool(16);
        let free_before = pool.free_pages();
        let block = pool.allocate(OWNER, 3).unwrap();
        assert_eq!(pool.table().get(block).unwrap().group, 4);
        assert_eq!(pool.free_pages(), free_before - 4);
        for i in block.index()..block.index() + 4 {
            let page = pool.table().page(i);
            assert_eq!(page.state, PageState::Allocated);
            assert_eq!(page.owner, Some(OWNER));
            assert_eq!(page.refs, 1);
        }
    }

    #[test]
    fn release_restores_the_bins() {
        let mut pool = pool(16);
        let free_before = pool.free_pages();
        let order2_before = pool.bin_count(2);
        let block = pool.allocate(OWNER, 3).unwrap();
        assert_eq!(pool.release_block(block).unwrap(), ReleaseOutcome::Freed);
        assert_eq!(pool.free_pages(), free_before);
        assert_eq!(pool.bin_count(2), order2_before);
    }

    #[test]
    fn stale_handle_cannot_release_twice() {
        let mut pool = pool(16);
        let block = pool.allocate(OWNER, 1).unwrap();
        pool.release_block(block).unwrap();
        assert!(matches!(pool.release_block(block), Err(MemError::Internal(_))));
    }

    #[test]
    fn shared_block_release_is_deferred() {
        let mut pool = pool(16);
        let block = pool.allocate(OWNER, 1).unwrap();
        {
            let page = pool.table_mut().get_mut(block).unwrap();
            page.region = RegionKind::Shared;
            page.refs += 1; // a sharee mapping holds the page
        }
        assert_eq!(pool.release_block(block).unwrap(), ReleaseOutcome::Deferred);
        assert_eq!(pool.table().get(block).unwrap().owner, None);
        // The sharee's reference drops later; the page then returns to the buddy.
        let free_before = pool.free_pages();
        pool.release_page(block).unwrap();
        assert_eq!(pool.free_pages(), free_before + 1);
        assert_eq!(
            pool.table().page(block.index()).region,
            RegionKind::Conventional
        );
    }

    #[test]
    fn zero_page_survives_release_attempts() {
        let mut pool = pool(16);
        let zero = pool.zero_page();
        pool.release_page(zero).unwrap();
        assert_ne!(pool.table().get(zero).unwrap().state, PageState::Free);
        assert!(pool.release_block(zero).is_err());
    }

    #[test]
    fn out_of_range_and_invalid_counts() {
        let mut pool = pool(16);
        assert_eq!(pool.allocate(OWNER, 0).unwrap_err(), MemError::InvalidArgs);
        assert_eq!(
            pool.allocate(OWNER, MAX_OP_PAGES + 1).unwrap_err(),
            MemError::OutOfRange
        );
    }
}

// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Descriptor arena covering one contiguous physical region.
//!
//! Frames are referenced by [`FrameId`], an index plus a reuse stamp: once a
//! page returns to the buddy its stamp advances and every outstanding id for
//! it goes stale, so a recycled page can never be reached through an old
//! handle. Host-first, the table also owns the backing page bytes, which is
//! what lets the copy-on-write and zero-fill paths be exercised end to end
//! without a kernel.

use crate::error::{MemError, Result};
use crate::phys::descriptor::{PageDescriptor, RegionKind};
use crate::types::{PhysAddr, PAGE_SIZE};

/// Stable handle to one physical page.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct FrameId {
    index: u32,
    stamp: u32,
}

impl FrameId {
    /// Arena index of the page.
    pub fn index(self) -> usize {
        self.index as usize
    }

    pub(crate) fn new(index: u32, stamp: u32) -> Self {
        Self { index, stamp }
    }
}

/// The physical page table: one descriptor per page of the managed region.
pub struct FrameTable {
    base: PhysAddr,
    pages: Vec<PageDescriptor>,
    bytes: Vec<u8>,
}

impl FrameTable {
    /// Builds a table of `count` pages starting at `base`, all Conventional.
    ///
    /// `base` must be page aligned.
    pub fn new(base: PhysAddr, count: usize) -> Self {
        assert!(base.is_page_aligned(), "table base must be page aligned");
        assert!(count > 0, "empty table");
        Self {
            base,
            pages: vec![PageDescriptor::new(RegionKind::Conventional); count],
            bytes: vec![0u8; count * PAGE_SIZE],
        }
    }

    /// Number of pages covered.
    pub fn len(&self) -> usize {
        self.pages.len()
    }

    /// True if the table covers no pages (never the case after construction).
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Base physical address of the region.
    pub fn base(&self) -> PhysAddr {
        self.base
    }

    /// Marks a page range with a region kind during seeding.
    pub(crate) fn set_region(&mut self, index: usize, count: usize, region: RegionKind) {
        for page in &mut self.pages[index..index + count] {
            page.region = region;
        }
    }

    /// Current id for the page at `index`.
    pub fn id_at(&self, index: usize) -> Option<FrameId> {
        self.pages.get(index).map(|page| FrameId::new(index as u32, page.stamp))
    }

    /// Resolves an id, rejecting out-of-table indices and stale stamps.
    pub fn get(&self, id: FrameId) -> Result<&PageDescriptor> {
        let page = self.pages.get(id.index()).ok_or(MemError::Internal("frame outside table"))?;
        if page.stamp != id.stamp {
            return Err(MemError::Internal("stale frame handle"));
        }
        Ok(page)
    }

    /// Mutable variant of [`FrameTable::get`].
    pub fn get_mut(&mut self, id: FrameId) -> Result<&mut PageDescriptor> {
        let page =
            self.pages.get_mut(id.index()).ok_or(MemError::Internal("frame outside table"))?;
        if page.stamp != id.stamp {
            return Err(MemError::Internal("stale frame handle"));
        }
        Ok(page)
    }

    pub(crate) fn page(&self, index: usize) -> &PageDescriptor {
        &self.pages[index]
    }

    pub(crate) fn page_mut(&mut self, index: usize) -> &mut PageDescriptor {
        &mut self.pages[index]
    }

    /// Advances the reuse stamp, invalidating all outstanding ids.
    pub(crate) fn bump_stamp(&mut self, index: usize) {
        let page = &mut self.pages[index];
        page.stamp = page.stamp.wrapping_add(1);
    }

    /// Physical address of the page at `index`.
    pub fn phys_of(&self, index: usize) -> PhysAddr {
        debug_assert!(index < self.pages.len());
        PhysAddr::new(self.base.raw() + (index * PAGE_SIZE) as u64)
    }

    /// Index of the page containing `addr`, if it lies in the managed region.
    pub fn index_of(&self, addr: PhysAddr) -> Option<usize> {
        let addr = addr.align_down();
        if addr < self.base {
            return None;
        }
        let index = ((addr.raw() - self.base.raw()) / PAGE_SIZE as u64) as usize;
        (index < self.pages.len()).then_some(index)
    }

    /// True if `addr` falls inside the managed region.
    pub fn contains(&self, addr: PhysAddr) -> bool {
        self.index_of(addr).is_some()
    }

    /// Head index of the buddy block containing `index`.
    pub(crate) fn block_head(&self, index: usize) -> usize {
        let group = self.pages[index].group as usize;
        index & !(group - 1)
    }

    /// Zero-fills the page contents.
    pub fn zero_frame(&mut self, index: usize) {
        let start = index * PAGE_SIZE;
        self.bytes[start..start + PAGE_SIZE].fill(0);
    }

    /// Byte-copies one page's contents onto another.
    pub fn copy_frame(&mut self, src: usize, dst: usize) {
        assert_ne!(src, dst);
        let (src_start, dst_start) = (src * PAGE_SIZE, dst * PAGE_SIZE);
        let src_bytes: Vec<u8> = self.bytes[src_start..src_start + PAGE_SIZE].to_vec();
        self.bytes[dst_start..dst_start + PAGE_SIZE].copy_from_slice(&src_bytes);
    }

    /// Read-only view of a page's contents.
    pub fn frame_bytes(&self, index: usize) -> &[u8] {
        &self.bytes[index * PAGE_SIZE..(index + 1) * PAGE_SIZE]
    }

    /// Mutable view of a page's contents.
    pub fn frame_bytes_mut(&mut self, index: usize) -> &mut [u8] {
        &mut self.bytes[index * PAGE_SIZE..(index + 1) * PAGE_SIZE]
    }
}

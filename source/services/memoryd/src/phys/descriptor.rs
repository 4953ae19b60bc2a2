// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Per-page metadata record.

use nexus_mem_abi::Rights;

use crate::types::{TaskId, VirtAddr};

/// Lifecycle state of a physical page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageState {
    /// Owned by the buddy allocator.
    Free,
    /// Handed out by the page allocator, no hardware mapping installed.
    Allocated,
    /// Registered and hardware-mapped.
    Mapped,
    /// Registered, hardware mapping revoked (will be re-faulted).
    Unmapped,
}

/// Region classification assigned when the pool is seeded or a block is
/// tagged for sharing. Only `Conventional` pages ever enter the buddy bins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    /// General-purpose memory.
    Conventional,
    /// Firmware/device windows; never allocated or buddied.
    Reserved,
    /// Pages holding boot images; never buddied.
    Boot,
    /// Conventional page currently tagged for cross-space sharing.
    Shared,
}

/// Behavioral class of a page, matched on by the fault state machine.
///
/// A page is never both constant and privately writable; the variants make
/// that a structural property instead of a flag convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageClass {
    /// Ordinary private page.
    Plain,
    /// Read-only page that is privately copied on the first write.
    CopyOnWrite,
    /// Copy-on-write page pinned by one or more snapshot generations.
    Snapshot,
    /// The shared zero page.
    ConstZero,
}

impl PageClass {
    /// True for every class that takes the copy-on-write breakout on a write.
    pub fn breaks_on_write(self) -> bool {
        matches!(self, PageClass::CopyOnWrite | PageClass::Snapshot | PageClass::ConstZero)
    }
}

/// Sentinel for "not linked into any free list".
pub(crate) const FREE_NONE: u32 = u32::MAX;

/// Metadata for one physical page.
///
/// `group` is the size in pages of the buddy block this page belongs to;
/// every page of a block carries the same value, re-established by each
/// split and merge.
#[derive(Debug, Clone)]
pub struct PageDescriptor {
    /// Lifecycle state.
    pub state: PageState,
    /// Region classification.
    pub region: RegionKind,
    /// Behavioral class.
    pub class: PageClass,
    /// Buddy block size in pages (power of two).
    pub group: u32,
    /// Primary holder, if allocated.
    pub owner: Option<TaskId>,
    /// Rights granted to the owner.
    pub owner_rights: Rights,
    /// Optional second authorized holder.
    pub sharer: Option<TaskId>,
    /// Rights the sharer may be granted.
    pub sharer_rights: Rights,
    /// Virtual address the page is currently registered at.
    pub destination: Option<VirtAddr>,
    /// Epoch of the newest snapshot that saw this page resident.
    pub generation: u32,
    /// Permissions actually handed out so far.
    pub access: Rights,
    /// Live references: one for the owning reservation plus one per
    /// shared-in mapping entry (the zero page holds a permanent manager
    /// reference on top).
    pub refs: u32,
    /// Index of the next page in the free list; `FREE_NONE` when unlinked.
    pub(crate) next_free: u32,
    /// Reuse stamp; bumped whenever the page returns to the buddy.
    pub(crate) stamp: u32,
}

impl PageDescriptor {
    pub(crate) fn new(region: RegionKind) -> Self {
        Self {
            state: PageState::Free,
            region,
            class: PageClass::Plain,
            group: 1,
            owner: None,
            owner_rights: Rights::empty(),
            sharer: None,
            sharer_rights: Rights::empty(),
            destination: None,
            generation: 0,
            access: Rights::empty(),
            refs: 0,
            next_free: FREE_NONE,
            stamp: 0,
        }
    }

    /// Clears all allocation-scoped fields, leaving region, group and stamp.
    pub(crate) fn reset(&mut self) {
        self.state = PageState::Free;
        self.class = PageClass::Plain;
        self.owner = None;
        self.owner_rights = Rights::empty();
        self.sharer = None;
        self.sharer_rights = Rights::empty();
        self.destination = None;
        self.generation = 0;
        self.access = Rights::empty();
        self.refs = 0;
        self.next_free = FREE_NONE;
    }
}

// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! The kernel boundary.
//!
//! The memory manager consumes exactly three primitives from the underlying
//! kernel: establish a hardware mapping, revoke one, and adjust the rights of
//! an existing one. [`HostPort`] is the host-first implementation recording
//! hardware state in memory; the OS build supplies a syscall-backed port
//! behind the same trait.

use std::collections::BTreeMap;

use nexus_mem_abi::Rights;

use crate::error::Result;
use crate::types::{PhysAddr, TaskId, VirtAddr, PAGE_SIZE};

/// Hardware mapping primitives supplied by the kernel.
pub trait KernelPort {
    /// Establishes a mapping of `pages` pages of physical memory at `phys`
    /// into `space` at `dest` with `rights`.
    fn map(
        &mut self,
        space: TaskId,
        dest: VirtAddr,
        phys: PhysAddr,
        pages: usize,
        rights: Rights,
    ) -> Result<()>;

    /// Revokes the mapping of `pages` pages at `dest` in `space`.
    fn unmap(&mut self, space: TaskId, dest: VirtAddr, pages: usize) -> Result<()>;

    /// Adjusts the rights of an existing mapping at `dest` in `space`.
    fn protect(&mut self, space: TaskId, dest: VirtAddr, pages: usize, rights: Rights)
        -> Result<()>;
}

/// In-memory hardware state, one record per `(space, page)`.
#[derive(Default)]
pub struct HostPort {
    mappings: BTreeMap<(TaskId, VirtAddr), (PhysAddr, Rights)>,
}

impl HostPort {
    /// Creates a port with no mappings installed.
    pub fn new() -> Self {
        Self::default()
    }

    /// The recorded mapping for one page, if installed.
    pub fn mapping(&self, space: TaskId, dest: VirtAddr) -> Option<(PhysAddr, Rights)> {
        self.mappings.get(&(space, dest.align_down())).copied()
    }

    /// Number of installed page mappings across all spaces.
    pub fn mapped_pages(&self) -> usize {
        self.mappings.len()
    }
}

impl KernelPort for HostPort {
    fn map(
        &mut self,
        space: TaskId,
        dest: VirtAddr,
        phys: PhysAddr,
        pages: usize,
        rights: Rights,
    ) -> Result<()> {
        for i in 0..pages {
            let va = VirtAddr::new(dest.align_down().raw() + (i * PAGE_SIZE) as u64);
            let pa = PhysAddr::new(phys.align_down().raw() + (i * PAGE_SIZE) as u64);
            self.mappings.insert((space, va), (pa, rights));
        }
        Ok(())
    }

    fn unmap(&mut self, space: TaskId, dest: VirtAddr, pages: usize) -> Result<()> {
        for i in 0..pages {
            let va = VirtAddr::new(dest.align_down().raw() + (i * PAGE_SIZE) as u64);
            self.mappings.remove(&(space, va));
        }
        Ok(())
    }

    fn protect(
        &mut self,
        space: TaskId,
        dest: VirtAddr,
        pages: usize,
        rights: Rights,
    ) -> Result<()> {
        for i in 0..pages {
            let va = VirtAddr::new(dest.align_down().raw() + (i * PAGE_SIZE) as u64);
            if let Some(entry) = self.mappings.get_mut(&(space, va)) {
                entry.1 = rights;
            }
        }
        Ok(())
    }
}

// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Page-fault resolution.
//!
//! The state machine matches on the page class: plain pages are re-granted,
//! copy-on-write-like pages (snapshot, zero page) break out into a private
//! copy on the first write, shared pages are never auto-faulted back in, and
//! anonymous faults either allocate a zeroed page (write) or alias the shared
//! zero page (read).

use nexus_mem_abi::{MapItem, Rights};

use crate::error::{MemError, Result};
use crate::kernel::KernelPort;
use crate::phys::{FrameId, PageAllocator, PageClass, PageState, RegionKind};
use crate::space::AddressSpace;
use crate::types::VirtAddr;

pub(crate) fn resolve_fault<K: KernelPort>(
    space: &mut AddressSpace,
    pool: &mut PageAllocator,
    kernel: &mut K,
    addr: VirtAddr,
    ip: u64,
    access: Rights,
) -> Result<MapItem> {
    let page_va = addr.align_down();
    if !page_va.in_user_window() {
        return Err(MemError::InvalidRights);
    }
    if let Some(frame) = space.map().lookup(page_va) {
        let (region, class) = {
            let page = pool.table().get(frame)?;
            (page.region, page.class)
        };
        if region == RegionKind::Shared {
            // Shared pages are never auto-faulted in: drop the stale entry
            // and fall through to the anonymous path.
            log::warn!(
                target: "pager",
                "shared page re-faulted at {page_va:?} in space {:?}; reallocating",
                space.root()
            );
            space.map_mut().remove(page_va);
            pool.release_page(frame)?;
        } else if class.breaks_on_write() && access.contains(Rights::WRITE) {
            return break_copy_on_write(space, pool, kernel, page_va, frame);
        } else {
            return grant_existing(space, pool, kernel, page_va, frame, access);
        }
    }
    resolve_anonymous(space, pool, kernel, page_va, ip, access)
}

/// Plain resolution: reply from the frame intersected with its owner
/// rights, write masked off while the page stays copy-on-write.
fn grant_existing<K: KernelPort>(
    space: &mut AddressSpace,
    pool: &mut PageAllocator,
    kernel: &mut K,
    page_va: VirtAddr,
    frame: FrameId,
    access: Rights,
) -> Result<MapItem> {
    let (grant, class) = {
        let page = pool.table().get(frame)?;
        let mut grant = page.owner_rights;
        if page.class.breaks_on_write() {
            grant = grant.difference(Rights::WRITE);
        }
        (grant, page.class)
    };
    if !grant.contains(access) {
        return Err(MemError::InvalidRights);
    }
    let phys = pool.table().phys_of(frame.index());
    kernel.map(space.root(), page_va, phys, 1, grant)?;
    {
        let page = pool.table_mut().get_mut(frame)?;
        page.access |= grant;
        if class != PageClass::ConstZero {
            page.state = PageState::Mapped;
            page.destination = Some(page_va);
        }
    }
    Ok(MapItem { phys: phys.raw(), count: 1, rights: grant, dest: page_va.raw() })
}

/// Copy-on-write breakout: a private copy replaces the protected
/// page; the original keeps its owner and its snapshot pinning.
pub(crate) fn break_copy_on_write<K: KernelPort>(
    space: &mut AddressSpace,
    pool: &mut PageAllocator,
    kernel: &mut K,
    page_va: VirtAddr,
    old: FrameId,
) -> Result<MapItem> {
    let (old_class, old_rights) = {
        let page = pool.table().get(old)?;
        (page.class, page.owner_rights)
    };
    let new = pool.allocate(space.root(), 1)?;
    pool.table_mut().copy_frame(old.index(), new.index());
    let grant = old_rights | Rights::RW;
    {
        let page = pool.table_mut().get_mut(new)?;
        page.owner_rights = grant;
        page.access = grant;
        page.state = PageState::Mapped;
        page.destination = Some(page_va);
    }
    let phys = pool.table().phys_of(new.index());
    if let Err(err) = kernel.map(space.root(), page_va, phys, 1, grant) {
        pool.release_block(new)?;
        return Err(err);
    }
    {
        // The original is marked written so the next snapshot knows it was
        // superseded by a private copy.
        let page = pool.table_mut().get_mut(old)?;
        page.access |= Rights::WRITE;
    }
    space.map_mut().replace(page_va, new);
    if old_class == PageClass::ConstZero {
        pool.release_page(old)?;
    }
    log::trace!(
        target: "pager",
        "cow breakout at {page_va:?}: frame {} -> {}",
        old.index(),
        new.index()
    );
    Ok(MapItem { phys: phys.raw(), count: 1, rights: grant, dest: page_va.raw() })
}

/// Anonymous mapping: no database entry exists for the address.
fn resolve_anonymous<K: KernelPort>(
    space: &mut AddressSpace,
    pool: &mut PageAllocator,
    kernel: &mut K,
    page_va: VirtAddr,
    ip: u64,
    access: Rights,
) -> Result<MapItem> {
    if VirtAddr::new(ip).align_down() == page_va {
        return Err(MemError::InvalidRights);
    }
    if access.contains(Rights::EXECUTE) {
        return Err(MemError::InvalidRights);
    }
    if access.contains(Rights::WRITE) {
        let frame = pool.allocate(space.root(), 1)?;
        pool.table_mut().zero_frame(frame.index());
        {
            let page = pool.table_mut().get_mut(frame)?;
            page.owner_rights = Rights::RW;
            page.access = Rights::RW;
            page.state = PageState::Mapped;
            page.destination = Some(page_va);
        }
        let phys = pool.table().phys_of(frame.index());
        if let Err(err) = kernel.map(space.root(), page_va, phys, 1, Rights::RW) {
            pool.release_block(frame)?;
            return Err(err);
        }
        if let Err(err) = space.map_mut().insert(page_va, frame) {
            kernel.unmap(space.root(), page_va, 1)?;
            pool.release_block(frame)?;
            return Err(err);
        }
        return Ok(MapItem { phys: phys.raw(), count: 1, rights: Rights::RW, dest: page_va.raw() });
    }
    // Read-only: alias the shared zero page; the next write fault takes the
    // copy-on-write breakout.
    let zero = pool.zero_page();
    let phys = pool.table().phys_of(zero.index());
    kernel.map(space.root(), page_va, phys, 1, Rights::READ)?;
    if let Err(err) = space.map_mut().insert(page_va, zero) {
        kernel.unmap(space.root(), page_va, 1)?;
        return Err(err);
    }
    {
        let page = pool.table_mut().get_mut(zero)?;
        page.refs += 1;
        page.access |= Rights::READ;
    }
    Ok(MapItem { phys: phys.raw(), count: 1, rights: Rights::READ, dest: page_va.raw() })
}

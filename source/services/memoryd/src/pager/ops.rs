// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Explicit reservation, mapping, unmapping and release.
//!
//! Every compound path rolls its allocation back before returning an error;
//! no operation leaks physical pages on its own failure path.

use nexus_mem_abi::{MapItem, Rights};

use crate::error::{MemError, Result};
use crate::kernel::KernelPort;
use crate::pager::fault;
use crate::phys::{FrameId, PageAllocator, PageState, RegionKind};
use crate::space::AddressSpace;
use crate::types::{PhysAddr, TaskId, VirtAddr, MAX_OP_PAGES, USER_TOP};

fn checked_range(addr: VirtAddr, count: usize) -> Result<VirtAddr> {
    if !addr.is_page_aligned() || count == 0 {
        return Err(MemError::InvalidArgs);
    }
    if count > MAX_OP_PAGES {
        return Err(MemError::OutOfRange);
    }
    let end = addr.checked_add_pages(count).ok_or(MemError::InvalidArgs)?;
    if !addr.in_user_window() || end.raw() > USER_TOP {
        return Err(MemError::InvalidRights);
    }
    Ok(end)
}

/// Reserves `count` virtual pages without mapping them. The backing block is
/// allocated eagerly; `peer` tags it shared with that space's root.
pub(crate) fn reserve(
    space: &mut AddressSpace,
    pool: &mut PageAllocator,
    addr: VirtAddr,
    count: usize,
    rights: Rights,
    peer: Option<TaskId>,
) -> Result<()> {
    checked_range(addr, count)?;
    for i in 0..count {
        let va = addr.checked_add_pages(i).ok_or(MemError::InvalidArgs)?;
        if space.map().lookup(va).is_some() {
            return Err(MemError::AlreadyExists);
        }
    }
    let block = pool.allocate(space.root(), count)?;
    let mut registered = 0usize;
    let result = (|| {
        for i in 0..count {
            let va = addr.checked_add_pages(i).ok_or(MemError::InvalidArgs)?;
            let frame = pool
                .table()
                .id_at(block.index() + i)
                .ok_or(MemError::Internal("reserved block outside table"))?;
            {
                let page = pool.table_mut().get_mut(frame)?;
                page.owner_rights = rights;
                page.destination = Some(va);
                if let Some(peer) = peer {
                    page.region = RegionKind::Shared;
                    page.sharer = Some(peer);
                    page.sharer_rights = rights;
                }
            }
            space.map_mut().insert(va, frame)?;
            registered += 1;
        }
        Ok(())
    })();
    if let Err(err) = result {
        for i in 0..registered {
            if let Some(va) = addr.checked_add_pages(i) {
                space.map_mut().remove(va);
            }
        }
        let _ = pool.release_block(block);
        return Err(err);
    }
    log::trace!(
        target: "pager",
        "reserved {count} pages at {addr:?} for space {:?} (shared: {})",
        space.root(),
        peer.is_some()
    );
    Ok(())
}

/// Map case (a): re-maps own reserved pages at new rights, routing through
/// the copy-on-write breakout where a write is requested on a protected page.
pub(crate) fn remap<K: KernelPort>(
    space: &mut AddressSpace,
    pool: &mut PageAllocator,
    kernel: &mut K,
    addr: VirtAddr,
    count: usize,
    rights: Rights,
) -> Result<MapItem> {
    checked_range(addr, count)?;
    let mut first: Option<MapItem> = None;
    for i in 0..count {
        let va = addr.checked_add_pages(i).ok_or(MemError::InvalidArgs)?;
        let frame = space.map().lookup(va).ok_or(MemError::NotFound)?;
        let (class, owner_rights) = {
            let page = pool.table().get(frame)?;
            (page.class, page.owner_rights)
        };
        let item = if class.breaks_on_write() && rights.contains(Rights::WRITE) {
            fault::break_copy_on_write(space, pool, kernel, va, frame)?
        } else {
            if !owner_rights.contains(rights) {
                return Err(MemError::InvalidRights);
            }
            let phys = pool.table().phys_of(frame.index());
            kernel.map(space.root(), va, phys, 1, rights)?;
            {
                let page = pool.table_mut().get_mut(frame)?;
                page.state = PageState::Mapped;
                page.access |= rights;
                page.destination = Some(va);
            }
            MapItem { phys: phys.raw(), count: 1, rights, dest: va.raw() }
        };
        if first.is_none() {
            first = Some(item);
        }
    }
    let mut item = first.ok_or(MemError::InvalidArgs)?;
    item.count = count as u32;
    Ok(item)
}

/// Map case (b): wildcard source, allocate-on-demand zeroed pages.
pub(crate) fn map_anonymous<K: KernelPort>(
    space: &mut AddressSpace,
    pool: &mut PageAllocator,
    kernel: &mut K,
    addr: VirtAddr,
    count: usize,
    rights: Rights,
) -> Result<MapItem> {
    checked_range(addr, count)?;
    if rights.contains(Rights::EXECUTE) {
        return Err(MemError::InvalidRights);
    }
    for i in 0..count {
        let va = addr.checked_add_pages(i).ok_or(MemError::InvalidArgs)?;
        if space.map().lookup(va).is_some() {
            return Err(MemError::AlreadyExists);
        }
    }
    let block = pool.allocate(space.root(), count)?;
    let mut registered = 0usize;
    let result = (|| {
        for i in 0..count {
            let va = addr.checked_add_pages(i).ok_or(MemError::InvalidArgs)?;
            let frame = pool
                .table()
                .id_at(block.index() + i)
                .ok_or(MemError::Internal("mapped block outside table"))?;
            pool.table_mut().zero_frame(frame.index());
            {
                let page = pool.table_mut().get_mut(frame)?;
                page.owner_rights = rights;
                page.access = rights;
                page.state = PageState::Mapped;
                page.destination = Some(va);
            }
            space.map_mut().insert(va, frame)?;
            registered += 1;
        }
        let phys = pool.table().phys_of(block.index());
        kernel.map(space.root(), addr, phys, count, rights)?;
        Ok(phys)
    })();
    match result {
        Ok(phys) => Ok(MapItem {
            phys: phys.raw(),
            count: count as u32,
            rights,
            dest: addr.raw(),
        }),
        Err(err) => {
            for i in 0..registered {
                if let Some(va) = addr.checked_add_pages(i) {
                    space.map_mut().remove(va);
                }
            }
            let _ = pool.release_block(block);
            Err(err)
        }
    }
}

/// Map case (c): identity-maps a physical range outside the managed pool
/// (device I/O) through the kernel's raw primitive. No database entry.
pub(crate) fn map_device<K: KernelPort>(
    space: &mut AddressSpace,
    pool: &PageAllocator,
    kernel: &mut K,
    addr: VirtAddr,
    src: PhysAddr,
    count: usize,
    rights: Rights,
) -> Result<MapItem> {
    checked_range(addr, count)?;
    if !src.is_page_aligned() {
        return Err(MemError::InvalidArgs);
    }
    let end = src.checked_add_pages(count).ok_or(MemError::InvalidArgs)?;
    if pool.table().contains(src) || pool.table().contains(PhysAddr::new(end.raw() - 1)) {
        return Err(MemError::InvalidArgs);
    }
    kernel.map(space.root(), addr, src, count, rights)?;
    log::debug!(
        target: "pager",
        "device map {count} pages {src:?} -> {addr:?} in space {:?}",
        space.root()
    );
    Ok(MapItem { phys: src.raw(), count: count as u32, rights, dest: addr.raw() })
}

/// Map case (d): installs a cross-space sharing of `frames` (already looked
/// up in the source space) into `space` at `addr`.
pub(crate) fn share_in<K: KernelPort>(
    space: &mut AddressSpace,
    pool: &mut PageAllocator,
    kernel: &mut K,
    addr: VirtAddr,
    frames: &[FrameId],
    src_root: TaskId,
    rights: Rights,
) -> Result<MapItem> {
    checked_range(addr, frames.len())?;
    for frame in frames {
        let page = pool.table().get(*frame)?;
        if page.owner != Some(src_root) {
            return Err(MemError::InvalidRights);
        }
        if page.sharer != Some(space.root()) {
            return Err(MemError::InvalidRights);
        }
        if !page.sharer_rights.contains(rights) {
            return Err(MemError::InvalidRights);
        }
    }
    let mut installed = 0usize;
    let result = (|| {
        for (i, frame) in frames.iter().enumerate() {
            let va = addr.checked_add_pages(i).ok_or(MemError::InvalidArgs)?;
            if let Some(previous) = space.map_mut().remove(va) {
                kernel.unmap(space.root(), va, 1)?;
                pool.release_page(previous)?;
            }
            space.map_mut().insert(va, *frame)?;
            {
                let page = pool.table_mut().get_mut(*frame)?;
                page.refs += 1;
                page.access |= rights;
            }
            let phys = pool.table().phys_of(frame.index());
            kernel.map(space.root(), va, phys, 1, rights)?;
            installed += 1;
        }
        Ok(())
    })();
    if let Err(err) = result {
        for i in 0..installed {
            if let Some(va) = addr.checked_add_pages(i) {
                if let Some(frame) = space.map_mut().remove(va) {
                    let _ = kernel.unmap(space.root(), va, 1);
                    let _ = pool.release_page(frame);
                }
            }
        }
        return Err(err);
    }
    let phys = pool.table().phys_of(frames[0].index());
    Ok(MapItem { phys: phys.raw(), count: frames.len() as u32, rights, dest: addr.raw() })
}

/// Revokes the hardware mapping unconditionally. The database entry is
/// retained for pages the caller owns (they will be re-faulted) and removed
/// outright for shared-in mappings.
pub(crate) fn unmap<K: KernelPort>(
    space: &mut AddressSpace,
    pool: &mut PageAllocator,
    kernel: &mut K,
    addr: VirtAddr,
) -> Result<()> {
    let page_va = addr.align_down();
    let frame = space.map().lookup(page_va).ok_or(MemError::NotFound)?;
    kernel.unmap(space.root(), page_va, 1)?;
    let owned = pool.table().get(frame)?.owner == Some(space.root());
    if owned {
        let page = pool.table_mut().get_mut(frame)?;
        if page.state == PageState::Mapped {
            page.state = PageState::Unmapped;
        }
    } else {
        space.map_mut().remove(page_va);
        pool.release_page(frame)?;
    }
    Ok(())
}

/// Releases the whole reservation block containing the page at `addr`:
/// every registered page of the block is unmapped and unregistered, then the
/// block returns to the allocator (deferred while sharers remain).
pub(crate) fn release<K: KernelPort>(
    space: &mut AddressSpace,
    pool: &mut PageAllocator,
    kernel: &mut K,
    addr: VirtAddr,
) -> Result<()> {
    let page_va = addr.align_down();
    let frame = space.map().lookup(page_va).ok_or(MemError::NotFound)?;
    {
        let page = pool.table().get(frame)?;
        if page.owner != Some(space.root()) {
            return Err(MemError::InvalidRights);
        }
    }
    let head = {
        let table = pool.table();
        let head_index = table.block_head(frame.index());
        table.id_at(head_index).ok_or(MemError::Internal("block head outside table"))?
    };
    let group = pool.table().get(head)?.group as usize;
    for i in 0..group {
        let index = head.index() + i;
        let (destination, state) = {
            let page = pool.table().page(index);
            (page.destination, page.state)
        };
        let Some(va) = destination else { continue };
        if space.map().lookup(va) != Some(pool.table().id_at(index).ok_or(
            MemError::Internal("block page outside table"),
        )?) {
            continue;
        }
        if state == PageState::Mapped {
            kernel.unmap(space.root(), va, 1)?;
        }
        space.map_mut().remove(va);
    }
    let outcome = pool.release_block(head)?;
    log::trace!(
        target: "pager",
        "released block at {page_va:?} in space {:?}: {outcome:?}",
        space.root()
    );
    Ok(())
}

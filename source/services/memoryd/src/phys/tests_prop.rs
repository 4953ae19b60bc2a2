// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg(test)]
//! CONTEXT: Property-based tests for the buddy allocator
//! NOTE: Tests only; no allocator logic. Ensures conservation and
//! split/merge round-trips over arbitrary operation sequences.
//!
//! TEST_SCOPE:
//!   - Conservation: free pages + allocated pages always cover the pool
//!   - No page is simultaneously free and allocated
//!   - Releasing everything restores the primed bin layout

use proptest::prelude::*;

use crate::phys::allocator::PageAllocator;
use crate::phys::descriptor::PageState;
use crate::phys::table::{FrameId, FrameTable};
use crate::types::{PhysAddr, TaskId, MAX_ORDER};

const POOL_PAGES: usize = 64;
const OWNER: TaskId = TaskId::new(1);

fn pool() -> PageAllocator {
    PageAllocator::new(FrameTable::new(PhysAddr::new(0x8000_0000), POOL_PAGES)).unwrap()
}

fn allocated_pages(pool: &PageAllocator, blocks: &[FrameId]) -> usize {
    blocks
        .iter()
        .map(|id| pool.table().get(*id).map(|p| p.group as usize).unwrap_or(0))
        .sum()
}

proptest! {
    #[test]
    fn conservation_over_random_sequences(ops in proptest::collection::vec((0usize..4, 1usize..9), 1..40)) {
        let mut pool = pool();
        // One page is the zero page, held by the manager.
        let managed = POOL_PAGES - 1;
        let mut held: Vec<FrameId> = Vec::new();
        for (kind, count) in ops {
            if kind == 0 && !held.is_empty() {
                let id = held.remove(count % held.len());
                pool.release_block(id).unwrap();
            } else if let Ok(id) = pool.allocate(OWNER, count) {
                held.push(id);
            }
            let free = pool.free_pages();
            let allocated = allocated_pages(&pool, &held);
            prop_assert_eq!(free + allocated, managed);
            // No held block may point at a free page.
            for id in &held {
                prop_assert_eq!(pool.table().get(*id).unwrap().state, PageState::Allocated);
            }
        }
    }

    #[test]
    fn alloc_release_roundtrip_any_order(order in 0usize..MAX_ORDER - 1) {
        let mut pool = pool();
        if (1usize << order) >= POOL_PAGES {
            return Ok(());
        }
        let counts_before: Vec<usize> = (0..MAX_ORDER).map(|o| pool.bin_count(o)).collect();
        let free_before = pool.free_pages();
        let id = pool.allocate(OWNER, 1 << order).unwrap();
        pool.release_block(id).unwrap();
        let counts_after: Vec<usize> = (0..MAX_ORDER).map(|o| pool.bin_count(o)).collect();
        prop_assert_eq!(counts_before, counts_after);
        prop_assert_eq!(pool.free_pages(), free_before);
    }

    #[test]
    fn groups_are_uniform_within_blocks(count in 1usize..16) {
        let mut pool = pool();
        let id = pool.allocate(OWNER, count).unwrap();
        let head = id.index();
        let group = pool.table().get(id).unwrap().group;
        prop_assert_eq!(group as usize, count.next_power_of_two());
        for i in head..head + group as usize {
            prop_assert_eq!(pool.table().page(i).group, group);
        }
    }
}

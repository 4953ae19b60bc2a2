// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Physical memory: page descriptors, the frame table, the buddy allocator
//! and the page allocator built on top of it.

pub mod allocator;
pub mod buddy;
pub mod descriptor;
pub mod table;

pub use allocator::{PageAllocator, ReleaseOutcome, SharedPool};
pub use buddy::BuddyAllocator;
pub use descriptor::{PageClass, PageDescriptor, PageState, RegionKind};
pub use table::{FrameId, FrameTable};

#[cfg(test)]
mod tests_prop;

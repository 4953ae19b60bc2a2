// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Registry of live address spaces, addressed by handle, root thread, or any
//! resident thread.

use core::num::NonZeroU32;

use crate::error::{MemError, Result};
use crate::kernel::KernelPort;
use crate::phys::PageAllocator;
use crate::space::AddressSpace;
use crate::types::TaskId;

/// Handle referencing a tracked address space.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SpaceHandle(NonZeroU32);

impl SpaceHandle {
    fn from_index(index: usize) -> Self {
        // The +1 offset keeps the raw value non-zero.
        Self(NonZeroU32::new(index as u32 + 1).expect("index overflow"))
    }

    fn index(self) -> usize {
        self.0.get() as usize - 1
    }

    /// Constructs a handle from a raw value.
    pub fn from_raw(raw: u32) -> Option<Self> {
        NonZeroU32::new(raw).map(Self)
    }

    /// Raw representation of the handle.
    pub fn to_raw(self) -> u32 {
        self.0.get()
    }
}

/// Tracks every protection domain this manager pages for.
#[derive(Default)]
pub struct SpaceRegistry {
    spaces: Vec<Option<AddressSpace>>,
}

impl SpaceRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a space rooted at `root` and returns its handle.
    pub fn create(&mut self, root: TaskId, pager: TaskId) -> Result<SpaceHandle> {
        if self.by_task(root).is_some() {
            return Err(MemError::AlreadyExists);
        }
        let space = AddressSpace::new(root, pager);
        for (index, slot) in self.spaces.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(space);
                return Ok(SpaceHandle::from_index(index));
            }
        }
        self.spaces.push(Some(space));
        Ok(SpaceHandle::from_index(self.spaces.len() - 1))
    }

    /// Resolves a handle.
    pub fn get(&self, handle: SpaceHandle) -> Result<&AddressSpace> {
        self.spaces
            .get(handle.index())
            .and_then(|slot| slot.as_ref())
            .ok_or(MemError::InvalidSpace)
    }

    /// Mutable variant of [`SpaceRegistry::get`].
    pub fn get_mut(&mut self, handle: SpaceHandle) -> Result<&mut AddressSpace> {
        self.spaces
            .get_mut(handle.index())
            .and_then(|slot| slot.as_mut())
            .ok_or(MemError::InvalidSpace)
    }

    /// Finds the space whose root thread is `root`.
    pub fn by_root(&self, root: TaskId) -> Option<&AddressSpace> {
        self.spaces
            .iter()
            .flatten()
            .find(|space| space.root() == root)
    }

    /// Finds the space `task` is resident in (root included).
    pub fn by_task(&self, task: TaskId) -> Option<&AddressSpace> {
        self.spaces
            .iter()
            .flatten()
            .find(|space| space.is_resident(task))
    }

    /// Mutable variant of [`SpaceRegistry::by_task`].
    pub fn by_task_mut(&mut self, task: TaskId) -> Option<&mut AddressSpace> {
        self.spaces
            .iter_mut()
            .flatten()
            .find(|space| space.is_resident(task))
    }

    /// Number of live spaces.
    pub fn len(&self) -> usize {
        self.spaces.iter().flatten().count()
    }

    /// True when no space is tracked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Destroys a space whose threads are all torn down, discarding its
    /// mapping database and snapshots and releasing its backing pages.
    pub fn destroy<K: KernelPort>(
        &mut self,
        handle: SpaceHandle,
        pool: &mut PageAllocator,
        kernel: &mut K,
    ) -> Result<()> {
        let space = self.get_mut(handle)?;
        if space.thread_count() != 0 {
            return Err(MemError::InvalidThread);
        }
        space.teardown(pool, kernel)?;
        self.spaces[handle.index()] = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::HostPort;
    use crate::phys::FrameTable;
    use crate::types::PhysAddr;

    #[test]
    fn create_resolves_by_root_and_thread() {
        let mut registry = SpaceRegistry::new();
        let root = TaskId::new(20);
        let handle = registry.create(root, TaskId::new(1)).unwrap();
        registry.get_mut(handle).unwrap().attach_thread(TaskId::new(21)).unwrap();
        assert_eq!(registry.by_root(root).unwrap().root(), root);
        assert_eq!(registry.by_task(TaskId::new(21)).unwrap().root(), root);
        assert!(registry.by_task(TaskId::new(99)).is_none());
        assert_eq!(registry.create(root, TaskId::new(1)).unwrap_err(), MemError::AlreadyExists);
    }

    #[test]
    fn destroy_requires_torn_down_threads() {
        let mut registry = SpaceRegistry::new();
        let root = TaskId::new(30);
        let handle = registry.create(root, TaskId::new(1)).unwrap();
        let mut pool =
            PageAllocator::new(FrameTable::new(PhysAddr::new(0x8000_0000), 8)).unwrap();
        let mut kernel = HostPort::new();
        assert_eq!(
            registry.destroy(handle, &mut pool, &mut kernel).unwrap_err(),
            MemError::InvalidThread
        );
        registry.get_mut(handle).unwrap().detach_thread(root).unwrap();
        registry.destroy(handle, &mut pool, &mut kernel).unwrap();
        assert!(registry.get(handle).is_err());
        assert!(registry.by_root(root).is_none());
    }
}

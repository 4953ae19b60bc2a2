// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! The memory-manager protocol server.
//!
//! A synchronous request/reply loop: receive one frame, dispatch on the
//! decoded operation, reply, block again. All requests concerning one
//! address space are serialized through its pager; the shared physical pool
//! is the only cross-space resource and its lock is never held across a
//! reply.

mod fault;
mod ops;

use std::collections::VecDeque;

use nexus_mem_abi::{self as abi, MapItem, Rights};

use crate::error::{MemError, Result};
use crate::kernel::KernelPort;
use crate::phys::SharedPool;
use crate::space::{SpaceHandle, SpaceRegistry};
use crate::types::{PhysAddr, TaskId, VirtAddr};

/// Trait implemented by transports delivering request frames to the pager.
pub trait Transport {
    /// Error type returned by the transport.
    type Error: Into<TransportError>;

    /// Receives the next request and its sender, if any remain.
    fn recv(&mut self) -> core::result::Result<Option<(TaskId, Vec<u8>)>, Self::Error>;

    /// Sends a reply frame back to `to`.
    fn send(&mut self, to: TaskId, frame: &[u8]) -> core::result::Result<(), Self::Error>;
}

/// Errors originating from the transport layer.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Transport has been closed by the peer.
    #[error("transport closed")]
    Closed,
    /// The transport is not implemented for this build.
    #[error("transport unsupported")]
    Unsupported,
    /// Any other transport issue described via string message.
    #[error("transport error: {0}")]
    Other(String),
}

/// Errors returned by the pager server loop.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Transport level failure.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

/// In-memory transport: a queue of requests and a record of replies.
#[derive(Default)]
pub struct ChannelTransport {
    inbox: VecDeque<(TaskId, Vec<u8>)>,
    outbox: Vec<(TaskId, Vec<u8>)>,
}

impl ChannelTransport {
    /// Creates an empty transport.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a request frame from `from`.
    pub fn push_request(&mut self, from: TaskId, frame: &[u8]) {
        self.inbox.push_back((from, frame.to_vec()));
    }

    /// Replies sent so far, in order.
    pub fn replies(&self) -> &[(TaskId, Vec<u8>)] {
        &self.outbox
    }

    /// Drains the recorded replies.
    pub fn take_replies(&mut self) -> Vec<(TaskId, Vec<u8>)> {
        std::mem::take(&mut self.outbox)
    }
}

impl Transport for ChannelTransport {
    type Error = TransportError;

    fn recv(&mut self) -> core::result::Result<Option<(TaskId, Vec<u8>)>, TransportError> {
        Ok(self.inbox.pop_front())
    }

    fn send(&mut self, to: TaskId, frame: &[u8]) -> core::result::Result<(), TransportError> {
        self.outbox.push((to, frame.to_vec()));
        Ok(())
    }
}

const EMPTY_ITEM: MapItem = MapItem { phys: 0, count: 0, rights: Rights::empty(), dest: 0 };

fn map_reply(op: u8, result: Result<MapItem>) -> Vec<u8> {
    match result {
        Ok(item) => abi::encode_map_rsp(op, abi::STATUS_OK, &item).to_vec(),
        Err(err) => abi::encode_map_rsp(op, err.status(), &EMPTY_ITEM).to_vec(),
    }
}

fn status_reply(op: u8, result: Result<()>) -> Vec<u8> {
    let status = match result {
        Ok(()) => abi::STATUS_OK,
        Err(err) => err.status(),
    };
    abi::encode_status_rsp(op, status).to_vec()
}

/// The memory manager: spaces, the shared pool, and the kernel boundary.
pub struct Server<K: KernelPort> {
    pool: SharedPool,
    spaces: SpaceRegistry,
    kernel: K,
}

impl<K: KernelPort> Server<K> {
    /// Creates a server over the shared pool and a kernel port.
    pub fn new(pool: SharedPool, kernel: K) -> Self {
        Self { pool, spaces: SpaceRegistry::new(), kernel }
    }

    /// The space registry.
    pub fn spaces(&self) -> &SpaceRegistry {
        &self.spaces
    }

    /// Mutable access to the space registry.
    pub fn spaces_mut(&mut self) -> &mut SpaceRegistry {
        &mut self.spaces
    }

    /// The kernel port (hardware state, in the host build).
    pub fn kernel(&self) -> &K {
        &self.kernel
    }

    /// The shared pool handle.
    pub fn pool(&self) -> &SharedPool {
        &self.pool
    }

    /// Creates a protection domain rooted at `root`, paged by this manager
    /// on behalf of `pager`.
    pub fn create_space(&mut self, root: TaskId, pager: TaskId) -> Result<SpaceHandle> {
        self.spaces.create(root, pager)
    }

    /// Destroys a space whose threads are all torn down.
    pub fn destroy_space(&mut self, handle: SpaceHandle) -> Result<()> {
        let mut pool = self.pool.lock();
        self.spaces.destroy(handle, &mut pool, &mut self.kernel)
    }

    /// Runs the receive → dispatch → reply loop until the transport drains.
    pub fn serve<T: Transport>(&mut self, transport: &mut T) -> core::result::Result<(), ServerError> {
        loop {
            let request = transport.recv().map_err(|err| ServerError::Transport(err.into()))?;
            let Some((from, frame)) = request else { break };
            let reply = self.handle_request(from, &frame);
            transport.send(from, &reply).map_err(|err| ServerError::Transport(err.into()))?;
        }
        Ok(())
    }

    /// Dispatches one request frame and returns the encoded reply.
    pub fn handle_request(&mut self, from: TaskId, frame: &[u8]) -> Vec<u8> {
        let Some(op) = abi::decode_request_op(frame) else {
            return abi::encode_status_rsp(0, abi::STATUS_INVALID_ARGS).to_vec();
        };
        match op {
            abi::OP_FAULT => match abi::decode_fault_req(frame) {
                Some((addr, ip, access)) => map_reply(op, self.do_fault(from, addr, ip, access)),
                None => map_reply(op, Err(MemError::InvalidArgs)),
            },
            abi::OP_ALLOCATE => match abi::decode_allocate_req(frame) {
                Some((addr, count, rights, peer)) => {
                    status_reply(op, self.do_allocate(from, addr, count, rights, peer))
                }
                None => status_reply(op, Err(MemError::InvalidArgs)),
            },
            abi::OP_MAP => match abi::decode_map_req(frame) {
                Some((dest_addr, dest_space, src_addr, src_space, count, rights)) => map_reply(
                    op,
                    self.do_map(from, dest_addr, dest_space, src_addr, src_space, count, rights),
                ),
                None => map_reply(op, Err(MemError::InvalidArgs)),
            },
            abi::OP_UNMAP => match abi::decode_unmap_req(frame) {
                Some((addr, _rights)) => status_reply(op, self.do_unmap(from, addr)),
                None => status_reply(op, Err(MemError::InvalidArgs)),
            },
            abi::OP_RELEASE => match abi::decode_release_req(frame) {
                Some(addr) => status_reply(op, self.do_release(from, addr)),
                None => status_reply(op, Err(MemError::InvalidArgs)),
            },
            abi::OP_SNAPSHOT => match abi::decode_snapshot_req(frame) {
                Some((ip, sp)) => match self.do_snapshot(from, ip, sp) {
                    Ok(epoch) => abi::encode_snapshot_rsp(abi::STATUS_OK, epoch).to_vec(),
                    Err(err) => abi::encode_snapshot_rsp(err.status(), 0).to_vec(),
                },
                None => abi::encode_snapshot_rsp(abi::STATUS_INVALID_ARGS, 0).to_vec(),
            },
            abi::OP_RESTORE => match abi::decode_restore_req(frame) {
                Some(generation) => match self.do_restore(from, generation) {
                    Ok((ip, sp)) => abi::encode_restore_rsp(abi::STATUS_OK, ip, sp).to_vec(),
                    Err(err) => abi::encode_restore_rsp(err.status(), 0, 0).to_vec(),
                },
                None => abi::encode_restore_rsp(abi::STATUS_INVALID_ARGS, 0, 0).to_vec(),
            },
            other => abi::encode_status_rsp(other, abi::STATUS_INVALID_ARGS).to_vec(),
        }
    }

    fn do_fault(&mut self, from: TaskId, addr: u64, ip: u64, access: Rights) -> Result<MapItem> {
        let mut pool = self.pool.lock();
        let space = self.spaces.by_task_mut(from).ok_or(MemError::InvalidThread)?;
        fault::resolve_fault(space, &mut pool, &mut self.kernel, VirtAddr::new(addr), ip, access)
    }

    fn do_allocate(
        &mut self,
        from: TaskId,
        addr: u64,
        count: u32,
        rights: Rights,
        peer: u64,
    ) -> Result<()> {
        let peer_root = if peer == abi::PEER_NONE {
            None
        } else {
            Some(self.spaces.by_task(TaskId::new(peer)).ok_or(MemError::InvalidSpace)?.root())
        };
        let mut pool = self.pool.lock();
        let space = self.spaces.by_task_mut(from).ok_or(MemError::InvalidThread)?;
        ops::reserve(space, &mut pool, VirtAddr::new(addr), count as usize, rights, peer_root)
    }

    #[allow(clippy::too_many_arguments)]
    fn do_map(
        &mut self,
        from: TaskId,
        dest_addr: u64,
        dest_space: u64,
        src_addr: u64,
        src_space: u64,
        count: u32,
        rights: Rights,
    ) -> Result<MapItem> {
        let count = count as usize;
        let dest_task = if dest_space == abi::SPACE_SELF { from } else { TaskId::new(dest_space) };
        let dest_va = VirtAddr::new(dest_addr);
        if src_addr == abi::SRC_WILDCARD {
            let mut pool = self.pool.lock();
            let space = self.spaces.by_task_mut(dest_task).ok_or(MemError::InvalidSpace)?;
            return ops::map_anonymous(space, &mut pool, &mut self.kernel, dest_va, count, rights);
        }
        if src_space == abi::SPACE_PHYSICAL {
            let pool = self.pool.lock();
            let space = self.spaces.by_task_mut(dest_task).ok_or(MemError::InvalidSpace)?;
            return ops::map_device(
                space,
                &pool,
                &mut self.kernel,
                dest_va,
                PhysAddr::new(src_addr),
                count,
                rights,
            );
        }
        if src_space == abi::SPACE_SELF {
            if dest_space != abi::SPACE_SELF || dest_addr != src_addr {
                return Err(MemError::InvalidArgs);
            }
            let mut pool = self.pool.lock();
            let space = self.spaces.by_task_mut(from).ok_or(MemError::InvalidThread)?;
            return ops::remap(space, &mut pool, &mut self.kernel, dest_va, count, rights);
        }
        // Cross-space share: look the source pages up first, then install.
        let src_va = VirtAddr::new(src_addr);
        if !src_va.is_page_aligned() || count == 0 {
            return Err(MemError::InvalidArgs);
        }
        let (src_root, frames) = {
            let src = self.spaces.by_task(TaskId::new(src_space)).ok_or(MemError::InvalidSpace)?;
            let mut frames = Vec::with_capacity(count);
            for i in 0..count {
                let va = src_va.checked_add_pages(i).ok_or(MemError::InvalidArgs)?;
                frames.push(src.map().lookup(va).ok_or(MemError::NotFound)?);
            }
            (src.root(), frames)
        };
        let mut pool = self.pool.lock();
        let dest = self.spaces.by_task_mut(dest_task).ok_or(MemError::InvalidSpace)?;
        ops::share_in(dest, &mut pool, &mut self.kernel, dest_va, &frames, src_root, rights)
    }

    fn do_unmap(&mut self, from: TaskId, addr: u64) -> Result<()> {
        let mut pool = self.pool.lock();
        let space = self.spaces.by_task_mut(from).ok_or(MemError::InvalidThread)?;
        ops::unmap(space, &mut pool, &mut self.kernel, VirtAddr::new(addr))
    }

    fn do_release(&mut self, from: TaskId, addr: u64) -> Result<()> {
        let mut pool = self.pool.lock();
        let space = self.spaces.by_task_mut(from).ok_or(MemError::InvalidThread)?;
        ops::release(space, &mut pool, &mut self.kernel, VirtAddr::new(addr))
    }

    fn do_snapshot(&mut self, from: TaskId, ip: u64, sp: u64) -> Result<u32> {
        let mut pool = self.pool.lock();
        let space = self.spaces.by_task_mut(from).ok_or(MemError::InvalidThread)?;
        space.snapshot(&mut pool, &mut self.kernel, ip, sp)
    }

    fn do_restore(&mut self, from: TaskId, generation: u32) -> Result<(u64, u64)> {
        let mut pool = self.pool.lock();
        let space = self.spaces.by_task_mut(from).ok_or(MemError::InvalidThread)?;
        space.restore(&mut pool, &mut self.kernel, generation)
    }
}

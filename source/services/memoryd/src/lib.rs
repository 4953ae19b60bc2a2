// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![forbid(unsafe_code)]
#![deny(clippy::all)]

//! CONTEXT: memoryd — the user-level memory manager
//! OWNERS: @runtime
//! PUBLIC API: Server, Transport, PageAllocator, AddressSpace, MemoryMap
//! DEPENDS_ON: nexus-mem-abi, parking_lot, thiserror, serde/toml, log
//! INVARIANTS: One live mapping per virtual address per space; no operation
//! leaks physical pages on its own failure path; the pool lock is never held
//! across a reply
//!
//! memoryd turns the flat physical page pool into demand-paged, copy-on-write,
//! checkpointable address spaces. The domain logic is host-first: everything
//! below the [`kernel::KernelPort`] seam and above the transport runs and is
//! tested without a kernel.

pub mod bootmap;
pub mod error;
pub mod kernel;
pub mod pager;
pub mod phys;
pub mod space;
pub mod types;

pub use bootmap::{ConfigError, MemoryMap};
pub use error::{MemError, Result};
pub use kernel::{HostPort, KernelPort};
pub use pager::{ChannelTransport, Server, ServerError, Transport, TransportError};
pub use phys::{FrameId, FrameTable, PageAllocator, SharedPool};
pub use space::{AddressSpace, SpaceHandle, SpaceRegistry};
pub use types::{PhysAddr, TaskId, VirtAddr, PAGE_SIZE};

/// Default location of the boot memory map on the system image.
pub const DEFAULT_BOOTMAP: &str = "/config/memoryd/bootmap.toml";

/// Errors surfaced by the daemon entry point.
#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    /// Loading the boot memory map failed.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// Seeding the physical pool failed.
    #[error("pool init failed: {0}")]
    Pool(#[from] MemError),
    /// The server loop ended with a transport failure.
    #[error(transparent)]
    Server(#[from] ServerError),
}

/// Daemon entry: loads the boot memory map (`MEMORYD_BOOTMAP` overrides the
/// default location), seeds the shared pool and serves on the default system
/// transport.
pub fn daemon_main() -> core::result::Result<(), DaemonError> {
    let path = std::env::var_os("MEMORYD_BOOTMAP")
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|| std::path::PathBuf::from(DEFAULT_BOOTMAP));
    let map = MemoryMap::load(&path)?;
    let pool = PageAllocator::shared(map.seed_table())?;
    let server = Server::new(pool, HostPort::new());
    run_default(server)?;
    Ok(())
}

/// Executes `server` over the default system transport (currently
/// unsupported on the host build; the OS build wires the kernel endpoint).
pub fn run_default<K: KernelPort>(_server: Server<K>) -> core::result::Result<(), ServerError> {
    Err(ServerError::Transport(TransportError::Unsupported))
}

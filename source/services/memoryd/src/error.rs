// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Protocol-visible error taxonomy.
//!
//! Every handler returns one of these synchronously; the pager maps them onto
//! the wire status bytes of `nexus-mem-abi`. `Internal` marks unrecoverable
//! conditions (bin corruption, stale frame handles) that abort the operation
//! rather than attempt repair.

use nexus_mem_abi as abi;

/// Result alias used throughout the service.
pub type Result<T> = core::result::Result<T, MemError>;

/// Errors surfaced by memory-manager operations.
#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum MemError {
    /// Request payload was malformed.
    #[error("invalid arguments")]
    InvalidArgs,
    /// Access outside owner/sharer permission or the user address window.
    #[error("invalid rights")]
    InvalidRights,
    /// Address-space identity did not resolve.
    #[error("invalid space")]
    InvalidSpace,
    /// Thread identity did not resolve.
    #[error("invalid thread")]
    InvalidThread,
    /// No mapping entry, or no snapshot at the requested generation.
    #[error("not found")]
    NotFound,
    /// Double reservation.
    #[error("already exists")]
    AlreadyExists,
    /// The buddy allocator is exhausted.
    #[error("out of memory")]
    OutOfMemory,
    /// Request exceeds the fixed operation limits.
    #[error("out of range")]
    OutOfRange,
    /// Unrecoverable internal condition; the operation was aborted.
    #[error("internal error: {0}")]
    Internal(&'static str),
}

impl MemError {
    /// Maps the error onto its wire status byte.
    pub fn status(self) -> u8 {
        match self {
            MemError::InvalidArgs => abi::STATUS_INVALID_ARGS,
            MemError::InvalidRights => abi::STATUS_INVALID_RIGHTS,
            MemError::InvalidSpace => abi::STATUS_INVALID_SPACE,
            MemError::InvalidThread => abi::STATUS_INVALID_THREAD,
            MemError::NotFound => abi::STATUS_NOT_FOUND,
            MemError::AlreadyExists => abi::STATUS_ALREADY_EXISTS,
            MemError::OutOfMemory => abi::STATUS_OUT_OF_MEMORY,
            MemError::OutOfRange => abi::STATUS_OUT_OF_RANGE,
            MemError::Internal(_) => abi::STATUS_INTERNAL,
        }
    }
}

// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), no_std)]
#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs)]

//! CONTEXT: Pager protocol frames shared between memoryd and its clients
//! OWNERS: @runtime
//! PUBLIC API: Rights, status codes, encode_*/decode_* per operation
//! DEPENDS_ON: bitflags
//! INVARIANTS: Frames are `[M,M,ver,op]`-prefixed LE byte strings; replies set bit 7 of op

use bitflags::bitflags;

/// First magic byte (`'M'`).
pub const MAGIC0: u8 = b'M';
/// Second magic byte (`'M'`).
pub const MAGIC1: u8 = b'M';
/// Pager protocol version.
pub const VERSION: u8 = 1;

/// Page-fault resolution request opcode.
pub const OP_FAULT: u8 = 1;
/// Explicit reservation opcode.
pub const OP_ALLOCATE: u8 = 2;
/// Map opcode (re-map, wildcard, device, cross-space share).
pub const OP_MAP: u8 = 3;
/// Unmap opcode.
pub const OP_UNMAP: u8 = 4;
/// Release opcode.
pub const OP_RELEASE: u8 = 5;
/// Snapshot (checkpoint) opcode.
pub const OP_SNAPSHOT: u8 = 6;
/// Restore (rollback) opcode.
pub const OP_RESTORE: u8 = 7;

/// Status: operation succeeded.
pub const STATUS_OK: u8 = 0;
/// Status: request payload was malformed.
pub const STATUS_INVALID_ARGS: u8 = 1;
/// Status: access outside owner/sharer permission or the user window.
pub const STATUS_INVALID_RIGHTS: u8 = 2;
/// Status: address-space identity did not resolve.
pub const STATUS_INVALID_SPACE: u8 = 3;
/// Status: thread identity did not resolve.
pub const STATUS_INVALID_THREAD: u8 = 4;
/// Status: no mapping entry, or no snapshot at the requested generation.
pub const STATUS_NOT_FOUND: u8 = 5;
/// Status: double reservation.
pub const STATUS_ALREADY_EXISTS: u8 = 6;
/// Status: physical page pool exhausted.
pub const STATUS_OUT_OF_MEMORY: u8 = 7;
/// Status: request exceeds a fixed-size reply buffer.
pub const STATUS_OUT_OF_RANGE: u8 = 8;
/// Status: unrecoverable internal condition; the operation was aborted.
pub const STATUS_INTERNAL: u8 = 9;

/// Wildcard source address: allocate-on-demand map case.
pub const SRC_WILDCARD: u64 = u64::MAX;
/// Space operand meaning "the requesting space".
pub const SPACE_SELF: u64 = 0;
/// Space operand meaning "the source address is physical" (device map case).
pub const SPACE_PHYSICAL: u64 = u64::MAX;
/// Peer operand meaning "no sharing peer" in reservation requests.
pub const PEER_NONE: u64 = 0;

bitflags! {
    /// Access rights carried in requests and mapping replies.
    #[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
    pub struct Rights: u8 {
        /// Read access.
        const READ = 1 << 0;
        /// Write access.
        const WRITE = 1 << 1;
        /// Execute access.
        const EXECUTE = 1 << 2;
    }
}

impl Rights {
    /// Read plus write, the grant handed to anonymous pages.
    pub const RW: Rights = Rights::READ.union(Rights::WRITE);
}

/// A resolved mapping as carried in fault and map replies.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MapItem {
    /// Physical base address of the mapped frame(s).
    pub phys: u64,
    /// Number of pages covered.
    pub count: u32,
    /// Rights granted by the pager.
    pub rights: Rights,
    /// Virtual destination address the mapping is installed at.
    pub dest: u64,
}

fn put_header(out: &mut [u8], op: u8) {
    out[0] = MAGIC0;
    out[1] = MAGIC1;
    out[2] = VERSION;
    out[3] = op;
}

fn check_header(frame: &[u8], op: u8) -> bool {
    frame.len() >= 4
        && frame[0] == MAGIC0
        && frame[1] == MAGIC1
        && frame[2] == VERSION
        && frame[3] == op
}

fn get_u32(frame: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([frame[at], frame[at + 1], frame[at + 2], frame[at + 3]])
}

fn get_u64(frame: &[u8], at: usize) -> u64 {
    u64::from_le_bytes([
        frame[at],
        frame[at + 1],
        frame[at + 2],
        frame[at + 3],
        frame[at + 4],
        frame[at + 5],
        frame[at + 6],
        frame[at + 7],
    ])
}

/// Decodes the opcode from any request frame.
pub fn decode_request_op(frame: &[u8]) -> Option<u8> {
    if frame.len() < 4 || frame[0] != MAGIC0 || frame[1] != MAGIC1 || frame[2] != VERSION {
        return None;
    }
    Some(frame[3])
}

/// Encodes a page-fault request.
///
/// Frame: `[M,M,ver,OP_FAULT, addr:u64le, ip:u64le, access:u8]`
pub fn encode_fault_req(addr: u64, ip: u64, access: Rights) -> [u8; 21] {
    let mut out = [0u8; 21];
    put_header(&mut out, OP_FAULT);
    out[4..12].copy_from_slice(&addr.to_le_bytes());
    out[12..20].copy_from_slice(&ip.to_le_bytes());
    out[20] = access.bits();
    out
}

/// Decodes a page-fault request and returns `(addr, ip, access)`.
pub fn decode_fault_req(frame: &[u8]) -> Option<(u64, u64, Rights)> {
    if frame.len() != 21 || !check_header(frame, OP_FAULT) {
        return None;
    }
    let access = Rights::from_bits(frame[20])?;
    Some((get_u64(frame, 4), get_u64(frame, 12), access))
}

/// Encodes a reservation request.
///
/// Frame: `[M,M,ver,OP_ALLOCATE, addr:u64le, count:u32le, rights:u8, peer:u64le]`
pub fn encode_allocate_req(addr: u64, count: u32, rights: Rights, peer: u64) -> [u8; 25] {
    let mut out = [0u8; 25];
    put_header(&mut out, OP_ALLOCATE);
    out[4..12].copy_from_slice(&addr.to_le_bytes());
    out[12..16].copy_from_slice(&count.to_le_bytes());
    out[16] = rights.bits();
    out[17..25].copy_from_slice(&peer.to_le_bytes());
    out
}

/// Decodes a reservation request and returns `(addr, count, rights, peer)`.
pub fn decode_allocate_req(frame: &[u8]) -> Option<(u64, u32, Rights, u64)> {
    if frame.len() != 25 || !check_header(frame, OP_ALLOCATE) {
        return None;
    }
    let rights = Rights::from_bits(frame[16])?;
    Some((get_u64(frame, 4), get_u32(frame, 12), rights, get_u64(frame, 17)))
}

/// Encodes a map request.
///
/// Frame: `[M,M,ver,OP_MAP, dest_addr:u64le, dest_space:u64le, src_addr:u64le,
/// src_space:u64le, count:u32le, rights:u8]`
pub fn encode_map_req(
    dest_addr: u64,
    dest_space: u64,
    src_addr: u64,
    src_space: u64,
    count: u32,
    rights: Rights,
) -> [u8; 41] {
    let mut out = [0u8; 41];
    put_header(&mut out, OP_MAP);
    out[4..12].copy_from_slice(&dest_addr.to_le_bytes());
    out[12..20].copy_from_slice(&dest_space.to_le_bytes());
    out[20..28].copy_from_slice(&src_addr.to_le_bytes());
    out[28..36].copy_from_slice(&src_space.to_le_bytes());
    out[36..40].copy_from_slice(&count.to_le_bytes());
    out[40] = rights.bits();
    out
}

/// Decodes a map request and returns
/// `(dest_addr, dest_space, src_addr, src_space, count, rights)`.
pub fn decode_map_req(frame: &[u8]) -> Option<(u64, u64, u64, u64, u32, Rights)> {
    if frame.len() != 41 || !check_header(frame, OP_MAP) {
        return None;
    }
    let rights = Rights::from_bits(frame[40])?;
    Some((
        get_u64(frame, 4),
        get_u64(frame, 12),
        get_u64(frame, 20),
        get_u64(frame, 28),
        get_u32(frame, 36),
        rights,
    ))
}

/// Encodes an unmap request.
///
/// Frame: `[M,M,ver,OP_UNMAP, addr:u64le, rights:u8]`
pub fn encode_unmap_req(addr: u64, rights: Rights) -> [u8; 13] {
    let mut out = [0u8; 13];
    put_header(&mut out, OP_UNMAP);
    out[4..12].copy_from_slice(&addr.to_le_bytes());
    out[12] = rights.bits();
    out
}

/// Decodes an unmap request and returns `(addr, rights)`.
pub fn decode_unmap_req(frame: &[u8]) -> Option<(u64, Rights)> {
    if frame.len() != 13 || !check_header(frame, OP_UNMAP) {
        return None;
    }
    let rights = Rights::from_bits(frame[12])?;
    Some((get_u64(frame, 4), rights))
}

/// Encodes a release request.
///
/// Frame: `[M,M,ver,OP_RELEASE, addr:u64le]`
pub fn encode_release_req(addr: u64) -> [u8; 12] {
    let mut out = [0u8; 12];
    put_header(&mut out, OP_RELEASE);
    out[4..12].copy_from_slice(&addr.to_le_bytes());
    out
}

/// Decodes a release request and returns the reservation address.
pub fn decode_release_req(frame: &[u8]) -> Option<u64> {
    if frame.len() != 12 || !check_header(frame, OP_RELEASE) {
        return None;
    }
    Some(get_u64(frame, 4))
}

/// Encodes a snapshot request.
///
/// Frame: `[M,M,ver,OP_SNAPSHOT, ip:u64le, sp:u64le]`
pub fn encode_snapshot_req(ip: u64, sp: u64) -> [u8; 20] {
    let mut out = [0u8; 20];
    put_header(&mut out, OP_SNAPSHOT);
    out[4..12].copy_from_slice(&ip.to_le_bytes());
    out[12..20].copy_from_slice(&sp.to_le_bytes());
    out
}

/// Decodes a snapshot request and returns `(ip, sp)`.
pub fn decode_snapshot_req(frame: &[u8]) -> Option<(u64, u64)> {
    if frame.len() != 20 || !check_header(frame, OP_SNAPSHOT) {
        return None;
    }
    Some((get_u64(frame, 4), get_u64(frame, 12)))
}

/// Encodes a restore request.
///
/// Frame: `[M,M,ver,OP_RESTORE, generation:u32le]`
pub fn encode_restore_req(generation: u32) -> [u8; 8] {
    let mut out = [0u8; 8];
    put_header(&mut out, OP_RESTORE);
    out[4..8].copy_from_slice(&generation.to_le_bytes());
    out
}

/// Decodes a restore request and returns the target generation.
pub fn decode_restore_req(frame: &[u8]) -> Option<u32> {
    if frame.len() != 8 || !check_header(frame, OP_RESTORE) {
        return None;
    }
    Some(get_u32(frame, 4))
}

/// Encodes a status-only reply for `op`.
///
/// Frame: `[M,M,ver,op|0x80, status:u8]`
pub fn encode_status_rsp(op: u8, status: u8) -> [u8; 5] {
    let mut out = [0u8; 5];
    put_header(&mut out, op | 0x80);
    out[4] = status;
    out
}

/// Decodes a status-only reply and returns `(op, status)`.
pub fn decode_status_rsp(frame: &[u8]) -> Option<(u8, u8)> {
    if frame.len() != 5
        || frame[0] != MAGIC0
        || frame[1] != MAGIC1
        || frame[2] != VERSION
        || frame[3] & 0x80 == 0
    {
        return None;
    }
    Some((frame[3] & !0x80, frame[4]))
}

/// Encodes a mapping reply for `op` (fault or map).
///
/// Frame: `[M,M,ver,op|0x80, status:u8, phys:u64le, count:u32le, rights:u8, dest:u64le]`
pub fn encode_map_rsp(op: u8, status: u8, item: &MapItem) -> [u8; 26] {
    let mut out = [0u8; 26];
    put_header(&mut out, op | 0x80);
    out[4] = status;
    out[5..13].copy_from_slice(&item.phys.to_le_bytes());
    out[13..17].copy_from_slice(&item.count.to_le_bytes());
    out[17] = item.rights.bits();
    out[18..26].copy_from_slice(&item.dest.to_le_bytes());
    out
}

/// Decodes a mapping reply and returns `(op, status, item)`.
pub fn decode_map_rsp(frame: &[u8]) -> Option<(u8, u8, MapItem)> {
    if frame.len() != 26
        || frame[0] != MAGIC0
        || frame[1] != MAGIC1
        || frame[2] != VERSION
        || frame[3] & 0x80 == 0
    {
        return None;
    }
    let rights = Rights::from_bits(frame[17])?;
    let item = MapItem {
        phys: get_u64(frame, 5),
        count: get_u32(frame, 13),
        rights,
        dest: get_u64(frame, 18),
    };
    Some((frame[3] & !0x80, frame[4], item))
}

/// Encodes a snapshot reply carrying the new generation.
///
/// Frame: `[M,M,ver,OP_SNAPSHOT|0x80, status:u8, generation:u32le]`
pub fn encode_snapshot_rsp(status: u8, generation: u32) -> [u8; 9] {
    let mut out = [0u8; 9];
    put_header(&mut out, OP_SNAPSHOT | 0x80);
    out[4] = status;
    out[5..9].copy_from_slice(&generation.to_le_bytes());
    out
}

/// Decodes a snapshot reply and returns `(status, generation)`.
pub fn decode_snapshot_rsp(frame: &[u8]) -> Option<(u8, u32)> {
    if frame.len() != 9 || !check_header(frame, OP_SNAPSHOT | 0x80) {
        return None;
    }
    Some((frame[4], get_u32(frame, 5)))
}

/// Encodes a restore reply carrying the saved register context.
///
/// Frame: `[M,M,ver,OP_RESTORE|0x80, status:u8, ip:u64le, sp:u64le]`
pub fn encode_restore_rsp(status: u8, ip: u64, sp: u64) -> [u8; 21] {
    let mut out = [0u8; 21];
    put_header(&mut out, OP_RESTORE | 0x80);
    out[4] = status;
    out[5..13].copy_from_slice(&ip.to_le_bytes());
    out[13..21].copy_from_slice(&sp.to_le_bytes());
    out
}

/// Decodes a restore reply and returns `(status, ip, sp)`.
pub fn decode_restore_rsp(frame: &[u8]) -> Option<(u8, u64, u64)> {
    if frame.len() != 21 || !check_header(frame, OP_RESTORE | 0x80) {
        return None;
    }
    Some((frame[4], get_u64(frame, 5), get_u64(frame, 13)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fault_req_golden() {
        let frame = encode_fault_req(0x1000, 0x8000_0040, Rights::WRITE);
        const GOLDEN_PREFIX: [u8; 4] = [b'M', b'M', 1, 1];
        assert_eq!(&frame[..4], &GOLDEN_PREFIX);
        assert_eq!(frame[20], 2);
        let (addr, ip, access) = decode_fault_req(&frame).unwrap();
        assert_eq!(addr, 0x1000);
        assert_eq!(ip, 0x8000_0040);
        assert_eq!(access, Rights::WRITE);
    }

    #[test]
    fn fault_req_rejects_bad_rights_bits() {
        let mut frame = encode_fault_req(0x1000, 0x2000, Rights::READ);
        frame[20] = 0xF0;
        assert!(decode_fault_req(&frame).is_none());
    }

    #[test]
    fn map_rsp_golden() {
        let item = MapItem { phys: 0x8020_0000, count: 4, rights: Rights::RW, dest: 0x4000 };
        let frame = encode_map_rsp(OP_MAP, STATUS_OK, &item);
        assert_eq!(frame[3], OP_MAP | 0x80);
        assert_eq!(frame[4], STATUS_OK);
        let (op, status, decoded) = decode_map_rsp(&frame).unwrap();
        assert_eq!(op, OP_MAP);
        assert_eq!(status, STATUS_OK);
        assert_eq!(decoded, item);
    }

    #[test]
    fn reply_bit_is_mandatory() {
        let frame = encode_status_rsp(OP_UNMAP, STATUS_OK);
        assert!(decode_status_rsp(&frame).is_some());
        let req = encode_release_req(0x3000);
        assert!(decode_status_rsp(&req).is_none());
    }
}

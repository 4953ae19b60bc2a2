// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Frame round-trip and golden-byte coverage for the pager protocol.

use nexus_mem_abi::*;

#[test]
fn allocate_req_golden() {
    let frame = encode_allocate_req(0x0040_0000, 3, Rights::RW, PEER_NONE);
    const GOLDEN_PREFIX: [u8; 4] = [b'M', b'M', 1, 2];
    assert_eq!(&frame[..4], &GOLDEN_PREFIX);
    assert_eq!(&frame[4..12], &0x0040_0000u64.to_le_bytes());
    assert_eq!(&frame[12..16], &3u32.to_le_bytes());
    assert_eq!(frame[16], 3); // READ | WRITE
    let (addr, count, rights, peer) = decode_allocate_req(&frame).unwrap();
    assert_eq!((addr, count, rights, peer), (0x0040_0000, 3, Rights::RW, PEER_NONE));
}

#[test]
fn map_req_roundtrip_all_cases() {
    // (a) re-map own reservation, (b) wildcard, (c) physical, (d) cross-space.
    let cases = [
        (0x5000, SPACE_SELF, 0x5000, SPACE_SELF, 1, Rights::RW),
        (0x6000, SPACE_SELF, SRC_WILDCARD, SPACE_SELF, 2, Rights::READ),
        (0x7000, SPACE_SELF, 0xFEE0_0000, SPACE_PHYSICAL, 1, Rights::RW),
        (0x8000, 0x77, 0x9000, 0x42, 1, Rights::READ),
    ];
    for (dest, dspace, src, sspace, count, rights) in cases {
        let frame = encode_map_req(dest, dspace, src, sspace, count, rights);
        let decoded = decode_map_req(&frame).unwrap();
        assert_eq!(decoded, (dest, dspace, src, sspace, count, rights));
    }
}

#[test]
fn unmap_release_roundtrip() {
    let frame = encode_unmap_req(0xA000, Rights::WRITE);
    assert_eq!(decode_unmap_req(&frame).unwrap(), (0xA000, Rights::WRITE));
    let frame = encode_release_req(0xB000);
    assert_eq!(decode_release_req(&frame).unwrap(), 0xB000);
}

#[test]
fn snapshot_restore_roundtrip() {
    let frame = encode_snapshot_req(0x8000_1234, 0x3FFF_FFF0);
    assert_eq!(decode_snapshot_req(&frame).unwrap(), (0x8000_1234, 0x3FFF_FFF0));

    let frame = encode_restore_req(7);
    assert_eq!(decode_restore_req(&frame).unwrap(), 7);

    let rsp = encode_snapshot_rsp(STATUS_OK, 7);
    assert_eq!(decode_snapshot_rsp(&rsp).unwrap(), (STATUS_OK, 7));

    let rsp = encode_restore_rsp(STATUS_OK, 0x8000_1234, 0x3FFF_FFF0);
    assert_eq!(decode_restore_rsp(&rsp).unwrap(), (STATUS_OK, 0x8000_1234, 0x3FFF_FFF0));
}

#[test]
fn restore_rsp_golden() {
    let frame = encode_restore_rsp(STATUS_NOT_FOUND, 0, 0);
    const GOLDEN: [u8; 21] = [
        b'M', b'M', 1, 0x87, // OP_RESTORE | 0x80
        5, // STATUS_NOT_FOUND
        0, 0, 0, 0, 0, 0, 0, 0, // ip
        0, 0, 0, 0, 0, 0, 0, 0, // sp
    ];
    assert_eq!(frame, GOLDEN);
}

#[test]
fn truncated_frames_rejected() {
    let frame = encode_map_req(0, 0, 0, 0, 1, Rights::READ);
    for cut in 0..frame.len() {
        assert!(decode_map_req(&frame[..cut]).is_none());
    }
    assert!(decode_request_op(&[b'M', b'M']).is_none());
    assert!(decode_request_op(&[b'X', b'M', 1, 1]).is_none());
}

#[test]
fn request_op_dispatch() {
    assert_eq!(decode_request_op(&encode_fault_req(0, 0, Rights::READ)).unwrap(), OP_FAULT);
    assert_eq!(decode_request_op(&encode_snapshot_req(0, 0)).unwrap(), OP_SNAPSHOT);
    assert_eq!(decode_request_op(&encode_restore_req(1)).unwrap(), OP_RESTORE);
}

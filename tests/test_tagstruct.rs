// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// TagStruct integration tests covering the wire shapes the protocol layer
// actually builds (ack events, SHM_DATA descriptors) rather than isolated
// scalar round trips.

use inc_runtime::TagStruct;

#[test]
fn ack_event_payload_round_trips_in_field_order() {
    let mut ts = TagStruct::new();
    ts.put_str("ack");
    ts.put_u32(7); // channel_id
    ts.put_u32(42); // seq_num
    ts.put_u32(3); // block_id
    ts.put_u32(256); // len

    let mut read = TagStruct::from_bytes(ts.freeze());
    assert_eq!(read.get_str(), Some("ack".to_string()));
    assert_eq!(read.get_u32(), Some(7));
    assert_eq!(read.get_u32(), Some(42));
    assert_eq!(read.get_u32(), Some(3));
    assert_eq!(read.get_u32(), Some(256));
}

#[test]
fn shm_data_descriptor_payload_round_trips() {
    let mut ts = TagStruct::new();
    ts.put_u32(11); // block_id
    ts.put_i64(-2); // shm_id
    ts.put_str("/inc_pool_9"); // segment_name
    ts.put_u64(4096); // offset
    ts.put_u64(512); // size
    ts.put_u64(1_000); // pos

    let mut read = TagStruct::from_bytes(ts.freeze());
    assert_eq!(read.get_u32(), Some(11));
    assert_eq!(read.get_i64(), Some(-2));
    assert_eq!(read.get_str(), Some("/inc_pool_9".to_string()));
    assert_eq!(read.get_u64(), Some(4096));
    assert_eq!(read.get_u64(), Some(512));
    assert_eq!(read.get_u64(), Some(1_000));
}

#[test]
fn inline_write_payload_pos_plus_bytes_round_trips_zero_copy() {
    let payload = b"stream chunk payload";
    let mut ts = TagStruct::new();
    ts.put_u64(64);
    ts.put_bytes(payload);

    let mut read = TagStruct::from_bytes(ts.freeze());
    assert_eq!(read.get_u64(), Some(64));
    let bytes = read.get_bytes().expect("bytes element");
    assert_eq!(&bytes[..], payload);
}

#[test]
fn malformed_ack_missing_fields_is_rejected_field_by_field() {
    // Only 3 of the 4 expected u32 fields are present after the tag.
    let mut ts = TagStruct::new();
    ts.put_str("ack");
    ts.put_u32(1);
    ts.put_u32(2);
    ts.put_u32(3);

    let mut read = TagStruct::from_bytes(ts.freeze());
    assert_eq!(read.get_str(), Some("ack".to_string()));
    assert_eq!(read.get_u32(), Some(1));
    assert_eq!(read.get_u32(), Some(2));
    assert_eq!(read.get_u32(), Some(3));
    assert_eq!(read.get_u32(), None); // len missing
}

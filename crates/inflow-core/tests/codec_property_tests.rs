//! Property-based tests for the frame codec
//!
//! These tests verify that a body survives encoding and decoding no matter
//! how the wire bytes are split into reads and writes.

use inflow_core::protocol::{
    encode_frame, CodecState, ConnectionState, DecodeStatus, START_BYTE, TRAILER_BYTE_1,
    TRAILER_BYTE_2,
};
use proptest::prelude::*;

/// Generate a body that cannot be mistaken for framing
fn arb_body() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>().prop_filter("no start byte", |b| *b != START_BYTE), 0..600)
        .prop_filter("no embedded trailer", |body| {
            !body
                .windows(2)
                .any(|w| w[0] == TRAILER_BYTE_1 && w[1] == TRAILER_BYTE_2)
        })
}

/// Generate read sizes, cycled over the wire bytes
fn arb_chunk_sizes() -> impl Strategy<Value = Vec<usize>> {
    prop::collection::vec(1usize..32, 1..8)
}

fn decode_in_chunks(wire: &[u8], sizes: &[usize], max_frame_size: usize) -> (ConnectionState, usize) {
    let mut codec = ConnectionState::new(max_frame_size);
    let mut offset = 0;
    let mut reads = 0;
    for size in sizes.iter().cycle() {
        if offset >= wire.len() {
            break;
        }
        let end = (offset + size).min(wire.len());
        let status = codec.decode(&wire[offset..end]).expect("well-formed frame");
        reads += 1;
        match status {
            DecodeStatus::Complete { consumed } => {
                assert_eq!(offset + consumed, wire.len());
                break;
            }
            DecodeStatus::Incomplete => offset = end,
            DecodeStatus::Ignored => panic!("decoder ignored input while reading"),
        }
    }
    (codec, reads)
}

proptest! {
    /// Property: A framed body decodes to itself for any split into reads
    #[test]
    fn frame_round_trip_across_chunk_boundaries(body in arb_body(), sizes in arb_chunk_sizes()) {
        let wire = encode_frame(&body);
        let (codec, _) = decode_in_chunks(&wire, &sizes, 1024);
        prop_assert_eq!(codec.state(), CodecState::ReadComplete);
        prop_assert_eq!(codec.message(), body.as_slice());
    }

    /// Property: Encoding into buffers of any size produces the canonical frame
    #[test]
    fn encode_into_any_buffer_size(body in arb_body(), out_size in 1usize..64) {
        let mut codec = ConnectionState::new(1024);
        codec.decode(&encode_frame(b"request")).unwrap();
        codec.begin_response(body.clone()).unwrap();

        let mut wire = Vec::new();
        let mut out = vec![0u8; out_size];
        while !codec.is_write_complete() {
            let n = codec.encode(&mut out);
            prop_assert!(n > 0);
            wire.extend_from_slice(&out[..n]);
        }
        prop_assert_eq!(wire, encode_frame(&body));
    }
}

#[test]
fn test_round_trip_body_lengths_zero_one_and_large() {
    let buffer_size = 64;
    for body in [Vec::new(), vec![b'x'], vec![b'y'; buffer_size * 5 + 3]] {
        let wire = encode_frame(&body);
        let (codec, reads) = decode_in_chunks(&wire, &[buffer_size], 1024);
        assert_eq!(codec.message(), body.as_slice());
        if body.len() > buffer_size {
            assert!(reads > 1);
        }
    }
}

#[test]
fn test_framing_error_then_recovery_on_same_codec() {
    let mut codec = ConnectionState::new(1024);
    assert!(codec.decode(b"noise").is_err());
    assert_eq!(codec.state(), CodecState::Error);

    let status = codec.decode(&encode_frame(b"MSH|after")).unwrap();
    assert!(matches!(status, DecodeStatus::Complete { .. }));
    assert_eq!(codec.message(), b"MSH|after");
}

//! Wire framing constants
//!
//! A frame on the wire is `START_BYTE`, the body, then `TRAILER_BYTE_1` and
//! `TRAILER_BYTE_2`. The carriage return in the trailer doubles as the line
//! terminator, so nothing follows it.

/// Vertical tab, marks the start of a frame
pub const START_BYTE: u8 = 0x0B;

/// File separator, first trailer byte
pub const TRAILER_BYTE_1: u8 = 0x1C;

/// Carriage return, second trailer byte and line terminator
pub const TRAILER_BYTE_2: u8 = 0x0D;

/// Bytes added around a body by framing
pub const FRAME_OVERHEAD: usize = 3;

/// Build the complete wire representation of `body`
pub fn encode_frame(body: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(body.len() + FRAME_OVERHEAD);
    frame.push(START_BYTE);
    frame.extend_from_slice(body);
    frame.push(TRAILER_BYTE_1);
    frame.push(TRAILER_BYTE_2);
    frame
}

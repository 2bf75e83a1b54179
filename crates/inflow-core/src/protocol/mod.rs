//! Inflow Wire Protocol Module
//!
//! This module contains the framed byte protocol spoken by listening endpoints:
//! - `framing`: Start and trailer marker bytes
//! - `connection_state`: Per-connection decode/encode state machine
//! - `message`: Decoded messages, responses and acknowledgement generation

pub mod connection_state;
pub mod framing;
pub mod message;

// Re-export framing constants
pub use framing::{encode_frame, FRAME_OVERHEAD, START_BYTE, TRAILER_BYTE_1, TRAILER_BYTE_2};

// Re-export codec types
pub use connection_state::{CodecState, ConnectionState, DecodeStatus};

// Re-export message types
pub use message::{
    AckCode, AckGenerator, InboundMessage, MessageHeader, MessageParser, OutboundKind,
    OutboundMessage, Response, SegmentAckGenerator, SegmentParser,
};

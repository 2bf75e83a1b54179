//! Per-connection Frame Codec State Machine
//!
//! `ConnectionState` decodes exactly one inbound frame, then encodes exactly
//! one outbound frame, then must be `reset()` before the connection can read
//! again. There is no pipelining: bytes arriving while a response is pending
//! are ignored.

use super::framing::{START_BYTE, TRAILER_BYTE_1, TRAILER_BYTE_2};
use crate::errors::FramingError;
use std::fmt;
use tracing::debug;

// ----------------------------------------------------------------------------
// Codec States
// ----------------------------------------------------------------------------

/// Position of a connection in its read/respond cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CodecState {
    /// Waiting for the start byte of the next frame
    Idle,
    /// Start byte seen, no body bytes yet
    ReadingHeader,
    /// Accumulating body bytes
    ReadingBody,
    /// A full frame has been decoded and awaits a response
    ReadComplete,
    /// Writing the start byte and body of the response
    WritingBody,
    /// Writing the response trailer
    WritingTrailer,
    /// The response has been fully encoded
    WriteComplete,
    /// The last input was malformed
    Error,
}

impl CodecState {
    pub fn is_reading(&self) -> bool {
        matches!(self, CodecState::ReadingHeader | CodecState::ReadingBody)
    }

    pub fn is_writing(&self) -> bool {
        matches!(self, CodecState::WritingBody | CodecState::WritingTrailer)
    }
}

impl fmt::Display for CodecState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CodecState::Idle => "idle",
            CodecState::ReadingHeader => "reading-header",
            CodecState::ReadingBody => "reading-body",
            CodecState::ReadComplete => "read-complete",
            CodecState::WritingBody => "writing-body",
            CodecState::WritingTrailer => "writing-trailer",
            CodecState::WriteComplete => "write-complete",
            CodecState::Error => "error",
        };
        f.write_str(name)
    }
}

/// Outcome of feeding one chunk to the decoder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeStatus {
    /// All bytes consumed, frame not finished yet
    Incomplete,
    /// Frame finished after `consumed` bytes of the chunk
    Complete { consumed: usize },
    /// The codec is not reading; the chunk was not looked at
    Ignored,
}

// ----------------------------------------------------------------------------
// Connection State
// ----------------------------------------------------------------------------

/// Decode/encode state for one connection
#[derive(Debug)]
pub struct ConnectionState {
    state: CodecState,
    body: Vec<u8>,
    max_frame_size: usize,
    /// A trailer byte ended the previous chunk and may start the trailer
    pending_trailer: bool,
    outbound: Vec<u8>,
    write_pos: usize,
}

impl ConnectionState {
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            state: CodecState::Idle,
            body: Vec::new(),
            max_frame_size,
            pending_trailer: false,
            outbound: Vec::new(),
            write_pos: 0,
        }
    }

    pub fn state(&self) -> CodecState {
        self.state
    }

    /// Feed a chunk of received bytes into the decoder
    ///
    /// On error the codec moves to `CodecState::Error` and drops the partial
    /// body; a later start byte begins a fresh frame.
    pub fn decode(&mut self, chunk: &[u8]) -> Result<DecodeStatus, FramingError> {
        let result = self.decode_inner(chunk);
        if let Err(error) = &result {
            debug!(
                state = %self.state,
                preview = %hex::encode(&chunk[..chunk.len().min(16)]),
                %error,
                "Rejecting malformed frame input"
            );
            self.state = CodecState::Error;
            self.body.clear();
            self.pending_trailer = false;
        }
        result
    }

    fn decode_inner(&mut self, chunk: &[u8]) -> Result<DecodeStatus, FramingError> {
        let mut index = 0;

        match self.state {
            CodecState::Idle | CodecState::Error => {
                let Some(&first) = chunk.first() else {
                    return Ok(DecodeStatus::Incomplete);
                };
                if first != START_BYTE {
                    return Err(FramingError::MissingStartByte { found: first });
                }
                self.body.clear();
                self.pending_trailer = false;
                self.state = CodecState::ReadingHeader;
                index = 1;
            }
            CodecState::ReadingHeader | CodecState::ReadingBody => {}
            _ => return Ok(DecodeStatus::Ignored),
        }

        if self.pending_trailer && index < chunk.len() {
            self.pending_trailer = false;
            if chunk[index] == TRAILER_BYTE_2 {
                self.state = CodecState::ReadComplete;
                return Ok(DecodeStatus::Complete {
                    consumed: index + 1,
                });
            }
            self.push_body(TRAILER_BYTE_1)?;
        }

        while index < chunk.len() {
            let byte = chunk[index];
            match byte {
                START_BYTE => {
                    return Err(FramingError::UnexpectedStartByte {
                        offset: self.body.len(),
                    });
                }
                TRAILER_BYTE_1 => match chunk.get(index + 1) {
                    Some(&TRAILER_BYTE_2) => {
                        self.state = CodecState::ReadComplete;
                        return Ok(DecodeStatus::Complete {
                            consumed: index + 2,
                        });
                    }
                    Some(_) => self.push_body(byte)?,
                    None => {
                        self.pending_trailer = true;
                    }
                },
                _ => self.push_body(byte)?,
            }
            index += 1;
        }

        Ok(DecodeStatus::Incomplete)
    }

    fn push_body(&mut self, byte: u8) -> Result<(), FramingError> {
        if self.body.len() >= self.max_frame_size {
            return Err(FramingError::FrameTooLarge {
                size: self.body.len() + 1,
                max_size: self.max_frame_size,
            });
        }
        self.body.push(byte);
        self.state = CodecState::ReadingBody;
        Ok(())
    }

    /// Body of the decoded frame
    pub fn message(&self) -> &[u8] {
        &self.body
    }

    /// Move the decoded body out, leaving the codec in `ReadComplete`
    pub fn take_message(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.body)
    }

    /// Queue a response body for encoding
    ///
    /// Only legal once a request has been fully decoded.
    pub fn begin_response(&mut self, payload: Vec<u8>) -> Result<(), FramingError> {
        if self.state != CodecState::ReadComplete {
            return Err(FramingError::InvalidState {
                state: self.state.to_string(),
            });
        }
        self.outbound = payload;
        self.write_pos = 0;
        self.state = CodecState::WritingBody;
        Ok(())
    }

    /// Encode as much of the queued response as fits into `out`
    pub fn encode(&mut self, out: &mut [u8]) -> usize {
        let mut written = 0;
        while written < out.len() {
            match self.state {
                CodecState::WritingBody => {
                    if self.write_pos == 0 {
                        out[written] = START_BYTE;
                        written += 1;
                        self.write_pos = 1;
                        continue;
                    }
                    let offset = self.write_pos - 1;
                    let n = (self.outbound.len() - offset).min(out.len() - written);
                    out[written..written + n].copy_from_slice(&self.outbound[offset..offset + n]);
                    written += n;
                    self.write_pos += n;
                    if offset + n == self.outbound.len() {
                        self.state = CodecState::WritingTrailer;
                    }
                }
                CodecState::WritingTrailer => {
                    const TRAILER: [u8; 2] = [TRAILER_BYTE_1, TRAILER_BYTE_2];
                    let offset = self.write_pos - 1 - self.outbound.len();
                    let n = (TRAILER.len() - offset).min(out.len() - written);
                    out[written..written + n].copy_from_slice(&TRAILER[offset..offset + n]);
                    written += n;
                    self.write_pos += n;
                    if offset + n == TRAILER.len() {
                        self.state = CodecState::WriteComplete;
                    }
                }
                _ => break,
            }
        }
        written
    }

    pub fn is_write_complete(&self) -> bool {
        self.state == CodecState::WriteComplete
    }

    /// Return to `Idle` so the connection can read its next frame
    pub fn reset(&mut self) {
        self.state = CodecState::Idle;
        self.body.clear();
        self.outbound.clear();
        self.pending_trailer = false;
        self.write_pos = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::framing::encode_frame;

    fn encode_all(codec: &mut ConnectionState, chunk_size: usize) -> Vec<u8> {
        let mut wire = Vec::new();
        let mut out = vec![0u8; chunk_size];
        while !codec.is_write_complete() {
            let n = codec.encode(&mut out);
            assert!(n > 0, "encoder stalled in {}", codec.state());
            wire.extend_from_slice(&out[..n]);
        }
        wire
    }

    #[test]
    fn test_decode_single_chunk() {
        let mut codec = ConnectionState::new(1024);
        let frame = encode_frame(b"MSH|^~\\&|A");
        let status = codec.decode(&frame).unwrap();
        assert_eq!(status, DecodeStatus::Complete { consumed: frame.len() });
        assert_eq!(codec.state(), CodecState::ReadComplete);
        assert_eq!(codec.message(), b"MSH|^~\\&|A");
    }

    #[test]
    fn test_decode_trailer_split_across_chunks() {
        let mut codec = ConnectionState::new(1024);
        assert_eq!(codec.decode(&[START_BYTE, b'x', TRAILER_BYTE_1]).unwrap(), DecodeStatus::Incomplete);
        assert_eq!(
            codec.decode(&[TRAILER_BYTE_2]).unwrap(),
            DecodeStatus::Complete { consumed: 1 }
        );
        assert_eq!(codec.message(), b"x");
    }

    #[test]
    fn test_lone_trailer_byte_is_content() {
        let mut codec = ConnectionState::new(1024);
        codec.decode(&[START_BYTE, b'a', TRAILER_BYTE_1]).unwrap();
        codec.decode(&[b'b', TRAILER_BYTE_1, b'c']).unwrap();
        let status = codec.decode(&[TRAILER_BYTE_1, TRAILER_BYTE_2]).unwrap();
        assert_eq!(status, DecodeStatus::Complete { consumed: 2 });
        assert_eq!(codec.message(), &[b'a', TRAILER_BYTE_1, b'b', TRAILER_BYTE_1, b'c']);
    }

    #[test]
    fn test_empty_body() {
        let mut codec = ConnectionState::new(1024);
        codec.decode(&[START_BYTE]).unwrap();
        assert_eq!(codec.state(), CodecState::ReadingHeader);
        codec.decode(&[TRAILER_BYTE_1, TRAILER_BYTE_2]).unwrap();
        assert_eq!(codec.state(), CodecState::ReadComplete);
        assert!(codec.message().is_empty());
    }

    #[test]
    fn test_missing_start_byte_enters_error_state() {
        let mut codec = ConnectionState::new(1024);
        let err = codec.decode(b"garbage").unwrap_err();
        assert_eq!(err, FramingError::MissingStartByte { found: b'g' });
        assert_eq!(codec.state(), CodecState::Error);

        // A well-formed frame recovers the codec
        let status = codec.decode(&encode_frame(b"ok")).unwrap();
        assert!(matches!(status, DecodeStatus::Complete { .. }));
        assert_eq!(codec.message(), b"ok");
    }

    #[test]
    fn test_start_byte_inside_body_is_rejected() {
        let mut codec = ConnectionState::new(1024);
        let err = codec.decode(&[START_BYTE, b'a', b'b', START_BYTE]).unwrap_err();
        assert_eq!(err, FramingError::UnexpectedStartByte { offset: 2 });
        assert!(codec.message().is_empty());
    }

    #[test]
    fn test_frame_too_large() {
        let mut codec = ConnectionState::new(4);
        let err = codec.decode(&[START_BYTE, 1, 2, 3, 4, 5]).unwrap_err();
        assert_eq!(err, FramingError::FrameTooLarge { size: 5, max_size: 4 });
    }

    #[test]
    fn test_input_ignored_while_awaiting_response() {
        let mut codec = ConnectionState::new(1024);
        codec.decode(&encode_frame(b"a")).unwrap();
        assert_eq!(codec.decode(&encode_frame(b"b")).unwrap(), DecodeStatus::Ignored);
        assert_eq!(codec.message(), b"a");
    }

    #[test]
    fn test_begin_response_requires_decoded_request() {
        let mut codec = ConnectionState::new(1024);
        let err = codec.begin_response(b"ack".to_vec()).unwrap_err();
        assert!(matches!(err, FramingError::InvalidState { .. }));
    }

    #[test]
    fn test_encode_in_small_chunks_then_reset() {
        let mut codec = ConnectionState::new(1024);
        codec.decode(&encode_frame(b"req")).unwrap();
        codec.begin_response(b"response".to_vec()).unwrap();
        let wire = encode_all(&mut codec, 3);
        assert_eq!(wire, encode_frame(b"response"));

        codec.reset();
        assert_eq!(codec.state(), CodecState::Idle);
        codec.decode(&encode_frame(b"next")).unwrap();
        assert_eq!(codec.message(), b"next");
    }

    #[test]
    fn test_encode_empty_response() {
        let mut codec = ConnectionState::new(1024);
        codec.decode(&encode_frame(b"req")).unwrap();
        codec.begin_response(Vec::new()).unwrap();
        assert_eq!(encode_all(&mut codec, 1), encode_frame(b""));
    }
}

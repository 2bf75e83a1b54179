//! Decoded messages, responses and acknowledgement generation
//!
//! The transport only understands enough of the payload to validate that it
//! is a segment-structured message and to echo its control identifier in
//! acknowledgements. Everything else is left to the execution engine.

use crate::errors::ContentError;
use crate::types::{ConnectionKey, MessageId};

/// Segment terminator inside a message body
pub const SEGMENT_SEPARATOR: char = '\r';

/// Name of the header segment every message starts with
pub const HEADER_SEGMENT: &str = "MSH";

const DEFAULT_FIELD_SEPARATOR: char = '|';
const DEFAULT_ENCODING_CHARACTERS: &str = "^~\\&";
const DEFAULT_CONTROL_ID: &str = "0";
const DEFAULT_PROCESSING_ID: &str = "P";
const DEFAULT_VERSION: &str = "2.2";

// ----------------------------------------------------------------------------
// Message Header
// ----------------------------------------------------------------------------

/// Fields of the header segment relevant to acknowledgements
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageHeader {
    pub field_separator: char,
    pub encoding_characters: String,
    pub sending_application: String,
    pub sending_facility: String,
    pub receiving_application: String,
    pub receiving_facility: String,
    pub message_type: String,
    pub control_id: String,
    pub processing_id: String,
    pub version: String,
}

impl MessageHeader {
    /// Parse a header segment such as `MSH|^~\&|APP|FAC|...`
    pub fn parse(segment: &str) -> Result<Self, ContentError> {
        let missing = || ContentError::MissingHeaderSegment {
            expected: HEADER_SEGMENT.to_string(),
        };
        if !segment.starts_with(HEADER_SEGMENT) {
            return Err(missing());
        }
        let separator = segment[HEADER_SEGMENT.len()..]
            .chars()
            .next()
            .ok_or_else(missing)?;
        if separator.is_alphanumeric() || separator == SEGMENT_SEPARATOR {
            return Err(ContentError::Rejected {
                reason: format!("invalid field separator {:?}", separator),
            });
        }

        // The separator itself is field 1, so field n lives at index n - 1
        let fields: Vec<&str> = segment.split(separator).collect();
        let field = |n: usize| fields.get(n - 1).copied().unwrap_or_default().to_string();

        Ok(Self {
            field_separator: separator,
            encoding_characters: field(2),
            sending_application: field(3),
            sending_facility: field(4),
            receiving_application: field(5),
            receiving_facility: field(6),
            message_type: field(9),
            control_id: field(10),
            processing_id: field(11),
            version: field(12),
        })
    }
}

// ----------------------------------------------------------------------------
// Inbound Messages
// ----------------------------------------------------------------------------

/// A fully decoded frame ready for submission
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub id: MessageId,
    pub connection: ConnectionKey,
    pub body: Vec<u8>,
    /// Present when the body was parsed successfully
    pub header: Option<MessageHeader>,
}

impl InboundMessage {
    pub fn new(connection: ConnectionKey, body: Vec<u8>) -> Self {
        Self {
            id: MessageId::new(),
            connection,
            body,
            header: None,
        }
    }

    pub fn with_header(mut self, header: Option<MessageHeader>) -> Self {
        self.header = header;
        self
    }

    /// Body as text, if it is valid UTF-8
    pub fn text(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }

    pub fn control_id(&self) -> Option<&str> {
        self.header.as_ref().map(|h| h.control_id.as_str())
    }
}

/// Turns a raw frame body into structured content
pub trait MessageParser: Send + Sync {
    /// Parse `body`, checking structure when `validate` is set
    fn parse(&self, body: &[u8], validate: bool) -> Result<Option<MessageHeader>, ContentError>;
}

/// Parser for carriage-return separated segment messages
#[derive(Debug, Clone, Copy, Default)]
pub struct SegmentParser;

impl MessageParser for SegmentParser {
    fn parse(&self, body: &[u8], validate: bool) -> Result<Option<MessageHeader>, ContentError> {
        let text = std::str::from_utf8(body).map_err(|e| ContentError::InvalidEncoding {
            valid_up_to: e.valid_up_to(),
        })?;
        let first = text
            .split(|c| c == SEGMENT_SEPARATOR || c == '\n')
            .find(|segment| !segment.trim().is_empty());

        match first {
            None if validate => Err(ContentError::Empty),
            None => Ok(None),
            Some(segment) if validate => MessageHeader::parse(segment.trim_start()).map(Some),
            Some(segment) => Ok(MessageHeader::parse(segment.trim_start()).ok()),
        }
    }
}

// ----------------------------------------------------------------------------
// Responses
// ----------------------------------------------------------------------------

/// Answer the execution engine gives for a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Send this payload back verbatim
    Payload(Vec<u8>),
    /// Send the transport-generated acknowledgement for the request
    ApplicationAck,
    /// Send a negative acknowledgement with this reason
    Nack(String),
}

/// Origin of an outbound frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboundKind {
    Ack,
    Nack,
    Application,
}

/// A response ready to be framed and written to a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub payload: Vec<u8>,
    pub kind: OutboundKind,
    /// Close the connection once the frame is written
    pub close_after: bool,
}

impl OutboundMessage {
    pub fn ack(payload: Vec<u8>) -> Self {
        Self {
            payload,
            kind: OutboundKind::Ack,
            close_after: false,
        }
    }

    pub fn nack(payload: Vec<u8>) -> Self {
        Self {
            payload,
            kind: OutboundKind::Nack,
            close_after: false,
        }
    }

    pub fn application(payload: Vec<u8>) -> Self {
        Self {
            payload,
            kind: OutboundKind::Application,
            close_after: false,
        }
    }

    pub fn closing(mut self, close_after: bool) -> Self {
        self.close_after = close_after;
        self
    }
}

// ----------------------------------------------------------------------------
// Acknowledgement Generation
// ----------------------------------------------------------------------------

/// Acknowledgement code carried in the MSA segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckCode {
    /// Application accept
    Accept,
    /// Application error
    Error,
    /// Application reject
    Reject,
}

impl AckCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AckCode::Accept => "AA",
            AckCode::Error => "AE",
            AckCode::Reject => "AR",
        }
    }
}

/// Produces acknowledgement payloads for requests
pub trait AckGenerator: Send + Sync {
    /// Positive acknowledgement for a parsed request
    fn ack(&self, request: &InboundMessage) -> Vec<u8>;

    /// Negative acknowledgement; `request` is `None` when nothing could be parsed
    fn nack(&self, request: Option<&InboundMessage>, reason: &str) -> Vec<u8>;
}

/// Builds pipe-delimited `MSH`/`MSA` acknowledgements
#[derive(Debug, Clone, Copy, Default)]
pub struct SegmentAckGenerator;

impl SegmentAckGenerator {
    fn build(header: Option<&MessageHeader>, code: AckCode, reason: Option<&str>) -> Vec<u8> {
        let sep = header
            .map(|h| h.field_separator)
            .unwrap_or(DEFAULT_FIELD_SEPARATOR);
        let pick = |value: Option<&str>, default: &str| -> String {
            match value {
                Some(v) if !v.is_empty() => v.to_string(),
                _ => default.to_string(),
            }
        };

        let encoding = pick(
            header.map(|h| h.encoding_characters.as_str()),
            DEFAULT_ENCODING_CHARACTERS,
        );
        let control_id = pick(header.map(|h| h.control_id.as_str()), DEFAULT_CONTROL_ID);
        let processing_id = pick(header.map(|h| h.processing_id.as_str()), DEFAULT_PROCESSING_ID);
        let version = pick(header.map(|h| h.version.as_str()), DEFAULT_VERSION);

        // Sender and receiver swap sides in the acknowledgement
        let msh = [
            HEADER_SEGMENT.to_string(),
            encoding,
            pick(header.map(|h| h.receiving_application.as_str()), ""),
            pick(header.map(|h| h.receiving_facility.as_str()), ""),
            pick(header.map(|h| h.sending_application.as_str()), ""),
            pick(header.map(|h| h.sending_facility.as_str()), ""),
            String::new(),
            String::new(),
            "ACK".to_string(),
            control_id.clone(),
            processing_id,
            version,
        ]
        .join(&sep.to_string());

        let mut msa = vec!["MSA".to_string(), code.as_str().to_string(), control_id];
        if let Some(reason) = reason {
            msa.push(sanitize(reason, sep));
        }
        let msa = msa.join(&sep.to_string());

        let mut payload = String::with_capacity(msh.len() + msa.len() + 2);
        payload.push_str(&msh);
        payload.push(SEGMENT_SEPARATOR);
        payload.push_str(&msa);
        payload.push(SEGMENT_SEPARATOR);
        payload.into_bytes()
    }
}

fn sanitize(text: &str, separator: char) -> String {
    text.chars()
        .map(|c| {
            if c == separator || c == SEGMENT_SEPARATOR || c == '\n' {
                ' '
            } else {
                c
            }
        })
        .collect()
}

impl AckGenerator for SegmentAckGenerator {
    fn ack(&self, request: &InboundMessage) -> Vec<u8> {
        Self::build(request.header.as_ref(), AckCode::Accept, None)
    }

    fn nack(&self, request: Option<&InboundMessage>, reason: &str) -> Vec<u8> {
        match request.and_then(|r| r.header.as_ref()) {
            Some(header) => Self::build(Some(header), AckCode::Error, Some(reason)),
            None => Self::build(None, AckCode::Reject, Some(reason)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "MSH|^~\\&|LAB|NORTH|EHR|SOUTH|20240101||ADT^A01|MSG00042|P|2.5\rPID|1||123\r";

    fn key() -> ConnectionKey {
        ConnectionKey::new(2575, "127.0.0.1:50000".parse().unwrap())
    }

    #[test]
    fn test_parse_header_fields() {
        let header = SegmentParser.parse(SAMPLE.as_bytes(), true).unwrap().unwrap();
        assert_eq!(header.field_separator, '|');
        assert_eq!(header.sending_application, "LAB");
        assert_eq!(header.receiving_facility, "SOUTH");
        assert_eq!(header.message_type, "ADT^A01");
        assert_eq!(header.control_id, "MSG00042");
        assert_eq!(header.version, "2.5");
    }

    #[test]
    fn test_validation_rejects_missing_header() {
        let err = SegmentParser.parse(b"PID|1||123\r", true).unwrap_err();
        assert!(matches!(err, ContentError::MissingHeaderSegment { .. }));
        assert_eq!(SegmentParser.parse(b"PID|1||123\r", false).unwrap(), None);
    }

    #[test]
    fn test_validation_rejects_invalid_utf8() {
        let err = SegmentParser.parse(&[0x4d, 0xff, 0xfe], false).unwrap_err();
        assert_eq!(err, ContentError::InvalidEncoding { valid_up_to: 1 });
    }

    #[test]
    fn test_empty_body_is_content_error_when_validating() {
        assert_eq!(SegmentParser.parse(b"", true), Err(ContentError::Empty));
        assert_eq!(SegmentParser.parse(b"", false), Ok(None));
    }

    #[test]
    fn test_ack_echoes_control_id_and_swaps_parties() {
        let header = SegmentParser.parse(SAMPLE.as_bytes(), true).unwrap();
        let request = InboundMessage::new(key(), SAMPLE.as_bytes().to_vec()).with_header(header);
        let ack = String::from_utf8(SegmentAckGenerator.ack(&request)).unwrap();
        assert!(ack.starts_with("MSH|^~\\&|EHR|SOUTH|LAB|NORTH|||ACK|MSG00042|P|2.5\r"));
        assert!(ack.ends_with("MSA|AA|MSG00042\r"));
    }

    #[test]
    fn test_nack_codes() {
        let header = SegmentParser.parse(SAMPLE.as_bytes(), true).unwrap();
        let request = InboundMessage::new(key(), SAMPLE.as_bytes().to_vec()).with_header(header);
        let nack = String::from_utf8(SegmentAckGenerator.nack(Some(&request), "bad|field")).unwrap();
        assert!(nack.ends_with("MSA|AE|MSG00042|bad field\r"));

        let default = String::from_utf8(SegmentAckGenerator.nack(None, "unparseable")).unwrap();
        assert!(default.contains("MSA|AR|0|unparseable"));
    }
}

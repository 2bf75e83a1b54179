//! Inflow Core
//!
//! Runtime-agnostic building blocks for the inflow message-ingestion runtime:
//! error types, identifiers, configuration, the framed wire codec, pooled
//! buffers and the `PollTask` capability every listener implements. Nothing in
//! this crate owns a thread, a socket or a timer.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod buffer;
pub mod config;
pub mod errors;
pub mod protocol;
pub mod task;
pub mod types;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use buffer::{BufferPool, BufferPoolStats, PooledBuffer};
pub use config::{
    EndpointConfig, EndpointKind, ExecutionConfig, IngressConfig, ListenerSettings, ReactorConfig,
    SchedulerConfig, SocketOptions,
};
pub use errors::{
    ContentError, ExecutionError, FramingError, InflowError, InflowResult, Result, SchedulerError,
    TaskError, TransportError,
};
pub use protocol::{
    encode_frame, AckGenerator, CodecState, ConnectionState, DecodeStatus, InboundMessage,
    MessageHeader, MessageParser, OutboundKind, OutboundMessage, Response, SegmentAckGenerator,
    SegmentParser,
};
pub use task::{FnTask, PollTask};
pub use types::{ConnectionKey, MessageId};

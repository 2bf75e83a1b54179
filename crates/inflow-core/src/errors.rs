//! Error types for the inflow ingestion runtime
//!
//! This module contains every error kind raised by the ingestion pipeline:
//! framing errors on the wire, application content errors, socket-level
//! transport errors, scheduler registration failures, per-cycle task failures
//! and execution engine failures, plus the `InflowError` type that unifies them.

use crate::types::MessageId;

// ----------------------------------------------------------------------------
// Specific Error Types
// ----------------------------------------------------------------------------

/// Malformed marker sequences on the framed byte stream
///
/// Framing errors are recoverable: the connection state is reset and the
/// socket stays open unless the connection was already in the error state.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FramingError {
    #[error("Could not find start byte in incoming message (found 0x{found:02x})")]
    MissingStartByte { found: u8 },
    #[error("Unexpected start byte inside message body at offset {offset}")]
    UnexpectedStartByte { offset: usize },
    #[error("Frame too large: {size} bytes (max: {max_size})")]
    FrameTooLarge { size: usize, max_size: usize },
    #[error("Codec is in an inconsistent state: {state}")]
    InvalidState { state: String },
}

/// Structurally invalid application content inside a well-formed frame
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContentError {
    #[error("Message body is empty")]
    Empty,
    #[error("Message body is not valid UTF-8 (valid up to byte {valid_up_to})")]
    InvalidEncoding { valid_up_to: usize },
    #[error("Message does not start with a {expected} header segment")]
    MissingHeaderSegment { expected: String },
    #[error("Message rejected: {reason}")]
    Rejected { reason: String },
}

/// Socket and listener level errors
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Network I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Port {port} is not available for binding")]
    PortUnavailable { port: u16 },
}

/// Distributed scheduler errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchedulerError {
    #[error("Failed to register job {job}: {reason}")]
    RegistrationFailed { job: String, reason: String },
    #[error("Job not found: {job}")]
    JobNotFound { job: String },
    #[error("Scheduler unavailable: {reason}")]
    Unavailable { reason: String },
}

/// Failure of a single poll/consume cycle
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    #[error("Task cycle failed: {reason}")]
    Failed { reason: String },
    #[error("Task cycle panicked: {reason}")]
    Panicked { reason: String },
    #[error("Task connection lost: {reason}")]
    ConnectionLost { reason: String },
}

impl TaskError {
    /// Create a generic cycle failure
    pub fn failed<T: Into<String>>(reason: T) -> Self {
        TaskError::Failed {
            reason: reason.into(),
        }
    }

    /// Create a lost-connection failure; one-shot runners reconnect on retry
    pub fn connection_lost<T: Into<String>>(reason: T) -> Self {
        TaskError::ConnectionLost {
            reason: reason.into(),
        }
    }
}

/// Failures reported by the execution engine
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecutionError {
    #[error("Could not find sequence '{name}'")]
    SequenceNotFound { name: String },
    #[error("Execution failed: {reason}")]
    Failed { reason: String },
}

// ----------------------------------------------------------------------------
// Main Error Type
// ----------------------------------------------------------------------------

/// Core error type for the ingestion runtime
#[derive(Debug, thiserror::Error)]
pub enum InflowError {
    #[error("Framing error: {0}")]
    Framing(#[from] FramingError),

    #[error("Content error: {0}")]
    Content(#[from] ContentError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("Task error: {0}")]
    Task(#[from] TaskError),

    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    #[error("Timed out waiting for response to message {message_id}")]
    ResponseTimeout { message_id: MessageId },

    #[error("Endpoint not found: {name}")]
    EndpointNotFound { name: String },

    #[error("Another endpoint named {existing} is currently using port {port}")]
    EndpointConflict { port: u16, existing: String },

    #[error("Operation not supported for endpoint {name}: {operation}")]
    Unsupported { name: String, operation: String },

    /// Channel communication error between reactor and workers
    #[error("Channel error: {message}")]
    Channel { message: String },

    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    #[error("TOML parsing error: {0}")]
    TomlParsing(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

// ----------------------------------------------------------------------------
// Convenience Error Constructors
// ----------------------------------------------------------------------------

impl InflowError {
    /// Create a configuration error with a reason
    pub fn config_error<T: Into<String>>(reason: T) -> Self {
        InflowError::Configuration {
            reason: reason.into(),
        }
    }

    /// Create a channel error with a message
    pub fn channel_error<T: Into<String>>(message: T) -> Self {
        InflowError::Channel {
            message: message.into(),
        }
    }

    /// Create a port unavailable error
    pub fn port_unavailable(port: u16) -> Self {
        InflowError::Transport(TransportError::PortUnavailable { port })
    }

    /// Create an endpoint not found error
    pub fn endpoint_not_found<T: Into<String>>(name: T) -> Self {
        InflowError::EndpointNotFound { name: name.into() }
    }

    /// Create an unsupported operation error
    pub fn unsupported<N: Into<String>, O: Into<String>>(name: N, operation: O) -> Self {
        InflowError::Unsupported {
            name: name.into(),
            operation: operation.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// Type Aliases
// ----------------------------------------------------------------------------

pub type Result<T> = core::result::Result<T, InflowError>;
pub type InflowResult<T> = Result<T>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_framing_error_converts_into_inflow_error() {
        let err: InflowError = FramingError::MissingStartByte { found: 0x41 }.into();
        assert!(matches!(err, InflowError::Framing(_)));
        assert!(err.to_string().contains("0x41"));
    }

    #[test]
    fn test_port_unavailable_constructor() {
        let err = InflowError::port_unavailable(2575);
        assert!(matches!(
            err,
            InflowError::Transport(TransportError::PortUnavailable { port: 2575 })
        ));
    }

    #[test]
    fn test_response_timeout_names_the_message() {
        let id = MessageId::new();
        let err = InflowError::ResponseTimeout { message_id: id };
        assert!(err.to_string().contains(&id.to_string()));
    }
}

//! Reactor events and the link back to a live connection

use super::io::{ByteSink, ByteSource};
use inflow_core::{ConnectionKey, OutboundMessage};
use std::fmt;
use tokio::sync::mpsc;

// ----------------------------------------------------------------------------
// Reactor Events
// ----------------------------------------------------------------------------

/// I/O callbacks delivered to a connection handler
pub enum ReactorEvent<'a> {
    /// The connection was accepted
    Connected,
    /// The socket has bytes to read
    InputReady { source: &'a mut dyn ByteSource },
    /// The socket can accept more bytes
    OutputReady { sink: &'a mut dyn ByteSink },
    /// A response produced off the I/O thread is ready to be written
    OutputRequested(OutboundMessage),
    /// The connection has been idle for too long
    Timeout,
    /// The connection is being torn down
    Disconnected,
}

impl fmt::Debug for ReactorEvent<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReactorEvent::Connected => f.write_str("Connected"),
            ReactorEvent::InputReady { .. } => f.write_str("InputReady"),
            ReactorEvent::OutputReady { .. } => f.write_str("OutputReady"),
            ReactorEvent::OutputRequested(message) => f
                .debug_tuple("OutputRequested")
                .field(&message.kind)
                .finish(),
            ReactorEvent::Timeout => f.write_str("Timeout"),
            ReactorEvent::Disconnected => f.write_str("Disconnected"),
        }
    }
}

/// What a handler wants the reactor to wait for next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerDirective {
    Read,
    Write,
    Close,
}

// ----------------------------------------------------------------------------
// Connection Link
// ----------------------------------------------------------------------------

/// Commands queued to a connection's driver from outside the I/O path
#[derive(Debug)]
pub enum LinkCommand {
    Send(OutboundMessage),
    Close,
}

/// Cloneable handle for delivering responses to a live connection
#[derive(Debug, Clone)]
pub struct ConnectionLink {
    key: ConnectionKey,
    sender: mpsc::UnboundedSender<LinkCommand>,
}

impl ConnectionLink {
    pub fn new(key: ConnectionKey, sender: mpsc::UnboundedSender<LinkCommand>) -> Self {
        Self { key, sender }
    }

    /// Create a link together with the receiving end a driver polls
    pub fn channel(key: ConnectionKey) -> (Self, mpsc::UnboundedReceiver<LinkCommand>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self::new(key, sender), receiver)
    }

    pub fn key(&self) -> ConnectionKey {
        self.key
    }

    /// Queue a response; returns `false` if the connection is already gone
    pub fn send(&self, message: OutboundMessage) -> bool {
        self.sender.send(LinkCommand::Send(message)).is_ok()
    }

    /// Ask the driver to close the connection
    pub fn close(&self) -> bool {
        self.sender.send(LinkCommand::Close).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

//! Per-connection protocol handling
//!
//! A `ConnectionHandler` owns one connection's codec and its two pooled
//! buffers and turns reactor events into codec transitions. It never blocks:
//! reads and writes stop at `WouldBlock` and message execution is handed to
//! the `MessageProcessor`.

use crate::processor::{MessageProcessor, ProcessOutcome};
use crate::reactor::{ByteSink, ByteSource, ConnectionLink, HandlerDirective, ReactorEvent};
use inflow_core::{
    BufferPool, CodecState, ConnectionKey, ConnectionState, DecodeStatus, OutboundMessage,
    PooledBuffer,
};
use std::io;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Reads performed per readiness event before yielding to other connections
const MAX_READS_PER_EVENT: usize = 16;

// ----------------------------------------------------------------------------
// Connection Handler
// ----------------------------------------------------------------------------

/// Drives one connection's codec from reactor events
pub struct ConnectionHandler {
    key: ConnectionKey,
    codec: ConnectionState,
    input: PooledBuffer,
    output: PooledBuffer,
    processor: Arc<MessageProcessor>,
    link: ConnectionLink,
    close_after_write: bool,
}

impl ConnectionHandler {
    pub fn new(
        key: ConnectionKey,
        pool: &BufferPool,
        max_frame_size: usize,
        processor: Arc<MessageProcessor>,
        link: ConnectionLink,
    ) -> Self {
        Self {
            key,
            codec: ConnectionState::new(max_frame_size),
            input: pool.acquire(),
            output: pool.acquire(),
            processor,
            link,
            close_after_write: false,
        }
    }

    pub fn key(&self) -> ConnectionKey {
        self.key
    }

    pub fn codec_state(&self) -> CodecState {
        self.codec.state()
    }

    /// Dispatch a single reactor event
    pub fn handle(&mut self, event: ReactorEvent<'_>) -> HandlerDirective {
        match event {
            ReactorEvent::Connected => {
                debug!(connection = %self.key, "Connection established");
                HandlerDirective::Read
            }
            ReactorEvent::InputReady { source } => self.on_input(source),
            ReactorEvent::OutputReady { sink } => self.on_output(sink),
            ReactorEvent::OutputRequested(message) => self.on_response(message),
            ReactorEvent::Timeout => {
                info!(connection = %self.key, "Connection timed out");
                self.clear_buffers();
                HandlerDirective::Close
            }
            ReactorEvent::Disconnected => {
                debug!(connection = %self.key, "Connection disconnected");
                self.clear_buffers();
                HandlerDirective::Close
            }
        }
    }

    /// Release correlation state before the handler is dropped
    ///
    /// The pooled buffers go back to the pool when the handler itself drops.
    pub fn release(&mut self) {
        self.clear_buffers();
        self.processor.release_connection(self.key);
    }

    fn idle_directive(&self) -> HandlerDirective {
        if self.codec.state().is_writing() {
            HandlerDirective::Write
        } else {
            HandlerDirective::Read
        }
    }

    // ------------------------------------------------------------------------
    // Input
    // ------------------------------------------------------------------------

    fn on_input(&mut self, source: &mut dyn ByteSource) -> HandlerDirective {
        for _ in 0..MAX_READS_PER_EVENT {
            match source.try_read(self.input.writable_mut()) {
                Ok(0) => {
                    debug!(connection = %self.key, state = %self.codec.state(), "End of stream");
                    self.clear_buffers();
                    return HandlerDirective::Close;
                }
                Ok(n) => {
                    self.input.commit(n);
                    if let Some(directive) = self.decode_input() {
                        return directive;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(connection = %self.key, error = %e, "I/O error while reading");
                    self.clear_buffers();
                    return HandlerDirective::Close;
                }
            }
        }
        self.idle_directive()
    }

    /// Feed buffered input to the codec; `Some` ends the current read event
    fn decode_input(&mut self) -> Option<HandlerDirective> {
        let was_error = self.codec.state() == CodecState::Error;
        let available = self.input.readable().len();

        match self.codec.decode(self.input.readable()) {
            Ok(DecodeStatus::Incomplete) => {
                self.input.clear();
                None
            }
            Ok(DecodeStatus::Ignored) => {
                warn!(
                    connection = %self.key,
                    discarded = available,
                    "Discarding bytes received while a response is pending"
                );
                self.input.clear();
                None
            }
            Ok(DecodeStatus::Complete { consumed }) => {
                if consumed < available {
                    warn!(
                        connection = %self.key,
                        discarded = available - consumed,
                        "Discarding bytes following a complete frame"
                    );
                }
                self.input.clear();
                self.on_message()
            }
            Err(err) if was_error => {
                warn!(connection = %self.key, error = %err, "Repeated framing error, closing connection");
                self.clear_buffers();
                Some(HandlerDirective::Close)
            }
            Err(err) => {
                warn!(connection = %self.key, error = %err, "Framing error, resetting connection state");
                self.clear_buffers();
                None
            }
        }
    }

    fn on_message(&mut self) -> Option<HandlerDirective> {
        let body = self.codec.take_message();
        debug!(connection = %self.key, size = body.len(), "Decoded frame");
        match self.processor.process(body, &self.link) {
            ProcessOutcome::Respond(message) => Some(self.begin_write(message)),
            ProcessOutcome::Pending(message_id) => {
                debug!(connection = %self.key, message_id = %message_id, "Awaiting response");
                None
            }
        }
    }

    // ------------------------------------------------------------------------
    // Output
    // ------------------------------------------------------------------------

    fn on_response(&mut self, message: OutboundMessage) -> HandlerDirective {
        if self.codec.state() != CodecState::ReadComplete {
            warn!(
                connection = %self.key,
                state = %self.codec.state(),
                "Dropping response for a connection that is not awaiting one"
            );
            return self.idle_directive();
        }
        self.begin_write(message)
    }

    fn begin_write(&mut self, message: OutboundMessage) -> HandlerDirective {
        let close_after = message.close_after;
        match self.codec.begin_response(message.payload) {
            Ok(()) => {
                self.close_after_write = close_after;
                self.output.clear();
                HandlerDirective::Write
            }
            Err(err) => {
                error!(connection = %self.key, error = %err, "Cannot encode response");
                self.clear_buffers();
                HandlerDirective::Close
            }
        }
    }

    fn on_output(&mut self, sink: &mut dyn ByteSink) -> HandlerDirective {
        loop {
            if self.output.is_empty() {
                if self.codec.is_write_complete() {
                    return self.finish_write();
                }
                let written = self.codec.encode(self.output.writable_mut());
                if written == 0 {
                    return self.idle_directive();
                }
                self.output.commit(written);
            }

            match sink.try_write(self.output.readable()) {
                Ok(0) => {
                    warn!(connection = %self.key, "Peer stopped accepting data");
                    self.clear_buffers();
                    return HandlerDirective::Close;
                }
                Ok(n) => self.output.consume(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return HandlerDirective::Write,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(connection = %self.key, error = %e, "I/O error while writing");
                    self.clear_buffers();
                    return HandlerDirective::Close;
                }
            }
        }
    }

    fn finish_write(&mut self) -> HandlerDirective {
        if self.close_after_write {
            debug!(connection = %self.key, "Response written, closing as requested");
            self.clear_buffers();
            return HandlerDirective::Close;
        }
        self.codec.reset();
        self.close_after_write = false;
        HandlerDirective::Read
    }

    fn clear_buffers(&mut self) {
        self.input.clear();
        self.output.clear();
    }
}

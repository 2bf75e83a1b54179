//! Session multiplexer for the protocol reactor
//!
//! This module contains the `SessionMultiplexer`, the single dispatcher that
//! routes every reactor event to the `ConnectionHandler` owning that
//! connection. Handlers are created on `Connected` and removed as soon as one
//! returns `HandlerDirective::Close`.

use crate::managers::connection::ConnectionHandler;
use crate::processor::MessageProcessor;
use crate::reactor::{ConnectionLink, HandlerDirective, ReactorEvent};
use dashmap::DashMap;
use inflow_core::{BufferPool, ConnectionKey};
use std::sync::Arc;
use tracing::debug;

// ----------------------------------------------------------------------------
// Session Multiplexer
// ----------------------------------------------------------------------------

/// Routes reactor events to per-connection handlers
pub struct SessionMultiplexer {
    handlers: DashMap<ConnectionKey, ConnectionHandler>,
    pool: BufferPool,
    max_frame_size: usize,
}

impl SessionMultiplexer {
    pub fn new(pool: BufferPool, max_frame_size: usize) -> Self {
        Self {
            handlers: DashMap::new(),
            pool,
            max_frame_size,
        }
    }

    pub fn buffer_pool(&self) -> &BufferPool {
        &self.pool
    }

    /// Create the handler for a newly accepted connection and deliver `Connected`
    pub fn connect(
        &self,
        key: ConnectionKey,
        processor: Arc<MessageProcessor>,
        link: ConnectionLink,
    ) -> HandlerDirective {
        let handler =
            ConnectionHandler::new(key, &self.pool, self.max_frame_size, processor, link);
        if let Some(mut stale) = self.handlers.insert(key, handler) {
            debug!(connection = %key, "Replacing handler of a connection that was not cleaned up");
            stale.release();
        }
        self.dispatch(key, ReactorEvent::Connected)
    }

    /// Deliver `event` to the handler for `key`
    ///
    /// Unknown connections are told to close.
    pub fn dispatch(&self, key: ConnectionKey, event: ReactorEvent<'_>) -> HandlerDirective {
        let directive = match self.handlers.get_mut(&key) {
            Some(mut handler) => handler.handle(event),
            None => return HandlerDirective::Close,
        };
        if directive == HandlerDirective::Close {
            self.remove(key);
        }
        directive
    }

    /// Drop the handler for `key`, returning its buffers to the pool
    pub fn remove(&self, key: ConnectionKey) -> bool {
        match self.handlers.remove(&key) {
            Some((_, mut handler)) => {
                handler.release();
                debug!(connection = %key, "Removed connection handler");
                true
            }
            None => false,
        }
    }

    /// Drop every handler of connections accepted on `port`
    pub fn close_port(&self, port: u16) -> usize {
        let keys: Vec<ConnectionKey> = self
            .handlers
            .iter()
            .filter(|entry| entry.key().local_port == port)
            .map(|entry| *entry.key())
            .collect();
        keys.into_iter().filter(|key| self.remove(*key)).count()
    }

    /// Drop every handler
    pub fn clear(&self) -> usize {
        let keys: Vec<ConnectionKey> = self.handlers.iter().map(|entry| *entry.key()).collect();
        keys.into_iter().filter(|key| self.remove(*key)).count()
    }

    pub fn contains(&self, key: &ConnectionKey) -> bool {
        self.handlers.contains_key(key)
    }

    pub fn connection_count(&self) -> usize {
        self.handlers.len()
    }

    pub fn connections_on(&self, port: u16) -> usize {
        self.handlers
            .iter()
            .filter(|entry| entry.key().local_port == port)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::{ExecutionEngine, ExecutionPool, ExecutionRequest, ProcessorSettings};
    use async_trait::async_trait;
    use inflow_core::{ExecutionConfig, ExecutionError, SegmentAckGenerator, SegmentParser};
    use std::time::Duration;

    struct NullEngine;

    #[async_trait]
    impl ExecutionEngine for NullEngine {
        async fn execute(&self, _request: ExecutionRequest) -> Result<(), ExecutionError> {
            Ok(())
        }
    }

    fn processor() -> Arc<MessageProcessor> {
        let exec = Arc::new(ExecutionPool::new(&ExecutionConfig { worker_threads: 1 }).unwrap());
        let settings = ProcessorSettings {
            endpoint: "feed".to_string(),
            sequence: None,
            error_sequence: None,
            auto_ack: true,
            response_timeout: Duration::from_secs(1),
            validate: false,
        };
        Arc::new(MessageProcessor::new(
            settings,
            Arc::new(NullEngine),
            Arc::new(SegmentParser),
            Arc::new(SegmentAckGenerator),
            exec,
        ))
    }

    fn key(local: u16, remote: u16) -> ConnectionKey {
        ConnectionKey::new(local, format!("127.0.0.1:{}", remote).parse().unwrap())
    }

    #[test]
    fn test_handlers_created_on_connect_and_removed_on_close() {
        let mux = SessionMultiplexer::new(BufferPool::new(32, 8), 1024);
        let processor = processor();

        for remote in [5001, 5002] {
            let (link, _rx) = ConnectionLink::channel(key(7000, remote));
            assert_eq!(
                mux.connect(key(7000, remote), processor.clone(), link),
                HandlerDirective::Read
            );
        }
        assert_eq!(mux.connection_count(), 2);
        assert_eq!(mux.buffer_pool().outstanding(), 4);

        assert_eq!(
            mux.dispatch(key(7000, 5001), ReactorEvent::Disconnected),
            HandlerDirective::Close
        );
        assert!(!mux.contains(&key(7000, 5001)));
        assert!(mux.contains(&key(7000, 5002)));
        assert_eq!(mux.buffer_pool().outstanding(), 2);

        assert_eq!(
            mux.dispatch(key(7000, 5001), ReactorEvent::Timeout),
            HandlerDirective::Close
        );
    }

    #[test]
    fn test_close_port_only_touches_that_port() {
        let mux = SessionMultiplexer::new(BufferPool::new(32, 8), 1024);
        let processor = processor();
        for (local, remote) in [(7000, 1), (7000, 2), (7001, 1)] {
            let (link, _rx) = ConnectionLink::channel(key(local, remote));
            mux.connect(key(local, remote), processor.clone(), link);
        }

        assert_eq!(mux.close_port(7000), 2);
        assert_eq!(mux.close_port(7000), 0);
        assert_eq!(mux.connections_on(7001), 1);
        assert_eq!(mux.clear(), 1);
        assert_eq!(mux.buffer_pool().outstanding(), 0);
    }
}

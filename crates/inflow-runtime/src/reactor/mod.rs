//! Protocol Reactor
//!
//! One `ProtocolReactor` owns the non-blocking I/O event loop for every
//! listening endpoint in the process. All bound ports and all accepted
//! connections share its fixed pool of I/O threads; per-connection state is
//! looked up through the `SessionMultiplexer` on each event.
//!
//! ```rust,no_run
//! use inflow_core::ReactorConfig;
//! use inflow_runtime::ProtocolReactor;
//!
//! let reactor = ProtocolReactor::new(ReactorConfig::default());
//! reactor.start()?;
//! // reactor.bind(2575, processor);
//! reactor.stop();
//! # Ok::<(), inflow_core::InflowError>(())
//! ```

mod driver;
pub mod event;
pub mod io;

pub use event::{ConnectionLink, HandlerDirective, LinkCommand, ReactorEvent};
pub use io::{ByteSink, ByteSource};

use crate::managers::SessionMultiplexer;
use crate::processor::MessageProcessor;
use dashmap::DashMap;
use driver::{accept_loop, ListenerContext};
use inflow_core::{BufferPool, InflowResult, ReactorConfig};
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::net::{TcpListener, TcpSocket};
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// How long `unbind` waits for the listening socket to be released
const LISTENER_CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

// ----------------------------------------------------------------------------
// Reactor State
// ----------------------------------------------------------------------------

/// Lifecycle of the reactor event loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReactorState {
    Stopped,
    Running,
    /// Sockets stay open but no I/O is serviced
    Paused,
}

struct ListenerEntry {
    processor: Arc<MessageProcessor>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
    closed: Mutex<std::sync::mpsc::Receiver<()>>,
}

// ----------------------------------------------------------------------------
// Protocol Reactor
// ----------------------------------------------------------------------------

/// Shared event loop for all listening endpoints
pub struct ProtocolReactor {
    config: ReactorConfig,
    runtime: Mutex<Option<Runtime>>,
    state: watch::Sender<ReactorState>,
    listeners: DashMap<u16, ListenerEntry>,
    multiplexer: Arc<SessionMultiplexer>,
}

impl ProtocolReactor {
    pub fn new(config: ReactorConfig) -> Self {
        let pool = BufferPool::new(config.read_buffer_size, config.buffer_pool_capacity);
        let multiplexer = Arc::new(SessionMultiplexer::new(pool, config.max_frame_size));
        let (state, _) = watch::channel(ReactorState::Stopped);
        Self {
            config,
            runtime: Mutex::new(None),
            state,
            listeners: DashMap::new(),
            multiplexer,
        }
    }

    pub fn config(&self) -> &ReactorConfig {
        &self.config
    }

    pub fn state(&self) -> ReactorState {
        *self.state.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.state() == ReactorState::Running
    }

    pub fn multiplexer(&self) -> &SessionMultiplexer {
        &self.multiplexer
    }

    pub fn buffer_pool(&self) -> &BufferPool {
        self.multiplexer.buffer_pool()
    }

    /// Launch the event loop; resumes a paused reactor and is a no-op when running
    pub fn start(&self) -> InflowResult<()> {
        let mut runtime = self.runtime.lock().unwrap_or_else(PoisonError::into_inner);
        if runtime.is_some() {
            if self.state() == ReactorState::Paused {
                self.state.send_replace(ReactorState::Running);
                info!("Protocol reactor resumed");
            }
            return Ok(());
        }

        let io_threads = self.config.io_threads.max(1);
        let built = Builder::new_multi_thread()
            .worker_threads(io_threads)
            .thread_name("inflow-reactor")
            .enable_all()
            .build()?;
        *runtime = Some(built);
        self.state.send_replace(ReactorState::Running);
        info!(io_threads, "Protocol reactor started");
        Ok(())
    }

    /// Stop servicing I/O without closing listeners or connections
    pub fn pause(&self) {
        if self.state() == ReactorState::Running {
            self.state.send_replace(ReactorState::Paused);
            info!("Protocol reactor paused");
        }
    }

    /// Close every listener and connection and shut the event loop down
    pub fn stop(&self) {
        let runtime = self
            .runtime
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(runtime) = runtime else {
            return;
        };

        self.state.send_replace(ReactorState::Stopped);
        let ports: Vec<u16> = self.listeners.iter().map(|entry| *entry.key()).collect();
        for port in ports {
            if let Some((_, entry)) = self.listeners.remove(&port) {
                let _ = entry.shutdown.send(true);
                entry.task.abort();
            }
        }
        // Clear last: a driver still mid-poll sees the shutdown flag and
        // removes its own handler
        runtime.shutdown_background();
        let closed = self.multiplexer.clear();
        info!(closed_connections = closed, "Protocol reactor stopped");
    }

    fn handle(&self) -> Option<Handle> {
        self.runtime
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|runtime| runtime.handle().clone())
    }

    /// Start listening on `port`, serving its connections with `processor`
    ///
    /// Returns `false` if the reactor is not running, the port is already
    /// bound here, or the port is unavailable.
    pub fn bind(&self, port: u16, processor: Arc<MessageProcessor>) -> bool {
        let Some(handle) = self.handle() else {
            warn!(port, "Cannot bind while the protocol reactor is not running");
            return false;
        };
        if self.listeners.contains_key(&port) {
            warn!(port, "Port is already bound by this reactor");
            return false;
        }

        let ip: IpAddr = match self.config.bind_address.parse() {
            Ok(ip) => ip,
            Err(e) => {
                error!(address = %self.config.bind_address, error = %e, "Invalid bind address");
                return false;
            }
        };
        let addr = SocketAddr::new(ip, port);

        let listener = {
            let _guard = handle.enter();
            if !port_accepts_bind(addr) {
                error!(port, "Port is not available for binding");
                return false;
            }
            match self.open_listener(addr) {
                Ok(listener) => listener,
                Err(e) => {
                    error!(port, error = %e, "Failed to open listener");
                    return false;
                }
            }
        };

        let (shutdown, shutdown_rx) = watch::channel(false);
        let (closed_tx, closed) = std::sync::mpsc::channel();
        let context = ListenerContext {
            port,
            processor: processor.clone(),
            multiplexer: self.multiplexer.clone(),
            socket: self.config.socket.clone(),
            idle_timeout: self.config.idle_timeout(),
            state: self.state.subscribe(),
            shutdown: shutdown_rx,
        };
        let task = handle.spawn(accept_loop(listener, context, closed_tx));

        self.listeners.insert(
            port,
            ListenerEntry {
                processor,
                shutdown,
                task,
                closed: Mutex::new(closed),
            },
        );
        info!(port, address = %addr, "Listening for connections");
        true
    }

    fn open_listener(&self, addr: SocketAddr) -> std::io::Result<TcpListener> {
        let options = &self.config.socket;
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        socket.set_keepalive(options.keep_alive)?;
        if let Some(size) = options.recv_buffer_size {
            socket.set_recv_buffer_size(size)?;
        }
        if let Some(size) = options.send_buffer_size {
            socket.set_send_buffer_size(size)?;
        }
        socket.bind(addr)?;
        socket.listen(options.backlog)
    }

    /// Close the listener on `port` and every connection accepted on it
    ///
    /// Returns `false` if nothing was bound on `port`.
    pub fn unbind(&self, port: u16) -> bool {
        let Some((_, entry)) = self.listeners.remove(&port) else {
            debug!(port, "Unbind requested for a port that is not bound");
            return false;
        };

        let _ = entry.shutdown.send(true);
        let closed = entry.closed.into_inner().unwrap_or_else(PoisonError::into_inner);
        if closed.recv_timeout(LISTENER_CLOSE_TIMEOUT).is_err() {
            entry.task.abort();
        }
        let closed = self.multiplexer.close_port(port);
        info!(port, closed_connections = closed, "Stopped listening");
        true
    }

    pub fn is_bound(&self, port: u16) -> bool {
        self.listeners.contains_key(&port)
    }

    /// Processor serving `port`, if bound
    pub fn processor(&self, port: u16) -> Option<Arc<MessageProcessor>> {
        self.listeners.get(&port).map(|entry| entry.processor.clone())
    }

    pub fn bound_ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self.listeners.iter().map(|entry| *entry.key()).collect();
        ports.sort_unstable();
        ports
    }
}

impl Drop for ProtocolReactor {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Best-effort check that nothing else is listening on `addr`
fn port_accepts_bind(addr: SocketAddr) -> bool {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    };
    match socket {
        Ok(socket) => socket.set_reuseaddr(true).is_ok() && socket.bind(addr).is_ok(),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_is_idempotent_and_resumes_pause() {
        let reactor = ProtocolReactor::new(ReactorConfig::testing());
        assert_eq!(reactor.state(), ReactorState::Stopped);

        reactor.start().unwrap();
        reactor.start().unwrap();
        assert!(reactor.is_running());

        reactor.pause();
        assert_eq!(reactor.state(), ReactorState::Paused);
        reactor.start().unwrap();
        assert_eq!(reactor.state(), ReactorState::Running);

        reactor.stop();
        reactor.stop();
        assert_eq!(reactor.state(), ReactorState::Stopped);
    }

    #[test]
    fn test_unbind_unknown_port_is_harmless() {
        let reactor = ProtocolReactor::new(ReactorConfig::testing());
        reactor.start().unwrap();
        assert!(!reactor.unbind(1));
        assert!(!reactor.is_bound(1));
    }
}

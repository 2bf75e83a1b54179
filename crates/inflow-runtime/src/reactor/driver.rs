//! Accept loops and per-connection drivers
//!
//! Every bound port runs one accept loop on the reactor runtime. Each accepted
//! socket gets a driver task that waits for whatever the handler asked for
//! (readable, writable, a queued response, the idle deadline) and feeds the
//! resulting event through the shared `SessionMultiplexer`.

use super::event::{ConnectionLink, HandlerDirective, LinkCommand, ReactorEvent};
use super::ReactorState;
use crate::managers::SessionMultiplexer;
use crate::processor::MessageProcessor;
use inflow_core::{ConnectionKey, SocketOptions};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, warn};

/// Pause after a failed accept before trying again
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Everything a connection driver shares with its listener
#[derive(Clone)]
pub(crate) struct ListenerContext {
    pub port: u16,
    pub processor: Arc<MessageProcessor>,
    pub multiplexer: Arc<SessionMultiplexer>,
    pub socket: SocketOptions,
    pub idle_timeout: Option<Duration>,
    pub state: watch::Receiver<ReactorState>,
    pub shutdown: watch::Receiver<bool>,
}

/// Wait until the reactor leaves `Paused`; `false` means stop instead
async fn wait_while_paused(
    state: &mut watch::Receiver<ReactorState>,
    shutdown: &mut watch::Receiver<bool>,
) -> bool {
    loop {
        let current = *state.borrow_and_update();
        match current {
            ReactorState::Running => return true,
            ReactorState::Stopped => return false,
            ReactorState::Paused => {}
        }
        if *shutdown.borrow() {
            return false;
        }
        tokio::select! {
            changed = state.changed() => {
                if changed.is_err() {
                    return false;
                }
            }
            _ = shutdown.changed() => return false,
        }
    }
}

// ----------------------------------------------------------------------------
// Accept Loop
// ----------------------------------------------------------------------------

pub(crate) async fn accept_loop(
    listener: TcpListener,
    mut context: ListenerContext,
    closed: std::sync::mpsc::Sender<()>,
) {
    let port = context.port;
    loop {
        let current = *context.state.borrow();
        if current == ReactorState::Stopped || *context.shutdown.borrow() {
            break;
        }
        if current == ReactorState::Paused
            && !wait_while_paused(&mut context.state, &mut context.shutdown).await
        {
            break;
        }

        tokio::select! {
            _ = context.shutdown.changed() => break,
            changed = context.state.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => {
                    let key = ConnectionKey::new(port, remote);
                    debug!(port, connection = %key, "Accepted connection");
                    tokio::spawn(drive_connection(stream, key, context.clone()));
                }
                Err(e) => {
                    error!(port, error = %e, "Failed to accept connection");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },
        }
    }

    drop(listener);
    debug!(port, "Listener closed");
    let _ = closed.send(());
}

// ----------------------------------------------------------------------------
// Connection Driver
// ----------------------------------------------------------------------------

async fn drive_connection(stream: TcpStream, key: ConnectionKey, mut context: ListenerContext) {
    if let Err(e) = stream.set_nodelay(context.socket.no_delay) {
        warn!(connection = %key, error = %e, "Failed to apply TCP_NODELAY");
    }

    if *context.shutdown.borrow() || *context.state.borrow() == ReactorState::Stopped {
        debug!(connection = %key, "Dropping connection accepted during shutdown");
        return;
    }

    let (mut reader, mut writer) = stream.into_split();
    let (tx, mut commands) = mpsc::unbounded_channel();
    let link = ConnectionLink::new(key, tx);
    let multiplexer = context.multiplexer.clone();

    let mut directive = multiplexer.connect(key, context.processor.clone(), link);
    let mut deadline = context.idle_timeout.map(|timeout| Instant::now() + timeout);

    while directive != HandlerDirective::Close {
        if *context.shutdown.borrow() {
            multiplexer.dispatch(key, ReactorEvent::Disconnected);
            break;
        }
        if *context.state.borrow() != ReactorState::Running
            && !wait_while_paused(&mut context.state, &mut context.shutdown).await
        {
            multiplexer.dispatch(key, ReactorEvent::Disconnected);
            break;
        }

        let idle_deadline = deadline.unwrap_or_else(Instant::now);
        directive = tokio::select! {
            _ = context.shutdown.changed() => {
                multiplexer.dispatch(key, ReactorEvent::Disconnected)
            }
            changed = context.state.changed() => {
                if changed.is_err() {
                    multiplexer.dispatch(key, ReactorEvent::Disconnected)
                } else {
                    directive
                }
            }
            command = commands.recv() => match command {
                Some(LinkCommand::Send(message)) => {
                    multiplexer.dispatch(key, ReactorEvent::OutputRequested(message))
                }
                Some(LinkCommand::Close) | None => {
                    multiplexer.dispatch(key, ReactorEvent::Disconnected)
                }
            },
            ready = reader.readable(), if directive == HandlerDirective::Read => match ready {
                Ok(()) => {
                    deadline = context.idle_timeout.map(|timeout| Instant::now() + timeout);
                    multiplexer.dispatch(key, ReactorEvent::InputReady { source: &mut reader })
                }
                Err(e) => {
                    error!(connection = %key, error = %e, "Socket failed while waiting to read");
                    multiplexer.dispatch(key, ReactorEvent::Disconnected)
                }
            },
            ready = writer.writable(), if directive == HandlerDirective::Write => match ready {
                Ok(()) => {
                    deadline = context.idle_timeout.map(|timeout| Instant::now() + timeout);
                    multiplexer.dispatch(key, ReactorEvent::OutputReady { sink: &mut writer })
                }
                Err(e) => {
                    error!(connection = %key, error = %e, "Socket failed while waiting to write");
                    multiplexer.dispatch(key, ReactorEvent::Disconnected)
                }
            },
            _ = sleep_until(idle_deadline), if deadline.is_some() => {
                multiplexer.dispatch(key, ReactorEvent::Timeout)
            }
        };
    }

    debug!(connection = %key, "Connection driver finished");
}

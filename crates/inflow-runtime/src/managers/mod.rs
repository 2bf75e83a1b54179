//! Stateful managers for the inflow runtime
//!
//! This module contains the per-connection handler, the reactor-level session
//! multiplexer and the request/response correlator.

pub mod connection;
pub mod delivery;
pub mod session;

pub use connection::ConnectionHandler;
pub use delivery::{CompletionOutcome, ExchangeState, PendingExchange, RequestCorrelator, TIMEOUT_NACK_REASON};
pub use session::SessionMultiplexer;

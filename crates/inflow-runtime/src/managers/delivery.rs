//! Request/response correlation for listening endpoints
//!
//! This module contains the `RequestCorrelator`, which pairs a decoded
//! request with the response the execution engine produces for it later, or
//! with a timeout NACK if the engine takes too long. Each exchange reaches
//! exactly one terminal state; the transition out of `Pending` happens under
//! the exchange's own mutex, so a response racing the timer delivers exactly
//! one frame.

use crate::reactor::ConnectionLink;
use dashmap::DashMap;
use inflow_core::{
    AckGenerator, ConnectionKey, InboundMessage, InflowError, MessageId, OutboundMessage, Response,
};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

/// Reason carried by the NACK sent when no response arrives in time
pub const TIMEOUT_NACK_REASON: &str = "Timed out while waiting for response to be generated";

// ----------------------------------------------------------------------------
// Pending Exchange
// ----------------------------------------------------------------------------

/// Lifecycle of one correlated exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeState {
    Pending,
    Completed,
    TimedOut,
    Cancelled,
}

/// Result of handing a response to the correlator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionOutcome {
    /// The response was queued to the waiting connection
    Delivered,
    /// No pending exchange carries this message id
    Stale,
    /// The exchange already timed out or was cancelled
    AlreadyFinished,
}

/// One outstanding request awaiting its response
#[derive(Debug)]
pub struct PendingExchange {
    request: InboundMessage,
    link: ConnectionLink,
    state: Mutex<ExchangeState>,
    timer: Mutex<Option<AbortHandle>>,
}

impl PendingExchange {
    fn new(request: InboundMessage, link: ConnectionLink) -> Self {
        Self {
            request,
            link,
            state: Mutex::new(ExchangeState::Pending),
            timer: Mutex::new(None),
        }
    }

    pub fn message_id(&self) -> MessageId {
        self.request.id
    }

    pub fn connection(&self) -> ConnectionKey {
        self.link.key()
    }

    pub fn state(&self) -> ExchangeState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Leave `Pending` for `next`; only the first caller succeeds
    fn finish(&self, next: ExchangeState) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state != ExchangeState::Pending {
            return false;
        }
        *state = next;
        true
    }

    fn set_timer(&self, handle: AbortHandle) {
        *self.timer.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }

    fn cancel_timer(&self) {
        if let Some(timer) = self.timer.lock().unwrap_or_else(PoisonError::into_inner).take() {
            timer.abort();
        }
    }
}

// ----------------------------------------------------------------------------
// Request Correlator
// ----------------------------------------------------------------------------

#[derive(Debug)]
struct CorrelatorInner {
    exchanges: DashMap<MessageId, Arc<PendingExchange>>,
    by_connection: DashMap<ConnectionKey, MessageId>,
}

/// Matches asynchronously produced responses to their requests
#[derive(Clone)]
pub struct RequestCorrelator {
    inner: Arc<CorrelatorInner>,
    timers: Handle,
    acks: Arc<dyn AckGenerator>,
}

impl RequestCorrelator {
    /// Create a correlator whose timeout timers run on `timers`
    pub fn new(timers: Handle, acks: Arc<dyn AckGenerator>) -> Self {
        Self {
            inner: Arc::new(CorrelatorInner {
                exchanges: DashMap::new(),
                by_connection: DashMap::new(),
            }),
            timers,
            acks,
        }
    }

    /// Start waiting for the response to `request`
    ///
    /// A zero `timeout` waits indefinitely. An exchange already pending on
    /// the same connection is cancelled first.
    pub fn arm(&self, request: InboundMessage, link: ConnectionLink, timeout: Duration) -> MessageId {
        let id = request.id;
        let key = link.key();

        if let Some(previous) = self.inner.by_connection.insert(key, id) {
            if let Some((_, exchange)) = self.inner.exchanges.remove(&previous) {
                if exchange.finish(ExchangeState::Cancelled) {
                    exchange.cancel_timer();
                    warn!(
                        message_id = %previous,
                        connection = %key,
                        "Cancelling unanswered request replaced by a new one"
                    );
                }
            }
        }

        let exchange = Arc::new(PendingExchange::new(request, link));
        self.inner.exchanges.insert(id, exchange.clone());

        if !timeout.is_zero() {
            let correlator = self.clone();
            let timer = self.timers.spawn(async move {
                tokio::time::sleep(timeout).await;
                correlator.on_timeout(id);
            });
            exchange.set_timer(timer.abort_handle());
        }

        debug!(message_id = %id, connection = %key, ?timeout, "Armed pending exchange");
        id
    }

    /// Deliver the engine's response for `id`
    pub fn complete(&self, id: MessageId, response: Response) -> CompletionOutcome {
        self.complete_with(id, response, false)
    }

    /// Deliver the engine's response for `id` and close the connection afterwards
    pub fn complete_then_close(&self, id: MessageId, response: Response) -> CompletionOutcome {
        self.complete_with(id, response, true)
    }

    fn complete_with(&self, id: MessageId, response: Response, close_after: bool) -> CompletionOutcome {
        let Some(exchange) = self.inner.exchanges.get(&id).map(|entry| entry.value().clone()) else {
            warn!(
                message_id = %id,
                "Response ID does not match request ID. This response may have been received after the timeout"
            );
            return CompletionOutcome::Stale;
        };

        if !exchange.finish(ExchangeState::Completed) {
            debug!(message_id = %id, "Ignoring response for an exchange that already finished");
            return CompletionOutcome::AlreadyFinished;
        }
        exchange.cancel_timer();
        self.forget(&exchange);

        let outbound = self.to_outbound(&exchange.request, response).closing(close_after);
        if !exchange.link.send(outbound) {
            debug!(message_id = %id, "Connection closed before its response could be written");
        }
        CompletionOutcome::Delivered
    }

    /// Answer `id` with a timeout NACK if it is still pending
    pub fn on_timeout(&self, id: MessageId) -> bool {
        let Some(exchange) = self.inner.exchanges.get(&id).map(|entry| entry.value().clone()) else {
            return false;
        };
        if !exchange.finish(ExchangeState::TimedOut) {
            return false;
        }
        self.forget(&exchange);

        let err = InflowError::ResponseTimeout { message_id: id };
        warn!(
            message_id = %id,
            connection = %exchange.connection(),
            error = %err,
            "No response generated in time, sending timeout NACK"
        );
        let nack = self.acks.nack(Some(&exchange.request), TIMEOUT_NACK_REASON);
        exchange.link.send(OutboundMessage::nack(nack));
        true
    }

    /// Cancel whatever exchange is pending on a closing connection
    pub fn release_connection(&self, key: ConnectionKey) {
        let Some((_, id)) = self.inner.by_connection.remove(&key) else {
            return;
        };
        if let Some((_, exchange)) = self.inner.exchanges.remove(&id) {
            if exchange.finish(ExchangeState::Cancelled) {
                exchange.cancel_timer();
                debug!(message_id = %id, connection = %key, "Cancelled exchange of closed connection");
            }
        }
    }

    pub fn pending_count(&self) -> usize {
        self.inner.exchanges.len()
    }

    pub fn is_pending(&self, id: &MessageId) -> bool {
        self.inner.exchanges.contains_key(id)
    }

    fn forget(&self, exchange: &PendingExchange) {
        let id = exchange.message_id();
        self.inner.exchanges.remove(&id);
        self.inner
            .by_connection
            .remove_if(&exchange.connection(), |_, pending| *pending == id);
    }

    fn to_outbound(&self, request: &InboundMessage, response: Response) -> OutboundMessage {
        match response {
            Response::Payload(payload) => OutboundMessage::application(payload),
            Response::ApplicationAck => OutboundMessage::ack(self.acks.ack(request)),
            Response::Nack(reason) => OutboundMessage::nack(self.acks.nack(Some(request), &reason)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::LinkCommand;
    use inflow_core::{OutboundKind, SegmentAckGenerator};

    fn key(port: u16) -> ConnectionKey {
        ConnectionKey::new(2575, format!("127.0.0.1:{}", port).parse().unwrap())
    }

    fn correlator() -> RequestCorrelator {
        RequestCorrelator::new(Handle::current(), Arc::new(SegmentAckGenerator))
    }

    #[tokio::test]
    async fn test_complete_delivers_payload_once() {
        let correlator = correlator();
        let (link, mut rx) = ConnectionLink::channel(key(1));
        let request = InboundMessage::new(key(1), b"MSH|x".to_vec());
        let id = correlator.arm(request, link, Duration::ZERO);

        assert_eq!(
            correlator.complete(id, Response::Payload(b"reply".to_vec())),
            CompletionOutcome::Delivered
        );
        assert_eq!(
            correlator.complete(id, Response::ApplicationAck),
            CompletionOutcome::Stale
        );
        match rx.recv().await {
            Some(LinkCommand::Send(message)) => {
                assert_eq!(message.kind, OutboundKind::Application);
                assert_eq!(message.payload, b"reply");
            }
            other => panic!("unexpected command {:?}", other),
        }
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_timeout_sends_nack_and_blocks_late_response() {
        let correlator = correlator();
        let (link, mut rx) = ConnectionLink::channel(key(2));
        let id = correlator.arm(
            InboundMessage::new(key(2), b"MSH|x".to_vec()),
            link,
            Duration::from_millis(20),
        );

        match rx.recv().await {
            Some(LinkCommand::Send(message)) => {
                assert_eq!(message.kind, OutboundKind::Nack);
                let text = String::from_utf8(message.payload).unwrap();
                assert!(text.contains(TIMEOUT_NACK_REASON));
            }
            other => panic!("unexpected command {:?}", other),
        }
        assert_eq!(correlator.complete(id, Response::ApplicationAck), CompletionOutcome::Stale);
    }

    #[tokio::test]
    async fn test_rearming_connection_cancels_previous_exchange() {
        let correlator = correlator();
        let (link, _rx) = ConnectionLink::channel(key(3));
        let first = correlator.arm(InboundMessage::new(key(3), b"a".to_vec()), link.clone(), Duration::ZERO);
        let second = correlator.arm(InboundMessage::new(key(3), b"b".to_vec()), link, Duration::ZERO);

        assert!(!correlator.is_pending(&first));
        assert!(correlator.is_pending(&second));
        assert_eq!(correlator.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_release_connection_cancels_exchange() {
        let correlator = correlator();
        let (link, _rx) = ConnectionLink::channel(key(4));
        let id = correlator.arm(
            InboundMessage::new(key(4), b"a".to_vec()),
            link,
            Duration::from_secs(30),
        );
        correlator.release_connection(key(4));
        correlator.release_connection(key(4));
        assert!(!correlator.is_pending(&id));
        assert!(!correlator.on_timeout(id));
    }
}

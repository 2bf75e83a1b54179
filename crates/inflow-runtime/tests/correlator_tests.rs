//! Integration Tests for Request Correlation
//!
//! Races between engine responses and response timers, and handling of
//! responses that arrive for an exchange that is no longer pending.

use inflow_core::{
    ConnectionKey, InboundMessage, MessageId, MessageParser, OutboundKind, Response,
    SegmentAckGenerator, SegmentParser,
};
use inflow_runtime::{CompletionOutcome, ConnectionLink, LinkCommand, RequestCorrelator};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::time::{sleep, timeout};

const REQUEST: &[u8] = b"MSH|^~\\&|LAB|NORTH|EHR|SOUTH|||ORU^R01|R7|P|2.5\r";

fn key(remote_port: u16) -> ConnectionKey {
    ConnectionKey::new(2575, format!("10.0.0.5:{}", remote_port).parse().unwrap())
}

fn request(remote_port: u16) -> InboundMessage {
    let header = SegmentParser.parse(REQUEST, true).unwrap();
    InboundMessage::new(key(remote_port), REQUEST.to_vec()).with_header(header)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_complete_racing_timeout_delivers_exactly_one_frame() {
    let correlator = RequestCorrelator::new(Handle::current(), Arc::new(SegmentAckGenerator));
    let mut delivered_responses = 0;
    let mut delivered_nacks = 0;

    for round in 0..200u16 {
        let (link, mut rx) = ConnectionLink::channel(key(30_000 + round));
        let id = correlator.arm(request(30_000 + round), link, Duration::from_millis(1));

        let racer = correlator.clone();
        let completion = tokio::spawn(async move {
            sleep(Duration::from_micros(u64::from(round % 5) * 300)).await;
            racer.complete(id, Response::Payload(b"result".to_vec()))
        });

        let first = timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("neither the response nor the timeout NACK arrived");
        let outcome = completion.await.unwrap();

        match first {
            Some(LinkCommand::Send(message)) if message.kind == OutboundKind::Application => {
                assert_eq!(outcome, CompletionOutcome::Delivered);
                delivered_responses += 1;
            }
            Some(LinkCommand::Send(message)) if message.kind == OutboundKind::Nack => {
                assert_ne!(outcome, CompletionOutcome::Delivered);
                delivered_nacks += 1;
            }
            other => panic!("unexpected command {:?}", other),
        }

        sleep(Duration::from_millis(3)).await;
        assert!(rx.try_recv().is_err());
        assert!(!correlator.is_pending(&id));
    }

    assert_eq!(delivered_responses + delivered_nacks, 200);
    assert_eq!(correlator.pending_count(), 0);
}

#[tokio::test]
async fn test_mismatched_response_leaves_live_exchange_untouched() {
    let correlator = RequestCorrelator::new(Handle::current(), Arc::new(SegmentAckGenerator));
    let (link, mut rx) = ConnectionLink::channel(key(40_000));
    let id = correlator.arm(request(40_000), link, Duration::from_secs(30));

    assert_eq!(
        correlator.complete(MessageId::new(), Response::ApplicationAck),
        CompletionOutcome::Stale
    );
    assert!(correlator.is_pending(&id));
    assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));

    assert_eq!(
        correlator.complete(id, Response::Nack("downstream rejected".to_string())),
        CompletionOutcome::Delivered
    );
    match rx.recv().await {
        Some(LinkCommand::Send(message)) => {
            assert_eq!(message.kind, OutboundKind::Nack);
            let text = String::from_utf8(message.payload).unwrap();
            assert!(text.contains("MSA|AE|R7|downstream rejected"));
        }
        other => panic!("unexpected command {:?}", other),
    }
}

#[tokio::test]
async fn test_late_response_after_timeout_is_a_no_op() {
    let correlator = RequestCorrelator::new(Handle::current(), Arc::new(SegmentAckGenerator));
    let (link, mut rx) = ConnectionLink::channel(key(40_001));
    let id = correlator.arm(request(40_001), link, Duration::from_millis(10));

    let nack = timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
    assert!(matches!(nack, Some(LinkCommand::Send(ref m)) if m.kind == OutboundKind::Nack));

    assert_eq!(
        correlator.complete_then_close(id, Response::ApplicationAck),
        CompletionOutcome::Stale
    );
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_exchanges_on_different_connections_are_independent() {
    let correlator = RequestCorrelator::new(Handle::current(), Arc::new(SegmentAckGenerator));
    let (first_link, mut first_rx) = ConnectionLink::channel(key(40_010));
    let (second_link, mut second_rx) = ConnectionLink::channel(key(40_011));
    let first = correlator.arm(request(40_010), first_link, Duration::ZERO);
    let second = correlator.arm(request(40_011), second_link, Duration::ZERO);
    assert_eq!(correlator.pending_count(), 2);

    correlator.complete_then_close(second, Response::ApplicationAck);
    match second_rx.recv().await {
        Some(LinkCommand::Send(message)) => {
            assert_eq!(message.kind, OutboundKind::Ack);
            assert!(message.close_after);
        }
        other => panic!("unexpected command {:?}", other),
    }
    assert!(matches!(first_rx.try_recv(), Err(TryRecvError::Empty)));
    assert!(correlator.is_pending(&first));
}

//! Session Lifecycle Integration Tests
//!
//! Drives a real `QuoteSession` against the in-process `PriceSimulator`:
//! start-up failures, quote delivery into the price book, subscription
//! growth and stop.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::float_cmp)]

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::time::timeout;

use quote_stream::infrastructure::alpaca::ClientRequest;
use quote_stream::{
    Connector, Credentials, ErrorKind, LifecycleState, PriceBook, PriceSimulator, Quote,
    QuoteBatch, QuoteSession, QuoteStream, ReconnectConfig, SessionError, SessionOptions,
    SimulatorConfig, StreamConnector, StreamEndpoint,
};

const WAIT: Duration = Duration::from_secs(5);

fn connector_for(url: String, base_url: String) -> Arc<dyn Connector> {
    let endpoint = StreamEndpoint::new(url, base_url, "v2");
    let credentials = Credentials::new("test-key", "test-secret").unwrap();
    Arc::new(
        StreamConnector::new(endpoint, credentials)
            .with_connect_timeout(Duration::from_secs(2))
            .with_auth_timeout(Duration::from_secs(2)),
    )
}

fn simulator_connector(sim: &PriceSimulator) -> Arc<dyn Connector> {
    connector_for(sim.ws_url(), sim.http_url())
}

fn test_options() -> SessionOptions {
    SessionOptions::default()
        .with_reconnect(ReconnectConfig::fixed(Duration::from_millis(100)))
        .with_heartbeat(None)
        .with_ack_timeout(Duration::from_secs(2))
}

async fn next_batch(stream: &mut QuoteStream) -> QuoteBatch {
    timeout(WAIT, stream.recv())
        .await
        .expect("timeout waiting for batch")
        .expect("quote stream ended")
}

async fn wait_until_streaming(session: &QuoteSession) {
    let mut states = session.state_changes();
    timeout(WAIT, states.wait_for(|s| *s == LifecycleState::Streaming))
        .await
        .expect("timeout waiting for streaming")
        .expect("session state channel closed");
}

async fn start_session(
    sim: &PriceSimulator,
    symbols: &[&str],
) -> (QuoteSession, QuoteStream, Arc<PriceBook>) {
    let book = PriceBook::shared();
    let (session, stream) = QuoteSession::start(
        simulator_connector(sim),
        Arc::clone(&book),
        symbols.iter().copied(),
        test_options(),
    )
    .await
    .expect("session should start");
    (session, stream, book)
}

#[tokio::test]
async fn start_authenticates_then_subscribes() {
    let sim = PriceSimulator::start().await.unwrap();
    let (session, _stream, _book) = start_session(&sim, &["ACA"]).await;

    let auth = sim.next_request(WAIT).await.expect("auth request");
    assert_eq!(
        auth.request,
        ClientRequest::Auth {
            key: "test-key".to_string(),
            secret: "test-secret".to_string(),
        }
    );

    let subscribe = sim.next_request(WAIT).await.expect("subscribe request");
    assert_eq!(subscribe.connection_id, auth.connection_id);
    assert_eq!(
        subscribe.request,
        ClientRequest::Subscribe {
            quotes: vec!["ACA".to_string()]
        }
    );

    wait_until_streaming(&session).await;
    assert_eq!(session.symbols(), vec!["ACA".to_string()]);
    session.stop().await;
}

#[tokio::test]
async fn handshake_carries_origin_header() {
    let sim = PriceSimulator::start().await.unwrap();
    let (session, _stream, _book) = start_session(&sim, &["ACA"]).await;

    let expected = format!("{}/v2", sim.http_url());
    assert_eq!(sim.origins(), vec![Some(expected)]);
    session.stop().await;
}

#[tokio::test]
async fn greeting_before_auth_is_tolerated() {
    let sim = PriceSimulator::bind(
        "127.0.0.1:0",
        SimulatorConfig {
            send_greeting: true,
            ..SimulatorConfig::default()
        },
    )
    .await
    .unwrap();
    let (session, mut stream, book) = start_session(&sim, &["ACA"]).await;

    sim.publish(&[Quote::new("ACA", 10.0, 10.5)]).unwrap();
    let batch = next_batch(&mut stream).await;
    assert_eq!(batch.len(), 1);
    assert_eq!(book.get("ACA").unwrap().ask_price, 10.5);
    session.stop().await;
}

#[tokio::test]
async fn quotes_reach_price_book_with_exact_fields() {
    let sim = PriceSimulator::start().await.unwrap();
    let (session, mut stream, book) = start_session(&sim, &["AAPL"]).await;

    let quote = Quote::new("AAPL", 150.25, 150.30)
        .with_sizes(2, 3)
        .with_exchanges("V", "Q")
        .with_timestamp("2024-01-15T14:30:00.123456789Z")
        .with_conditions(vec!["R".to_string()])
        .with_tape("C");
    sim.publish(std::slice::from_ref(&quote)).unwrap();

    let batch = next_batch(&mut stream).await;
    assert_eq!(batch.iter().collect::<Vec<_>>(), vec![&quote]);

    let cached = book.get("AAPL").expect("quote cached");
    assert_eq!(*cached, quote);
    assert_eq!(book.len(), 1);
    session.stop().await;
}

#[tokio::test]
async fn batch_preserves_frame_order() {
    let sim = PriceSimulator::start().await.unwrap();
    let (session, mut stream, book) = start_session(&sim, &["A", "B", "C"]).await;

    let quotes = vec![
        Quote::new("C", 3.0, 3.1),
        Quote::new("A", 1.0, 1.1),
        Quote::new("B", 2.0, 2.1),
    ];
    sim.publish(&quotes).unwrap();

    let batch = next_batch(&mut stream).await;
    let symbols: Vec<_> = batch.iter().map(|q| q.symbol.as_str()).collect();
    assert_eq!(symbols, vec!["C", "A", "B"]);
    assert_eq!(book.len(), 3);
    session.stop().await;
}

#[tokio::test]
async fn newer_quote_replaces_older_and_repeats_are_idempotent() {
    let sim = PriceSimulator::start().await.unwrap();
    let (session, mut stream, book) = start_session(&sim, &["ACA"]).await;

    sim.publish(&[Quote::new("ACA", 75.46, 65.00)]).unwrap();
    next_batch(&mut stream).await;
    let first = book.get("ACA").unwrap();
    assert_eq!((first.bid_price, first.ask_price), (75.46, 65.00));

    let second = Quote::new("ACA", 85.46, 95.00);
    for _ in 0..2 {
        sim.publish(std::slice::from_ref(&second)).unwrap();
        next_batch(&mut stream).await;
        assert_eq!(*book.get("ACA").unwrap(), second);
    }
    assert_eq!(book.len(), 1);
    session.stop().await;
}

#[tokio::test]
async fn subscribe_announces_full_set_and_ignores_duplicates() {
    let sim = PriceSimulator::start().await.unwrap();
    let (session, _stream, _book) = start_session(&sim, &["A"]).await;
    let (_, initial) = sim.next_subscription(WAIT).await.unwrap();
    assert_eq!(initial, vec!["A".to_string()]);

    session.subscribe(["B"]).await.unwrap();
    let (_, grown) = sim.next_subscription(WAIT).await.unwrap();
    assert_eq!(grown, vec!["A".to_string(), "B".to_string()]);

    session.subscribe(["A", "B"]).await.unwrap();
    let (_, repeated) = sim.next_subscription(WAIT).await.unwrap();
    assert_eq!(repeated, vec!["A".to_string(), "B".to_string()]);
    assert_eq!(session.symbols(), vec!["A".to_string(), "B".to_string()]);

    session.stop().await;
}

#[tokio::test]
async fn empty_initial_set_skips_subscribe() {
    let sim = PriceSimulator::start().await.unwrap();
    let (session, _stream, _book) = start_session(&sim, &[]).await;

    let auth = sim.next_request(WAIT).await.unwrap();
    assert!(matches!(auth.request, ClientRequest::Auth { .. }));
    assert!(sim.next_request(Duration::from_millis(200)).await.is_none());
    wait_until_streaming(&session).await;

    session.subscribe(["ACA"]).await.unwrap();
    let (_, symbols) = sim.next_subscription(WAIT).await.unwrap();
    assert_eq!(symbols, vec!["ACA".to_string()]);
    session.stop().await;
}

#[tokio::test]
async fn stop_ends_stream_and_freezes_price_book() {
    let sim = PriceSimulator::start().await.unwrap();
    let (session, mut stream, book) = start_session(&sim, &["ACA"]).await;

    sim.publish(&[Quote::new("ACA", 1.0, 2.0)]).unwrap();
    next_batch(&mut stream).await;

    timeout(WAIT, session.stop()).await.expect("stop should be bounded");
    assert_eq!(session.state(), LifecycleState::Stopped);
    assert!(session.is_stopped());

    let end = timeout(WAIT, stream.next()).await.expect("stream should end");
    assert!(end.is_none());

    let updates = book.update_count();
    sim.publish(&[Quote::new("ACA", 9.0, 9.5)]).unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(book.update_count(), updates);
    assert_eq!(book.get("ACA").unwrap().bid_price, 1.0);

    timeout(WAIT, session.stop()).await.expect("second stop is a no-op");
}

#[tokio::test]
async fn subscribe_after_stop_is_rejected() {
    let sim = PriceSimulator::start().await.unwrap();
    let (session, _stream, _book) = start_session(&sim, &["ACA"]).await;

    session.stop().await;
    let err = session.subscribe(["MSFT"]).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Stopped);
    assert!(matches!(err, SessionError::Stopped));
}

#[tokio::test]
async fn closed_port_fails_with_connect_failed() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let book = PriceBook::shared();
    let err = QuoteSession::start(
        connector_for(format!("ws://{addr}/pricing"), format!("http://{addr}")),
        Arc::clone(&book),
        ["ACA"],
        test_options(),
    )
    .await
    .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::ConnectFailed);
    assert!(book.is_empty());
}

#[tokio::test]
async fn rejected_credentials_fail_with_auth_failed() {
    let sim = PriceSimulator::bind(
        "127.0.0.1:0",
        SimulatorConfig {
            reject_auth: true,
            ..SimulatorConfig::default()
        },
    )
    .await
    .unwrap();

    let book = PriceBook::shared();
    let err = QuoteSession::start(
        simulator_connector(&sim),
        Arc::clone(&book),
        ["ACA"],
        test_options(),
    )
    .await
    .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::AuthFailed);
    assert!(book.is_empty());
    assert_eq!(sim.connections_accepted(), 1);
}

#[tokio::test]
async fn dropped_stream_does_not_stop_price_book_updates() {
    let sim = PriceSimulator::start().await.unwrap();
    let (session, stream, book) = start_session(&sim, &["ACA"]).await;
    drop(stream);

    sim.publish(&[Quote::new("ACA", 5.0, 5.5)]).unwrap();
    timeout(WAIT, async {
        while book.get("ACA").is_none() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("price book should update without a consumer");

    session.stop().await;
}

#[tokio::test]
async fn rejected_subscription_fails_start_without_retry() {
    let sim = PriceSimulator::bind(
        "127.0.0.1:0",
        SimulatorConfig {
            reject_subscribe: true,
            ..SimulatorConfig::default()
        },
    )
    .await
    .unwrap();

    let book = PriceBook::shared();
    let err = QuoteSession::start(
        simulator_connector(&sim),
        Arc::clone(&book),
        ["ACA"],
        test_options(),
    )
    .await
    .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::SubscribeFailed);
    assert!(matches!(err, SessionError::SubscribeFailed(_)));
    assert!(book.is_empty());

    timeout(WAIT, async {
        while sim.live_connections() > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("failed start should close its connection");
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(sim.connections_accepted(), 1);
}

#[tokio::test]
async fn slow_consumer_does_not_block_subscribe_or_price_book() {
    let sim = PriceSimulator::start().await.unwrap();
    let book = PriceBook::shared();
    let (session, mut stream) = QuoteSession::start(
        simulator_connector(&sim),
        Arc::clone(&book),
        ["A"],
        test_options().with_output_capacity(1),
    )
    .await
    .expect("session should start");
    sim.next_subscription(WAIT).await.unwrap();

    for bid in [1.0, 2.0, 3.0] {
        sim.publish(&[Quote::new("A", bid, bid + 0.5)]).unwrap();
    }
    timeout(WAIT, async {
        while book.get("A").is_none_or(|q| q.bid_price != 3.0) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("price book should update while the stream is full");

    timeout(Duration::from_secs(1), session.subscribe(["B"]))
        .await
        .expect("subscribe should not wait on the consumer")
        .unwrap();
    let (_, symbols) = sim.next_subscription(WAIT).await.unwrap();
    assert_eq!(symbols, vec!["A".to_string(), "B".to_string()]);

    // Capacity 1 plus a backlog of 1: the middle batch gave way to the newest.
    assert_eq!(next_batch(&mut stream).await.quotes[0].bid_price, 1.0);
    assert_eq!(next_batch(&mut stream).await.quotes[0].bid_price, 3.0);
    assert!(
        timeout(Duration::from_millis(200), stream.recv())
            .await
            .is_err()
    );

    session.stop().await;
}

//! Reconnect Recovery Integration Tests
//!
//! Forces connection loss on the simulated feed and checks that the
//! session reconnects, re-announces the full subscription set and keeps
//! the price book flowing.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::float_cmp)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::time::timeout;

use quote_stream::{
    Connector, Credentials, ErrorKind, FeedConnection, HeartbeatConfig, LifecycleState,
    PriceBook, PriceSimulator, Quote, QuoteBatch, QuoteSession, QuoteStream, ReconnectConfig,
    SessionEvent, SessionOptions, StreamConnector, StreamEndpoint, TransportError,
};

const WAIT: Duration = Duration::from_secs(5);
const RETRY_DELAY: Duration = Duration::from_millis(100);

fn stream_connector(sim: &PriceSimulator) -> StreamConnector {
    let endpoint = StreamEndpoint::new(sim.ws_url(), sim.http_url(), "v2");
    let credentials = Credentials::new("test-key", "test-secret").unwrap();
    StreamConnector::new(endpoint, credentials)
        .with_connect_timeout(Duration::from_secs(2))
        .with_auth_timeout(Duration::from_secs(2))
}

/// Connects immediately the first time and after `delay` every time after.
struct DelayedReconnect {
    inner: StreamConnector,
    delay: Duration,
    calls: AtomicU32,
}

#[async_trait]
impl Connector for DelayedReconnect {
    async fn connect(&self) -> Result<FeedConnection, TransportError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) > 0 {
            tokio::time::sleep(self.delay).await;
        }
        self.inner.connect().await
    }
}

fn session_options(reconnect: ReconnectConfig) -> SessionOptions {
    SessionOptions::default()
        .with_reconnect(reconnect)
        .with_heartbeat(None)
        .with_ack_timeout(Duration::from_secs(2))
}

async fn start_with(
    connector: Arc<dyn Connector>,
    symbols: &[&str],
    options: SessionOptions,
) -> (QuoteSession, QuoteStream, Arc<PriceBook>) {
    let book = PriceBook::shared();
    let (session, stream) = QuoteSession::start(
        connector,
        Arc::clone(&book),
        symbols.iter().copied(),
        options,
    )
    .await
    .expect("session should start");
    (session, stream, book)
}

async fn start_session(
    sim: &PriceSimulator,
    symbols: &[&str],
    reconnect: ReconnectConfig,
) -> (QuoteSession, QuoteStream, Arc<PriceBook>) {
    start_with(
        Arc::new(stream_connector(sim)),
        symbols,
        session_options(reconnect),
    )
    .await
}

async fn next_batch(stream: &mut QuoteStream) -> QuoteBatch {
    timeout(WAIT, stream.recv())
        .await
        .expect("timeout waiting for batch")
        .expect("quote stream ended")
}

/// Wait for the first event matching `pred`, skipping the rest.
async fn wait_for_event<F>(events: &mut broadcast::Receiver<SessionEvent>, pred: F) -> SessionEvent
where
    F: Fn(&SessionEvent) -> bool,
{
    timeout(WAIT, async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timeout waiting for session event")
}

fn is_resubscribed(event: &SessionEvent) -> bool {
    matches!(event, SessionEvent::Resubscribed { .. })
}

#[tokio::test]
async fn price_book_follows_quotes_across_forced_disconnect() {
    let sim = PriceSimulator::start().await.unwrap();
    let (session, mut stream, book) =
        start_session(&sim, &["ACA"], ReconnectConfig::fixed(RETRY_DELAY)).await;
    let mut events = session.events();

    sim.publish(&[Quote::new("ACA", 75.46, 65.00)]).unwrap();
    next_batch(&mut stream).await;
    let quote = book.get("ACA").unwrap();
    assert_eq!((quote.bid_price, quote.ask_price), (75.46, 65.00));

    sim.publish(&[Quote::new("ACA", 85.46, 95.00)]).unwrap();
    next_batch(&mut stream).await;
    let quote = book.get("ACA").unwrap();
    assert_eq!((quote.bid_price, quote.ask_price), (85.46, 95.00));

    assert_eq!(sim.disconnect(), 1);
    let event = wait_for_event(&mut events, is_resubscribed).await;
    let SessionEvent::Resubscribed { symbols, .. } = event else {
        unreachable!()
    };
    assert_eq!(symbols, vec!["ACA".to_string()]);

    // Nothing published while disconnected; the book keeps the last quote.
    let quote = book.get("ACA").unwrap();
    assert_eq!((quote.bid_price, quote.ask_price), (85.46, 95.00));

    sim.publish(&[Quote::new("ACA", 1175.46, 6435.00)]).unwrap();
    let batch = next_batch(&mut stream).await;
    let quote = book.get("ACA").unwrap();
    assert_eq!((quote.bid_price, quote.ask_price), (1175.46, 6435.00));
    assert_eq!(sim.connections_accepted(), 2);
    assert_ne!(batch.connection_id, 1);

    session.stop().await;
}

#[tokio::test]
async fn reconnect_announces_cumulative_set() {
    let sim = PriceSimulator::start().await.unwrap();
    let (session, _stream, _book) =
        start_session(&sim, &["A"], ReconnectConfig::fixed(RETRY_DELAY)).await;

    let (first_conn, initial) = sim.next_subscription(WAIT).await.unwrap();
    assert_eq!(initial, vec!["A".to_string()]);

    session.subscribe(["B"]).await.unwrap();
    let (same_conn, grown) = sim.next_subscription(WAIT).await.unwrap();
    assert_eq!(same_conn, first_conn);
    assert_eq!(grown, vec!["A".to_string(), "B".to_string()]);

    sim.disconnect();
    let (next_conn, resent) = sim.next_subscription(WAIT).await.unwrap();
    assert_ne!(next_conn, first_conn);
    assert_eq!(resent, vec!["A".to_string(), "B".to_string()]);

    session.stop().await;
}

#[tokio::test]
async fn undecodable_frame_triggers_reconnect() {
    let sim = PriceSimulator::start().await.unwrap();
    let (session, mut stream, book) =
        start_session(&sim, &["ACA"], ReconnectConfig::fixed(RETRY_DELAY)).await;
    let mut events = session.events();

    sim.publish_raw("this is not json");

    let lost = wait_for_event(&mut events, |e| {
        matches!(e, SessionEvent::Disconnected { .. })
    })
    .await;
    let SessionEvent::Disconnected { kind, .. } = lost else {
        unreachable!()
    };
    assert_eq!(kind, ErrorKind::DecodeFailed);

    wait_for_event(&mut events, is_resubscribed).await;
    sim.publish(&[Quote::new("ACA", 2.0, 2.5)]).unwrap();
    next_batch(&mut stream).await;
    assert_eq!(book.get("ACA").unwrap().bid_price, 2.0);

    session.stop().await;
}

#[tokio::test]
async fn backoff_retries_until_feed_accepts_again() {
    let sim = PriceSimulator::start().await.unwrap();
    let (session, mut stream, book) =
        start_session(&sim, &["ACA"], ReconnectConfig::fixed(RETRY_DELAY)).await;
    let mut events = session.events();

    sim.set_accepting(false);
    sim.disconnect();

    for expected in 1..=2 {
        let event = wait_for_event(&mut events, |e| {
            matches!(e, SessionEvent::ReconnectFailed { .. })
        })
        .await;
        let SessionEvent::ReconnectFailed {
            attempt,
            kind,
            retry_in,
        } = event
        else {
            unreachable!()
        };
        assert_eq!(attempt, expected);
        assert_eq!(kind, ErrorKind::ConnectFailed);
        assert_eq!(retry_in, RETRY_DELAY);
    }
    assert_eq!(sim.connections_accepted(), 1);

    sim.set_accepting(true);
    wait_for_event(&mut events, is_resubscribed).await;
    let mut states = session.state_changes();
    timeout(WAIT, states.wait_for(|s| *s == LifecycleState::Streaming))
        .await
        .expect("session should resume streaming")
        .unwrap();

    sim.publish(&[Quote::new("ACA", 3.0, 3.5)]).unwrap();
    next_batch(&mut stream).await;
    assert_eq!(book.get("ACA").unwrap().ask_price, 3.5);

    session.stop().await;
}

#[tokio::test]
async fn subscribe_during_backoff_is_deferred_to_reconnect() {
    let sim = PriceSimulator::start().await.unwrap();
    let (session, _stream, _book) =
        start_session(&sim, &["A"], ReconnectConfig::fixed(RETRY_DELAY)).await;
    let mut events = session.events();
    sim.next_subscription(WAIT).await.unwrap();

    sim.set_accepting(false);
    sim.disconnect();
    wait_for_event(&mut events, |e| {
        matches!(e, SessionEvent::ReconnectFailed { .. })
    })
    .await;

    timeout(WAIT, session.subscribe(["B"]))
        .await
        .expect("deferred subscribe should return promptly")
        .unwrap();
    assert_eq!(session.symbols(), vec!["A".to_string(), "B".to_string()]);

    sim.set_accepting(true);
    let (_, resent) = sim.next_subscription(WAIT).await.unwrap();
    assert_eq!(resent, vec!["A".to_string(), "B".to_string()]);

    session.stop().await;
}

#[tokio::test]
async fn stop_during_backoff_is_bounded() {
    let sim = PriceSimulator::start().await.unwrap();
    let (session, mut stream, _book) =
        start_session(&sim, &["ACA"], ReconnectConfig::fixed(Duration::from_secs(60))).await;
    let mut events = session.events();

    sim.set_accepting(false);
    sim.disconnect();
    wait_for_event(&mut events, |e| {
        matches!(e, SessionEvent::ReconnectFailed { .. })
    })
    .await;

    timeout(Duration::from_secs(2), session.stop())
        .await
        .expect("stop should not wait out the backoff");
    assert_eq!(session.state(), LifecycleState::Stopped);
    assert!(timeout(WAIT, stream.recv()).await.unwrap().is_none());
}

#[tokio::test]
async fn exhausted_attempts_stop_the_session() {
    let sim = PriceSimulator::start().await.unwrap();
    let (session, mut stream, _book) = start_session(
        &sim,
        &["ACA"],
        ReconnectConfig::fixed(Duration::from_millis(20)).with_max_attempts(2),
    )
    .await;

    sim.set_accepting(false);
    sim.disconnect();

    let mut states = session.state_changes();
    timeout(WAIT, states.wait_for(|s| *s == LifecycleState::Stopped))
        .await
        .expect("session should give up")
        .unwrap();
    assert!(timeout(WAIT, stream.recv()).await.unwrap().is_none());

    let err = session.subscribe(["MSFT"]).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Stopped);
    session.stop().await;
}

#[tokio::test]
async fn subscribe_during_slow_reconnect_attempt_returns_promptly() {
    let sim = PriceSimulator::start().await.unwrap();
    let connector = Arc::new(DelayedReconnect {
        inner: stream_connector(&sim),
        delay: Duration::from_secs(1),
        calls: AtomicU32::new(0),
    });
    let (session, _stream, _book) =
        start_with(connector, &["A"], session_options(ReconnectConfig::fixed(RETRY_DELAY))).await;
    let mut events = session.events();
    sim.next_subscription(WAIT).await.unwrap();

    sim.disconnect();
    wait_for_event(&mut events, |e| {
        matches!(e, SessionEvent::Reconnecting { .. })
    })
    .await;

    timeout(Duration::from_millis(500), session.subscribe(["B"]))
        .await
        .expect("subscribe should not wait for the reconnect attempt")
        .unwrap();
    assert_eq!(session.symbols(), vec!["A".to_string(), "B".to_string()]);

    let (_, resent) = sim.next_subscription(WAIT).await.unwrap();
    assert_eq!(resent, vec!["A".to_string(), "B".to_string()]);

    session.stop().await;
}

#[tokio::test]
async fn silent_feed_expires_heartbeat_and_reconnects() {
    let sim = PriceSimulator::start().await.unwrap();
    let options = session_options(ReconnectConfig::fixed(RETRY_DELAY)).with_heartbeat(
        HeartbeatConfig::enabled(Duration::from_millis(100), Duration::from_millis(400)),
    );
    let (session, mut stream, book) =
        start_with(Arc::new(stream_connector(&sim)), &["ACA"], options).await;
    let mut events = session.events();

    assert_eq!(sim.stall(), 1);

    let lost = wait_for_event(&mut events, |e| {
        matches!(e, SessionEvent::Disconnected { .. })
    })
    .await;
    let SessionEvent::Disconnected { kind, reason, .. } = lost else {
        unreachable!()
    };
    assert_eq!(kind, ErrorKind::ReadFailed);
    assert!(reason.contains("heartbeat"), "unexpected reason: {reason}");

    let event = wait_for_event(&mut events, is_resubscribed).await;
    let SessionEvent::Resubscribed { symbols, .. } = event else {
        unreachable!()
    };
    assert_eq!(symbols, vec!["ACA".to_string()]);
    assert_eq!(sim.connections_accepted(), 2);

    sim.publish(&[Quote::new("ACA", 4.0, 4.5)]).unwrap();
    next_batch(&mut stream).await;
    assert_eq!(book.get("ACA").unwrap().bid_price, 4.0);

    session.stop().await;
}

//! Quote Session
//!
//! Owns one logical subscription to the quote feed across any number of
//! physical connections.
//!
//! # Lifecycle
//!
//! ```text
//! Idle -> Connecting -> Subscribing -> Streaming
//!                                         |  read/decode failure
//!                                         v
//!          Streaming <- Subscribing <- Reconnecting <- Disconnected
//!
//! any state --stop()--> Stopped
//! ```
//!
//! # Concurrency
//!
//! A single task owns the connection, the subscription set and the output
//! sender. [`QuoteSession`] is a handle that enqueues commands to it, so
//! frames written to a connection are serialized by ownership. The task
//! selects over the stop signal, commands, the next frame, the heartbeat
//! and room in the caller's stream. Every wait it performs, including
//! reconnect attempts and backoff, also observes the stop signal and keeps
//! serving commands.
//!
//! The price book is written as soon as a batch is read. Batches the
//! caller has no room for wait in a backlog bounded by the output capacity;
//! when it overflows the oldest waiting batch is dropped.
//!
//! Failures while streaming never reach the caller as errors. They close
//! the connection and go through reconnect, which retries until it
//! succeeds or the session is stopped. Callers only see a gap in data.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::stream::Stream;
use parking_lot::Mutex;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use super::codec::JsonCodec;
use super::connector::{FeedConnection, Frame};
use super::error::{ErrorKind, SessionError};
use super::heartbeat::{HeartbeatAction, HeartbeatConfig, HeartbeatMonitor, next_tick};
use super::messages::{FeedMessage, SubscriptionRequest};
use super::reconnect::{ReconnectConfig, ReconnectPolicy};
use crate::application::ports::Connector;
use crate::domain::price_book::SharedPriceBook;
use crate::domain::streaming::{Quote, QuoteBatch};
use crate::domain::subscription::{SubscriptionSet, Symbol};
use crate::infrastructure::metrics;

/// Default time to wait for the subscription acknowledgment.
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(10);

/// Default capacity of the caller's batch stream.
pub const DEFAULT_OUTPUT_CAPACITY: usize = 1024;

const COMMAND_CAPACITY: usize = 64;
const EVENT_CAPACITY: usize = 256;

// =============================================================================
// Public Types
// =============================================================================

/// Session tuning.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Delay schedule between failed reconnect attempts.
    pub reconnect: ReconnectConfig,
    /// Liveness monitoring; `None` disables it.
    pub heartbeat: Option<HeartbeatConfig>,
    /// Time to wait for the ack after sending a subscription.
    pub ack_timeout: Duration,
    /// Capacity of the caller's batch stream. Up to as many more batches
    /// wait in a backlog before the oldest is dropped.
    pub output_capacity: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            reconnect: ReconnectConfig::default(),
            heartbeat: Some(HeartbeatConfig::default()),
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            output_capacity: DEFAULT_OUTPUT_CAPACITY,
        }
    }
}

impl SessionOptions {
    /// Set the reconnect schedule.
    #[must_use]
    pub const fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Set or disable heartbeat monitoring.
    #[must_use]
    pub const fn with_heartbeat(mut self, heartbeat: Option<HeartbeatConfig>) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    /// Set the subscription ack timeout.
    #[must_use]
    pub const fn with_ack_timeout(mut self, ack_timeout: Duration) -> Self {
        self.ack_timeout = ack_timeout;
        self
    }

    /// Set the output stream capacity.
    #[must_use]
    pub const fn with_output_capacity(mut self, output_capacity: usize) -> Self {
        self.output_capacity = output_capacity;
        self
    }
}

/// Where the session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LifecycleState {
    /// Created, nothing attempted yet.
    #[default]
    Idle,
    /// Dialing and authenticating the first connection.
    Connecting,
    /// Announcing the subscription set on a fresh connection.
    Subscribing,
    /// Receiving quotes.
    Streaming,
    /// The connection was lost.
    Disconnected,
    /// Dialing a replacement connection.
    Reconnecting,
    /// Stopped; terminal.
    Stopped,
}

impl LifecycleState {
    /// State name for logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Subscribing => "subscribing",
            Self::Streaming => "streaming",
            Self::Disconnected => "disconnected",
            Self::Reconnecting => "reconnecting",
            Self::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observable session events.
///
/// Receivers see events sent after they subscribe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A connection is authenticated and subscribed.
    Connected {
        /// Physical connection id.
        connection_id: u64,
    },
    /// The active connection was lost.
    Disconnected {
        /// Physical connection id.
        connection_id: u64,
        /// Failure classification.
        kind: ErrorKind,
        /// Failure description.
        reason: String,
    },
    /// A reconnect attempt is starting.
    Reconnecting {
        /// Attempt number since the loss, starting at 1.
        attempt: u32,
    },
    /// A reconnect attempt failed.
    ReconnectFailed {
        /// Attempt number since the loss.
        attempt: u32,
        /// Failure classification.
        kind: ErrorKind,
        /// Time until the next attempt.
        retry_in: Duration,
    },
    /// A replacement connection carries the full subscription set.
    Resubscribed {
        /// Physical connection id.
        connection_id: u64,
        /// Symbols announced.
        symbols: Vec<Symbol>,
    },
    /// The feed confirmed a subscription.
    SubscriptionConfirmed {
        /// Symbols the feed reports as subscribed.
        symbols: Vec<Symbol>,
    },
    /// The feed sent an error message on a live connection.
    FeedError {
        /// Error code.
        code: i32,
        /// Error message.
        message: String,
    },
    /// The session stopped.
    Stopped,
}

/// Batches of quotes in arrival order; ends when the session stops.
#[derive(Debug)]
pub struct QuoteStream {
    rx: mpsc::Receiver<QuoteBatch>,
}

impl QuoteStream {
    /// Receive the next batch, or `None` once the session has stopped.
    pub async fn recv(&mut self) -> Option<QuoteBatch> {
        self.rx.recv().await
    }
}

impl Stream for QuoteStream {
    type Item = QuoteBatch;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

enum Command {
    Subscribe {
        symbols: Vec<Symbol>,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
}

// =============================================================================
// Session Handle
// =============================================================================

/// Handle to a running quote session.
///
/// Dropping the handle stops the session.
pub struct QuoteSession {
    id: Uuid,
    commands: mpsc::Sender<Command>,
    cancel: CancellationToken,
    state: watch::Receiver<LifecycleState>,
    symbols: watch::Receiver<Vec<Symbol>>,
    events: broadcast::Sender<SessionEvent>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for QuoteSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuoteSession")
            .field("id", &self.id)
            .field("state", &*self.state.borrow())
            .finish_non_exhaustive()
    }
}

impl QuoteSession {
    /// Connect, authenticate, subscribe to `symbols` and start streaming.
    ///
    /// The initial connection is not retried: any failure here is returned
    /// and no background task is left running. An empty symbol set skips
    /// the subscription step.
    ///
    /// # Errors
    ///
    /// - `ConnectFailed` / `AuthFailed` kinds if the connector fails
    /// - [`SessionError::SubscribeFailed`] if the subscription frame cannot
    ///   be sent or is not acknowledged within the ack timeout
    pub async fn start<I, S>(
        connector: Arc<dyn Connector>,
        price_book: SharedPriceBook,
        symbols: I,
        options: SessionOptions,
    ) -> Result<(Self, QuoteStream), SessionError>
    where
        I: IntoIterator<Item = S>,
        S: Into<Symbol>,
    {
        let id = Uuid::new_v4();
        let span = tracing::info_span!("quote_session", session_id = %id);
        let subscriptions: SubscriptionSet = symbols.into_iter().collect();
        let codec = JsonCodec::new();

        let (state_tx, state_rx) = watch::channel(LifecycleState::Idle);
        let (symbols_tx, symbols_rx) = watch::channel(subscriptions.to_vec());
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);

        state_tx.send_replace(LifecycleState::Connecting);
        let mut conn = match connector.connect().instrument(span.clone()).await {
            Ok(conn) => conn,
            Err(e) => {
                tracing::error!(parent: &span, error = %e, kind = %e.kind(), "Initial connect failed");
                state_tx.send_replace(LifecycleState::Stopped);
                return Err(e.into());
            }
        };

        state_tx.send_replace(LifecycleState::Subscribing);
        let ack = match subscribe_and_ack(&mut conn, &subscriptions, options.ack_timeout, &codec)
            .instrument(span.clone())
            .await
        {
            Ok(ack) => ack,
            Err(e) => {
                tracing::error!(parent: &span, error = %e, "Initial subscribe failed");
                conn.close().await;
                state_tx.send_replace(LifecycleState::Stopped);
                return Err(e);
            }
        };

        tracing::info!(
            parent: &span,
            connection_id = conn.id(),
            symbols = ?subscriptions.symbols(),
            "Session started"
        );
        metrics::set_connected(true);
        #[allow(clippy::cast_precision_loss)]
        metrics::set_subscribed_symbols(subscriptions.len() as f64);

        let (command_tx, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        let backlog_limit = options.output_capacity.max(1);
        let (output_tx, output_rx) = mpsc::channel(backlog_limit);
        let cancel = CancellationToken::new();

        let actor = SessionActor {
            connector,
            price_book,
            subscriptions,
            policy: ReconnectPolicy::new(options.reconnect.clone()),
            options,
            codec,
            commands: command_rx,
            output: output_tx,
            output_closed: false,
            backlog: VecDeque::new(),
            backlog_limit,
            cancel: cancel.clone(),
            state: state_tx,
            symbols: symbols_tx,
            events: events_tx.clone(),
        };
        let task = tokio::spawn(actor.run(conn, ack).instrument(span));

        let session = Self {
            id,
            commands: command_tx,
            cancel,
            state: state_rx,
            symbols: symbols_rx,
            events: events_tx,
            task: Mutex::new(Some(task)),
        };
        Ok((session, QuoteStream { rx: output_rx }))
    }

    /// Add symbols and re-announce the full set on the live connection.
    ///
    /// Duplicates are ignored. While the session is reconnecting the symbols
    /// are recorded and announced once a connection is back, and the call
    /// returns `Ok`.
    ///
    /// # Errors
    ///
    /// - [`SessionError::SubscribeFailed`] if the frame cannot be written;
    ///   the symbols stay tracked and the connection is left to the
    ///   receive loop
    /// - [`SessionError::Stopped`] after [`Self::stop`]
    pub async fn subscribe<I, S>(&self, symbols: I) -> Result<(), SessionError>
    where
        I: IntoIterator<Item = S>,
        S: Into<Symbol>,
    {
        if self.cancel.is_cancelled() {
            return Err(SessionError::Stopped);
        }

        let (reply, response) = oneshot::channel();
        let command = Command::Subscribe {
            symbols: symbols.into_iter().map(Into::into).collect(),
            reply,
        };
        self.commands
            .send(command)
            .await
            .map_err(|_| SessionError::Stopped)?;
        response.await.map_err(|_| SessionError::Stopped)?
    }

    /// Stop the session and wait for its task to finish.
    ///
    /// Closes the active connection, ends the quote stream and stops all
    /// further price book writes. Idempotent.
    pub async fn stop(&self) {
        self.cancel.cancel();

        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::warn!(session_id = %self.id, error = %e, "Session task ended abnormally");
            }
        } else {
            let mut state = self.state.clone();
            let _ = state.wait_for(|s| *s == LifecycleState::Stopped).await;
        }
    }

    /// Session id, also recorded on the session's tracing span.
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    /// Watch lifecycle transitions.
    #[must_use]
    pub fn state_changes(&self) -> watch::Receiver<LifecycleState> {
        self.state.clone()
    }

    /// The cumulative subscription set.
    #[must_use]
    pub fn symbols(&self) -> Vec<Symbol> {
        self.symbols.borrow().clone()
    }

    /// Subscribe to session events.
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Whether [`Self::stop`] has been called or the handle is shutting down.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for QuoteSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// =============================================================================
// Session Task
// =============================================================================

/// Outcome of announcing the subscription set on a fresh connection.
#[derive(Debug, Default)]
struct Ack {
    quotes: Vec<Quote>,
    confirmed: Option<Vec<Symbol>>,
}

enum Step {
    Stop,
    Command(Command),
    Frame(Result<Frame, super::connector::TransportError>),
    Heartbeat(HeartbeatAction),
}

enum StreamEnd {
    Stopped,
    Lost(SessionError),
}

struct SessionActor {
    connector: Arc<dyn Connector>,
    price_book: SharedPriceBook,
    subscriptions: SubscriptionSet,
    options: SessionOptions,
    policy: ReconnectPolicy,
    codec: JsonCodec,
    commands: mpsc::Receiver<Command>,
    output: mpsc::Sender<QuoteBatch>,
    output_closed: bool,
    backlog: VecDeque<QuoteBatch>,
    backlog_limit: usize,
    cancel: CancellationToken,
    state: watch::Sender<LifecycleState>,
    symbols: watch::Sender<Vec<Symbol>>,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionActor {
    async fn run(mut self, conn: FeedConnection, ack: Ack) {
        let mut conn = conn;
        self.on_connected(conn.id(), ack);

        loop {
            match self.stream(&mut conn).await {
                StreamEnd::Stopped => {
                    conn.close().await;
                    break;
                }
                StreamEnd::Lost(err) => {
                    let connection_id = conn.id();
                    self.on_lost(connection_id, &err);
                    conn.close().await;

                    match self.reconnect().await {
                        Some(next) => conn = next,
                        None => break,
                    }
                }
            }
        }

        self.finish();
    }

    /// Receive loop for one physical connection.
    async fn stream(&mut self, conn: &mut FeedConnection) -> StreamEnd {
        self.set_state(LifecycleState::Streaming);
        let mut heartbeat = self.options.heartbeat.map(HeartbeatMonitor::new);

        loop {
            let step = tokio::select! {
                biased;
                () = self.cancel.cancelled() => Step::Stop,
                command = self.commands.recv() => command.map_or(Step::Stop, Step::Command),
                ready = output_ready(&self.output), if !self.backlog.is_empty() => {
                    self.flush_backlog(ready);
                    continue;
                }
                frame = conn.read_frame() => Step::Frame(frame),
                action = next_tick(&mut heartbeat) => Step::Heartbeat(action),
            };

            match step {
                Step::Stop => return StreamEnd::Stopped,
                Step::Command(Command::Subscribe { symbols, reply }) => {
                    let result = self.handle_subscribe(Some(&mut *conn), symbols).await;
                    let _ = reply.send(result);
                }
                Step::Frame(Ok(frame)) => {
                    if let Some(monitor) = heartbeat.as_mut() {
                        monitor.record_activity(tokio::time::Instant::now());
                    }
                    if frame == Frame::Keepalive {
                        continue;
                    }
                    match frame.decode(&self.codec) {
                        Ok(messages) => self.process(conn.id(), messages),
                        Err(e) => {
                            metrics::record_decode_failure();
                            return StreamEnd::Lost(SessionError::DecodeFailed(e));
                        }
                    }
                }
                Step::Frame(Err(e)) => {
                    return StreamEnd::Lost(SessionError::ReadFailed(e.to_string()));
                }
                Step::Heartbeat(HeartbeatAction::Ping) => {
                    if let Err(e) = conn.ping().await {
                        return StreamEnd::Lost(SessionError::ReadFailed(e.to_string()));
                    }
                }
                Step::Heartbeat(HeartbeatAction::Expired { silent_for }) => {
                    return StreamEnd::Lost(SessionError::ReadFailed(format!(
                        "heartbeat timeout: no frames for {silent_for:?}"
                    )));
                }
            }
        }
    }

    fn process(&mut self, connection_id: u64, messages: Vec<FeedMessage>) {
        let mut quotes = Vec::new();

        for message in messages {
            match message {
                FeedMessage::Quote(quote) => quotes.push(quote),
                FeedMessage::Subscription(sub) => {
                    tracing::debug!(connection_id, symbols = ?sub.quotes, "Subscription confirmed");
                    self.emit(SessionEvent::SubscriptionConfirmed {
                        symbols: sub.quotes,
                    });
                }
                FeedMessage::Error(err) => {
                    tracing::warn!(connection_id, code = err.code, message = %err.msg, "Feed error");
                    self.emit(SessionEvent::FeedError {
                        code: err.code,
                        message: err.msg,
                    });
                }
                FeedMessage::Success(success) => {
                    tracing::debug!(connection_id, msg = %success.msg, "Feed status");
                }
                FeedMessage::Ignored(msg_type) => {
                    tracing::trace!(connection_id, msg_type = %msg_type, "Ignoring message");
                }
            }
        }

        if !quotes.is_empty() {
            metrics::record_quotes_received(quotes.len() as u64);
            self.deliver(QuoteBatch::new(connection_id, quotes));
        }
    }

    /// Write a batch to the price book and hand it to the caller's stream.
    ///
    /// Never waits on the consumer: a full stream parks the batch in the
    /// backlog, which `flush_backlog` drains as room appears.
    fn deliver(&mut self, batch: QuoteBatch) {
        if batch.is_empty() || self.cancel.is_cancelled() {
            return;
        }

        self.price_book.update(&batch.quotes);

        if self.output_closed {
            return;
        }

        if self.backlog.is_empty() {
            match self.output.try_send(batch) {
                Ok(()) => {
                    metrics::record_batch_delivered();
                    return;
                }
                Err(TrySendError::Closed(_)) => {
                    self.close_output();
                    return;
                }
                Err(TrySendError::Full(batch)) => self.backlog.push_back(batch),
            }
        } else {
            self.backlog.push_back(batch);
        }

        if self.backlog.len() > self.backlog_limit {
            self.backlog.pop_front();
            metrics::record_batch_dropped();
            tracing::warn!(
                backlog = self.backlog.len(),
                "Consumer behind; dropped oldest waiting batch"
            );
        }
    }

    /// Move waiting batches into the caller's stream while it has room.
    fn flush_backlog(&mut self, ready: bool) {
        if !ready {
            self.close_output();
            return;
        }

        while let Some(batch) = self.backlog.pop_front() {
            match self.output.try_send(batch) {
                Ok(()) => metrics::record_batch_delivered(),
                Err(TrySendError::Full(batch)) => {
                    self.backlog.push_front(batch);
                    return;
                }
                Err(TrySendError::Closed(_)) => {
                    self.close_output();
                    return;
                }
            }
        }
    }

    fn close_output(&mut self) {
        if !self.output_closed {
            tracing::info!("Quote stream dropped by consumer; price book still updating");
        }
        self.output_closed = true;
        self.backlog.clear();
    }

    /// Serve a command while no connection can carry it.
    async fn serve_deferred(&mut self, command: Command) {
        match command {
            Command::Subscribe { symbols, reply } => {
                let result = self.handle_subscribe(None, symbols).await;
                let _ = reply.send(result);
            }
        }
    }

    async fn handle_subscribe(
        &mut self,
        conn: Option<&mut FeedConnection>,
        symbols: Vec<Symbol>,
    ) -> Result<(), SessionError> {
        let added = self.subscriptions.extend(symbols);
        if !added.is_empty() {
            self.symbols.send_replace(self.subscriptions.to_vec());
            #[allow(clippy::cast_precision_loss)]
            metrics::set_subscribed_symbols(self.subscriptions.len() as f64);
        }

        let Some(conn) = conn else {
            tracing::info!(added = ?added, "No streaming connection; subscription deferred");
            return Ok(());
        };

        self.announce(conn).await?;
        tracing::info!(
            connection_id = conn.id(),
            added = ?added,
            total = self.subscriptions.len(),
            "Subscription updated"
        );
        Ok(())
    }

    /// Send the full subscription set without waiting for an ack.
    async fn announce(&self, conn: &mut FeedConnection) -> Result<(), SessionError> {
        let request = SubscriptionRequest::subscribe(self.subscriptions.to_vec());
        let text = self
            .codec
            .encode(&request)
            .map_err(|e| SessionError::SubscribeFailed(e.to_string()))?;

        conn.send_text(text).await.map_err(|e| {
            tracing::warn!(connection_id = conn.id(), error = %e, "Subscription send failed");
            SessionError::SubscribeFailed(e.to_string())
        })
    }

    fn on_lost(&mut self, connection_id: u64, err: &SessionError) {
        let kind = err.kind();
        tracing::warn!(connection_id, kind = %kind, error = %err, "Connection lost");
        metrics::record_connection_loss(kind);
        metrics::set_connected(false);
        self.set_state(LifecycleState::Disconnected);
        self.emit(SessionEvent::Disconnected {
            connection_id,
            kind,
            reason: err.to_string(),
        });
    }

    fn on_connected(&mut self, connection_id: u64, ack: Ack) {
        self.emit(SessionEvent::Connected { connection_id });
        if let Some(symbols) = ack.confirmed {
            self.emit(SessionEvent::SubscriptionConfirmed { symbols });
        }
        if !ack.quotes.is_empty() {
            metrics::record_quotes_received(ack.quotes.len() as u64);
            self.deliver(QuoteBatch::new(connection_id, ack.quotes));
        }
    }

    /// Reconnect until it succeeds, the session stops, or attempts run out.
    ///
    /// The first attempt is immediate; the policy's delay applies between
    /// failed attempts.
    async fn reconnect(&mut self) -> Option<FeedConnection> {
        let mut attempt: u32 = 0;

        loop {
            if self.cancel.is_cancelled() {
                return None;
            }

            attempt += 1;
            self.set_state(LifecycleState::Reconnecting);
            self.emit(SessionEvent::Reconnecting { attempt });
            metrics::record_reconnect_attempt();
            tracing::info!(attempt, "Reconnecting");

            match self.try_reconnect().await {
                Ok((conn, ack)) => {
                    self.policy.reset();
                    metrics::record_reconnected();
                    metrics::set_connected(true);
                    tracing::info!(
                        connection_id = conn.id(),
                        attempt,
                        symbols = ?self.subscriptions.symbols(),
                        "Reconnected and resubscribed"
                    );
                    self.emit(SessionEvent::Resubscribed {
                        connection_id: conn.id(),
                        symbols: self.subscriptions.to_vec(),
                    });
                    self.on_connected(conn.id(), ack);
                    return Some(conn);
                }
                Err(_) if self.cancel.is_cancelled() => return None,
                Err(e) => {
                    let Some(delay) = self.policy.next_delay() else {
                        tracing::error!(attempt, error = %e, "Reconnect attempts exhausted");
                        return None;
                    };
                    tracing::warn!(
                        attempt,
                        kind = %e.kind(),
                        error = %e,
                        retry_in_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "Reconnect failed"
                    );
                    self.emit(SessionEvent::ReconnectFailed {
                        attempt,
                        kind: e.kind(),
                        retry_in: delay,
                    });
                    if !self.backoff(delay).await {
                        return None;
                    }
                }
            }
        }
    }

    /// One connect, auth and resubscribe attempt.
    ///
    /// Commands arriving meanwhile are recorded; symbols added after the
    /// set went out are announced once the ack is in.
    async fn try_reconnect(&mut self) -> Result<(FeedConnection, Ack), SessionError> {
        let connector = Arc::clone(&self.connector);
        let connect = connector.connect();
        tokio::pin!(connect);

        let mut conn = loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => return Err(SessionError::Stopped),
                result = &mut connect => break result?,
                Some(command) = self.commands.recv() => self.serve_deferred(command).await,
                ready = output_ready(&self.output), if !self.backlog.is_empty() => {
                    self.flush_backlog(ready);
                }
            }
        };

        self.set_state(LifecycleState::Subscribing);
        let announced = self.subscriptions.clone();
        let codec = self.codec;
        let ack_timeout = self.options.ack_timeout;

        let acked = {
            let ack = subscribe_and_ack(&mut conn, &announced, ack_timeout, &codec);
            tokio::pin!(ack);
            loop {
                tokio::select! {
                    biased;
                    () = self.cancel.cancelled() => break Err(SessionError::Stopped),
                    result = &mut ack => break result,
                    Some(command) = self.commands.recv() => self.serve_deferred(command).await,
                    ready = output_ready(&self.output), if !self.backlog.is_empty() => {
                        self.flush_backlog(ready);
                    }
                }
            }
        };

        let acked = match acked {
            Ok(ack) if self.subscriptions.len() > announced.len() => {
                self.announce(&mut conn).await.map(|()| ack)
            }
            other => other,
        };

        match acked {
            Ok(ack) => Ok((conn, ack)),
            Err(e) => {
                conn.close().await;
                Err(e)
            }
        }
    }

    /// Sleep for `delay`, serving commands meanwhile.
    ///
    /// Returns `false` if the session stopped during the wait.
    async fn backoff(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => return false,
                () = &mut sleep => return true,
                command = self.commands.recv() => match command {
                    Some(command) => self.serve_deferred(command).await,
                    None => return false,
                },
                ready = output_ready(&self.output), if !self.backlog.is_empty() => {
                    self.flush_backlog(ready);
                }
            }
        }
    }

    fn finish(&mut self) {
        self.commands.close();
        metrics::set_connected(false);
        self.set_state(LifecycleState::Stopped);
        self.emit(SessionEvent::Stopped);
        tracing::info!("Session stopped");
    }

    fn set_state(&self, state: LifecycleState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::debug!(from = %previous, to = %state, "Lifecycle transition");
        }
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }
}

/// Resolves once the caller's stream has room, or `false` if it was dropped.
async fn output_ready(output: &mpsc::Sender<QuoteBatch>) -> bool {
    output.reserve().await.is_ok()
}

/// Announce the full set and consume one acknowledgment frame.
///
/// An empty set sends nothing. An undecodable ack still counts as an ack;
/// an error message in it does not.
async fn subscribe_and_ack(
    conn: &mut FeedConnection,
    subscriptions: &SubscriptionSet,
    ack_timeout: Duration,
    codec: &JsonCodec,
) -> Result<Ack, SessionError> {
    if subscriptions.is_empty() {
        tracing::debug!(connection_id = conn.id(), "No symbols; skipping subscribe");
        return Ok(Ack::default());
    }

    let request = SubscriptionRequest::subscribe(subscriptions.to_vec());
    let text = codec
        .encode(&request)
        .map_err(|e| SessionError::SubscribeFailed(e.to_string()))?;
    conn.send_text(text)
        .await
        .map_err(|e| SessionError::SubscribeFailed(e.to_string()))?;

    let frame = tokio::time::timeout(ack_timeout, async {
        loop {
            match conn.read_frame().await {
                Ok(Frame::Keepalive) => {}
                other => return other,
            }
        }
    })
    .await
    .map_err(|_| {
        SessionError::SubscribeFailed(format!("no subscription ack within {ack_timeout:?}"))
    })?
    .map_err(|e| SessionError::SubscribeFailed(format!("reading subscription ack: {e}")))?;

    let messages = match frame.decode(codec) {
        Ok(messages) => messages,
        Err(e) => {
            tracing::debug!(connection_id = conn.id(), error = %e, "Undecodable ack accepted");
            return Ok(Ack::default());
        }
    };

    let mut ack = Ack::default();
    for message in messages {
        match message {
            FeedMessage::Quote(quote) => ack.quotes.push(quote),
            FeedMessage::Subscription(sub) => ack.confirmed = Some(sub.quotes),
            FeedMessage::Error(err) => {
                return Err(SessionError::SubscribeFailed(format!(
                    "feed rejected subscription ({}): {}",
                    err.code, err.msg
                )));
            }
            FeedMessage::Success(_) | FeedMessage::Ignored(_) => {}
        }
    }

    tracing::debug!(
        connection_id = conn.id(),
        symbols = subscriptions.len(),
        "Subscription acknowledged"
    );
    Ok(ack)
}

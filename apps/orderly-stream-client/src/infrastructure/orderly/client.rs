//! Orderly Stream Client
//!
//! Topic router over one [`ReconnectingConnection`]. A `StreamClient` is a
//! cheap, cloneable handle; the socket itself is owned by a single driver
//! task started with [`StreamClient::start`].
//!
//! # Lifecycle
//!
//! ```text
//! start() ──► connect ──► replay ──► stream ──► (lost) ──► reconnect ─┐
//!                            ▲                                        │
//!                            └────────────────────────────────────────┘
//! ```
//!
//! On every (re)connect the driver replays session state before it reads
//! any data frame:
//!
//! - **Private**: send `auth`, wait for the acknowledgement, then send one
//!   `subscribe` per subscribed topic.
//! - **Public**: send one `subscribe` per subscribed topic.
//!
//! # Acknowledgements
//!
//! The server acknowledges control frames in order. The driver keeps a FIFO
//! of waiters per event name and resolves the oldest one on each ack, so a
//! rejected `subscribe` surfaces as [`StreamError::ProtocolViolation`] at
//! the `subscribe().await` that sent it. A rejection never tears the
//! connection down; it is also broadcast as
//! [`StreamEvent::ProtocolViolation`].

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::auth::{AuthError, Credential};
use super::connection::{
    ConnectionConfig, ConnectionError, ExitHook, ReadOutcome, ReconnectingConnection, StreamEvent,
};
use super::heartbeat::{HeartbeatHandler, HeartbeatState};
use super::reconnect::ReconnectConfig;
use super::transport::WsConnector;
use crate::application::ports::Connector;
use crate::domain::connection::{Channel, ConnectionState, StateCell};
use crate::domain::frame::{InboundFrame, OutboundFrame, ProtocolViolation, orderbook_topic};
use crate::domain::topic::{DEFAULT_QUEUE_CAPACITY, DeliveryOutcome, TopicRegistry, TopicStats};
use crate::infrastructure::config::StreamSettings;
use crate::infrastructure::{metrics, telemetry};

const EVENT_CHANNEL_CAPACITY: usize = 256;

// =============================================================================
// Configuration
// =============================================================================

/// Settings for one stream client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Public or private endpoint.
    pub channel: Channel,
    /// Client id sent with every control frame.
    pub id: String,
    /// Full socket URL (endpoint + account id).
    pub url: String,
    /// Longest silence tolerated before reconnecting; also bounds the wait
    /// for control acknowledgements.
    pub read_timeout: Duration,
    /// Window `recv` waits before logging progress and waiting again.
    pub queue_timeout: Duration,
    /// Pending messages kept per topic.
    pub queue_capacity: usize,
    /// Backoff settings.
    pub reconnect: ReconnectConfig,
}

impl ClientConfig {
    /// Create a configuration with default timeouts for `channel`.
    #[must_use]
    pub fn new(channel: Channel, url: impl Into<String>) -> Self {
        Self {
            channel,
            id: channel.default_id().to_owned(),
            url: url.into(),
            read_timeout: Duration::from_secs(60),
            queue_timeout: Duration::from_secs(10),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            reconnect: ReconnectConfig::default(),
        }
    }

    /// Build the configuration for `channel` from environment settings.
    #[must_use]
    pub fn from_settings(settings: &StreamSettings, channel: Channel) -> Self {
        Self {
            channel,
            id: channel.default_id().to_owned(),
            url: settings.url_for(channel),
            read_timeout: settings.read_timeout,
            queue_timeout: settings.queue_timeout,
            queue_capacity: settings.queue_capacity,
            reconnect: settings.reconnect_config(),
        }
    }

    /// Override the client id.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Override the read timeout.
    #[must_use]
    pub const fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Override the queue wait window.
    #[must_use]
    pub const fn with_queue_timeout(mut self, timeout: Duration) -> Self {
        self.queue_timeout = timeout;
        self
    }

    /// Override the per-topic queue capacity.
    #[must_use]
    pub const fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Override the backoff settings.
    #[must_use]
    pub const fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Errors surfaced to stream client callers.
///
/// Transport failures never appear here; they are retried internally.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// The server rejected a control frame.
    #[error("protocol violation: {0}")]
    ProtocolViolation(ProtocolViolation),

    /// Reconnect retries ran out; the client is exiting.
    #[error("reconnect attempts exhausted after {0} retries")]
    ExhaustedRetries(u32),

    /// Credential construction failed.
    #[error("signing failure: {0}")]
    Signing(#[from] AuthError),

    /// The client is closed.
    #[error("stream client closed")]
    Closed,

    /// `start` was called twice.
    #[error("stream client already started")]
    AlreadyStarted,

    /// The execution context could not be created.
    #[error("runtime error: {0}")]
    Runtime(#[from] std::io::Error),
}

// =============================================================================
// Client Handle
// =============================================================================

type AckReply = oneshot::Sender<Result<(), ProtocolViolation>>;

/// Subscribe and unsubscribe carry the registry revision of their change.
#[derive(Debug)]
enum Command {
    Subscribe {
        topic: String,
        revision: u64,
        reply: AckReply,
    },
    Unsubscribe {
        topic: String,
        revision: u64,
        reply: AckReply,
    },
    Request {
        symbol: String,
        reply: AckReply,
    },
}

struct Startup {
    connector: Arc<dyn Connector>,
    commands: mpsc::UnboundedReceiver<Command>,
}

struct Shared {
    config: ClientConfig,
    credential: Option<Credential>,
    topics: TopicRegistry,
    state: Arc<StateCell>,
    cancel: CancellationToken,
    events: broadcast::Sender<StreamEvent>,
    commands: mpsc::UnboundedSender<Command>,
    startup: Mutex<Option<Startup>>,
    exit_hook: Arc<ExitHook>,
    heartbeat: HeartbeatHandler,
}

/// Topic-multiplexed streaming client for one Orderly endpoint.
#[derive(Clone)]
pub struct StreamClient {
    shared: Arc<Shared>,
}

impl StreamClient {
    /// Create a public client over `connector`.
    #[must_use]
    pub fn new_public(config: ClientConfig, connector: Arc<dyn Connector>) -> Self {
        Self::build(config, connector, None)
    }

    /// Create a private client over `connector`.
    ///
    /// Every (re)connect authenticates with `credential` before replaying
    /// subscriptions.
    #[must_use]
    pub fn new_private(
        config: ClientConfig,
        connector: Arc<dyn Connector>,
        credential: Credential,
    ) -> Self {
        Self::build(config, connector, Some(credential))
    }

    /// Create a public client from environment settings.
    #[must_use]
    pub fn public(settings: &StreamSettings) -> Self {
        Self::new_public(
            ClientConfig::from_settings(settings, Channel::Public),
            Arc::new(WsConnector::new()),
        )
    }

    /// Create a private client from environment settings.
    ///
    /// # Errors
    ///
    /// Returns `Signing` if the settings carry no usable key material.
    pub fn private(settings: &StreamSettings) -> Result<Self, StreamError> {
        let credential = settings.credential()?;
        Ok(Self::new_private(
            ClientConfig::from_settings(settings, Channel::Private),
            Arc::new(WsConnector::new()),
            credential,
        ))
    }

    fn build(
        config: ClientConfig,
        connector: Arc<dyn Connector>,
        credential: Option<Credential>,
    ) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let topics = TopicRegistry::new(config.queue_capacity);
        Self {
            shared: Arc::new(Shared {
                config,
                credential,
                topics,
                state: Arc::new(StateCell::new()),
                cancel: CancellationToken::new(),
                events,
                commands: commands_tx,
                startup: Mutex::new(Some(Startup {
                    connector,
                    commands: commands_rx,
                })),
                exit_hook: Arc::new(ExitHook::new()),
                heartbeat: HeartbeatHandler::new(),
            }),
        }
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    /// Get the client configuration.
    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }

    /// Get the connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.shared.state.get()
    }

    /// Subscribe to lifecycle events.
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<StreamEvent> {
        self.shared.events.subscribe()
    }

    /// Counters for every registered topic.
    #[must_use]
    pub fn topic_stats(&self) -> Vec<TopicStats> {
        self.shared.topics.stats()
    }

    /// Topics replayed on reconnect.
    #[must_use]
    pub fn subscribed_topics(&self) -> Vec<String> {
        self.shared.topics.subscribed_topics()
    }

    /// Keepalive counters.
    #[must_use]
    pub fn heartbeat(&self) -> Arc<HeartbeatState> {
        self.shared.heartbeat.state()
    }

    /// Install a callback run once when the connection exits, whether by
    /// [`Self::close`] or by exhausted retries.
    pub fn on_exit(&self, hook: impl FnOnce() + Send + 'static) {
        self.shared.exit_hook.set(hook);
    }

    // -------------------------------------------------------------------------
    // Topic Operations
    // -------------------------------------------------------------------------

    /// Subscribe to `topic`.
    ///
    /// The topic is registered locally at once and replayed on every
    /// reconnect. While streaming, a `subscribe` frame is also sent and its
    /// acknowledgement awaited (bounded by the read timeout). Subscribing
    /// twice is a no-op locally but sends the frame again.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolViolation` if the server rejects the subscription,
    /// or `Closed` if the client has exited.
    pub async fn subscribe(&self, topic: &str) -> Result<(), StreamError> {
        self.ensure_open()?;
        let change = self.shared.topics.subscribe(topic);
        if change.changed {
            tracing::debug!(topic, "Registered topic");
            metrics::set_subscribed_topics(
                self.shared.config.channel,
                self.shared.topics.subscribed_topics().len(),
            );
        }
        if !self.shared.state.is_streaming() {
            return Ok(());
        }
        let (reply, ack) = oneshot::channel();
        self.send_command(Command::Subscribe {
            topic: topic.to_owned(),
            revision: change.revision,
            reply,
        })?;
        self.await_ack(ack).await
    }

    /// Unsubscribe from `topic`, discarding its pending messages.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolViolation` if the server rejects the request, or
    /// `Closed` if the client has exited.
    pub async fn unsubscribe(&self, topic: &str) -> Result<(), StreamError> {
        self.ensure_open()?;
        let change = self.shared.topics.remove(topic);
        if change.changed {
            tracing::debug!(topic, discarded = change.discarded, "Removed topic");
            metrics::set_subscribed_topics(
                self.shared.config.channel,
                self.shared.topics.subscribed_topics().len(),
            );
        }
        if !self.shared.state.is_streaming() {
            return Ok(());
        }
        let (reply, ack) = oneshot::channel();
        self.send_command(Command::Unsubscribe {
            topic: topic.to_owned(),
            revision: change.revision,
            reply,
        })?;
        self.await_ack(ack).await
    }

    /// Request an orderbook snapshot for `symbol`.
    ///
    /// The snapshot is queued under `"{symbol}@orderbook"`; receive it with
    /// [`Self::recv`]. A request issued while reconnecting is sent once the
    /// connection is back. Snapshot topics are not replayed.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolViolation` if the server rejects the request, or
    /// `Closed` if the client has exited.
    pub async fn request(&self, symbol: &str) -> Result<(), StreamError> {
        self.ensure_open()?;
        self.shared.topics.ensure(&orderbook_topic(symbol));
        let (reply, ack) = oneshot::channel();
        self.send_command(Command::Request {
            symbol: symbol.to_owned(),
            reply,
        })?;
        if self.shared.state.is_streaming() {
            self.await_ack(ack).await
        } else {
            Ok(())
        }
    }

    /// Wait for the next message on `topic`.
    ///
    /// Waits in windows of the configured queue timeout, logging progress
    /// after each empty window, until a message arrives or the client
    /// exits.
    ///
    /// # Errors
    ///
    /// Returns `Closed` once the client has exited.
    pub async fn recv(&self, topic: &str) -> Result<Value, StreamError> {
        self.recv_timeout(topic, self.shared.config.queue_timeout)
            .await
    }

    /// Like [`Self::recv`] with an explicit wait window.
    ///
    /// # Errors
    ///
    /// Returns `Closed` once the client has exited.
    pub async fn recv_timeout(&self, topic: &str, window: Duration) -> Result<Value, StreamError> {
        loop {
            if let Some(message) = self.next_within(topic, window).await? {
                return Ok(message);
            }
            tracing::info!(topic, "no message in {} seconds", window.as_secs_f64());
        }
    }

    /// Wait at most `window` for the next message on `topic`.
    ///
    /// Waiting on a topic that is not registered registers it without
    /// subscribing. The queue is dropped again once it is empty, unsubscribed
    /// and no other receiver is waiting on it.
    ///
    /// # Errors
    ///
    /// Returns `Closed` once the client has exited.
    pub async fn next_within(
        &self,
        topic: &str,
        window: Duration,
    ) -> Result<Option<Value>, StreamError> {
        self.ensure_open()?;
        let queue = self.shared.topics.ensure(topic);
        let result = tokio::select! {
            () = self.shared.cancel.cancelled() => Err(StreamError::Closed),
            result = tokio::time::timeout(window, queue.pop()) => Ok(result.ok()),
        };
        drop(queue);
        self.shared.topics.release(topic);
        result
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Spawn the connection driver on `handle`.
    ///
    /// The returned task resolves with `Ok(())` after [`Self::close`], or
    /// with `ExhaustedRetries` exactly once if reconnecting gives up.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyStarted` on a second call, or `Closed` after close.
    pub fn start(
        &self,
        handle: &Handle,
    ) -> Result<JoinHandle<Result<(), StreamError>>, StreamError> {
        self.ensure_open()?;
        let startup = self
            .shared
            .startup
            .lock()
            .take()
            .ok_or(StreamError::AlreadyStarted)?;

        let shared = &self.shared;
        let connection = ReconnectingConnection::new(
            ConnectionConfig {
                channel: shared.config.channel,
                url: shared.config.url.clone(),
                read_timeout: shared.config.read_timeout,
                reconnect: shared.config.reconnect.clone(),
            },
            startup.connector,
            Arc::clone(&shared.state),
            shared.cancel.clone(),
            shared.events.clone(),
            Arc::clone(&shared.exit_hook),
        );
        let driver = Driver {
            shared: Arc::clone(shared),
            conn: connection,
            commands: startup.commands,
            pending: PendingAcks::default(),
            replayed: 0,
        };
        let span = telemetry::connection_span(shared.config.channel, &shared.config.url);
        Ok(handle.spawn(driver.run().instrument(span)))
    }

    /// Close the client.
    ///
    /// Moves to `EXITING` and wakes every waiting `recv`. The driver closes
    /// the transport and runs the exit hook; a client that was never
    /// started runs the hook here.
    pub fn close(&self) {
        self.shared.state.exit();
        self.shared.cancel.cancel();
        if self.shared.startup.lock().take().is_some() {
            self.shared.exit_hook.fire();
        }
    }

    /// Check whether the client has exited.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    fn ensure_open(&self) -> Result<(), StreamError> {
        if self.is_closed() {
            Err(StreamError::Closed)
        } else {
            Ok(())
        }
    }

    fn send_command(&self, command: Command) -> Result<(), StreamError> {
        self.shared
            .commands
            .send(command)
            .map_err(|_| StreamError::Closed)
    }

    async fn await_ack(
        &self,
        ack: oneshot::Receiver<Result<(), ProtocolViolation>>,
    ) -> Result<(), StreamError> {
        let window = self.shared.config.read_timeout;
        tokio::select! {
            () = self.shared.cancel.cancelled() => Err(StreamError::Closed),
            result = tokio::time::timeout(window, ack) => match result {
                Ok(Ok(Err(violation))) => Err(StreamError::ProtocolViolation(violation)),
                // Acked, lost to a reconnect (replay covers it), or never acked.
                Ok(Ok(Ok(())) | Err(_)) | Err(_) => Ok(()),
            },
        }
    }
}

impl std::fmt::Debug for StreamClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamClient")
            .field("channel", &self.shared.config.channel)
            .field("url", &self.shared.config.url)
            .field("state", &self.shared.state.get())
            .field("topics", &self.shared.topics.len())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Driver
// =============================================================================

/// Waiters for control acknowledgements, oldest first, per event name.
///
/// Frames the driver sends on its own (replayed subscribes) hold a `None`
/// slot so later acks still line up with their senders.
#[derive(Debug, Default)]
struct PendingAcks {
    waiting: HashMap<&'static str, VecDeque<Option<AckReply>>>,
}

impl PendingAcks {
    fn push(&mut self, event: &'static str, reply: Option<AckReply>) {
        self.waiting.entry(event).or_default().push_back(reply);
    }

    fn resolve(&mut self, event: &str, result: Result<(), ProtocolViolation>) {
        let slot = self.waiting.get_mut(event).and_then(VecDeque::pop_front);
        if let Some(Some(reply)) = slot {
            let _ = reply.send(result);
        }
    }

    fn clear(&mut self) {
        self.waiting.clear();
    }
}

enum Flow {
    Continue,
    Lost(String),
    Exit,
}

struct Driver {
    shared: Arc<Shared>,
    conn: ReconnectingConnection,
    commands: mpsc::UnboundedReceiver<Command>,
    pending: PendingAcks,
    /// Registry revision the last replay reflected.
    replayed: u64,
}

impl Driver {
    async fn run(mut self) -> Result<(), StreamError> {
        let result = self.drive().await;
        self.conn.close().await;
        match result {
            Ok(()) | Err(ConnectionError::Closed) => Ok(()),
            Err(ConnectionError::ExhaustedRetries(attempts)) => {
                Err(StreamError::ExhaustedRetries(attempts))
            }
            Err(e) => {
                tracing::error!(error = %e, "Stream driver stopped");
                Err(StreamError::Closed)
            }
        }
    }

    async fn drive(&mut self) -> Result<(), ConnectionError> {
        self.conn.connect().await?;
        loop {
            let flow = match self.replay().await {
                Flow::Continue => {
                    self.conn.established();
                    self.stream().await
                }
                other => other,
            };
            match flow {
                Flow::Lost(reason) => {
                    self.pending.clear();
                    self.conn.reconnect(&reason).await?;
                }
                Flow::Exit | Flow::Continue => return Ok(()),
            }
        }
    }

    /// Re-establish authentication and subscriptions on a fresh transport.
    async fn replay(&mut self) -> Flow {
        if let Some(credential) = self.shared.credential.clone() {
            let frame = credential.auth_frame_now(self.shared.config.id.clone());
            if let Err(e) = self.conn.send(&frame).await {
                return Flow::Lost(e.to_string());
            }
            let window = self.shared.config.read_timeout;
            match tokio::time::timeout(window, self.await_auth()).await {
                Ok(Flow::Continue) => {
                    tracing::info!(endpoint = %self.shared.config.channel, "Authenticated");
                    let _ = self.shared.events.send(StreamEvent::Authenticated);
                }
                Ok(other) => return other,
                Err(_) => return Flow::Lost("auth acknowledgement timed out".to_owned()),
            }
        }

        let replay = self.shared.topics.replay_set();
        self.replayed = replay.revision;
        let topics = replay.topics;
        for topic in &topics {
            let frame = OutboundFrame::subscribe(self.shared.config.id.clone(), topic.clone());
            if let Err(e) = self.conn.send(&frame).await {
                return Flow::Lost(e.to_string());
            }
            self.pending.push("subscribe", None);
        }
        if !topics.is_empty() {
            tracing::info!(count = topics.len(), "Restored subscriptions");
        }
        metrics::set_subscribed_topics(self.shared.config.channel, topics.len());
        Flow::Continue
    }

    /// Read until the auth acknowledgement. Data frames arriving earlier
    /// are dropped.
    async fn await_auth(&mut self) -> Flow {
        loop {
            let frame = match self.conn.read().await {
                ReadOutcome::Frame(frame) => frame,
                ReadOutcome::Dropped => continue,
                ReadOutcome::Lost(reason) => return Flow::Lost(reason),
                ReadOutcome::Exiting => return Flow::Exit,
            };
            if let Some(flow) = self.answer_ping(&frame).await {
                if !matches!(flow, Flow::Continue) {
                    return flow;
                }
                continue;
            }
            match InboundFrame::classify(frame) {
                InboundFrame::AuthAck => return Flow::Continue,
                InboundFrame::Error(violation) if violation.event == "auth" => {
                    self.report_violation(&violation);
                    return Flow::Lost(violation.to_string());
                }
                other => {
                    tracing::debug!(kind = other.kind(), "Dropping frame received before authentication");
                }
            }
        }
    }

    async fn stream(&mut self) -> Flow {
        loop {
            let flow = tokio::select! {
                () = self.shared.cancel.cancelled() => Flow::Exit,
                Some(command) = self.commands.recv() => self.handle_command(command).await,
                outcome = self.conn.read() => match outcome {
                    ReadOutcome::Frame(frame) => self.handle_frame(frame).await,
                    ReadOutcome::Dropped => Flow::Continue,
                    ReadOutcome::Lost(reason) => Flow::Lost(reason),
                    ReadOutcome::Exiting => Flow::Exit,
                },
            };
            if !matches!(flow, Flow::Continue) {
                return flow;
            }
        }
    }

    async fn handle_command(&mut self, command: Command) -> Flow {
        let id = self.shared.config.id.clone();
        let (frame, revision, reply) = match command {
            Command::Subscribe {
                topic,
                revision,
                reply,
            } => (OutboundFrame::subscribe(id, topic), Some(revision), reply),
            Command::Unsubscribe {
                topic,
                revision,
                reply,
            } => (OutboundFrame::unsubscribe(id, topic), Some(revision), reply),
            Command::Request { symbol, reply } => {
                (OutboundFrame::orderbook_request(id, symbol), None, reply)
            }
        };
        // The replay on this transport already reflects the change.
        if revision.is_some_and(|revision| revision <= self.replayed) {
            tracing::debug!(event = frame.event(), "Change covered by replay, not resending");
            let _ = reply.send(Ok(()));
            return Flow::Continue;
        }
        match self.conn.send(&frame).await {
            Ok(()) => {
                self.pending.push(frame.event(), Some(reply));
                Flow::Continue
            }
            Err(e) => Flow::Lost(e.to_string()),
        }
    }

    /// Answer a ping. Returns `None` if the frame is not a ping.
    async fn answer_ping(&mut self, frame: &Value) -> Option<Flow> {
        let pong = self.shared.heartbeat.intercept(frame)?;
        if let Err(e) = self.conn.send(&pong).await {
            return Some(Flow::Lost(e.to_string()));
        }
        metrics::record_ping_answered(self.shared.config.channel);
        let _ = self.shared.events.send(StreamEvent::Ping);
        Some(Flow::Continue)
    }

    async fn handle_frame(&mut self, frame: Value) -> Flow {
        if let Some(flow) = self.answer_ping(&frame).await {
            return flow;
        }

        match InboundFrame::classify(frame) {
            InboundFrame::DataEvent { topic, data } => self.deliver(&topic, data, false),
            InboundFrame::RequestAck { topic, data } => {
                self.pending.resolve("request", Ok(()));
                self.deliver(&topic, data, true);
            }
            InboundFrame::SubscribeAck => self.pending.resolve("subscribe", Ok(())),
            InboundFrame::Ack { event } => self.pending.resolve(&event, Ok(())),
            InboundFrame::AuthAck => tracing::debug!("Unexpected auth acknowledgement"),
            InboundFrame::Error(violation) => {
                self.report_violation(&violation);
                let event = violation.event.clone();
                self.pending.resolve(&event, Err(violation));
            }
            InboundFrame::Ping | InboundFrame::Pong | InboundFrame::Ignored => {
                tracing::trace!("Ignoring control chatter");
            }
        }
        Flow::Continue
    }

    fn deliver(&self, topic: &str, data: Value, register: bool) {
        let outcome = if register {
            self.shared.topics.deliver_or_register(topic, data)
        } else {
            self.shared.topics.deliver(topic, data)
        };
        match outcome {
            DeliveryOutcome::Delivered => {}
            DeliveryOutcome::DroppedOldest => {
                tracing::warn!(topic, "Topic queue full, dropped oldest message");
                metrics::record_message_dropped(topic);
            }
            DeliveryOutcome::UnknownTopic => {
                tracing::trace!(topic, "Dropping data for unregistered topic");
            }
        }
    }

    fn report_violation(&self, violation: &ProtocolViolation) {
        tracing::warn!(
            endpoint = %self.shared.config.channel,
            event = %violation.event,
            message = violation.message.as_deref().unwrap_or(""),
            "Server rejected control frame"
        );
        metrics::record_protocol_violation(self.shared.config.channel, &violation.event);
        let _ = self
            .shared
            .events
            .send(StreamEvent::ProtocolViolation(violation.clone()));
    }
}

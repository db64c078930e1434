//! Reconnecting Connection
//!
//! Owns exactly one transport at a time and drives the connect, read and
//! reconnect lifecycle:
//!
//! - `connect()` moves `INITIALISING -> STREAMING`. A failed attempt goes
//!   straight to `RECONNECTING` and the backoff loop instead of failing.
//! - `read()` returns one decoded frame. Malformed frames are dropped; a
//!   read timeout, a peer close or a transport error reports the
//!   connection as lost so the caller can `reconnect()`.
//! - `reconnect()` retries with backoff until a connect succeeds. After
//!   `max_reconnects` consecutive failed retries the connection moves to
//!   `EXITING` and the exhaustion is reported once.
//! - `close()` moves to `EXITING` unconditionally and runs the exit hook.
//!
//! Every suspension point (connect, read, backoff sleep) also waits on the
//! cancellation token, so `close()` from another task takes effect promptly.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use super::codec::{CodecError, FrameCodec};
use super::reconnect::{ReconnectConfig, ReconnectPolicy};
use crate::application::ports::{Connector, RawFrame, Transport, TransportError};
use crate::domain::connection::{Channel, ConnectionState, StateCell};
use crate::domain::frame::{OutboundFrame, ProtocolViolation};
use crate::infrastructure::metrics;

// =============================================================================
// Events
// =============================================================================

/// Lifecycle events broadcast to observers of a stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// A transport was opened.
    Connected,
    /// The private channel accepted the auth frame.
    Authenticated,
    /// The transport was lost.
    Disconnected {
        /// Why the transport was lost.
        reason: String,
    },
    /// A retry is scheduled.
    Reconnecting {
        /// 1-based retry number since the last successful connect.
        attempt: u32,
        /// Backoff before the retry.
        delay: Duration,
    },
    /// A server ping was answered.
    Ping,
    /// A control acknowledgement reported failure.
    ProtocolViolation(ProtocolViolation),
    /// Retries ran out; the connection is exiting.
    Exhausted {
        /// Retries attempted.
        attempts: u32,
    },
}

// =============================================================================
// Errors
// =============================================================================

/// Errors from the connection state machine.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// Transport failure.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Outbound frame could not be encoded.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// No transport is open.
    #[error("not connected")]
    NotConnected,

    /// Reconnect retries ran out.
    #[error("reconnect attempts exhausted after {0} retries")]
    ExhaustedRetries(u32),

    /// The connection was closed.
    #[error("connection closed")]
    Closed,
}

/// Result of one `read()` call.
#[derive(Debug, Clone, PartialEq)]
pub enum ReadOutcome {
    /// A decoded frame.
    Frame(Value),
    /// A frame arrived but could not be decoded; keep reading.
    Dropped,
    /// The transport is gone; reconnect with the given reason.
    Lost(String),
    /// The connection is exiting.
    Exiting,
}

// =============================================================================
// Exit Hook
// =============================================================================

type HookFn = Box<dyn FnOnce() + Send>;

/// Cleanup callback run once when a connection exits.
#[derive(Default)]
pub struct ExitHook {
    hook: Mutex<Option<HookFn>>,
}

impl ExitHook {
    /// Create an empty hook slot.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `hook`, replacing any hook not yet run.
    pub fn set(&self, hook: impl FnOnce() + Send + 'static) {
        *self.hook.lock() = Some(Box::new(hook));
    }

    /// Run the hook if one is installed. Later calls do nothing.
    pub fn fire(&self) {
        let hook = self.hook.lock().take();
        if let Some(hook) = hook {
            hook();
        }
    }
}

impl fmt::Debug for ExitHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExitHook")
            .field("armed", &self.hook.lock().is_some())
            .finish()
    }
}

// =============================================================================
// Configuration
// =============================================================================

/// Settings for one connection.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Endpoint kind, used in logs and metrics.
    pub channel: Channel,
    /// Full socket URL.
    pub url: String,
    /// Longest silence tolerated before the connection counts as lost.
    pub read_timeout: Duration,
    /// Backoff settings.
    pub reconnect: ReconnectConfig,
}

// =============================================================================
// Connection
// =============================================================================

/// A socket connection that reconnects itself.
pub struct ReconnectingConnection {
    config: ConnectionConfig,
    connector: Arc<dyn Connector>,
    state: Arc<StateCell>,
    policy: ReconnectPolicy,
    codec: FrameCodec,
    transport: Option<Box<dyn Transport>>,
    cancel: CancellationToken,
    events: broadcast::Sender<StreamEvent>,
    exit_hook: Arc<ExitHook>,
}

impl ReconnectingConnection {
    /// Create a connection. Nothing is opened until [`Self::connect`].
    #[must_use]
    pub fn new(
        config: ConnectionConfig,
        connector: Arc<dyn Connector>,
        state: Arc<StateCell>,
        cancel: CancellationToken,
        events: broadcast::Sender<StreamEvent>,
        exit_hook: Arc<ExitHook>,
    ) -> Self {
        let policy = ReconnectPolicy::new(config.reconnect.clone());
        Self {
            config,
            connector,
            state,
            policy,
            codec: FrameCodec::new(),
            transport: None,
            cancel,
            events,
            exit_hook,
        }
    }

    /// Get the current state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    /// Get the endpoint kind.
    #[must_use]
    pub const fn channel(&self) -> Channel {
        self.config.channel
    }

    /// Open the transport.
    ///
    /// A failed attempt is retried through [`Self::reconnect`] rather than
    /// returned.
    ///
    /// # Errors
    ///
    /// Returns `ExhaustedRetries` if every retry fails, or `Closed` if the
    /// connection was closed meanwhile.
    pub async fn connect(&mut self) -> Result<(), ConnectionError> {
        if self.cancel.is_cancelled() || self.state.is_exiting() {
            return Err(ConnectionError::Closed);
        }
        match self.open().await {
            Ok(()) => Ok(()),
            Err(ConnectionError::Transport(e)) => self.reconnect(&e.to_string()).await,
            Err(e) => Err(e),
        }
    }

    async fn open(&mut self) -> Result<(), ConnectionError> {
        tracing::info!(url = %self.config.url, endpoint = %self.config.channel, "Connecting to Orderly stream");

        let attempt = tokio::time::timeout(
            self.config.read_timeout,
            self.connector.connect(&self.config.url),
        );
        let transport = tokio::select! {
            () = self.cancel.cancelled() => return Err(ConnectionError::Closed),
            result = attempt => match result {
                Ok(result) => result?,
                Err(_) => {
                    return Err(TransportError::Connect {
                        message: format!(
                            "timed out after {}s",
                            self.config.read_timeout.as_secs_f64()
                        ),
                    }
                    .into());
                }
            },
        };

        if self.state.transition(ConnectionState::Streaming).is_none() {
            let mut transport = transport;
            transport.close().await;
            return Err(ConnectionError::Closed);
        }
        self.transport = Some(transport);
        tracing::info!(url = %self.config.url, endpoint = %self.config.channel, "Connected");
        let _ = self.events.send(StreamEvent::Connected);
        Ok(())
    }

    /// Mark the session on the open transport as usable.
    ///
    /// Only this resets the retry counter. A transport that opens but never
    /// gets past authentication keeps counting toward `max_reconnects`.
    pub const fn established(&mut self) {
        self.policy.reset();
    }

    /// Drop the current transport and retry with backoff until connected.
    ///
    /// # Errors
    ///
    /// Returns `ExhaustedRetries` once `max_reconnects` consecutive retries
    /// have failed; the connection is then `EXITING`. Returns `Closed` if
    /// the connection was closed while waiting.
    pub async fn reconnect(&mut self, reason: &str) -> Result<(), ConnectionError> {
        if let Some(mut transport) = self.transport.take() {
            transport.close().await;
        }
        if self.state.transition(ConnectionState::Reconnecting).is_none() {
            return Err(ConnectionError::Closed);
        }
        tracing::warn!(endpoint = %self.config.channel, reason, "Disconnected from Orderly stream");
        let _ = self.events.send(StreamEvent::Disconnected {
            reason: reason.to_owned(),
        });

        loop {
            let Some(delay) = self.policy.next_delay() else {
                return Err(self.exhaust());
            };
            let attempt = self.policy.attempt_count();
            tracing::info!(
                endpoint = %self.config.channel,
                attempt,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "Reconnecting to Orderly stream"
            );
            metrics::record_reconnect(self.config.channel, delay);
            let _ = self
                .events
                .send(StreamEvent::Reconnecting { attempt, delay });

            tokio::select! {
                () = self.cancel.cancelled() => {
                    tracing::info!("Cancelled during reconnect delay");
                    return Err(ConnectionError::Closed);
                }
                () = tokio::time::sleep(delay) => {}
            }

            match self.open().await {
                Ok(()) => return Ok(()),
                Err(ConnectionError::Transport(e)) => {
                    tracing::warn!(endpoint = %self.config.channel, attempt, error = %e, "Reconnect attempt failed");
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn exhaust(&self) -> ConnectionError {
        let attempts = self.policy.attempt_count();
        tracing::error!(
            endpoint = %self.config.channel,
            attempts,
            "Reconnect attempts exhausted, giving up"
        );
        self.state.exit();
        self.cancel.cancel();
        let _ = self.events.send(StreamEvent::Exhausted { attempts });
        self.exit_hook.fire();
        ConnectionError::ExhaustedRetries(attempts)
    }

    /// Send one frame on the open transport.
    ///
    /// # Errors
    ///
    /// Returns an error if no transport is open, encoding fails, or the
    /// transport rejects the frame.
    pub async fn send(&mut self, frame: &OutboundFrame) -> Result<(), ConnectionError> {
        let raw = self.codec.encode_raw(frame)?;
        let transport = self
            .transport
            .as_mut()
            .ok_or(ConnectionError::NotConnected)?;
        if !matches!(frame, OutboundFrame::Pong) {
            tracing::debug!(endpoint = %self.config.channel, event = frame.event(), "Sending frame");
        }
        transport.send(raw).await?;
        Ok(())
    }

    /// Wait for the next decoded frame.
    pub async fn read(&mut self) -> ReadOutcome {
        if self.cancel.is_cancelled() {
            return ReadOutcome::Exiting;
        }
        let Some(transport) = self.transport.as_mut() else {
            return ReadOutcome::Lost("not connected".to_owned());
        };

        let window = self.config.read_timeout;
        let received = tokio::select! {
            () = self.cancel.cancelled() => return ReadOutcome::Exiting,
            result = tokio::time::timeout(window, transport.recv()) => result,
        };

        let frame = match received {
            Err(_) => {
                tracing::warn!(endpoint = %self.config.channel, "Connection timed out");
                return ReadOutcome::Lost(format!(
                    "no data in {}s",
                    window.as_secs_f64()
                ));
            }
            Ok(Err(e)) => return ReadOutcome::Lost(e.to_string()),
            Ok(Ok(RawFrame::Close(reason))) => {
                tracing::info!(endpoint = %self.config.channel, ?reason, "Server sent close frame");
                return ReadOutcome::Lost(reason.map_or_else(
                    || "closed by peer".to_owned(),
                    |r| format!("closed by peer: {r}"),
                ));
            }
            Ok(Ok(frame)) => frame,
        };

        match self.codec.decode(&frame) {
            Ok(value) => {
                metrics::record_frame_received(self.config.channel);
                ReadOutcome::Frame(value)
            }
            Err(e) => {
                tracing::debug!(
                    endpoint = %self.config.channel,
                    kind = frame.kind(),
                    error = %e,
                    "Dropping malformed frame"
                );
                metrics::record_frame_malformed(self.config.channel);
                ReadOutcome::Dropped
            }
        }
    }

    /// Exit for good: close the transport and run the exit hook.
    pub async fn close(&mut self) {
        self.state.exit();
        self.cancel.cancel();
        if let Some(mut transport) = self.transport.take() {
            transport.close().await;
        }
        tracing::info!(endpoint = %self.config.channel, "Connection closed");
        self.exit_hook.fire();
    }
}

impl fmt::Debug for ReconnectingConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReconnectingConnection")
            .field("config", &self.config)
            .field("state", &self.state.get())
            .field("attempts", &self.policy.attempt_count())
            .field("connected", &self.transport.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use super::*;
    use crate::infrastructure::orderly::testing::{Attempt, ScriptedConnector, Step};

    struct Harness {
        conn: ReconnectingConnection,
        state: Arc<StateCell>,
        cancel: CancellationToken,
        events: broadcast::Receiver<StreamEvent>,
        hook_runs: Arc<AtomicUsize>,
    }

    fn harness(connector: &Arc<ScriptedConnector>, max_reconnects: u32) -> Harness {
        let state = Arc::new(StateCell::new());
        let cancel = CancellationToken::new();
        let (events_tx, events) = broadcast::channel(64);
        let hook = Arc::new(ExitHook::new());
        let hook_runs = Arc::new(AtomicUsize::new(0));
        let runs = Arc::clone(&hook_runs);
        hook.set(move || {
            runs.fetch_add(1, Ordering::SeqCst);
        });
        let config = ConnectionConfig {
            channel: Channel::Public,
            url: "ws://test/ws/stream/0xabc".to_owned(),
            read_timeout: Duration::from_millis(200),
            reconnect: ReconnectConfig::new(
                Duration::from_millis(5),
                Duration::from_millis(1),
                max_reconnects,
            ),
        };
        let conn = ReconnectingConnection::new(
            config,
            Arc::clone(connector) as Arc<dyn Connector>,
            Arc::clone(&state),
            cancel.clone(),
            events_tx,
            hook,
        );
        Harness {
            conn,
            state,
            cancel,
            events,
            hook_runs,
        }
    }

    fn drain(events: &mut broadcast::Receiver<StreamEvent>) -> Vec<StreamEvent> {
        std::iter::from_fn(|| events.try_recv().ok()).collect()
    }

    #[tokio::test]
    async fn connect_moves_to_streaming() {
        let connector = ScriptedConnector::new(vec![Attempt::accept(vec![])]);
        let mut h = harness(&connector, 5);

        assert_eq!(h.conn.state(), ConnectionState::Initialising);
        h.conn.connect().await.unwrap();
        assert_eq!(h.state.get(), ConnectionState::Streaming);
        assert_eq!(drain(&mut h.events), vec![StreamEvent::Connected]);
        assert_eq!(connector.connects(), 1);
    }

    #[tokio::test]
    async fn failed_initial_connect_is_retried() {
        let connector = ScriptedConnector::new(vec![
            Attempt::Refuse,
            Attempt::Refuse,
            Attempt::accept(vec![]),
        ]);
        let mut h = harness(&connector, 5);

        h.conn.connect().await.unwrap();
        assert_eq!(h.state.get(), ConnectionState::Streaming);
        assert_eq!(connector.connects(), 3);

        let events = drain(&mut h.events);
        let retries = events
            .iter()
            .filter(|e| matches!(e, StreamEvent::Reconnecting { .. }))
            .count();
        assert_eq!(retries, 2);
        assert_eq!(events.last(), Some(&StreamEvent::Connected));
    }

    #[tokio::test]
    async fn read_decodes_and_drops_malformed() {
        let connector = ScriptedConnector::new(vec![Attempt::accept(vec![
            Step::text(r#"{"topic":"bbos","data":{"price":1}}"#),
            Step::text("{garbage"),
            Step::gzip(r#"{"topic":"bbos","data":{"price":2}}"#),
        ])]);
        let mut h = harness(&connector, 5);
        h.conn.connect().await.unwrap();

        assert_eq!(
            h.conn.read().await,
            ReadOutcome::Frame(json!({"topic": "bbos", "data": {"price": 1}}))
        );
        assert_eq!(h.conn.read().await, ReadOutcome::Dropped);
        assert_eq!(
            h.conn.read().await,
            ReadOutcome::Frame(json!({"topic": "bbos", "data": {"price": 2}}))
        );
    }

    #[tokio::test]
    async fn peer_close_and_timeout_are_lost() {
        let connector = ScriptedConnector::new(vec![
            Attempt::accept(vec![Step::Close]),
            Attempt::accept(vec![]),
        ]);
        let mut h = harness(&connector, 5);
        h.conn.connect().await.unwrap();

        assert!(matches!(h.conn.read().await, ReadOutcome::Lost(r) if r.contains("closed by peer")));
        h.conn.reconnect("closed by peer").await.unwrap();
        assert_eq!(h.state.get(), ConnectionState::Streaming);

        // Second attempt never sends anything; the read window elapses.
        assert!(matches!(h.conn.read().await, ReadOutcome::Lost(r) if r.starts_with("no data")));
    }

    #[tokio::test]
    async fn transport_error_is_lost() {
        let connector =
            ScriptedConnector::new(vec![Attempt::accept(vec![Step::Fail("reset".to_owned())])]);
        let mut h = harness(&connector, 5);
        h.conn.connect().await.unwrap();
        assert!(matches!(h.conn.read().await, ReadOutcome::Lost(r) if r.contains("reset")));
    }

    #[tokio::test]
    async fn exhausted_retries_exit_once() {
        let connector = ScriptedConnector::new(vec![Attempt::accept(vec![Step::Close])]);
        let mut h = harness(&connector, 3);
        h.conn.connect().await.unwrap();
        assert!(matches!(h.conn.read().await, ReadOutcome::Lost(_)));

        let err = h.conn.reconnect("closed by peer").await.unwrap_err();
        assert!(matches!(err, ConnectionError::ExhaustedRetries(3)));
        assert_eq!(h.state.get(), ConnectionState::Exiting);
        assert!(h.cancel.is_cancelled());
        assert_eq!(connector.connects(), 4);

        let exhausted = drain(&mut h.events)
            .into_iter()
            .filter(|e| matches!(e, StreamEvent::Exhausted { .. }))
            .count();
        assert_eq!(exhausted, 1);
        assert_eq!(h.hook_runs.load(Ordering::SeqCst), 1);

        // Terminal: nothing leaves EXITING.
        assert!(matches!(h.conn.connect().await, Err(ConnectionError::Closed)));
        assert_eq!(h.conn.read().await, ReadOutcome::Exiting);
        h.conn.close().await;
        assert_eq!(h.hook_runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn successful_reconnect_resets_counter() {
        let connector = ScriptedConnector::new(vec![
            Attempt::accept(vec![Step::Close]),
            Attempt::Refuse,
            Attempt::accept(vec![Step::Close]),
            Attempt::Refuse,
            Attempt::accept(vec![]),
        ]);
        let mut h = harness(&connector, 2);
        h.conn.connect().await.unwrap();
        h.conn.established();

        for _ in 0..2 {
            assert!(matches!(h.conn.read().await, ReadOutcome::Lost(_)));
            h.conn.reconnect("closed by peer").await.unwrap();
            assert_eq!(h.state.get(), ConnectionState::Streaming);
            h.conn.established();
        }
    }

    #[tokio::test]
    async fn open_without_established_session_keeps_counting() {
        let connector = ScriptedConnector::new(vec![
            Attempt::accept(vec![Step::Close]),
            Attempt::accept(vec![Step::Close]),
            Attempt::accept(vec![Step::Close]),
        ]);
        let mut h = harness(&connector, 2);
        h.conn.connect().await.unwrap();

        assert!(matches!(h.conn.read().await, ReadOutcome::Lost(_)));
        h.conn.reconnect("closed by peer").await.unwrap();
        assert!(matches!(h.conn.read().await, ReadOutcome::Lost(_)));
        h.conn.reconnect("closed by peer").await.unwrap();
        assert!(matches!(h.conn.read().await, ReadOutcome::Lost(_)));

        let err = h.conn.reconnect("closed by peer").await.unwrap_err();
        assert!(matches!(err, ConnectionError::ExhaustedRetries(2)));
        assert_eq!(connector.connects(), 3);
    }

    #[tokio::test]
    async fn close_is_terminal_and_runs_hook() {
        let connector = ScriptedConnector::new(vec![Attempt::accept(vec![])]);
        let mut h = harness(&connector, 5);
        h.conn.connect().await.unwrap();

        h.conn.close().await;
        assert_eq!(h.state.get(), ConnectionState::Exiting);
        assert_eq!(h.hook_runs.load(Ordering::SeqCst), 1);
        assert_eq!(h.conn.read().await, ReadOutcome::Exiting);
        assert!(matches!(
            h.conn.send(&OutboundFrame::Pong).await,
            Err(ConnectionError::NotConnected)
        ));
        assert!(connector.transport_closed(0));
    }

    #[tokio::test]
    async fn cancel_interrupts_backoff_sleep() {
        let connector = ScriptedConnector::new(vec![Attempt::accept(vec![Step::Close])]);
        let state = Arc::new(StateCell::new());
        let cancel = CancellationToken::new();
        let (events_tx, _events) = broadcast::channel(16);
        let mut conn = ReconnectingConnection::new(
            ConnectionConfig {
                channel: Channel::Public,
                url: "ws://test".to_owned(),
                read_timeout: Duration::from_secs(5),
                reconnect: ReconnectConfig::new(
                    Duration::from_secs(3600),
                    Duration::from_secs(3600),
                    5,
                ),
            },
            Arc::clone(&connector) as Arc<dyn Connector>,
            state,
            cancel.clone(),
            events_tx,
            Arc::new(ExitHook::new()),
        );
        conn.connect().await.unwrap();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });
        let result = tokio::time::timeout(Duration::from_secs(2), conn.reconnect("test"))
            .await
            .expect("reconnect should observe cancellation");
        assert!(matches!(result, Err(ConnectionError::Closed)));
    }

    #[tokio::test]
    async fn send_writes_encoded_frame() {
        let connector = ScriptedConnector::new(vec![Attempt::accept(vec![])]);
        let mut h = harness(&connector, 5);
        h.conn.connect().await.unwrap();

        h.conn
            .send(&OutboundFrame::subscribe("WS_PUBLIC", "bbos"))
            .await
            .unwrap();
        assert_eq!(
            connector.sent(),
            vec![json!({"id": "WS_PUBLIC", "event": "subscribe", "topic": "bbos"})]
        );
    }
}

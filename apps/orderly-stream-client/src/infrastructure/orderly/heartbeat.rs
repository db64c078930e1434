//! Heartbeat Handler
//!
//! Orderly servers send `{"event":"ping"}` and drop connections that do not
//! answer with `{"event":"pong"}`. The handler runs inline in the read loop,
//! before frame classification, so pings never reach a topic queue.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde_json::Value;

use crate::domain::frame::{EVENT_PONG, OutboundFrame, is_ping};

/// Keepalive counters shared between the read loop and observers.
#[derive(Debug, Default)]
pub struct HeartbeatState {
    last_ping: RwLock<Option<Instant>>,
    pings_answered: AtomicU64,
    pongs_received: AtomicU64,
}

impl HeartbeatState {
    /// Create new heartbeat state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that a ping was answered.
    pub fn record_ping(&self) {
        *self.last_ping.write() = Some(Instant::now());
        self.pings_answered.fetch_add(1, Ordering::Relaxed);
    }

    /// Record that a server pong arrived.
    pub fn record_pong(&self) {
        self.pongs_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Pings answered since creation.
    #[must_use]
    pub fn pings_answered(&self) -> u64 {
        self.pings_answered.load(Ordering::Relaxed)
    }

    /// Pongs received since creation.
    #[must_use]
    pub fn pongs_received(&self) -> u64 {
        self.pongs_received.load(Ordering::Relaxed)
    }

    /// Time since the last ping, if one was seen.
    #[must_use]
    pub fn time_since_ping(&self) -> Option<Duration> {
        self.last_ping.read().map(|at| at.elapsed())
    }
}

/// Answers keepalive pings.
#[derive(Debug, Clone, Default)]
pub struct HeartbeatHandler {
    state: Arc<HeartbeatState>,
}

impl HeartbeatHandler {
    /// Create a handler with fresh state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the shared counters.
    #[must_use]
    pub fn state(&self) -> Arc<HeartbeatState> {
        Arc::clone(&self.state)
    }

    /// Inspect a decoded frame.
    ///
    /// Returns the pong to send if the frame is a ping. The caller must not
    /// propagate a frame that produced a pong.
    pub fn intercept(&self, frame: &Value) -> Option<OutboundFrame> {
        if is_ping(frame) {
            self.state.record_ping();
            tracing::trace!("answering ping");
            return Some(OutboundFrame::Pong);
        }
        if frame.get("event").and_then(Value::as_str) == Some(EVENT_PONG) {
            self.state.record_pong();
        }
        None
    }
}

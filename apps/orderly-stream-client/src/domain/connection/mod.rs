//! Connection Lifecycle State
//!
//! The state a streaming connection is in at any moment. Exactly one state
//! is active at a time:
//!
//! ```text
//! INITIALISING ──► STREAMING ◄──► RECONNECTING
//!       │              │               │
//!       └──────────────┴───────────────┴──► EXITING (terminal)
//! ```
//!
//! `EXITING` is terminal: once entered, no transition leaves it.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

// =============================================================================
// Connection State
// =============================================================================

/// Lifecycle state of a streaming connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    /// Created but not yet connected.
    #[default]
    Initialising,
    /// Transport is open and the read loop is running.
    Streaming,
    /// Transport was lost; waiting out backoff or retrying the connect.
    Reconnecting,
    /// Closed for good.
    Exiting,
}

impl ConnectionState {
    /// Get the state name used in logs.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Initialising => "initialising",
            Self::Streaming => "streaming",
            Self::Reconnecting => "reconnecting",
            Self::Exiting => "exiting",
        }
    }

    /// Check if this is the terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Exiting)
    }

    /// Check whether moving from `self` to `next` is allowed.
    #[must_use]
    pub const fn can_transition_to(&self, next: Self) -> bool {
        match (self, next) {
            (Self::Exiting, _) => false,
            (_, Self::Exiting) => true,
            (Self::Initialising | Self::Reconnecting, Self::Streaming | Self::Reconnecting) => {
                true
            }
            (Self::Streaming, Self::Reconnecting) => true,
            _ => false,
        }
    }

    const fn to_u8(self) -> u8 {
        match self {
            Self::Initialising => 0,
            Self::Streaming => 1,
            Self::Reconnecting => 2,
            Self::Exiting => 3,
        }
    }

    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Initialising,
            1 => Self::Streaming,
            2 => Self::Reconnecting,
            _ => Self::Exiting,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Channel
// =============================================================================

/// Which Orderly endpoint a connection serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Market data; no authentication.
    Public,
    /// Account data; authenticated on every connect.
    Private,
}

impl Channel {
    /// Get the channel name used in logs and metrics.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Private => "private",
        }
    }

    /// Default client id sent with every outbound frame.
    #[must_use]
    pub const fn default_id(&self) -> &'static str {
        match self {
            Self::Public => "WS_PUBLIC",
            Self::Private => "WS_PRIVATE",
        }
    }

    /// Check if the channel requires authentication.
    #[must_use]
    pub const fn requires_auth(&self) -> bool {
        matches!(self, Self::Private)
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// State Cell
// =============================================================================

/// Shared, lock-free holder for a [`ConnectionState`].
///
/// The connection loop writes it; client handles on other tasks or threads
/// only read it. Writes that would leave `Exiting` are refused.
#[derive(Debug, Default)]
pub struct StateCell {
    state: AtomicU8,
}

impl StateCell {
    /// Create a cell in the `Initialising` state.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(0),
        }
    }

    /// Get the current state.
    #[must_use]
    pub fn get(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Attempt a transition, returning the previous state on success.
    ///
    /// Returns `None` if the transition is not allowed from the current state.
    pub fn transition(&self, next: ConnectionState) -> Option<ConnectionState> {
        let mut current = self.state.load(Ordering::SeqCst);
        loop {
            let from = ConnectionState::from_u8(current);
            if !from.can_transition_to(next) {
                return None;
            }
            match self.state.compare_exchange(
                current,
                next.to_u8(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return Some(from),
                Err(actual) => current = actual,
            }
        }
    }

    /// Move to `Exiting` unconditionally.
    ///
    /// Returns `true` if this call performed the transition.
    pub fn exit(&self) -> bool {
        self.state
            .swap(ConnectionState::Exiting.to_u8(), Ordering::SeqCst)
            != ConnectionState::Exiting.to_u8()
    }

    /// Check if the connection is streaming.
    #[must_use]
    pub fn is_streaming(&self) -> bool {
        self.get() == ConnectionState::Streaming
    }

    /// Check if the connection has exited.
    #[must_use]
    pub fn is_exiting(&self) -> bool {
        self.get().is_terminal()
    }
}

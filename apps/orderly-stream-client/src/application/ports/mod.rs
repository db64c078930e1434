//! Port Interfaces
//!
//! Defines the interfaces (ports) for external systems following
//! the Hexagonal Architecture pattern. These are the contracts that
//! infrastructure adapters must implement.
//!
//! ## Driven Ports (Outbound)
//!
//! - `Connector`: Opens one socket to an endpoint URL
//! - `Transport`: One open socket; sends and receives raw frames
//!
//! The connection state machine only ever talks to these traits, so the
//! WebSocket adapter and the scripted test transport are interchangeable.

use async_trait::async_trait;

// =============================================================================
// Raw Frames
// =============================================================================

/// A frame as it arrives on, or leaves through, a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawFrame {
    /// UTF-8 text frame.
    Text(String),
    /// Binary frame (gzip-compressed JSON on this feed).
    Binary(Vec<u8>),
    /// Peer closed the socket, with an optional reason.
    Close(Option<String>),
}

impl RawFrame {
    /// Get the frame kind name used in logs.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Text(_) => "text",
            Self::Binary(_) => "binary",
            Self::Close(_) => "close",
        }
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Transport-level failure. Always transient from the caller's view.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// The connect attempt failed.
    #[error("Connect failed: {message}")]
    Connect {
        /// Error details.
        message: String,
    },

    /// Sending a frame failed.
    #[error("Send failed: {message}")]
    Send {
        /// Error details.
        message: String,
    },

    /// Receiving a frame failed.
    #[error("Receive failed: {message}")]
    Receive {
        /// Error details.
        message: String,
    },

    /// The socket is closed.
    #[error("Transport closed")]
    Closed,
}

// =============================================================================
// Ports
// =============================================================================

/// One open socket.
#[async_trait]
pub trait Transport: Send {
    /// Send one frame.
    async fn send(&mut self, frame: RawFrame) -> Result<(), TransportError>;

    /// Wait for the next frame.
    ///
    /// A peer close is returned as [`RawFrame::Close`]; a stream that ends
    /// without one is [`TransportError::Closed`].
    async fn recv(&mut self) -> Result<RawFrame, TransportError>;

    /// Close the socket. Errors are ignored; the socket is gone either way.
    async fn close(&mut self);
}

/// Opens sockets to an endpoint.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a socket to `url`.
    async fn connect(&self, url: &str) -> Result<Box<dyn Transport>, TransportError>;
}

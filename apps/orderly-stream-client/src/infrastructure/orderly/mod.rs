//! Orderly WebSocket Adapters
//!
//! Streaming client for Orderly's public and private WebSocket endpoints:
//!
//! - [`client::StreamClient`]: topic router with subscribe replay
//! - [`connection::ReconnectingConnection`]: connect/read/reconnect state machine
//! - [`threaded::ThreadedStreamManager`]: synchronous facade on its own thread
//! - [`transport::WsConnector`]: tokio-tungstenite transport

/// Ed25519 request signing and private channel credentials.
pub mod auth;

/// Topic router and connection driver.
pub mod client;

/// Frame decoding (gzip + JSON) and encoding.
pub mod codec;

/// Reconnecting connection state machine.
pub mod connection;

/// Ping/pong keepalive handling.
pub mod heartbeat;

/// Jittered exponential backoff.
pub mod reconnect;

/// Synchronous facade.
pub mod threaded;

/// WebSocket transport.
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use auth::{AuthError, Credential, Ed25519Signer, Signer};
pub use client::{ClientConfig, StreamClient, StreamError};
pub use connection::StreamEvent;
pub use reconnect::{ReconnectConfig, ReconnectPolicy};
pub use threaded::ThreadedStreamManager;
pub use transport::WsConnector;

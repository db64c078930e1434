#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::needless_collect,
        clippy::option_if_let_else,
        clippy::default_trait_access,
        clippy::items_after_statements,
        clippy::or_fun_call
    )
)]

//! Orderly Stream Client - Topic-Multiplexed WebSocket Client
//!
//! Keeps one resilient WebSocket connection per Orderly endpoint (public
//! market data, private account events), replays authentication and
//! subscriptions after every reconnect, and fans incoming frames out to
//! bounded per-topic queues so independent consumers read at their own
//! pace.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Pure types with no I/O
//!   - `connection`: Connection lifecycle states and channels
//!   - `frame`: Inbound classification, outbound wire frames
//!   - `topic`: Bounded drop-oldest queues and the topic registry
//!
//! - **Application**: Port definitions
//!   - `ports`: `Connector`/`Transport` seam behind which the socket lives
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `orderly`: Signing, codec, heartbeat, backoff, connection state
//!     machine, topic router, threaded facade, WebSocket transport
//!   - `config`: Environment-driven settings
//!   - `metrics`: Prometheus instrumentation
//!   - `telemetry`: Tracing subscriber and OTLP export
//!
//! # Data Flow
//!
//! ```text
//!                  ┌──────────────┐  ping ┌───────────┐
//! Orderly WS ────► │  Connection  │──────►│ Heartbeat │──► pong
//!   (gzip/JSON)    │ (reconnects) │       └───────────┘
//!                  └──────┬───────┘
//!                         │ classify
//!                         ▼
//!                  ┌──────────────┐      ┌─────────┐
//!                  │ Topic Router │─────►│  bbos   │──► recv("bbos")
//!                  │              │─────►│ BTC@ob  │──► recv("BTC@orderbook")
//!                  └──────────────┘      └─────────┘
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Core streaming types with no external dependencies.
pub mod domain;

/// Application layer - Port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::connection::{Channel, ConnectionState};
pub use domain::frame::{InboundFrame, OutboundFrame, ProtocolViolation, orderbook_topic};
pub use domain::topic::{DEFAULT_QUEUE_CAPACITY, TopicStats};

// Ports
pub use application::ports::{Connector, RawFrame, Transport, TransportError};

// Stream client
pub use infrastructure::orderly::{
    AuthError, ClientConfig, Credential, Ed25519Signer, ReconnectConfig, Signer, StreamClient,
    StreamError, StreamEvent, ThreadedStreamManager, WsConnector,
};

// Infrastructure config
pub use infrastructure::config::{ConfigError, Environment, KeyPair, StreamSettings};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{
    TelemetryConfig, TelemetryError, TelemetryGuard, init as init_telemetry,
};

//! Prometheus Metrics Module
//!
//! Exposes stream client metrics via Prometheus format for monitoring.
//!
//! # Metrics Categories
//!
//! - **Frames**: Counts of frames received and frames dropped as malformed
//! - **Queues**: Messages discarded by the drop-oldest policy, per topic
//! - **Connections**: Reconnect attempts and backoff delays
//! - **Protocol**: Pings answered and rejected control acknowledgements
//! - **Subscriptions**: Subscribed topic counts
//!
//! # Integration
//!
//! Recording goes through the `metrics` facade and is a no-op until a
//! recorder is installed. The binary installs the Prometheus exporter with
//! [`init_metrics`], which serves `/metrics` on its own port.

use std::net::SocketAddr;
use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

use crate::domain::connection::Channel;

// =============================================================================
// Exporter Installation
// =============================================================================

static INSTALLED: OnceLock<SocketAddr> = OnceLock::new();

/// Errors installing the Prometheus exporter.
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    /// The exporter could not be built or installed.
    #[error("failed to install Prometheus exporter: {0}")]
    Install(#[from] BuildError),
}

/// Install the Prometheus exporter with an HTTP listener on `port`.
///
/// A port of 0 disables the exporter. Must be called from within a Tokio
/// runtime. Repeated calls return the address of the first listener.
///
/// # Errors
///
/// Returns an error if the recorder or listener cannot be installed.
pub fn init_metrics(port: u16) -> Result<Option<SocketAddr>, MetricsError> {
    if port == 0 {
        return Ok(None);
    }
    if let Some(addr) = INSTALLED.get() {
        return Ok(Some(*addr));
    }

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    register_metrics();
    Ok(Some(*INSTALLED.get_or_init(|| addr)))
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    describe_counter!(
        "orderly_stream_frames_received_total",
        "Total frames decoded from Orderly streams"
    );
    describe_counter!(
        "orderly_stream_frames_malformed_total",
        "Total frames dropped because they failed to decompress or parse"
    );
    describe_counter!(
        "orderly_stream_messages_dropped_total",
        "Total queued messages discarded because a topic queue was full"
    );
    describe_counter!(
        "orderly_stream_reconnects_total",
        "Total reconnection attempts"
    );
    describe_counter!(
        "orderly_stream_pings_answered_total",
        "Total server pings answered with a pong"
    );
    describe_counter!(
        "orderly_stream_protocol_violations_total",
        "Total control acknowledgements with success=false"
    );
    describe_gauge!(
        "orderly_stream_subscribed_topics",
        "Number of topics replayed on reconnect"
    );
    describe_histogram!(
        "orderly_stream_reconnect_delay_seconds",
        "Backoff delay before each reconnection attempt"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Record a frame decoded from a stream.
pub fn record_frame_received(channel: Channel) {
    counter!(
        "orderly_stream_frames_received_total",
        "endpoint" => channel.as_str()
    )
    .increment(1);
}

/// Record a frame dropped as malformed.
pub fn record_frame_malformed(channel: Channel) {
    counter!(
        "orderly_stream_frames_malformed_total",
        "endpoint" => channel.as_str()
    )
    .increment(1);
}

/// Record a queued message discarded by the drop-oldest policy.
pub fn record_message_dropped(topic: &str) {
    counter!(
        "orderly_stream_messages_dropped_total",
        "topic" => topic.to_owned()
    )
    .increment(1);
}

/// Record a reconnection attempt and its backoff delay.
pub fn record_reconnect(channel: Channel, delay: Duration) {
    counter!(
        "orderly_stream_reconnects_total",
        "endpoint" => channel.as_str()
    )
    .increment(1);
    histogram!(
        "orderly_stream_reconnect_delay_seconds",
        "endpoint" => channel.as_str()
    )
    .record(delay.as_secs_f64());
}

/// Record a server ping answered with a pong.
pub fn record_ping_answered(channel: Channel) {
    counter!(
        "orderly_stream_pings_answered_total",
        "endpoint" => channel.as_str()
    )
    .increment(1);
}

/// Record a rejected control acknowledgement.
pub fn record_protocol_violation(channel: Channel, event: &str) {
    counter!(
        "orderly_stream_protocol_violations_total",
        "endpoint" => channel.as_str(),
        "event" => event.to_owned()
    )
    .increment(1);
}

/// Update the subscribed topic count for a channel.
pub fn set_subscribed_topics(channel: Channel, count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!(
        "orderly_stream_subscribed_topics",
        "endpoint" => channel.as_str()
    )
    .set(count as f64);
}

// =============================================================================
// Tests
// =============================================================================

//! Telemetry
//!
//! Log filtering, the process-wide subscriber, and the spans the stream
//! client runs under.
//!
//! Every connection driver runs inside an `orderly_stream` span carrying its
//! `endpoint` and `url`; every facade listener inside an `orderly_listener`
//! span carrying its `socket` name and `topic`. Events logged by the client
//! inherit those fields, both on stderr and in exported traces.
//!
//! # Environment Variables
//!
//! - `RUST_LOG`: Directives layered over the defaults (later wins per target)
//! - `OTEL_ENABLED`: Set to "true" to export spans over OTLP/gRPC (default: false)
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: Collector endpoint (default: http://localhost:4317)
//! - `OTEL_SERVICE_NAME`: Service name on exported spans (default: orderly-stream-client)

use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing::Span;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::ParseError;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};

use crate::domain::connection::Channel;

const DEFAULT_SERVICE_NAME: &str = "orderly-stream-client";

const DEFAULT_OTLP_ENDPOINT: &str = "http://localhost:4317";

/// Filter applied before `RUST_LOG`.
///
/// The socket stack is noisy at debug level and the exporter's gRPC client
/// logs every batch.
const DEFAULT_DIRECTIVES: &[&str] = &[
    "info",
    "orderly_stream_client=info",
    "tungstenite=warn",
    "tokio_tungstenite=warn",
    "rustls=warn",
    "h2=warn",
    "tonic=warn",
];

/// Errors installing telemetry.
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    /// A filter directive did not parse.
    #[error("invalid log directive: {0}")]
    Directive(#[from] ParseError),

    /// The OTLP exporter could not be built.
    #[error("failed to build OTLP exporter for {endpoint}: {message}")]
    Exporter {
        /// Collector endpoint.
        endpoint: String,
        /// Builder error.
        message: String,
    },

    /// A global subscriber was already installed.
    #[error("tracing subscriber already installed: {0}")]
    Subscriber(#[from] TryInitError),
}

/// Flushes exported spans when dropped.
pub struct TelemetryGuard {
    tracer_provider: Option<SdkTracerProvider>,
}

impl std::fmt::Debug for TelemetryGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelemetryGuard")
            .field("exporting", &self.tracer_provider.is_some())
            .finish()
    }
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.tracer_provider.take()
            && let Err(e) = provider.shutdown()
        {
            eprintln!("Failed to flush exported spans: {e}");
        }
    }
}

/// Telemetry settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryConfig {
    /// Export spans over OTLP.
    pub enabled: bool,
    /// Collector endpoint.
    pub otlp_endpoint: String,
    /// Service name on exported spans.
    pub service_name: String,
    /// Extra directives from `RUST_LOG`.
    pub log_directives: Option<String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            otlp_endpoint: DEFAULT_OTLP_ENDPOINT.to_owned(),
            service_name: DEFAULT_SERVICE_NAME.to_owned(),
            log_directives: None,
        }
    }
}

impl TelemetryConfig {
    /// Read the settings from the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read the settings through `lookup`. Unset and empty values fall back
    /// to the defaults.
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        let defaults = Self::default();
        Self {
            enabled: get("OTEL_ENABLED").is_some_and(|v| v.trim().eq_ignore_ascii_case("true")),
            otlp_endpoint: get("OTEL_EXPORTER_OTLP_ENDPOINT").unwrap_or(defaults.otlp_endpoint),
            service_name: get("OTEL_SERVICE_NAME").unwrap_or(defaults.service_name),
            log_directives: get("RUST_LOG"),
        }
    }

    /// Build the log filter: the defaults, then each `RUST_LOG` directive.
    ///
    /// # Errors
    ///
    /// Returns `Directive` if a `RUST_LOG` directive does not parse.
    pub fn env_filter(&self) -> Result<EnvFilter, TelemetryError> {
        let extra = self
            .log_directives
            .as_deref()
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|d| !d.is_empty());

        let mut filter = EnvFilter::default();
        for directive in DEFAULT_DIRECTIVES.iter().copied().chain(extra) {
            filter = filter.add_directive(directive.parse()?);
        }
        Ok(filter)
    }
}

/// Install the subscriber using settings from the environment.
///
/// Keep the guard alive until exit.
///
/// # Errors
///
/// See [`init_with_config`].
pub fn init() -> Result<TelemetryGuard, TelemetryError> {
    init_with_config(&TelemetryConfig::from_env())
}

/// Install the subscriber: filter, stderr formatter, and optionally the
/// OTLP span exporter.
///
/// # Errors
///
/// Returns an error if the filter does not parse, the exporter cannot be
/// built, or a subscriber is already installed.
pub fn init_with_config(config: &TelemetryConfig) -> Result<TelemetryGuard, TelemetryError> {
    let filter = config.env_filter()?;

    // The facade runtime thread is named `orderly-stream`.
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_names(true);

    if !config.enabled {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer)
            .try_init()?;
        return Ok(TelemetryGuard {
            tracer_provider: None,
        });
    }

    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(&config.otlp_endpoint)
        .build()
        .map_err(|e| TelemetryError::Exporter {
            endpoint: config.otlp_endpoint.clone(),
            message: e.to_string(),
        })?;
    let tracer_provider = SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(
            opentelemetry_sdk::Resource::builder()
                .with_service_name(config.service_name.clone())
                .build(),
        )
        .build();
    let otel_layer =
        tracing_opentelemetry::layer().with_tracer(tracer_provider.tracer(config.service_name.clone()));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .with(otel_layer)
        .try_init()?;

    Ok(TelemetryGuard {
        tracer_provider: Some(tracer_provider),
    })
}

// =============================================================================
// Spans
// =============================================================================

/// Span a connection driver runs in.
#[must_use]
pub fn connection_span(channel: Channel, url: &str) -> Span {
    tracing::info_span!("orderly_stream", endpoint = %channel, url = %url)
}

/// Span a facade listener runs in.
#[must_use]
pub fn listener_span(socket: &str, topic: &str) -> Span {
    tracing::info_span!("orderly_listener", socket = %socket, topic = %topic)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn unset_environment_uses_defaults() {
        let config = TelemetryConfig::from_lookup(lookup(&[]));
        assert_eq!(config, TelemetryConfig::default());
        assert_eq!(config.service_name, env!("CARGO_PKG_NAME"));
    }

    #[test]
    fn environment_overrides_defaults() {
        let config = TelemetryConfig::from_lookup(lookup(&[
            ("OTEL_ENABLED", " TRUE "),
            ("OTEL_EXPORTER_OTLP_ENDPOINT", "http://collector:4317"),
            ("OTEL_SERVICE_NAME", ""),
            ("RUST_LOG", "orderly_stream_client=debug"),
        ]));
        assert!(config.enabled);
        assert_eq!(config.otlp_endpoint, "http://collector:4317");
        assert_eq!(config.service_name, DEFAULT_SERVICE_NAME);
        assert_eq!(config.log_directives.as_deref(), Some("orderly_stream_client=debug"));
    }

    #[test]
    fn rust_log_replaces_default_directive_for_same_target() {
        let config = TelemetryConfig {
            log_directives: Some("orderly_stream_client=debug, tungstenite=trace".to_owned()),
            ..TelemetryConfig::default()
        };
        let rendered = config.env_filter().unwrap().to_string().to_lowercase();
        assert!(rendered.contains("orderly_stream_client=debug"));
        assert!(!rendered.contains("orderly_stream_client=info"));
        assert!(rendered.contains("tungstenite=trace"));
        assert!(rendered.contains("h2=warn"));
    }

    #[test]
    fn invalid_rust_log_is_an_error() {
        let config = TelemetryConfig {
            log_directives: Some("orderly_stream_client=loud".to_owned()),
            ..TelemetryConfig::default()
        };
        assert!(matches!(
            config.env_filter(),
            Err(TelemetryError::Directive(_))
        ));
    }

    #[test]
    fn default_directives_parse() {
        assert!(TelemetryConfig::default().env_filter().is_ok());
    }
}

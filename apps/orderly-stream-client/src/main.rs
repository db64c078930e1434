//! Orderly Stream Client Binary
//!
//! Streams Orderly topics to stdout.
//!
//! # Usage
//!
//! ```bash
//! cargo run -p orderly-stream-client -- public              # bbos
//! cargo run -p orderly-stream-client -- private             # position
//! cargo run -p orderly-stream-client -- orderbook PERP_ETH_USDC
//! cargo run -p orderly-stream-client -- threaded            # facade demo
//! ```
//!
//! # Environment Variables
//!
//! ## Required
//! - `ORDERLY_ACCOUNT_ID`: Orderly account id
//!
//! ## Optional
//! - `ORDERLY_KEY` / `ORDERLY_SECRET`: Key pair (required for `private`)
//! - `ORDERLY_ENV`: mainnet | testnet (default: testnet)
//! - `ORDERLY_WS_PUBLIC_ENDPOINT` / `ORDERLY_WS_PRIVATE_ENDPOINT`: Endpoint overrides
//! - `ORDERLY_STREAM_READ_TIMEOUT_SECS`: Read timeout (default: 60)
//! - `ORDERLY_STREAM_QUEUE_TIMEOUT_SECS`: Queue wait window (default: 10)
//! - `ORDERLY_STREAM_MAX_RECONNECTS`: Retries before giving up (default: 5)
//! - `ORDERLY_STREAM_MAX_BACKOFF_SECS`: Backoff cap (default: 60)
//! - `ORDERLY_STREAM_QUEUE_CAPACITY`: Messages kept per topic (default: 100)
//! - `ORDERLY_STREAM_METRICS_PORT`: Prometheus port, 0 disables (default: 0)
//! - `OTEL_ENABLED`: Export spans over OTLP (default: false)
//! - `RUST_LOG`: Log level (default: info)

use anyhow::{Context, bail};
use orderly_stream_client::infrastructure::telemetry;
use orderly_stream_client::{
    StreamClient, StreamError, StreamSettings, ThreadedStreamManager, init_metrics,
    orderbook_topic,
};
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::signal;
use tokio::task::JoinHandle;

/// What the binary streams.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Mode {
    Public,
    Private,
    Orderbook(String),
    Threaded,
}

impl Mode {
    fn from_args(mut args: impl Iterator<Item = String>) -> anyhow::Result<Self> {
        match args.next().as_deref() {
            None | Some("public") => Ok(Self::Public),
            Some("private") => Ok(Self::Private),
            Some("orderbook") => {
                let symbol = args.next().context("orderbook mode needs a SYMBOL")?;
                Ok(Self::Orderbook(symbol))
            }
            Some("threaded") => Ok(Self::Threaded),
            Some(other) => bail!("unknown mode {other:?}; expected public | private | orderbook SYMBOL | threaded"),
        }
    }
}

fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls crypto provider"))?;

    load_dotenv();

    let _telemetry_guard = telemetry::init()?;
    let mode = Mode::from_args(std::env::args().skip(1))?;
    let settings = StreamSettings::from_env()?;
    log_config(&settings);

    // The facade owns its own runtime thread; everything else runs here.
    if mode == Mode::Threaded {
        return run_threaded(settings);
    }

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(run_async(mode, settings))
}

async fn run_async(mode: Mode, settings: StreamSettings) -> anyhow::Result<()> {
    if let Some(addr) = init_metrics(settings.metrics_port)? {
        tracing::info!(%addr, "Prometheus exporter listening");
    }

    let (client, topic) = match &mode {
        Mode::Public => (StreamClient::public(&settings), "bbos".to_owned()),
        Mode::Private => (StreamClient::private(&settings)?, "position".to_owned()),
        Mode::Orderbook(symbol) => (StreamClient::public(&settings), orderbook_topic(symbol)),
        Mode::Threaded => bail!("threaded mode runs without an async runtime"),
    };

    let driver = client.start(&Handle::current())?;
    match &mode {
        Mode::Orderbook(symbol) => client.request(symbol).await?,
        _ => client.subscribe(&topic).await?,
    }
    tracing::info!(topic, state = %client.state(), "Streaming");

    let printer = spawn_printer(client.clone(), topic);
    let result = tokio::select! {
        () = await_shutdown() => Ok(()),
        joined = driver => joined.context("stream driver panicked")?,
    };

    client.close();
    let _ = printer.await;
    match result {
        Ok(()) => {
            tracing::info!("Stream client stopped");
            Ok(())
        }
        Err(StreamError::ExhaustedRetries(attempts)) => {
            bail!("gave up after {attempts} reconnect attempts")
        }
        Err(e) => Err(e.into()),
    }
}

fn spawn_printer(client: StreamClient, topic: String) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Ok(message) = client.recv(&topic).await {
            print_message(&topic, &message);
        }
    })
}

fn run_threaded(settings: StreamSettings) -> anyhow::Result<()> {
    let private = settings.has_keys();
    let manager = ThreadedStreamManager::new(settings)?;

    manager.start_socket(
        "bbos",
        "bbos",
        |message| print_message("bbos", &message),
        Some(Box::new(|| tracing::debug!("ping"))),
        false,
    )?;
    if private {
        manager.start_socket(
            "position",
            "position",
            |message| print_message("position", &message),
            None,
            true,
        )?;
    }

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(await_shutdown());

    manager.stop();
    manager.join();
    tracing::info!("Stream manager stopped");
    Ok(())
}

fn print_message(topic: &str, message: &Value) {
    println!("{topic}: {message}");
}

/// Load .env file from current or ancestor directories.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Log the parsed configuration.
fn log_config(settings: &StreamSettings) {
    tracing::info!(
        environment = settings.environment.as_str(),
        account_id = %settings.account_id,
        private_keys = settings.has_keys(),
        read_timeout_secs = settings.read_timeout.as_secs(),
        max_reconnects = settings.max_reconnects,
        metrics_port = settings.metrics_port,
        "Configuration loaded"
    );
    tracing::debug!(
        public_endpoint = %settings.public_endpoint,
        private_endpoint = %settings.private_endpoint,
        "WebSocket endpoints"
    );
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
#[allow(clippy::expect_used)]
async fn await_shutdown() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("signal handler installation is critical for graceful shutdown");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler installation is critical for graceful shutdown")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, shutting down");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, shutting down");
        }
    }
}

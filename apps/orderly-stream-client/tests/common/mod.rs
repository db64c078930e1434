//! Local Orderly-like WebSocket server for integration tests.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::io::Write;
use std::net::SocketAddr;
use std::time::Duration;

use flate2::Compression;
use flate2::write::GzEncoder;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;

use orderly_stream_client::{Channel, ClientConfig, ReconnectConfig};

pub const WAIT: Duration = Duration::from_secs(5);

pub type ServerSocket = WebSocketStream<TcpStream>;

/// Accepts WebSocket connections and hands each one to the test.
pub struct MockServer {
    addr: SocketAddr,
    connections: mpsc::UnboundedReceiver<ServerSocket>,
    task: JoinHandle<()>,
}

impl MockServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, connections) = mpsc::unbounded_channel();
        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                if let Ok(ws) = tokio_tungstenite::accept_async(stream).await {
                    if tx.send(ws).is_err() {
                        break;
                    }
                }
            }
        });
        Self {
            addr,
            connections,
            task,
        }
    }

    /// Endpoint URL with an account id appended, as the client expects.
    pub fn url(&self) -> String {
        format!("ws://{}/ws/stream/0xabc", self.addr)
    }

    /// Wait for the next client connection.
    pub async fn accept(&mut self) -> ServerSocket {
        tokio::time::timeout(WAIT, self.connections.recv())
            .await
            .expect("no connection within timeout")
            .expect("server stopped")
    }

    /// Stop listening; later connects are refused.
    pub async fn stop_listening(&self) {
        self.task.abort();
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Client configuration pointed at `url` with fast backoff.
pub fn config(channel: Channel, url: &str, max_reconnects: u32) -> ClientConfig {
    ClientConfig::new(channel, url)
        .with_read_timeout(Duration::from_secs(3))
        .with_queue_timeout(Duration::from_millis(200))
        .with_reconnect(ReconnectConfig::new(
            Duration::from_millis(50),
            Duration::from_millis(10),
            max_reconnects,
        ))
}

/// Read the next JSON text frame the client sent.
pub async fn next_json(ws: &mut ServerSocket) -> Value {
    tokio::time::timeout(WAIT, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => return serde_json::from_str(&text).unwrap(),
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                other => panic!("unexpected client message: {other:?}"),
            }
        }
    })
    .await
    .expect("no frame within timeout")
}

/// Send a JSON text frame.
pub async fn send_json(ws: &mut ServerSocket, value: &Value) {
    ws.send(Message::Text(value.to_string().into())).await.unwrap();
}

/// Send a gzip-compressed JSON binary frame.
pub async fn send_gzip(ws: &mut ServerSocket, value: &Value) {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(value.to_string().as_bytes()).unwrap();
    let bytes = encoder.finish().unwrap();
    ws.send(Message::Binary(bytes.into())).await.unwrap();
}

//! WebSocket Transport
//!
//! tokio-tungstenite implementation of the [`Connector`] and [`Transport`]
//! ports. TLS uses rustls with the webpki root store.
//!
//! WebSocket control pings are answered here and never reach the frame
//! codec; JSON-level `{"event":"ping"}` frames are passed through for the
//! heartbeat handler.

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::application::ports::{Connector, RawFrame, Transport, TransportError};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Opens WebSocket connections.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

impl WsConnector {
    /// Create a connector.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn Transport>, TransportError> {
        let (stream, response) =
            tokio_tungstenite::connect_async(url)
                .await
                .map_err(|e| TransportError::Connect {
                    message: e.to_string(),
                })?;
        tracing::debug!(status = %response.status(), "WebSocket handshake complete");
        let (write, read) = stream.split();
        Ok(Box::new(WsTransport { write, read }))
    }
}

/// One open WebSocket.
pub struct WsTransport {
    write: SplitSink<WsStream, Message>,
    read: SplitStream<WsStream>,
}

impl std::fmt::Debug for WsTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsTransport").finish_non_exhaustive()
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn send(&mut self, frame: RawFrame) -> Result<(), TransportError> {
        let message = match frame {
            RawFrame::Text(text) => Message::Text(text.into()),
            RawFrame::Binary(bytes) => Message::Binary(bytes.into()),
            RawFrame::Close(_) => Message::Close(None),
        };
        self.write
            .send(message)
            .await
            .map_err(|e| TransportError::Send {
                message: e.to_string(),
            })
    }

    async fn recv(&mut self) -> Result<RawFrame, TransportError> {
        loop {
            match self.read.next().await {
                Some(Ok(Message::Text(text))) => return Ok(RawFrame::Text(text.as_str().to_owned())),
                Some(Ok(Message::Binary(bytes))) => return Ok(RawFrame::Binary(bytes.to_vec())),
                Some(Ok(Message::Ping(data))) => {
                    tracing::trace!("Answering WebSocket ping");
                    self.write
                        .send(Message::Pong(data))
                        .await
                        .map_err(|e| TransportError::Send {
                            message: e.to_string(),
                        })?;
                }
                Some(Ok(Message::Pong(_) | Message::Frame(_))) => {}
                Some(Ok(Message::Close(frame))) => {
                    return Ok(RawFrame::Close(
                        frame.map(|f| f.reason.as_str().to_owned()).filter(|r| !r.is_empty()),
                    ));
                }
                Some(Err(e)) => {
                    return Err(TransportError::Receive {
                        message: e.to_string(),
                    });
                }
                None => return Err(TransportError::Closed),
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.write.close().await {
            tracing::debug!(error = %e, "WebSocket close failed");
        }
    }
}

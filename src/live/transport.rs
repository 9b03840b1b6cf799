//! Bidirectional transport for the live session

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::error::{ConnectionError, ProtocolError};
use crate::{Error, Result};

/// An open, message-oriented connection carrying JSON payloads
#[async_trait]
pub trait Transport: Send {
    /// Write one payload; resolves when the write completes
    async fn send(&mut self, payload: String) -> Result<()>;

    /// Next inbound payload, `None` once the peer has closed
    ///
    /// Must be cancel-safe: the session polls it inside `select!`.
    async fn recv(&mut self) -> Option<Result<String>>;

    /// Close the connection
    async fn close(&mut self);
}

/// Opens transports
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a fresh transport
    async fn connect(&self) -> Result<Box<dyn Transport>>;
}

/// Connects over WebSocket (TLS when the URL is `wss://`)
pub struct WebSocketConnector {
    url: String,
}

impl WebSocketConnector {
    /// Create a connector for an endpoint URL
    ///
    /// The API key, when given, is appended as the `key` query parameter.
    #[must_use]
    pub fn new(endpoint: &str, api_key: Option<&str>) -> Self {
        let url = match api_key {
            Some(key) if endpoint.contains('?') => format!("{endpoint}&key={key}"),
            Some(key) => format!("{endpoint}?key={key}"),
            None => endpoint.to_string(),
        };
        Self { url }
    }

    /// Endpoint with credentials stripped, for logging
    #[must_use]
    pub fn redacted_url(&self) -> &str {
        self.url.split_once('?').map_or(&self.url, |(base, _)| base)
    }
}

impl std::fmt::Debug for WebSocketConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketConnector")
            .field("url", &self.redacted_url())
            .finish()
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self) -> Result<Box<dyn Transport>> {
        tracing::debug!(url = %self.redacted_url(), "opening websocket");
        let (stream, response) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| ConnectionError::Transport(e.to_string()))?;
        tracing::debug!(status = %response.status(), "websocket established");
        Ok(Box::new(WebSocketTransport { stream }))
    }
}

/// WebSocket-backed transport
pub struct WebSocketTransport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn send(&mut self, payload: String) -> Result<()> {
        self.stream
            .send(Message::Text(payload))
            .await
            .map_err(|e| ConnectionError::Transport(e.to_string()).into())
    }

    async fn recv(&mut self) -> Option<Result<String>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text)),
                // The server frames JSON as binary as often as text
                Ok(Message::Binary(bytes)) => {
                    return Some(String::from_utf8(bytes).map_err(|e| {
                        Error::Protocol(ProtocolError::Malformed(format!(
                            "binary frame is not utf-8: {e}"
                        )))
                    }));
                }
                Ok(Message::Close(frame)) => {
                    tracing::debug!(?frame, "websocket closed by peer");
                    return None;
                }
                Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => {}
                Err(e) => return Some(Err(ConnectionError::Transport(e.to_string()).into())),
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.stream.close(None).await {
            tracing::debug!(error = %e, "websocket close failed");
        }
    }
}

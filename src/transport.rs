//! WebSocket transport layer
//!
//! Single responsibility: move text frames between the client and the hub.
//! No knowledge of authentication, command ids, or session management.
//!
//! The session talks to the socket through the [`TransportSink`] /
//! [`TransportStream`] traits with a [`Connector`] minting new pairs on
//! reconnect, so tests can swap the real socket for an in-memory channel.

use async_trait::async_trait;
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::protocol::Message,
    MaybeTlsStream, WebSocketStream,
};
use tracing::debug;
use url::Url;

use crate::error::{HearthError, Result};

/// Type alias for the WebSocket send half
pub type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>, Message>;

/// Type alias for the WebSocket receive half
pub type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>>;

/// Outbound half of a connected transport.
#[async_trait]
pub trait TransportSink: Send {
    /// Send one text frame.
    async fn send(&mut self, text: String) -> Result<()>;

    /// Close the socket. Best effort; the peer may already be gone.
    async fn close(&mut self);
}

/// Inbound half of a connected transport.
#[async_trait]
pub trait TransportStream: Send {
    /// Receive the next text frame.
    ///
    /// Returns `Ok(None)` once the socket is closed. Transport errors also
    /// terminate the stream from the session's point of view.
    async fn next_frame(&mut self) -> Result<Option<String>>;
}

/// Mints connected transports. The session calls this once at startup and
/// again on every reconnect attempt.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<(Box<dyn TransportSink>, Box<dyn TransportStream>)>;
}

/// The real connector: tokio-tungstenite over TCP/TLS.
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    /// Connect to an explicit `ws://` / `wss://` endpoint.
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    /// Connect to a hub given its base URL, deriving the WebSocket
    /// endpoint (`http://hub:8123` becomes `ws://hub:8123/api/websocket`).
    pub fn for_hub(base_url: &str) -> Result<Self> {
        Ok(Self { url: hub_ws_url(base_url)? })
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> Result<(Box<dyn TransportSink>, Box<dyn TransportStream>)> {
        debug!(url = %self.url, "Connecting to hub WebSocket");

        let (ws, _) = connect_async(&self.url)
            .await
            .map_err(|e| HearthError::Transport(format!("WebSocket connect failed: {}", e)))?;
        let (sink, stream) = ws.split();

        debug!(url = %self.url, "WebSocket connected");
        Ok((
            Box::new(WsSocketSink { sink }),
            Box::new(WsSocketStream { stream }),
        ))
    }
}

struct WsSocketSink {
    sink: WsSink,
}

#[async_trait]
impl TransportSink for WsSocketSink {
    async fn send(&mut self, text: String) -> Result<()> {
        self.sink
            .send(Message::Text(text))
            .await
            .map_err(|e| HearthError::Transport(format!("Failed to send: {}", e)))
    }

    async fn close(&mut self) {
        if let Err(e) = self.sink.send(Message::Close(None)).await {
            debug!(error = %e, "Close frame not delivered");
        }
    }
}

struct WsSocketStream {
    stream: WsStream,
}

#[async_trait]
impl TransportStream for WsSocketStream {
    async fn next_frame(&mut self) -> Result<Option<String>> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return Ok(Some(text)),
                Some(Ok(Message::Close(_))) => return Ok(None),
                Some(Ok(Message::Ping(_))) => {
                    // Pong is handled automatically by tungstenite
                    continue;
                }
                Some(Ok(_)) => continue, // Skip binary, pong, raw frames
                Some(Err(e)) => {
                    return Err(HearthError::Transport(format!("WebSocket error: {}", e)))
                }
                None => return Ok(None), // Stream ended
            }
        }
    }
}

/// Derive the hub's WebSocket endpoint from its base URL.
pub fn hub_ws_url(base_url: &str) -> Result<String> {
    let mut url = Url::parse(base_url)
        .map_err(|e| HearthError::Transport(format!("Invalid hub URL '{}': {}", base_url, e)))?;

    let scheme = match url.scheme() {
        "http" => "ws",
        "https" => "wss",
        "ws" | "wss" => url.scheme(),
        other => {
            return Err(HearthError::Transport(format!(
                "Unsupported hub URL scheme '{}'",
                other
            )))
        }
    };
    let scheme = scheme.to_string();
    url.set_scheme(&scheme)
        .map_err(|_| HearthError::Transport(format!("Invalid hub URL '{}'", base_url)))?;
    url.set_path("/api/websocket");
    url.set_query(None);
    url.set_fragment(None);

    Ok(url.to_string())
}

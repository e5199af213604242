//! In-memory hub for integration tests
//!
//! A [`FakeConnector`] mints channel-backed socket pairs instead of real
//! WebSockets. Each accepted connection surfaces as a [`HubSocket`] the
//! test drives directly: read what the client sent, inject hub frames,
//! answer the auth exchange, or drop the socket to force a reconnect.

// Not every test binary uses every helper.
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing_subscriber::EnvFilter;

use hearth_client::protocol::at_least_version;
use hearth_client::transport::{Connector, TransportSink, TransportStream};
use hearth_client::{Credentials, HearthError, LongLivedToken, Result, Session, SessionConfig};

pub const TEST_TOKEN: &str = "test-token";

const WAIT: Duration = Duration::from_secs(5);

/// Route library traces into the test harness; enable with `RUST_LOG`.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Connector whose sockets are in-memory channels. Every successful
/// `connect` hands the matching [`HubSocket`] to the test through the hub.
pub struct FakeConnector {
    shared: Arc<ConnectorShared>,
}

struct ConnectorShared {
    sockets: mpsc::UnboundedSender<HubSocket>,
    fail_connects: AtomicUsize,
    connects: AtomicUsize,
}

/// Test-side view of the connector: accepted sockets in order.
pub struct FakeHub {
    sockets: mpsc::UnboundedReceiver<HubSocket>,
    shared: Arc<ConnectorShared>,
}

pub fn fake_connector() -> (Arc<FakeConnector>, FakeHub) {
    init_tracing();
    let (tx, rx) = mpsc::unbounded_channel();
    let shared = Arc::new(ConnectorShared {
        sockets: tx,
        fail_connects: AtomicUsize::new(0),
        connects: AtomicUsize::new(0),
    });
    (
        Arc::new(FakeConnector { shared: Arc::clone(&shared) }),
        FakeHub { sockets: rx, shared },
    )
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self) -> Result<(Box<dyn TransportSink>, Box<dyn TransportStream>)> {
        self.shared.connects.fetch_add(1, Ordering::SeqCst);
        let refused = self
            .shared
            .fail_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(HearthError::CannotConnect("connection refused".to_string()));
        }

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (close_tx, close_rx) = oneshot::channel();
        let _ = self.shared.sockets.send(HubSocket {
            outbound: out_rx,
            inject: in_tx,
        });
        Ok((
            Box::new(ChannelSink {
                out: Some(out_tx),
                close_tx: Some(close_tx),
            }),
            Box::new(ChannelStream {
                rx: in_rx,
                close_rx: Some(close_rx),
            }),
        ))
    }
}

impl FakeHub {
    /// Wait for the next connection attempt to hand over its socket.
    pub async fn next_socket(&mut self) -> HubSocket {
        timeout(WAIT, self.sockets.recv())
            .await
            .expect("timed out waiting for a connection")
            .expect("connector dropped")
    }

    /// True if no connection attempt is currently waiting.
    pub fn no_pending_socket(&mut self) -> bool {
        matches!(
            self.sockets.try_recv(),
            Err(mpsc::error::TryRecvError::Empty)
        )
    }

    pub fn connect_count(&self) -> usize {
        self.shared.connects.load(Ordering::SeqCst)
    }

    /// Make the next `n` connection attempts fail at the transport level.
    pub fn refuse_connects(&self, n: usize) {
        self.shared.fail_connects.store(n, Ordering::SeqCst);
    }
}

/// One accepted socket, seen from the hub side.
pub struct HubSocket {
    outbound: mpsc::UnboundedReceiver<String>,
    inject: mpsc::UnboundedSender<String>,
}

impl HubSocket {
    /// Next client frame as raw text, `None` once the client closed.
    pub async fn recv_raw(&mut self) -> Option<String> {
        timeout(WAIT, self.outbound.recv())
            .await
            .expect("timed out waiting for a client frame")
    }

    /// Next client frame, parsed. Panics if the client closed.
    pub async fn recv(&mut self) -> Value {
        let text = self.recv_raw().await.expect("client closed the socket");
        serde_json::from_str(&text).expect("client sent invalid JSON")
    }

    /// Next client frame, asserting its `type`.
    pub async fn expect_type(&mut self, expected: &str) -> Value {
        let frame = self.recv().await;
        assert_eq!(frame["type"], expected, "unexpected frame: {frame}");
        frame
    }

    /// True if the client has sent nothing further.
    pub fn no_pending_frame(&mut self) -> bool {
        matches!(
            self.outbound.try_recv(),
            Err(mpsc::error::TryRecvError::Empty)
        )
    }

    pub fn send(&self, frame: Value) {
        let _ = self.inject.send(frame.to_string());
    }

    pub fn send_raw(&self, text: &str) {
        let _ = self.inject.send(text.to_string());
    }

    pub fn result_ok(&self, id: u64, result: Value) {
        self.send(json!({ "id": id, "type": "result", "success": true, "result": result }));
    }

    pub fn result_err(&self, id: u64, code: &str, message: &str) {
        self.send(json!({
            "id": id,
            "type": "result",
            "success": false,
            "error": { "code": code, "message": message },
        }));
    }

    pub fn event(&self, id: u64, event: Value) {
        self.send(json!({ "id": id, "type": "event", "event": event }));
    }

    pub fn pong(&self, id: u64) {
        self.send(json!({ "id": id, "type": "pong" }));
    }

    /// Drop the hub side; the client sees a closed socket.
    pub fn close(self) {}

    /// Run the hub side of the auth exchange, reporting `version`.
    pub async fn auth_handshake(&mut self, version: &str) {
        self.send(json!({ "type": "auth_required", "ha_version": version }));
        let auth = self.expect_type("auth").await;
        assert_eq!(auth["access_token"], TEST_TOKEN);
        self.send(json!({ "type": "auth_ok", "ha_version": version }));
        if at_least_version(version, 2022, 9, 0) {
            let features = self.expect_type("supported_features").await;
            assert_eq!(features["id"], 1);
            self.result_ok(1, Value::Null);
        }
    }

    /// Reject the auth exchange.
    pub async fn auth_reject(&mut self, message: &str) {
        self.send(json!({ "type": "auth_required", "ha_version": "2023.1.0" }));
        let _auth = self.expect_type("auth").await;
        self.send(json!({ "type": "auth_invalid", "message": message }));
    }
}

struct ChannelSink {
    out: Option<mpsc::UnboundedSender<String>>,
    close_tx: Option<oneshot::Sender<()>>,
}

#[async_trait]
impl TransportSink for ChannelSink {
    async fn send(&mut self, text: String) -> Result<()> {
        match &self.out {
            Some(out) => out
                .send(text)
                .map_err(|_| HearthError::Transport("peer is gone".to_string())),
            None => Err(HearthError::Transport("socket closed".to_string())),
        }
    }

    async fn close(&mut self) {
        self.out = None;
        if let Some(tx) = self.close_tx.take() {
            let _ = tx.send(());
        }
    }
}

struct ChannelStream {
    rx: mpsc::UnboundedReceiver<String>,
    close_rx: Option<oneshot::Receiver<()>>,
}

#[async_trait]
impl TransportStream for ChannelStream {
    async fn next_frame(&mut self) -> Result<Option<String>> {
        let Some(close_rx) = self.close_rx.as_mut() else {
            return Ok(None);
        };
        tokio::select! {
            frame = self.rx.recv() => match frame {
                Some(text) => Ok(Some(text)),
                None => {
                    self.close_rx = None;
                    Ok(None)
                }
            },
            _ = close_rx => {
                self.close_rx = None;
                Ok(None)
            }
        }
    }
}

pub fn test_config() -> SessionConfig {
    SessionConfig {
        url: "ws://hub.test/api/websocket".to_string(),
        setup_retries: Some(0),
    }
}

pub fn test_credentials() -> Arc<dyn Credentials> {
    Arc::new(LongLivedToken::new(TEST_TOKEN))
}

/// Connect a session against a fresh fake hub, answering the handshake
/// with the given hub version.
pub async fn connect_session(version: &str) -> (Session, FakeHub, HubSocket) {
    let (connector, mut hub) = fake_connector();
    let (session, socket) = tokio::join!(
        Session::connect_with(connector, test_credentials(), test_config()),
        async {
            let mut socket = hub.next_socket().await;
            socket.auth_handshake(version).await;
            socket
        }
    );
    (session.expect("connect failed"), hub, socket)
}

//! Authenticated hub session
//!
//! A [`Session`] wraps one logical connection to the hub: it allocates
//! command ids, correlates results back to callers, fans subscription
//! events out to callbacks, and survives socket loss by reconnecting and
//! re-establishing subscriptions.
//!
//! A background task owns the socket's read half. Callers talk to the hub
//! through the shared write half; the task drives dispatch and recovery.
//! Holding a `Session` means the handshake already succeeded; there is no
//! half-connected state to poll for.
//!
//! Command lifecycle:
//! - plain commands live in the pending table until their `result` (or
//!   `pong`) arrives, and are rejected with `ConnectionLost` if the socket
//!   dies first;
//! - subscriptions stay in the table for their whole life, are carried
//!   across reconnects, and get re-registered on the new socket under a
//!   fresh id.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::auth::{Credentials, TokenGate};
use crate::error::{HearthError, Result};
use crate::handshake::{self, AuthenticatedSocket};
use crate::protocol::{self, ServerMessage};
use crate::transport::{Connector, TransportSink, TransportStream, WsConnector};

/// Reconnect delay grows by one step per failed attempt, capped at
/// [`MAX_BACKOFF_STEPS`] steps. Attempts continue indefinitely.
const RECONNECT_BACKOFF_STEP: Duration = Duration::from_secs(1);
const MAX_BACKOFF_STEPS: u32 = 5;

/// Configuration for [`Session::connect`].
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// WebSocket endpoint of the hub.
    pub url: String,
    /// Handshake retries before the initial connect gives up.
    /// `None` retries forever, `Some(0)` makes a single attempt.
    pub setup_retries: Option<u32>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:8123/api/websocket".to_string(),
            setup_retries: Some(0),
        }
    }
}

/// Options for [`Session::subscribe_with_options`].
#[derive(Debug, Clone, Copy)]
pub struct SubscribeOptions {
    /// Re-establish the subscription after a reconnect.
    pub resubscribe: bool,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self { resubscribe: true }
    }
}

/// Session lifecycle events observable via [`Session::add_event_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionEvent {
    /// A socket is authenticated and all queued traffic has been flushed.
    /// Fires after every successful reconnect as well.
    Ready,
    /// The socket was lost and recovery is starting. Does not fire for a
    /// user-requested close.
    Disconnected,
    /// Recovery was abandoned permanently. Credential rejection
    /// ([`HearthError::InvalidAuth`]) is the only condition that abandons
    /// recovery, so it is always the cause and the event carries no
    /// payload; the session behaves as closed from here on.
    ReconnectError,
}

/// Token identifying a registered lifecycle listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerId(u64);

type LifecycleCallback = Arc<dyn Fn(Session) + Send + Sync>;

/// Callback receiving subscription event payloads.
pub(crate) type EventCallback = Arc<dyn Fn(Value) + Send + Sync>;

type SharedSink = Arc<tokio::sync::Mutex<Box<dyn TransportSink>>>;
type ResumeFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Handle to an authenticated hub session. Cloning shares the session.
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Clone for Session {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl Session {
    /// Connect and authenticate against the hub at `config.url`.
    ///
    /// Resolves only once the handshake has fully succeeded; an auth
    /// rejection surfaces as [`HearthError::InvalidAuth`] without retries.
    pub async fn connect(config: SessionConfig, credentials: Arc<dyn Credentials>) -> Result<Self> {
        let connector = Arc::new(WsConnector::new(config.url.clone()));
        Self::connect_with(connector, credentials, config).await
    }

    /// Connect through a custom [`Connector`]. This is the seam the
    /// integration tests use to drive a session over in-memory channels.
    pub async fn connect_with(
        connector: Arc<dyn Connector>,
        credentials: Arc<dyn Credentials>,
        config: SessionConfig,
    ) -> Result<Self> {
        let credentials = TokenGate::new(credentials);
        let socket =
            handshake::establish(connector.as_ref(), &credentials, config.setup_retries).await?;

        let (ctrl_tx, ctrl_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(SessionInner {
            connector,
            credentials,
            state: Mutex::new(SessionState {
                link: None,
                next_id: protocol::FIRST_COMMAND_ID,
                pending: HashMap::new(),
                queue: None,
                suspend_until: None,
                close_requested: false,
                ha_version: String::new(),
                generation: 0,
            }),
            listeners: Mutex::new(Vec::new()),
            next_listener_id: AtomicU64::new(1),
            collections: Mutex::new(HashMap::new()),
            ctrl_tx,
        });

        let stream = install_socket(&inner, socket, Vec::new()).await;
        tokio::spawn(session_task(Arc::downgrade(&inner), stream, ctrl_rx));

        Ok(Self { inner })
    }

    /// Fire-and-forget send. Consumes the next command id like any other
    /// send, but no result is awaited and nothing is registered for the id.
    ///
    /// While the session is replaying a suspension the message is queued
    /// and flushed, in submission order, once the socket is back; a queued
    /// message takes its id from the socket it is flushed onto.
    pub async fn send_message(&self, message: Value) -> Result<()> {
        if !message.is_object() {
            return Err(HearthError::Internal(
                "message must be a JSON object".to_string(),
            ));
        }

        let (sink, text) = {
            let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(queue) = state.queue.as_mut() {
                queue.push(QueuedSend::Message(message));
                return Ok(());
            }
            match &state.link {
                Some(link) => {
                    let sink = Arc::clone(&link.sink);
                    let id = state.next_id;
                    state.next_id += 1;
                    (sink, with_id(message, id).to_string())
                }
                None => return Err(HearthError::ConnectionLost),
            }
        };

        if let Err(e) = sink.lock().await.send(text).await {
            debug!(error = %e, "Fire-and-forget send failed");
            return Err(HearthError::ConnectionLost);
        }
        Ok(())
    }

    /// Send a command and await its result payload.
    ///
    /// The session assigns the `id`; the caller's message must be a JSON
    /// object. A `success: false` answer resolves to
    /// [`HearthError::Command`]; a socket loss before the answer resolves
    /// to [`HearthError::ConnectionLost`].
    pub async fn send_command(&self, message: Value) -> Result<Value> {
        if !message.is_object() {
            return Err(HearthError::Internal(
                "command message must be a JSON object".to_string(),
            ));
        }

        let (rx, dispatch) = {
            let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(queue) = state.queue.as_mut() {
                let (tx, rx) = oneshot::channel();
                queue.push(QueuedSend::Command { message, response: tx });
                (rx, None)
            } else {
                match &state.link {
                    Some(link) => {
                        let sink = Arc::clone(&link.sink);
                        let id = state.next_id;
                        state.next_id += 1;
                        let (tx, rx) = oneshot::channel();
                        state.pending.insert(id, PendingEntry::Command { tx });
                        let text = with_id(message, id).to_string();
                        (rx, Some((sink, text)))
                    }
                    None => return Err(HearthError::ConnectionLost),
                }
            }
        };

        if let Some((sink, text)) = dispatch {
            if let Err(e) = sink.lock().await.send(text).await {
                // Entry stays pending; recovery rejects it when it drains
                // the table.
                debug!(error = %e, "Command send failed, awaiting recovery");
            }
        }

        rx.await.map_err(|_| HearthError::ConnectionLost)?
    }

    /// Round-trip liveness probe, resolved by the hub's `pong`.
    pub async fn ping(&self) -> Result<()> {
        self.send_command(protocol::ping_message()).await.map(|_| ())
    }

    /// Start a subscription: `message` is sent with a fresh id and
    /// `callback` receives every `event` the hub addresses to that id.
    ///
    /// Resolves once the hub acks the subscription, to an idempotent
    /// [`Unsubscriber`]. The subscription is restored automatically after
    /// reconnects.
    pub async fn subscribe(
        &self,
        message: Value,
        callback: impl Fn(Value) + Send + Sync + 'static,
    ) -> Result<Unsubscriber> {
        self.subscribe_with_options(message, callback, SubscribeOptions::default())
            .await
    }

    pub async fn subscribe_with_options(
        &self,
        message: Value,
        callback: impl Fn(Value) + Send + Sync + 'static,
        options: SubscribeOptions,
    ) -> Result<Unsubscriber> {
        if !message.is_object() {
            return Err(HearthError::Internal(
                "subscribe message must be a JSON object".to_string(),
            ));
        }
        let callback: EventCallback = Arc::new(callback);

        // While a suspension is replaying, wait in line behind the queued
        // sends. The queue check and the registration share one lock
        // acquisition so a suspension starting in between cannot be missed.
        let (rx, anchor, sink, text) = loop {
            let waiter = {
                let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(queue) = state.queue.as_mut() {
                    let (tx, rx) = oneshot::channel();
                    queue.push(QueuedSend::Waiter(tx));
                    rx
                } else if state.close_requested {
                    return Err(HearthError::ConnectionLost);
                } else {
                    let Some(link) = &state.link else {
                        return Err(HearthError::ConnectionLost);
                    };
                    let sink = Arc::clone(&link.sink);

                    let id = state.next_id;
                    state.next_id += 1;
                    let (tx, rx) = oneshot::channel();
                    let anchor = Arc::new(SubscriptionAnchor {
                        current_id: Mutex::new(Some(id)),
                    });
                    let text = with_id(message.clone(), id).to_string();
                    state.pending.insert(
                        id,
                        PendingEntry::Subscription(SubscriptionEntry {
                            callback,
                            message,
                            resubscribe: options.resubscribe,
                            ack: Some(tx),
                            anchor: Arc::clone(&anchor),
                        }),
                    );
                    break (rx, anchor, sink, text);
                }
            };
            waiter.await.map_err(|_| HearthError::ConnectionLost)??;
        };

        if let Err(e) = sink.lock().await.send(text).await {
            // Recovery re-sends the registration on the next socket.
            debug!(error = %e, "Subscribe send failed, awaiting recovery");
        }

        rx.await.map_err(|_| HearthError::ConnectionLost)??;
        Ok(Unsubscriber {
            session: Arc::downgrade(&self.inner),
            anchor,
        })
    }

    /// Subscribe to hub event-bus events, optionally filtered by type.
    pub async fn subscribe_events(
        &self,
        event_type: Option<&str>,
        callback: impl Fn(Value) + Send + Sync + 'static,
    ) -> Result<Unsubscriber> {
        self.subscribe(protocol::subscribe_events_message(event_type), callback)
            .await
    }

    /// Register a lifecycle listener. The returned token removes it.
    pub fn add_event_listener(
        &self,
        event: SessionEvent,
        callback: impl Fn(Session) + Send + Sync + 'static,
    ) -> ListenerId {
        let id = self.inner.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((event, id, Arc::new(callback)));
        ListenerId(id)
    }

    pub fn remove_event_listener(&self, listener: ListenerId) {
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|(_, id, _)| *id != listener.0);
    }

    /// Defer the next reconnect until `resume` completes. Pair with
    /// [`suspend`](Self::suspend); typically used around host sleep.
    pub fn suspend_reconnect_until(&self, resume: impl Future<Output = ()> + Send + 'static) {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .suspend_until = Some(Box::pin(resume));
    }

    /// Drop the socket now; recovery waits on the stored resume future
    /// before reconnecting, and queues sends issued in the meantime.
    pub async fn suspend(&self) -> Result<()> {
        let sink = {
            let state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
            if state.suspend_until.is_none() {
                return Err(HearthError::Internal(
                    "suspend requires suspend_reconnect_until".to_string(),
                ));
            }
            state.link.as_ref().map(|link| Arc::clone(&link.sink))
        };
        if let Some(sink) = sink {
            sink.lock().await.close().await;
        }
        Ok(())
    }

    /// Close the socket and let normal recovery bring it back.
    pub async fn reconnect(&self) {
        let sink = {
            let state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
            state.link.as_ref().map(|link| Arc::clone(&link.sink))
        };
        if let Some(sink) = sink {
            sink.lock().await.close().await;
        }
    }

    /// Detach the current socket and recover immediately, without waiting
    /// for its close handshake. The stale socket's close is not processed
    /// twice.
    pub async fn force_reconnect(&self) {
        let target = {
            let state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
            state
                .link
                .as_ref()
                .map(|link| (Arc::clone(&link.sink), link.generation))
        };
        let Some((sink, generation)) = target else { return };

        // Detach first; the close below is a courtesy to the peer.
        let _ = self.inner.ctrl_tx.send(Ctrl::ForceReconnect { generation });
        sink.lock().await.close().await;
    }

    /// Shut the session down. Pending commands are rejected, no reconnect
    /// is attempted, and no `Disconnected` event fires.
    pub async fn close(&self) {
        let sink = {
            let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
            state.close_requested = true;
            state.link.as_ref().map(|link| Arc::clone(&link.sink))
        };
        if let Some(sink) = sink {
            sink.lock().await.close().await;
        }
    }

    pub fn connected(&self) -> bool {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .link
            .is_some()
    }

    /// Version string the hub reported in `auth_ok`.
    pub fn ha_version(&self) -> String {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .ha_version
            .clone()
    }

    pub(crate) fn downgrade(&self) -> WeakSession {
        WeakSession {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub(crate) fn collections(&self) -> &Mutex<HashMap<String, Arc<dyn Any + Send + Sync>>> {
        &self.inner.collections
    }
}

/// Weak session handle for callbacks that must not keep the session alive.
pub(crate) struct WeakSession {
    inner: Weak<SessionInner>,
}

impl Clone for WeakSession {
    fn clone(&self) -> Self {
        Self { inner: Weak::clone(&self.inner) }
    }
}

impl WeakSession {
    pub(crate) fn upgrade(&self) -> Option<Session> {
        self.inner.upgrade().map(|inner| Session { inner })
    }
}

/// Idempotent handle that cancels one subscription.
///
/// Safe to call repeatedly and safe after the session is gone (both are
/// local no-ops). Wire delivery of the unsubscribe is best effort.
pub struct Unsubscriber {
    session: Weak<SessionInner>,
    anchor: Arc<SubscriptionAnchor>,
}

impl Unsubscriber {
    pub async fn unsubscribe(&self) {
        let id = self
            .anchor
            .current_id
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(id) = id else { return };
        let Some(inner) = self.session.upgrade() else { return };
        let session = Session { inner };

        let connected = session
            .inner
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .link
            .is_some();
        if connected {
            if let Err(e) = session
                .send_command(protocol::unsubscribe_events_message(id))
                .await
            {
                debug!(id, error = %e, "Unsubscribe not delivered");
            }
        }
        session
            .inner
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pending
            .remove(&id);
    }
}

// ---------------------------------------------------------------------------
// Internals
// ---------------------------------------------------------------------------

struct SessionInner {
    connector: Arc<dyn Connector>,
    credentials: TokenGate,
    state: Mutex<SessionState>,
    listeners: Mutex<Vec<(SessionEvent, u64, LifecycleCallback)>>,
    next_listener_id: AtomicU64,
    /// Per-key collection cache entries, managed by the collection module.
    collections: Mutex<HashMap<String, Arc<dyn Any + Send + Sync>>>,
    ctrl_tx: mpsc::UnboundedSender<Ctrl>,
}

impl SessionInner {
    fn fire_event(self: &Arc<Self>, event: SessionEvent) {
        let snapshot: Vec<LifecycleCallback> = {
            let listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
            listeners
                .iter()
                .filter(|(e, _, _)| *e == event)
                .map(|(_, _, cb)| Arc::clone(cb))
                .collect()
        };
        if snapshot.is_empty() {
            return;
        }
        let session = Session { inner: Arc::clone(self) };
        for callback in snapshot {
            callback(session.clone());
        }
    }
}

struct SessionState {
    link: Option<Link>,
    next_id: u64,
    pending: HashMap<u64, PendingEntry>,
    /// `Some` only while replaying a suspension: sends buffer here until
    /// the next socket is installed (or the first reconnect attempt fails).
    queue: Option<Vec<QueuedSend>>,
    suspend_until: Option<ResumeFuture>,
    close_requested: bool,
    ha_version: String,
    generation: u64,
}

struct Link {
    sink: SharedSink,
    generation: u64,
}

enum PendingEntry {
    Command {
        tx: oneshot::Sender<Result<Value>>,
    },
    Subscription(SubscriptionEntry),
}

struct SubscriptionEntry {
    callback: EventCallback,
    /// Original subscribe payload without an id, re-sent on reconnect.
    message: Value,
    resubscribe: bool,
    /// Resolves the caller's `subscribe` future on the first ack. Taken on
    /// resolution, so a resubscribe ack after a reconnect is a no-op for
    /// callers that already completed.
    ack: Option<oneshot::Sender<Result<()>>>,
    anchor: Arc<SubscriptionAnchor>,
}

/// Shared between a subscription entry and its [`Unsubscriber`]. Holds the
/// id currently registered with the hub; `None` once unsubscribed, which
/// also tells recovery not to revive the subscription.
struct SubscriptionAnchor {
    current_id: Mutex<Option<u64>>,
}

enum QueuedSend {
    Message(Value),
    Command {
        message: Value,
        response: oneshot::Sender<Result<Value>>,
    },
    /// Admission ticket for a subscribe waiting out a suspension.
    Waiter(oneshot::Sender<Result<()>>),
}

enum Ctrl {
    ForceReconnect { generation: u64 },
}

enum SocketEnd {
    Recover,
    Halt,
}

fn with_id(mut message: Value, id: u64) -> Value {
    if let Value::Object(map) = &mut message {
        map.insert("id".to_string(), Value::from(id));
    }
    message
}

fn backoff_delay(attempt: u32) -> Duration {
    RECONNECT_BACKOFF_STEP * attempt.min(MAX_BACKOFF_STEPS)
}

/// Install an authenticated socket: point the session at the new sink,
/// re-register carried subscriptions, flush the suspension queue in
/// submission order, then report ready.
async fn install_socket(
    inner: &Arc<SessionInner>,
    socket: AuthenticatedSocket,
    carried: Vec<SubscriptionEntry>,
) -> Box<dyn TransportStream> {
    let AuthenticatedSocket { sink, stream, ha_version } = socket;
    let sink: SharedSink = Arc::new(tokio::sync::Mutex::new(sink));

    // Hold the sink for the whole install so traffic racing in through the
    // freshly visible link lands after the resubscribes and the flush.
    let mut sink_guard = sink.lock().await;

    let mut frames: Vec<String> = Vec::new();
    let mut waiters: Vec<oneshot::Sender<Result<()>>> = Vec::new();
    let mut resubscribed = 0usize;
    {
        let mut state = inner.state.lock().unwrap_or_else(|e| e.into_inner());
        state.ha_version = ha_version.clone();
        state.generation += 1;
        state.link = Some(Link {
            sink: Arc::clone(&sink),
            generation: state.generation,
        });

        for sub in carried {
            if !sub.resubscribe {
                // Detach the handle too: its old id may get reassigned on
                // this socket, and a late unsubscribe must not hit that.
                *sub
                    .anchor
                    .current_id
                    .lock()
                    .unwrap_or_else(|e| e.into_inner()) = None;
                continue;
            }
            let new_id;
            {
                let mut anchor_id = sub
                    .anchor
                    .current_id
                    .lock()
                    .unwrap_or_else(|e| e.into_inner());
                if anchor_id.is_none() {
                    // Unsubscribed while offline; stays dead.
                    continue;
                }
                new_id = state.next_id;
                state.next_id += 1;
                *anchor_id = Some(new_id);
            }
            frames.push(with_id(sub.message.clone(), new_id).to_string());
            state.pending.insert(new_id, PendingEntry::Subscription(sub));
            resubscribed += 1;
        }

        if let Some(queued) = state.queue.take() {
            for entry in queued {
                match entry {
                    QueuedSend::Message(message) => {
                        let id = state.next_id;
                        state.next_id += 1;
                        frames.push(with_id(message, id).to_string());
                    }
                    QueuedSend::Command { message, response } => {
                        let id = state.next_id;
                        state.next_id += 1;
                        state.pending.insert(id, PendingEntry::Command { tx: response });
                        frames.push(with_id(message, id).to_string());
                    }
                    QueuedSend::Waiter(tx) => waiters.push(tx),
                }
            }
        }
    }

    if resubscribed > 0 {
        debug!(resubscribed, "Restored subscriptions on new socket");
    }
    for frame in frames {
        if let Err(e) = sink_guard.send(frame).await {
            // Socket died under us already; the read side will notice and
            // recovery will carry the registrations to the next one.
            debug!(error = %e, "Send on fresh socket failed");
            break;
        }
    }
    drop(sink_guard);

    for tx in waiters {
        let _ = tx.send(Ok(()));
    }

    inner.fire_event(SessionEvent::Ready);
    info!(version = %ha_version, "Session ready");
    stream
}

/// Background task: reads the current socket until it dies, then runs
/// recovery, forever. Exits when the session is closed, when credentials
/// are rejected mid-recovery, or when every handle is dropped.
async fn session_task(
    weak: Weak<SessionInner>,
    mut stream: Box<dyn TransportStream>,
    mut ctrl_rx: mpsc::UnboundedReceiver<Ctrl>,
) {
    debug!("Session task started");
    loop {
        match read_socket(&weak, stream.as_mut(), &mut ctrl_rx).await {
            SocketEnd::Halt => break,
            SocketEnd::Recover => {}
        }
        match recover(&weak).await {
            Some(next_stream) => stream = next_stream,
            None => break,
        }
    }
    debug!("Session task ended");
}

async fn read_socket(
    weak: &Weak<SessionInner>,
    stream: &mut dyn TransportStream,
    ctrl_rx: &mut mpsc::UnboundedReceiver<Ctrl>,
) -> SocketEnd {
    loop {
        tokio::select! {
            frame = stream.next_frame() => match frame {
                Ok(Some(text)) => {
                    let Some(inner) = weak.upgrade() else { return SocketEnd::Halt };
                    dispatch_frame(&inner, &text);
                }
                Ok(None) => {
                    debug!("Socket closed by peer");
                    return SocketEnd::Recover;
                }
                Err(e) => {
                    warn!(error = %e, "Socket error");
                    return SocketEnd::Recover;
                }
            },
            ctrl = ctrl_rx.recv() => match ctrl {
                Some(Ctrl::ForceReconnect { generation }) => {
                    let Some(inner) = weak.upgrade() else { return SocketEnd::Halt };
                    let current = inner
                        .state
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .link
                        .as_ref()
                        .map(|link| link.generation);
                    if current == Some(generation) {
                        debug!("Force reconnect requested, detaching socket");
                        return SocketEnd::Recover;
                    }
                    // Stale request for a socket already replaced.
                }
                None => return SocketEnd::Halt,
            },
        }
    }
}

fn dispatch_frame(inner: &Arc<SessionInner>, text: &str) {
    let messages = match protocol::parse_frame(text) {
        Ok(messages) => messages,
        Err(e) => {
            warn!(error = %e, "Dropping unparseable frame");
            return;
        }
    };
    for message in messages {
        dispatch_message(inner, message);
    }
}

fn dispatch_message(inner: &Arc<SessionInner>, message: ServerMessage) {
    match message {
        ServerMessage::Event { id, event } => {
            enum Target {
                Callback(EventCallback),
                WrongKind,
                Unknown,
            }
            let target = {
                let state = inner.state.lock().unwrap_or_else(|e| e.into_inner());
                match state.pending.get(&id) {
                    Some(PendingEntry::Subscription(sub)) => {
                        Target::Callback(Arc::clone(&sub.callback))
                    }
                    Some(PendingEntry::Command { .. }) => Target::WrongKind,
                    None => Target::Unknown,
                }
            };
            match target {
                Target::Callback(callback) => callback(event),
                Target::WrongKind => {
                    warn!(id, "Event addressed to a non-subscription command")
                }
                Target::Unknown => {
                    warn!(id, "Event for unknown subscription, unsubscribing");
                    let session = Session { inner: Arc::clone(inner) };
                    tokio::spawn(async move {
                        let _ = session
                            .send_command(protocol::unsubscribe_events_message(id))
                            .await;
                    });
                }
            }
        }
        ServerMessage::Result { id, success, result, error } => {
            handle_result(inner, id, success, result, error)
        }
        ServerMessage::Pong { id } => handle_pong(inner, id),
        ServerMessage::AuthRequired { .. }
        | ServerMessage::AuthOk { .. }
        | ServerMessage::AuthInvalid { .. } => {
            debug!("Auth frame outside handshake, ignoring")
        }
        ServerMessage::Unknown => warn!("Unhandled message type"),
    }
}

fn handle_result(
    inner: &Arc<SessionInner>,
    id: u64,
    success: bool,
    result: Option<Value>,
    error: Option<Value>,
) {
    let mut state = inner.state.lock().unwrap_or_else(|e| e.into_inner());
    match state.pending.remove(&id) {
        None => {
            // Fire-and-forget traffic produces results with no entry.
            debug!(id, "Result for untracked command");
        }
        Some(PendingEntry::Command { tx }) => {
            drop(state);
            let outcome = if success {
                Ok(result.unwrap_or(Value::Null))
            } else {
                Err(HearthError::from_result_error(error))
            };
            let _ = tx.send(outcome);
        }
        Some(PendingEntry::Subscription(mut sub)) => {
            if success {
                let ack = sub.ack.take();
                state.pending.insert(id, PendingEntry::Subscription(sub));
                drop(state);
                if let Some(ack) = ack {
                    let _ = ack.send(Ok(()));
                }
            } else {
                let err = HearthError::from_result_error(error);
                warn!(id, error = %err, "Subscription rejected by hub");
                *sub
                    .anchor
                    .current_id
                    .lock()
                    .unwrap_or_else(|e| e.into_inner()) = None;
                let ack = sub.ack.take();
                drop(state);
                if let Some(ack) = ack {
                    let _ = ack.send(Err(err));
                }
            }
        }
    }
}

fn handle_pong(inner: &Arc<SessionInner>, id: u64) {
    let mut state = inner.state.lock().unwrap_or_else(|e| e.into_inner());
    let is_command = matches!(state.pending.get(&id), Some(PendingEntry::Command { .. }));
    if is_command {
        if let Some(PendingEntry::Command { tx }) = state.pending.remove(&id) {
            drop(state);
            let _ = tx.send(Ok(Value::Null));
        }
    } else {
        drop(state);
        warn!(id, "Unknown pong response");
    }
}

/// After a socket loss: drain the pending table, run the disconnect
/// protocol, and reconnect with backoff. Returns the new read half, or
/// `None` when the session is done for good.
async fn recover(weak: &Weak<SessionInner>) -> Option<Box<dyn TransportStream>> {
    let (carried, suspend) = {
        let inner = weak.upgrade()?;
        let (pending, suspend, close_requested) = {
            let mut state = inner.state.lock().unwrap_or_else(|e| e.into_inner());
            state.link = None;
            state.next_id = protocol::FIRST_COMMAND_ID;
            (
                std::mem::take(&mut state.pending),
                state.suspend_until.take(),
                state.close_requested,
            )
        };

        let mut carried = Vec::new();
        let mut rejected = 0usize;
        for (_, entry) in pending {
            match entry {
                PendingEntry::Command { tx } => {
                    let _ = tx.send(Err(HearthError::ConnectionLost));
                    rejected += 1;
                }
                PendingEntry::Subscription(sub) => carried.push(sub),
            }
        }

        if close_requested {
            debug!(
                rejected_commands = rejected,
                dropped_subscriptions = carried.len(),
                "Session closed by request"
            );
            return None;
        }

        info!(
            rejected_commands = rejected,
            carried_subscriptions = carried.len(),
            "Connection lost, recovering"
        );
        inner.fire_event(SessionEvent::Disconnected);
        (carried, suspend)
    };

    if let Some(resume) = suspend {
        {
            let inner = weak.upgrade()?;
            inner
                .state
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .queue = Some(Vec::new());
        }
        debug!("Reconnect suspended, queueing outbound sends until resume");
        resume.await;
        let inner = weak.upgrade()?;
        let (closed, queued) = {
            let mut state = inner.state.lock().unwrap_or_else(|e| e.into_inner());
            if state.close_requested {
                (true, state.queue.take())
            } else {
                (false, None)
            }
        };
        if closed {
            if let Some(queued) = queued {
                reject_queued(queued);
            }
            return None;
        }
        debug!("Resumed, reconnecting");
    }

    let mut attempt: u32 = 0;
    loop {
        let delay = backoff_delay(attempt);
        if !delay.is_zero() {
            debug!(attempt, delay_secs = delay.as_secs(), "Backing off before reconnect");
            tokio::time::sleep(delay).await;
        }

        let inner = weak.upgrade()?;
        {
            let mut state = inner.state.lock().unwrap_or_else(|e| e.into_inner());
            if state.close_requested {
                let queued = state.queue.take();
                drop(state);
                if let Some(queued) = queued {
                    reject_queued(queued);
                }
                return None;
            }
        }

        // Single handshake try per attempt; backoff control lives here.
        match handshake::establish(inner.connector.as_ref(), &inner.credentials, Some(0)).await {
            Ok(socket) => return Some(install_socket(&inner, socket, carried).await),
            Err(err) => {
                let queued = inner
                    .state
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .queue
                    .take();
                if let Some(queued) = queued {
                    reject_queued(queued);
                }

                if matches!(err, HearthError::InvalidAuth(_)) {
                    error!(error = %err, "Credentials rejected during reconnect, giving up");
                    inner
                        .state
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .close_requested = true;
                    inner.fire_event(SessionEvent::ReconnectError);
                    return None;
                }

                warn!(attempt, error = %err, "Reconnect attempt failed");
                attempt += 1;
            }
        }
    }
}

fn reject_queued(queued: Vec<QueuedSend>) {
    let mut dropped = 0usize;
    for entry in queued {
        match entry {
            QueuedSend::Message(_) => dropped += 1,
            QueuedSend::Command { response, .. } => {
                let _ = response.send(Err(HearthError::ConnectionLost));
            }
            QueuedSend::Waiter(tx) => {
                let _ = tx.send(Err(HearthError::ConnectionLost));
            }
        }
    }
    if dropped > 0 {
        warn!(dropped, "Dropped queued fire-and-forget messages");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_with_id_injects_into_objects() {
        let framed = with_id(json!({ "type": "ping" }), 42);
        assert_eq!(framed["id"], 42);
        assert_eq!(framed["type"], "ping");
    }

    #[test]
    fn test_backoff_delay_caps_at_five_steps() {
        assert_eq!(backoff_delay(0), Duration::from_secs(0));
        assert_eq!(backoff_delay(1), Duration::from_secs(1));
        assert_eq!(backoff_delay(4), Duration::from_secs(4));
        assert_eq!(backoff_delay(5), Duration::from_secs(5));
        assert_eq!(backoff_delay(50), Duration::from_secs(5));
    }

    #[test]
    fn test_subscribe_options_default_resubscribes() {
        assert!(SubscribeOptions::default().resubscribe);
    }
}

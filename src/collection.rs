//! Shared, self-maintaining collection caches
//!
//! A collection binds a [`Store`] to a hub subscription and keeps it fresh
//! for as long as anyone is watching. Collections are cached on the session
//! by key, so every caller asking for the same key shares one store and one
//! wire subscription.
//!
//! The cache is lazy in both directions: the wire subscription starts when
//! the first subscriber arrives and stops shortly after the last one
//! leaves. The stop is delayed by a grace period so that UI churn (the last
//! view unmounting right before the next one mounts) does not bounce the
//! subscription on the wire.

use std::any::Any;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{HearthError, Result};
use crate::session::{ListenerId, Session, SessionEvent, Unsubscriber, WeakSession};
use crate::store::{Store, Subscriber};

/// How long a collection stays attached after its last subscriber leaves.
const UNSUB_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Produces the full collection state from the hub, used for the initial
/// population and for re-fetches after a reconnect.
pub type FetchFn<T> =
    Arc<dyn Fn(Session) -> Pin<Box<dyn Future<Output = Result<T>> + Send>> + Send + Sync>;

/// Starts the update subscription feeding the collection's store.
pub type SubscribeFn<T> = Arc<
    dyn Fn(Session, Store<T>) -> Pin<Box<dyn Future<Output = Result<Unsubscriber>> + Send>>
        + Send
        + Sync,
>;

#[derive(Debug, Clone, Copy)]
pub struct CollectionOptions {
    /// How long the wire subscription outlives the last subscriber.
    /// `None` tears down immediately.
    pub unsub_grace: Option<Duration>,
}

impl Default for CollectionOptions {
    fn default() -> Self {
        Self {
            unsub_grace: Some(UNSUB_GRACE_PERIOD),
        }
    }
}

/// Look up or create the collection cached under `key` on this session.
///
/// The first call for a key decides its shape; later calls get the cached
/// collection back and `fetch`/`subscribe_updates` are ignored. At least
/// one of the two should be provided or the collection can never populate.
pub fn get_collection<T>(
    session: &Session,
    key: &str,
    fetch: Option<FetchFn<T>>,
    subscribe_updates: Option<SubscribeFn<T>>,
    options: CollectionOptions,
) -> Collection<T>
where
    T: Clone + Send + Sync + 'static,
{
    let mut collections = session
        .collections()
        .lock()
        .unwrap_or_else(|e| e.into_inner());

    if let Some(existing) = collections.get(key) {
        match Arc::clone(existing).downcast::<CollectionInner<T>>() {
            Ok(inner) => return Collection { inner },
            Err(_) => {
                warn!(key, "Collection key reused with a different type, replacing");
            }
        }
    }

    let inner = Arc::new(CollectionInner {
        session: session.downgrade(),
        key: key.to_string(),
        store: Store::new(),
        fetch,
        subscribe_updates,
        unsub_grace: options.unsub_grace,
        active: Mutex::new(ActiveState {
            subscribers: 0,
            live: None,
            grace: None,
            epoch: 0,
        }),
    });
    collections.insert(
        key.to_string(),
        Arc::clone(&inner) as Arc<dyn Any + Send + Sync>,
    );
    Collection { inner }
}

/// Handle to a cached collection. Cloning shares the cache entry.
pub struct Collection<T> {
    inner: Arc<CollectionInner<T>>,
}

impl<T> Clone for Collection<T> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<T> Collection<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Snapshot of the current state, `None` until first population and
    /// after detach.
    pub fn state(&self) -> Option<T> {
        self.inner.store.get()
    }

    /// Re-fetch the state from the hub and store it. Errors if this
    /// collection was created without a fetch function.
    pub async fn refresh(&self) -> Result<()> {
        let Some(fetch) = self.inner.fetch.clone() else {
            return Err(HearthError::Internal(
                "collection does not support refresh".to_string(),
            ));
        };
        let Some(session) = self.inner.session.upgrade() else {
            return Err(HearthError::ConnectionLost);
        };
        let state = fetch(session).await?;
        self.inner.store.set(state);
        Ok(())
    }

    /// Register an observer. The first subscriber attaches the collection:
    /// the update subscription is established and, when a fetch function
    /// exists, an initial fetch is started. If state is already present it
    /// is delivered asynchronously so the caller can finish wiring up
    /// first.
    ///
    /// The returned handle must be kept and unsubscribed; dropping it
    /// silently leaves the collection attached.
    pub async fn subscribe(&self, subscriber: impl Fn(&T) + Send + Sync + 'static) -> CollectionSubscription {
        let attach_token = {
            let mut active = self.inner.active.lock().unwrap_or_else(|e| e.into_inner());
            active.subscribers += 1;
            if active.subscribers == 1 {
                active.epoch += 1;
                if let Some(timer) = active.grace.take() {
                    // Back within the grace period: still attached.
                    timer.abort();
                    None
                } else {
                    Some(active.epoch)
                }
            } else {
                None
            }
        };
        if let Some(token) = attach_token {
            attach(&self.inner, token).await;
        }

        let subscriber: Subscriber<T> = Arc::new(subscriber);
        let store_sub = self.inner.store.subscribe_arc(Arc::clone(&subscriber));
        if self.inner.store.get().is_some() {
            let store = self.inner.store.clone();
            tokio::spawn(async move {
                if let Some(current) = store.get() {
                    subscriber(&current);
                }
            });
        }

        let inner = Arc::clone(&self.inner);
        CollectionSubscription {
            cancel: Box::new(move || {
                store_sub.unsubscribe();
                release(&inner);
            }),
        }
    }
}

/// Handle for one collection subscription.
pub struct CollectionSubscription {
    cancel: Box<dyn FnOnce() + Send>,
}

impl CollectionSubscription {
    pub fn unsubscribe(self) {
        (self.cancel)();
    }
}

struct CollectionInner<T> {
    session: WeakSession,
    key: String,
    store: Store<T>,
    fetch: Option<FetchFn<T>>,
    subscribe_updates: Option<SubscribeFn<T>>,
    unsub_grace: Option<Duration>,
    active: Mutex<ActiveState>,
}

struct ActiveState {
    subscribers: usize,
    live: Option<LiveLink>,
    /// Pending detach timer, present only while the grace period runs.
    grace: Option<JoinHandle<()>>,
    /// Bumped on every attach/detach decision; in-flight attaches and
    /// grace timers carry the epoch they were issued under and stand down
    /// when it has moved on.
    epoch: u64,
}

/// Everything attach acquires and detach must give back.
struct LiveLink {
    update_unsub: Option<Unsubscriber>,
    ready_listener: Option<ListenerId>,
    disconnected_listener: ListenerId,
}

async fn attach<T>(inner: &Arc<CollectionInner<T>>, token: u64)
where
    T: Clone + Send + Sync + 'static,
{
    let Some(session) = inner.session.upgrade() else { return };

    let update_unsub = match &inner.subscribe_updates {
        Some(subscribe_fn) => {
            match subscribe_fn(session.clone(), inner.store.clone()).await {
                Ok(unsub) => Some(unsub),
                Err(e) => {
                    warn!(key = %inner.key, error = %e, "Collection update subscription failed");
                    None
                }
            }
        }
        None => None,
    };

    let ready_listener = inner.fetch.as_ref().map(|_| {
        let weak = Arc::downgrade(inner);
        session.add_event_listener(SessionEvent::Ready, move |_| {
            if let Some(inner) = weak.upgrade() {
                spawn_refresh(&inner);
            }
        })
    });
    let disconnected_listener = {
        let weak = Arc::downgrade(inner);
        session.add_event_listener(SessionEvent::Disconnected, move |_| {
            if let Some(inner) = weak.upgrade() {
                handle_disconnect(&inner);
            }
        })
    };
    let mut link = Some(LiveLink {
        update_unsub,
        ready_listener,
        disconnected_listener,
    });

    let installed = {
        let mut active = inner.active.lock().unwrap_or_else(|e| e.into_inner());
        if active.epoch == token && active.subscribers > 0 {
            active.live = link.take();
            true
        } else {
            false
        }
    };
    if installed {
        if inner.fetch.is_some() {
            spawn_refresh(inner);
        }
    } else if let Some(link) = link {
        // Everyone left while we were attaching.
        debug!(key = %inner.key, "Attach overtaken by detach");
        dispose_link(&session, link);
    }
}

/// Initial fetch and every ready-triggered re-fetch. Errors during an
/// outage are expected and quietly retried by the next ready.
fn spawn_refresh<T>(inner: &Arc<CollectionInner<T>>)
where
    T: Clone + Send + Sync + 'static,
{
    let Some(fetch) = inner.fetch.clone() else { return };
    let Some(session) = inner.session.upgrade() else { return };
    let store = inner.store.clone();
    let key = inner.key.clone();
    tokio::spawn(async move {
        match fetch(session.clone()).await {
            Ok(state) => store.set(state),
            Err(e) => {
                if session.connected() {
                    warn!(key = %key, error = %e, "Collection refresh failed");
                } else {
                    debug!(key = %key, "Collection refresh interrupted by disconnect");
                }
            }
        }
    });
}

fn release<T>(inner: &Arc<CollectionInner<T>>)
where
    T: Clone + Send + Sync + 'static,
{
    let teardown = {
        let mut active = inner.active.lock().unwrap_or_else(|e| e.into_inner());
        active.subscribers = active.subscribers.saturating_sub(1);
        if active.subscribers > 0 {
            None
        } else if let Some(grace) = inner.unsub_grace {
            active.epoch += 1;
            let token = active.epoch;
            let weak = Arc::downgrade(inner);
            active.grace = Some(tokio::spawn(async move {
                tokio::time::sleep(grace).await;
                let Some(inner) = weak.upgrade() else { return };
                let link = {
                    let mut active =
                        inner.active.lock().unwrap_or_else(|e| e.into_inner());
                    if active.epoch != token || active.subscribers > 0 {
                        return;
                    }
                    active.grace = None;
                    active.live.take()
                };
                detach(&inner, link);
            }));
            None
        } else {
            active.epoch += 1;
            Some(active.live.take())
        }
    };
    if let Some(link) = teardown {
        detach(inner, link);
    }
}

/// A disconnect with a grace timer pending detaches right away instead of
/// re-establishing a subscription nobody is watching.
fn handle_disconnect<T>(inner: &Arc<CollectionInner<T>>)
where
    T: Clone + Send + Sync + 'static,
{
    let link = {
        let mut active = inner.active.lock().unwrap_or_else(|e| e.into_inner());
        let Some(timer) = active.grace.take() else { return };
        timer.abort();
        active.epoch += 1;
        active.live.take()
    };
    detach(inner, link);
}

fn detach<T>(inner: &Arc<CollectionInner<T>>, link: Option<LiveLink>)
where
    T: Clone + Send + Sync + 'static,
{
    inner.store.clear();
    let Some(link) = link else { return };
    if let Some(session) = inner.session.upgrade() {
        dispose_link(&session, link);
    }
}

fn dispose_link(session: &Session, link: LiveLink) {
    if let Some(id) = link.ready_listener {
        session.remove_event_listener(id);
    }
    session.remove_event_listener(link.disconnected_listener);
    if let Some(unsub) = link.update_unsub {
        tokio::spawn(async move {
            unsub.unsubscribe().await;
        });
    }
}

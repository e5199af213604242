//! Observable state container
//!
//! Holds the latest value of a collection and fans changes out to
//! subscribers. Notification iterates a snapshot of the subscriber list, so
//! a callback that subscribes or unsubscribes mid-notification never
//! affects the cycle already in flight.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Callback invoked with the new value after every change.
pub type Subscriber<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Shared observable container. Cloning the handle shares the state.
pub struct Store<T> {
    inner: Arc<StoreInner<T>>,
}

struct StoreInner<T> {
    state: Mutex<Option<T>>,
    subscribers: Mutex<Vec<(u64, Subscriber<T>)>>,
    next_subscriber_id: AtomicU64,
}

impl<T> Clone for Store<T> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<T> Default for Store<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Store<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            inner: Arc::new(StoreInner {
                state: Mutex::new(None),
                subscribers: Mutex::new(Vec::new()),
                next_subscriber_id: AtomicU64::new(1),
            }),
        }
    }

    /// Current value, if one has been set since the last [`clear`](Self::clear).
    pub fn get(&self) -> Option<T> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Replace the value wholesale and notify subscribers.
    pub fn set(&self, next: T) {
        {
            let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
            *state = Some(next.clone());
        }
        self.notify(&next);
    }

    /// Read-modify-write: `f` receives the current value (if any) and
    /// returns the next one. Subscribers are notified with the result.
    pub fn update(&self, f: impl FnOnce(Option<T>) -> T) {
        let next = {
            let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
            let next = f(state.take());
            *state = Some(next.clone());
            next
        };
        self.notify(&next);
    }

    /// Drop the value without notifying anyone. Used at collection teardown.
    pub fn clear(&self) {
        let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
        *state = None;
    }

    /// Register a subscriber for future changes.
    pub fn subscribe(&self, subscriber: impl Fn(&T) + Send + Sync + 'static) -> StoreSubscription<T> {
        self.subscribe_arc(Arc::new(subscriber))
    }

    pub(crate) fn subscribe_arc(&self, subscriber: Subscriber<T>) -> StoreSubscription<T> {
        let id = self.inner.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, subscriber));
        StoreSubscription { store: self.clone(), id }
    }

    fn notify(&self, value: &T) {
        // Snapshot first: callbacks may subscribe or unsubscribe while we
        // iterate, and the in-flight cycle must not see that.
        let snapshot: Vec<Subscriber<T>> = self
            .inner
            .subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, s)| Arc::clone(s))
            .collect();
        for subscriber in snapshot {
            subscriber(value);
        }
    }

    fn remove_subscriber(&self, id: u64) {
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|(sid, _)| *sid != id);
    }
}

/// Handle for one store subscription. Idempotent: dropping it does nothing,
/// and unsubscribing twice is a no-op.
pub struct StoreSubscription<T> {
    store: Store<T>,
    id: u64,
}

impl<T> StoreSubscription<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn unsubscribe(&self) {
        self.store.remove_subscriber(self.id);
    }
}

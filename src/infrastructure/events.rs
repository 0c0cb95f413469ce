//! Observer registration and fan-out.
//!
//! Callbacks are invoked on a snapshot taken under the lock, with the lock
//! released, so a callback may subscribe or unsubscribe (itself included)
//! without deadlocking or disturbing the current emission.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::mpsc;

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct HubInner<T> {
    next_id: u64,
    // Ordered by id, i.e. registration order
    subscribers: BTreeMap<u64, Callback<T>>,
}

pub struct EventHub<T> {
    inner: Arc<Mutex<HubInner<T>>>,
}

impl<T> Default for EventHub<T> {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HubInner {
                next_id: 0,
                subscribers: BTreeMap::new(),
            })),
        }
    }
}

fn lock<T>(inner: &Mutex<HubInner<T>>) -> MutexGuard<'_, HubInner<T>> {
    // A panicking subscriber never holds this lock, but stay usable anyway
    inner.lock().unwrap_or_else(|e| e.into_inner())
}

impl<T: 'static> EventHub<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = {
            let mut inner = lock(&self.inner);
            let id = inner.next_id;
            inner.next_id += 1;
            inner.subscribers.insert(id, Arc::new(callback));
            id
        };

        let weak: Weak<Mutex<HubInner<T>>> = Arc::downgrade(&self.inner);
        Subscription {
            remover: Some(Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    lock(&inner).subscribers.remove(&id);
                }
            })),
        }
    }

    pub fn emit(&self, event: &T) {
        let snapshot: Vec<Callback<T>> = lock(&self.inner).subscribers.values().cloned().collect();
        for callback in snapshot {
            callback(event);
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Clone + Send + 'static> EventHub<T> {
    /// Subscribe through an unbounded channel instead of a callback
    pub fn subscribe_channel(&self) -> (Subscription, mpsc::UnboundedReceiver<T>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = self.subscribe(move |event: &T| {
            let _ = tx.send(event.clone());
        });
        (subscription, rx)
    }
}

/// Registration handle. Dropping it unsubscribes.
pub struct Subscription {
    remover: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    /// Remove the registration. Later calls do nothing.
    pub fn unsubscribe(&mut self) {
        if let Some(remove) = self.remover.take() {
            remove();
        }
    }

    /// Keep the callback registered for the lifetime of the hub
    pub fn detach(mut self) {
        self.remover = None;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.remover.is_some())
            .finish()
    }
}

//! Process-scoped publish/subscribe bus.
//!
//! Each subscriber owns its own channel, so a slow consumer never blocks the
//! publisher or other subscribers. Dropping a [`Subscription`] unsubscribes;
//! closed channels are pruned on the next publish.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::mpsc;

struct Subscriber<T> {
    id: u64,
    tx: mpsc::UnboundedSender<Arc<T>>,
}

struct Registry<T> {
    next_id: AtomicU64,
    subscribers: Mutex<Vec<Subscriber<T>>>,
}

impl<T> Registry<T> {
    fn remove(&self, id: u64) {
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.retain(|s| s.id != id);
        }
    }
}

/// Cloneable handle to a shared bus.
pub struct EventBus<T> {
    registry: Arc<Registry<T>>,
}

impl<T> Clone for EventBus<T> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
        }
    }
}

impl<T> Default for EventBus<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> EventBus<T> {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Registry {
                next_id: AtomicU64::new(0),
                subscribers: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn subscribe(&self) -> Subscription<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut subs) = self.registry.subscribers.lock() {
            subs.push(Subscriber { id, tx });
        }
        Subscription {
            id,
            rx,
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Delivers `event` to every live subscriber; returns how many received it.
    pub fn publish(&self, event: T) -> usize {
        let event = Arc::new(event);
        let Ok(mut subs) = self.registry.subscribers.lock() else {
            return 0;
        };
        subs.retain(|s| s.tx.send(Arc::clone(&event)).is_ok());
        subs.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.registry
            .subscribers
            .lock()
            .map(|subs| subs.iter().filter(|s| !s.tx.is_closed()).count())
            .unwrap_or(0)
    }
}

/// Receiving end of a bus subscription.
pub struct Subscription<T> {
    id: u64,
    rx: mpsc::UnboundedReceiver<Arc<T>>,
    registry: Weak<Registry<T>>,
}

impl<T> Subscription<T> {
    /// Next event, or `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<Arc<T>> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Arc<T>> {
        self.rx.try_recv().ok()
    }

    /// Explicitly leaves the bus. Equivalent to dropping the handle.
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.id);
        }
    }
}

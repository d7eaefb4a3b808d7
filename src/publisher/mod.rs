//! A minimal push-based notification channel.
//!
//! The listener's accept loop, the HTTP/1 driver and the HTTP/2 driver all
//! announce new transport objects through a [`Publisher`]; trackers subscribe
//! to it and unsubscribe before draining.

mod tests;

use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

/// Receives values pushed by a [`Publisher`].
pub trait Subscriber<T>: Send + Sync {
    /// A new value was published.
    fn next(&self, value: T);

    /// The publisher failed; no further values follow.
    fn error(&self, _message: &str) {}

    /// The publisher completed; no further values follow.
    fn complete(&self) {}
}

struct FnSubscriber<F>(F);

impl<T, F> Subscriber<T> for FnSubscriber<F>
where
    F: Fn(T) + Send + Sync,
{
    fn next(&self, value: T) {
        (self.0)(value)
    }
}

struct Inner<T> {
    subscribers: Vec<(u64, Arc<dyn Subscriber<T>>)>,
    next_id: u64,
    closed: bool,
}

/// Fans values out to every current subscriber.
pub struct Publisher<T> {
    inner: Arc<Mutex<Inner<T>>>,
}

impl<T: Clone + 'static> Publisher<T> {
    /// Create a publisher with no subscribers.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                subscribers: Vec::new(),
                next_id: 1,
                closed: false,
            })),
        }
    }

    /// Add a subscriber. On a completed publisher the subscriber is told so
    /// right away.
    pub fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) -> Subscription {
        let mut inner = self.inner.lock();
        if inner.closed {
            drop(inner);
            subscriber.complete();
            return Subscription { detach: None };
        }
        let id = inner.next_id;
        inner.next_id += 1;
        inner.subscribers.push((id, subscriber));

        let weak: Weak<Mutex<Inner<T>>> = Arc::downgrade(&self.inner);
        Subscription {
            detach: Some(Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.lock().subscribers.retain(|(existing, _)| *existing != id);
                }
            })),
        }
    }

    /// Subscribe a closure receiving every value.
    pub fn subscribe_fn<F>(&self, next: F) -> Subscription
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        self.subscribe(Arc::new(FnSubscriber(next)))
    }

    /// Push `value` to every subscriber. Returns how many received it.
    pub fn next(&self, value: T) -> usize {
        let subscribers = self.snapshot();
        for subscriber in &subscribers {
            subscriber.next(value.clone());
        }
        subscribers.len()
    }

    /// Report a failure and drop every subscriber.
    pub fn error(&self, message: &str) {
        for subscriber in self.close() {
            subscriber.error(message);
        }
    }

    /// Complete the publisher and drop every subscriber.
    pub fn complete(&self) {
        for subscriber in self.close() {
            subscriber.complete();
        }
    }

    /// Number of current subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().subscribers.len()
    }

    fn snapshot(&self) -> Vec<Arc<dyn Subscriber<T>>> {
        let inner = self.inner.lock();
        if inner.closed {
            return Vec::new();
        }
        inner.subscribers.iter().map(|(_, s)| s.clone()).collect()
    }

    fn close(&self) -> Vec<Arc<dyn Subscriber<T>>> {
        let mut inner = self.inner.lock();
        inner.closed = true;
        inner.subscribers.drain(..).map(|(_, s)| s).collect()
    }
}

impl<T: Clone + 'static> Default for Publisher<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for Publisher<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> fmt::Debug for Publisher<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Publisher")
            .field("subscribers", &inner.subscribers.len())
            .field("closed", &inner.closed)
            .finish()
    }
}

/// Handle returned by [`Publisher::subscribe`].
pub struct Subscription {
    detach: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    /// Stop receiving values. Happens-before any value published afterwards.
    pub fn unsubscribe(mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.detach.is_some())
            .finish()
    }
}

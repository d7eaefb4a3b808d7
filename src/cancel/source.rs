//! Cancellation source and token.

use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::cancel::error::CancelError;
use crate::cancel::reason::StopReason;

/// A callback fired once when cancellation is requested.
///
/// Identity is the `Arc` allocation: registering the same `Arc` twice
/// yields the existing registration.
pub type CancelCallback = Arc<dyn Fn(&StopReason) + Send + Sync>;

struct Entry {
    id: u64,
    callback: CancelCallback,
}

#[derive(Default)]
struct State {
    reason: Option<StopReason>,
    entries: Vec<Entry>,
    next_id: u64,
}

struct Inner {
    state: Mutex<State>,
    // Mirrors `state.reason` for async waiters
    watch: watch::Sender<Option<StopReason>>,
}

impl Inner {
    fn new() -> Arc<Self> {
        let (watch, _) = watch::channel(None);
        Arc::new(Self {
            state: Mutex::new(State {
                next_id: 1,
                ..State::default()
            }),
            watch,
        })
    }

    fn unregister(&self, id: u64) {
        self.state.lock().entries.retain(|entry| entry.id != id);
    }
}

/// Owns cancellation state and triggers it.
#[derive(Clone)]
pub struct CancellationSource {
    inner: Arc<Inner>,
}

impl CancellationSource {
    /// Create a source that has not been cancelled.
    pub fn new() -> Self {
        Self { inner: Inner::new() }
    }

    /// A token observing this source.
    pub fn token(&self) -> CancellationToken {
        CancellationToken {
            inner: self.inner.clone(),
        }
    }

    /// Request cancellation.
    ///
    /// The first call stores `reason` and invokes every registered callback
    /// once with it. Later calls are no-ops and keep the first reason.
    pub fn cancel(&self, reason: StopReason) {
        let pending = {
            let mut state = self.inner.state.lock();
            if state.reason.is_some() {
                return;
            }
            state.reason = Some(reason.clone());
            std::mem::take(&mut state.entries)
        };
        self.inner.watch.send_replace(Some(reason.clone()));

        for entry in pending {
            (entry.callback)(&reason);
        }
    }

    /// Whether [`cancel`](Self::cancel) has been called.
    pub fn is_cancelled(&self) -> bool {
        self.inner.state.lock().reason.is_some()
    }
}

impl Default for CancellationSource {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CancellationSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationSource")
            .field("reason", &self.inner.state.lock().reason)
            .finish()
    }
}

/// Observes a [`CancellationSource`].
///
/// Once [`is_cancellation_requested`](Self::is_cancellation_requested)
/// returns `true` it never returns `false` again.
#[derive(Clone)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

impl CancellationToken {
    /// A token whose source is dropped immediately: it is never cancelled.
    pub fn none() -> Self {
        CancellationSource::new().token()
    }

    /// Whether cancellation was requested.
    pub fn is_cancellation_requested(&self) -> bool {
        self.inner.state.lock().reason.is_some()
    }

    /// The reason given to the first `cancel` call, if any.
    pub fn reason(&self) -> Option<StopReason> {
        self.inner.state.lock().reason.clone()
    }

    /// Return a [`CancelError`] when cancellation was already requested.
    pub fn throw_if_requested(&self) -> Result<(), CancelError> {
        match self.reason() {
            Some(reason) => Err(CancelError::new(reason)),
            None => Ok(()),
        }
    }

    /// Register `callback`.
    ///
    /// On an already cancelled token the callback runs immediately and the
    /// returned registration is inert.
    pub fn register(&self, callback: CancelCallback) -> Registration {
        let mut state = self.inner.state.lock();

        if let Some(reason) = state.reason.clone() {
            drop(state);
            callback(&reason);
            return Registration::inert();
        }

        if let Some(existing) = state
            .entries
            .iter()
            .find(|entry| Arc::ptr_eq(&entry.callback, &callback))
        {
            return Registration {
                inner: Arc::downgrade(&self.inner),
                id: existing.id,
            };
        }

        let id = state.next_id;
        state.next_id += 1;
        state.entries.push(Entry { id, callback });
        Registration {
            inner: Arc::downgrade(&self.inner),
            id,
        }
    }

    /// Register a closure. Each call creates a new registration.
    pub fn on_cancel<F>(&self, callback: F) -> Registration
    where
        F: Fn(&StopReason) + Send + Sync + 'static,
    {
        self.register(Arc::new(callback))
    }

    /// Wait until cancellation is requested and return the reason.
    pub async fn cancelled(&self) -> StopReason {
        let mut receiver = self.inner.watch.subscribe();
        let reason = receiver
            .wait_for(Option::is_some)
            .await
            .ok()
            .and_then(|reason| (*reason).clone());
        match reason {
            Some(reason) => reason,
            // The sender lives as long as `inner`, which `self` keeps alive
            None => std::future::pending::<StopReason>().await,
        }
    }

    pub(crate) fn callback_count(&self) -> usize {
        self.inner.state.lock().entries.len()
    }
}

impl fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationToken")
            .field("reason", &self.reason())
            .finish()
    }
}

/// Handle to a registered callback.
///
/// Dropping it keeps the callback registered; call
/// [`unregister`](Self::unregister) to remove it.
#[derive(Debug, Clone)]
pub struct Registration {
    inner: Weak<Inner>,
    id: u64,
}

impl Registration {
    fn inert() -> Self {
        Self {
            inner: Weak::new(),
            id: 0,
        }
    }

    /// Remove the callback from the pending set. A no-op once it fired.
    pub fn unregister(&self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.unregister(self.id);
        }
    }
}

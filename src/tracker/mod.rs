//! Trackers own the live sets of transport objects of a running server.
//!
//! Each tracker subscribes to a [`Publisher`] announcing accepted objects,
//! drops members as they close, and exposes a `stop` that first
//! unsubscribes, then snapshots the set and drains it. Unsubscribing before
//! the snapshot is what keeps objects accepted during a stop from slipping
//! past it.

mod connection;
mod request;
mod session;

pub use connection::{Connection, ConnectionTracker};
pub use request::{FinishGuard, InflightRequest, RequestTracker, Termination};
pub use session::{Session, SessionCloseError, SessionTracker};

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use parking_lot::Mutex;

use crate::publisher::{Publisher, Subscription};

/// A transport object a tracker can hold.
pub trait Tracked: Clone + Send + Sync + 'static {
    /// Identifier unique among live objects of this type.
    fn tracking_id(&self) -> u64;

    /// Resolves once the object is closed.
    fn wait_closed(&self) -> BoxFuture<'static, ()>;
}

struct LiveState<T> {
    members: HashMap<u64, T>,
    subscription: Option<Subscription>,
}

/// The live set shared by all trackers.
pub(crate) struct LiveSet<T> {
    state: Arc<Mutex<LiveState<T>>>,
}

impl<T: Tracked> LiveSet<T> {
    pub(crate) fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(LiveState {
                members: HashMap::new(),
                subscription: None,
            })),
        }
    }

    /// Start recording objects announced by `publisher`.
    pub(crate) fn track(&self, publisher: &Publisher<T>) {
        let weak = Arc::downgrade(&self.state);
        let subscription = publisher.subscribe_fn(move |member: T| {
            let Some(state) = weak.upgrade() else {
                return;
            };
            let id = member.tracking_id();
            let closed = member.wait_closed();
            state.lock().members.insert(id, member);

            let weak = Arc::downgrade(&state);
            tokio::spawn(async move {
                closed.await;
                if let Some(state) = weak.upgrade() {
                    state.lock().members.remove(&id);
                }
            });
        });

        let previous = self.state.lock().subscription.replace(subscription);
        if let Some(previous) = previous {
            previous.unsubscribe();
        }
    }

    /// Unsubscribe, then return every member still live.
    pub(crate) fn drain(&self) -> Vec<T> {
        let subscription = self.state.lock().subscription.take();
        if let Some(subscription) = subscription {
            subscription.unsubscribe();
        }
        self.state.lock().members.values().cloned().collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.state.lock().members.len()
    }
}

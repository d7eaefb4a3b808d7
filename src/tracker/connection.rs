//! Raw transport connections.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::future::{join_all, BoxFuture};
use futures_util::FutureExt;
use tokio::sync::watch;

use crate::cancel::{CancellationSource, CancellationToken, StopReason};
use crate::publisher::Publisher;
use crate::tracker::{LiveSet, Tracked};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

struct ConnectionInner {
    id: u64,
    peer_addr: SocketAddr,
    destroy: CancellationSource,
    closed: watch::Sender<bool>,
}

/// Handle to an accepted connection.
///
/// The task driving the connection watches [`destroy_token`](Self::destroy_token)
/// and holds the guard from [`close_guard`](Self::close_guard) until the
/// socket is dropped.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    /// Create a handle for a connection accepted from `peer_addr`.
    pub fn new(peer_addr: SocketAddr) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            inner: Arc::new(ConnectionInner {
                id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
                peer_addr,
                destroy: CancellationSource::new(),
                closed,
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.peer_addr
    }

    /// Fires when someone asked for this connection to be destroyed.
    pub fn destroy_token(&self) -> CancellationToken {
        self.inner.destroy.token()
    }

    pub fn is_closed(&self) -> bool {
        *self.inner.closed.borrow()
    }

    /// Mark the connection closed.
    pub fn mark_closed(&self) {
        self.inner.closed.send_replace(true);
    }

    /// A guard marking the connection closed when dropped.
    pub fn close_guard(&self) -> CloseGuard {
        CloseGuard(self.clone())
    }

    /// Resolves once the connection is closed.
    pub async fn closed(&self) {
        let mut receiver = self.inner.closed.subscribe();
        let _ = receiver.wait_for(|closed| *closed).await;
    }

    /// Force the connection closed and wait until its socket is gone.
    ///
    /// Destroying a connection that already closed succeeds immediately.
    pub async fn destroy(&self, reason: StopReason) {
        if self.is_closed() {
            return;
        }
        self.inner.destroy.cancel(reason);
        self.closed().await;
    }
}

impl Tracked for Connection {
    fn tracking_id(&self) -> u64 {
        self.inner.id
    }

    fn wait_closed(&self) -> BoxFuture<'static, ()> {
        let connection = self.clone();
        async move { connection.closed().await }.boxed()
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("peer_addr", &self.inner.peer_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Marks its connection closed on drop.
pub struct CloseGuard(Connection);

impl Drop for CloseGuard {
    fn drop(&mut self) {
        self.0.mark_closed();
    }
}

/// Tracks the connections of a listening server.
pub struct ConnectionTracker {
    live: LiveSet<Connection>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self { live: LiveSet::new() }
    }

    /// Record every connection announced by `accepted`.
    pub fn track(&self, accepted: &Publisher<Connection>) {
        self.live.track(accepted);
    }

    /// Number of connections currently open.
    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop accepting new members, then destroy every open connection and
    /// wait for all of them to close.
    pub async fn stop(&self, reason: &StopReason) {
        let members = self.live.drain();
        log::debug!("destroying {} open connection(s)", members.len());
        join_all(members.iter().map(|connection| connection.destroy(reason.clone()))).await;
    }
}

impl Default for ConnectionTracker {
    fn default() -> Self {
        Self::new()
    }
}

//! Multiplexed protocol sessions (HTTP/2).

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::future::{join_all, BoxFuture};
use futures_util::FutureExt;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{oneshot, watch};

use crate::cancel::StopReason;
use crate::publisher::Publisher;
use crate::tracker::{LiveSet, Tracked};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Why closing a session did not go cleanly.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionCloseError {
    /// The peer was gone before the close completed.
    #[error("session already disconnected")]
    Disconnected,

    /// The protocol layer reported an error while shutting down.
    #[error("{0}")]
    Protocol(String),
}

type Outcome = Option<Result<(), SessionCloseError>>;

struct SessionInner {
    id: u64,
    peer_addr: SocketAddr,
    close: Mutex<Option<oneshot::Sender<()>>>,
    outcome: watch::Sender<Outcome>,
}

/// Handle to a live protocol session.
///
/// The driver listens on the receiver returned by [`Session::new`]; when it
/// fires it shuts the session down gracefully (GOAWAY with `NO_ERROR`) and
/// reports the outcome through [`finish`](Self::finish).
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    pub fn new(peer_addr: SocketAddr) -> (Self, oneshot::Receiver<()>) {
        let (close_tx, close_rx) = oneshot::channel();
        let (outcome, _) = watch::channel(None);
        let session = Self {
            inner: Arc::new(SessionInner {
                id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
                peer_addr,
                close: Mutex::new(Some(close_tx)),
                outcome,
            }),
        };
        (session, close_rx)
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.peer_addr
    }

    pub fn is_closed(&self) -> bool {
        self.inner.outcome.borrow().is_some()
    }

    /// Record how the session ended. Only the first outcome is kept.
    pub fn finish(&self, outcome: Result<(), SessionCloseError>) {
        self.inner.outcome.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(outcome);
            true
        });
    }

    /// Resolves with the outcome once the session ended.
    pub async fn closed(&self) -> Result<(), SessionCloseError> {
        let mut receiver = self.inner.outcome.subscribe();
        let outcome = receiver
            .wait_for(Option::is_some)
            .await
            .ok()
            .and_then(|outcome| (*outcome).clone());
        outcome.unwrap_or(Err(SessionCloseError::Disconnected))
    }

    /// Close the session gracefully and wait for it to end.
    ///
    /// A session that already ended reports [`SessionCloseError::Disconnected`].
    pub async fn close(&self) -> Result<(), SessionCloseError> {
        if self.is_closed() {
            return Err(SessionCloseError::Disconnected);
        }
        let sender = self.inner.close.lock().take();
        if let Some(sender) = sender {
            let _ = sender.send(());
        }
        self.closed().await
    }
}

impl Tracked for Session {
    fn tracking_id(&self) -> u64 {
        self.inner.id
    }

    fn wait_closed(&self) -> BoxFuture<'static, ()> {
        let session = self.clone();
        async move {
            let _ = session.closed().await;
        }
        .boxed()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("peer_addr", &self.inner.peer_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Tracks the protocol sessions of a listening server.
pub struct SessionTracker {
    live: LiveSet<Session>,
}

impl SessionTracker {
    pub fn new() -> Self {
        Self { live: LiveSet::new() }
    }

    /// Record every session announced by `accepted`.
    pub fn track(&self, accepted: &Publisher<Session>) {
        self.live.track(accepted);
    }

    /// Number of sessions currently open.
    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop accepting new members, then close every open session and wait
    /// for all of them.
    ///
    /// Errors meaning "already disconnected", or carrying the stop reason
    /// itself, are not failures. The first other error is returned.
    pub async fn stop(&self, reason: &StopReason) -> Result<(), SessionCloseError> {
        let members = self.live.drain();
        let outcomes = join_all(members.iter().map(Session::close)).await;

        let reason_text = reason.to_string();
        let mut first_error = None;
        for outcome in outcomes {
            match outcome {
                Ok(()) | Err(SessionCloseError::Disconnected) => {}
                Err(SessionCloseError::Protocol(message)) if message == reason_text => {}
                Err(error) => {
                    first_error.get_or_insert(error);
                }
            }
        }
        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

impl Default for SessionTracker {
    fn default() -> Self {
        Self::new()
    }
}

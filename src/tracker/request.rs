//! In-flight request/response pairs.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::future::{join_all, BoxFuture};
use futures_util::FutureExt;
use parking_lot::Mutex;
use tokio::sync::{oneshot, watch};

use crate::parser::Method;
use crate::publisher::Publisher;
use crate::server::StatusCode;
use crate::tracker::{LiveSet, Tracked};

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Instruction to end a response early.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Termination {
    /// Status written when the head has not gone out yet.
    pub status: StatusCode,
    /// Text written as the body of that response.
    pub reason: String,
}

struct InflightInner {
    id: u64,
    method: Method,
    resource: String,
    headers_sent: AtomicBool,
    termination: Mutex<Option<oneshot::Sender<Termination>>>,
    finished: watch::Sender<bool>,
}

/// A request whose response has not finished yet.
///
/// The driver writing the response listens on the receiver returned by
/// [`InflightRequest::new`]; when a [`Termination`] arrives it writes the
/// terminal head (if [`headers_sent`](Self::headers_sent) is still false) and
/// closes the stream.
#[derive(Clone)]
pub struct InflightRequest {
    inner: Arc<InflightInner>,
}

impl InflightRequest {
    pub fn new(method: Method, resource: impl Into<String>) -> (Self, oneshot::Receiver<Termination>) {
        let (termination_tx, termination_rx) = oneshot::channel();
        let (finished, _) = watch::channel(false);
        let request = Self {
            inner: Arc::new(InflightInner {
                id: NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed),
                method,
                resource: resource.into(),
                headers_sent: AtomicBool::new(false),
                termination: Mutex::new(Some(termination_tx)),
                finished,
            }),
        };
        (request, termination_rx)
    }

    pub fn method(&self) -> Method {
        self.inner.method
    }

    pub fn resource(&self) -> &str {
        &self.inner.resource
    }

    pub fn headers_sent(&self) -> bool {
        self.inner.headers_sent.load(Ordering::Acquire)
    }

    pub fn mark_headers_sent(&self) {
        self.inner.headers_sent.store(true, Ordering::Release);
    }

    pub fn is_finished(&self) -> bool {
        *self.inner.finished.borrow()
    }

    pub fn mark_finished(&self) {
        self.inner.finished.send_replace(true);
    }

    /// A guard marking the response finished when dropped.
    pub fn finish_guard(&self) -> FinishGuard {
        FinishGuard(self.clone())
    }

    /// Resolves once the response finished or its stream closed.
    pub async fn finished(&self) {
        let mut receiver = self.inner.finished.subscribe();
        let _ = receiver.wait_for(|finished| *finished).await;
    }

    /// Ask the driver to end this response and wait until it has.
    ///
    /// Resolves immediately for a response that already finished.
    pub async fn terminate(&self, termination: Termination) {
        if self.is_finished() {
            return;
        }
        let sender = self.inner.termination.lock().take();
        if let Some(sender) = sender {
            let _ = sender.send(termination);
        }
        self.finished().await;
    }
}

impl Tracked for InflightRequest {
    fn tracking_id(&self) -> u64 {
        self.inner.id
    }

    fn wait_closed(&self) -> BoxFuture<'static, ()> {
        let request = self.clone();
        async move { request.finished().await }.boxed()
    }
}

impl fmt::Debug for InflightRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InflightRequest")
            .field("id", &self.inner.id)
            .field("method", &self.inner.method)
            .field("resource", &self.inner.resource)
            .field("headers_sent", &self.headers_sent())
            .field("finished", &self.is_finished())
            .finish()
    }
}

/// Marks its response finished on drop.
pub struct FinishGuard(InflightRequest);

impl Drop for FinishGuard {
    fn drop(&mut self) {
        self.0.mark_finished();
    }
}

/// Tracks requests whose responses are still being produced.
pub struct RequestTracker {
    live: LiveSet<InflightRequest>,
}

impl RequestTracker {
    pub fn new() -> Self {
        Self { live: LiveSet::new() }
    }

    /// Record every request announced by `accepted`.
    pub fn track(&self, accepted: &Publisher<InflightRequest>) {
        self.live.track(accepted);
    }

    /// Number of requests still in flight.
    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop accepting new members, then give every open request a terminal
    /// response with `status` and wait for all of them to finish.
    pub async fn stop(&self, status: StatusCode, reason: &str) {
        let members = self.live.drain();
        if !members.is_empty() {
            log::debug!("terminating {} pending request(s) with {status}", members.len());
        }
        join_all(members.iter().map(|request| {
            request.terminate(Termination {
                status,
                reason: reason.to_string(),
            })
        }))
        .await;
    }
}

impl Default for RequestTracker {
    fn default() -> Self {
        Self::new()
    }
}

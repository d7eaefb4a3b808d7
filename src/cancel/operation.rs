//! Stoppable operations: an asynchronous start paired with a stop that runs
//! exactly once.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use parking_lot::Mutex;
use tokio::sync::OnceCell;

use crate::cancel::error::{CancelError, OperationError};
use crate::cancel::source::{CancellationToken, Registration};

type StopFn = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

struct Stopper {
    stop: Mutex<Option<StopFn>>,
    done: OnceCell<()>,
}

impl Stopper {
    fn new(stop: StopFn) -> Arc<Self> {
        Arc::new(Self {
            stop: Mutex::new(Some(stop)),
            done: OnceCell::new(),
        })
    }

    async fn run(&self) {
        self.done
            .get_or_init(|| async {
                let stop = self.stop.lock().take();
                if let Some(stop) = stop {
                    stop().await;
                }
            })
            .await;
    }
}

/// The value produced by a successful start plus its memoized stop.
pub struct Operation<T> {
    value: T,
    stopper: Arc<Stopper>,
    registration: Registration,
}

impl<T> Operation<T> {
    /// The value the start future resolved with.
    pub fn value(&self) -> &T {
        &self.value
    }

    /// Run the stop function. Concurrent and repeated calls share the first
    /// run and all resolve once it completes.
    pub async fn stop(&self) {
        self.registration.unregister();
        self.stopper.run().await;
    }

    /// Whether the stop function has completed.
    pub fn is_stopped(&self) -> bool {
        self.stopper.done.initialized()
    }
}

impl<T: fmt::Debug> fmt::Debug for Operation<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("value", &self.value)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// Start `start` immediately and race it against `token`.
///
/// When the token fires first the call fails with [`CancelError`], and
/// `stop` still runs once with the value `start` eventually resolves to, so
/// whatever `start` opened is released. When `start` wins, the returned
/// [`Operation`] owns the value and the memoized `stop`, which also runs on
/// its own if the token fires later.
pub async fn start_operation<T, E, Start, Stop, StopFut>(
    token: &CancellationToken,
    start: Start,
    stop: Stop,
) -> Result<Operation<T>, OperationError<E>>
where
    T: Clone + Send + Sync + 'static,
    E: Send + 'static,
    Start: Future<Output = Result<T, E>> + Send + 'static,
    Stop: FnOnce(T) -> StopFut + Send + 'static,
    StopFut: Future<Output = ()> + Send + 'static,
{
    token.throw_if_requested()?;

    let mut start = Box::pin(start);
    tokio::select! {
        biased;

        reason = token.cancelled() => {
            // Let start settle in the background and release what it opened
            tokio::spawn(async move {
                if let Ok(value) = start.await {
                    stop(value).await;
                }
            });
            Err(OperationError::Cancelled(CancelError::new(reason)))
        }
        result = &mut start => {
            let value = result.map_err(OperationError::Failed)?;
            let stop_value = value.clone();
            let stopper = Stopper::new(Box::new(move || stop(stop_value).boxed()));
            let registration = {
                let stopper = stopper.clone();
                token.on_cancel(move |_| {
                    let stopper = stopper.clone();
                    tokio::spawn(async move { stopper.run().await });
                })
            };
            Ok(Operation {
                value,
                stopper,
                registration,
            })
        }
    }
}

//! Reference-counted trigger listeners.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Once, OnceLock, Weak};

use log::{debug, warn};
use parking_lot::{const_mutex, Mutex};

use crate::signal::{in_handler_scope, Trigger};

type TriggerCallback = Arc<dyn Fn(Trigger) + Send + Sync>;
type Teardown = Box<dyn FnOnce() + Send>;

struct Listener {
    subscribers: usize,
    teardown: Option<Teardown>,
}

struct Subscriber {
    id: u64,
    triggers: Vec<Trigger>,
    callback: TriggerCallback,
}

#[derive(Default)]
struct BridgeState {
    subscribers: Vec<Subscriber>,
    listeners: HashMap<Trigger, Listener>,
    next_id: u64,
}

impl BridgeState {
    /// Drop one subscriber's claim on `trigger`. Returns the teardown to run
    /// once the lock is released when that was the last claim.
    fn release(&mut self, trigger: Trigger) -> Option<Teardown> {
        let listener = self.listeners.get_mut(&trigger)?;
        listener.subscribers = listener.subscribers.saturating_sub(1);
        if listener.subscribers > 0 {
            return None;
        }
        self.listeners.remove(&trigger).and_then(|listener| listener.teardown)
    }

    fn remove_subscribers(&mut self, matches: impl Fn(&Subscriber) -> bool) -> (Vec<Subscriber>, Vec<Teardown>) {
        let (removed, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.subscribers)
            .into_iter()
            .partition(|subscriber| matches(subscriber));
        self.subscribers = kept;

        let mut teardowns = Vec::new();
        for subscriber in &removed {
            for trigger in &subscriber.triggers {
                teardowns.extend(self.release(*trigger));
            }
        }
        (removed, teardowns)
    }
}

struct BridgeInner {
    state: Mutex<BridgeState>,
}

/// Fans process triggers out to subscriptions.
///
/// Each subscription names the triggers it cares about. The first of them to
/// fire invokes its callback once and removes the subscription, releasing
/// the listeners it held.
#[derive(Clone)]
pub struct SignalBridge {
    inner: Arc<BridgeInner>,
}

static PROCESS_BRIDGE: OnceLock<SignalBridge> = OnceLock::new();

impl SignalBridge {
    /// Create a bridge with no listeners installed.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BridgeInner {
                state: Mutex::new(BridgeState {
                    next_id: 1,
                    ..BridgeState::default()
                }),
            }),
        }
    }

    /// The bridge shared by every server in the process.
    pub fn process() -> SignalBridge {
        PROCESS_BRIDGE.get_or_init(SignalBridge::new).clone()
    }

    /// Call `callback` with whichever of `triggers` fires first.
    ///
    /// OS listeners need a tokio runtime; outside of one the OS triggers are
    /// skipped with a warning. Dropping the subscription removes it.
    pub fn subscribe<F>(&self, triggers: &[Trigger], callback: F) -> SignalSubscription
    where
        F: Fn(Trigger) + Send + Sync + 'static,
    {
        let mut unique: Vec<Trigger> = Vec::with_capacity(triggers.len());
        for trigger in triggers {
            if !unique.contains(trigger) {
                unique.push(*trigger);
            }
        }

        let mut state = self.inner.state.lock();
        for trigger in &unique {
            let listener = state.listeners.entry(*trigger).or_insert_with(|| Listener {
                subscribers: 0,
                teardown: None,
            });
            // Retried by later subscriptions until installing succeeds
            if listener.teardown.is_none() {
                listener.teardown = install(Arc::downgrade(&self.inner), *trigger);
                if listener.teardown.is_some() {
                    debug!("installed {trigger} listener");
                }
            }
            listener.subscribers += 1;
        }

        let id = state.next_id;
        state.next_id += 1;
        state.subscribers.push(Subscriber {
            id,
            triggers: unique,
            callback: Arc::new(callback),
        });

        SignalSubscription {
            inner: Arc::downgrade(&self.inner),
            id,
        }
    }

    /// Deliver `trigger` to its subscribers as if it had fired.
    pub fn raise(&self, trigger: Trigger) {
        deliver(&self.inner, trigger);
    }

    /// Announce that the program is about to exit normally.
    pub fn notify_exit(&self) {
        self.raise(Trigger::Exit);
    }

    /// Number of live subscriptions holding `trigger`.
    pub fn listener_count(&self, trigger: Trigger) -> usize {
        self.inner
            .state
            .lock()
            .listeners
            .get(&trigger)
            .map_or(0, |listener| listener.subscribers)
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.inner.state.lock().subscribers.len()
    }
}

impl Default for SignalBridge {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SignalBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("SignalBridge")
            .field("subscribers", &state.subscribers.len())
            .field("listeners", &state.listeners.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Keeps a [`SignalBridge`] subscription alive. Dropping it unsubscribes.
pub struct SignalSubscription {
    inner: Weak<BridgeInner>,
    id: u64,
}

impl SignalSubscription {
    /// Remove the subscription now.
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for SignalSubscription {
    fn drop(&mut self) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let (_, teardowns) = inner
            .state
            .lock()
            .remove_subscribers(|subscriber| subscriber.id == self.id);
        for teardown in teardowns {
            teardown();
        }
    }
}

impl fmt::Debug for SignalSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalSubscription").field("id", &self.id).finish()
    }
}

fn deliver(inner: &BridgeInner, trigger: Trigger) {
    // A panic may come from a thread already holding the lock
    let state = if trigger == Trigger::Crash {
        inner.state.try_lock()
    } else {
        Some(inner.state.lock())
    };
    let Some(mut state) = state else {
        warn!("{trigger} raised while the signal bridge was busy; ignored");
        return;
    };
    let (fired, teardowns) = state.remove_subscribers(|subscriber| subscriber.triggers.contains(&trigger));
    drop(state);

    if !fired.is_empty() {
        debug!("{trigger} delivered to {} subscription(s)", fired.len());
    }
    for subscriber in fired {
        (subscriber.callback)(trigger);
    }
    for teardown in teardowns {
        teardown();
    }
}

fn install(inner: Weak<BridgeInner>, trigger: Trigger) -> Option<Teardown> {
    match trigger {
        Trigger::Interrupt | Trigger::Terminate | Trigger::Hangup => install_os_listener(inner, trigger),
        Trigger::Crash => Some(install_panic_hook(inner)),
        Trigger::Exit => None,
    }
}

fn current_runtime(trigger: Trigger) -> Option<tokio::runtime::Handle> {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => Some(handle),
        Err(_) => {
            warn!("no async runtime running; {trigger} will not be observed");
            None
        }
    }
}

#[cfg(unix)]
fn install_os_listener(inner: Weak<BridgeInner>, trigger: Trigger) -> Option<Teardown> {
    use tokio::signal::unix::{signal, SignalKind};

    let runtime = current_runtime(trigger)?;
    let kind = match trigger {
        Trigger::Interrupt => SignalKind::interrupt(),
        Trigger::Terminate => SignalKind::terminate(),
        Trigger::Hangup => SignalKind::hangup(),
        Trigger::Crash | Trigger::Exit => return None,
    };
    let mut stream = match signal(kind) {
        Ok(stream) => stream,
        Err(e) => {
            warn!("cannot listen for {trigger}: {e}");
            return None;
        }
    };

    let task = runtime.spawn(async move {
        while stream.recv().await.is_some() {
            match inner.upgrade() {
                Some(inner) => deliver(&inner, trigger),
                None => break,
            }
        }
    });
    Some(Box::new(move || task.abort()))
}

#[cfg(not(unix))]
fn install_os_listener(inner: Weak<BridgeInner>, trigger: Trigger) -> Option<Teardown> {
    if trigger != Trigger::Interrupt {
        return None;
    }
    let runtime = current_runtime(trigger)?;
    let task = runtime.spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            match inner.upgrade() {
                Some(inner) => deliver(&inner, trigger),
                None => break,
            }
        }
    });
    Some(Box::new(move || task.abort()))
}

/// Bridges with a live crash listener, fed by one process-wide panic hook.
static CRASH_BRIDGES: Mutex<Vec<(u64, Weak<BridgeInner>)>> = const_mutex(Vec::new());
static CRASH_HOOK: Once = Once::new();
static NEXT_CRASH_ID: AtomicU64 = AtomicU64::new(1);

/// Register `inner` for crashes.
///
/// The hook is chained in front of whatever hook was set when the first
/// crash listener was installed and is never removed; tearing a listener
/// down only unregisters its bridge, so bridges may come and go in any order.
fn install_panic_hook(inner: Weak<BridgeInner>) -> Teardown {
    CRASH_HOOK.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            previous(info);
            if in_handler_scope() {
                return;
            }
            let bridges: Vec<Arc<BridgeInner>> = match CRASH_BRIDGES.try_lock() {
                Some(bridges) => bridges.iter().filter_map(|(_, bridge)| bridge.upgrade()).collect(),
                None => return,
            };
            for bridge in bridges {
                deliver(&bridge, Trigger::Crash);
            }
        }));
    });

    let id = NEXT_CRASH_ID.fetch_add(1, Ordering::Relaxed);
    CRASH_BRIDGES.lock().push((id, inner));
    Box::new(move || CRASH_BRIDGES.lock().retain(|(entry, _)| *entry != id))
}

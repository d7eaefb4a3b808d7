//! Process-level stop triggers.
//!
//! A [`SignalBridge`] turns OS signals, panics outside request handlers and
//! an explicit exit notification into [`Trigger`] callbacks. Listeners are
//! installed once per trigger no matter how many subscriptions want them,
//! and removed when the last of those subscriptions goes away.

mod bridge;

pub use bridge::{SignalBridge, SignalSubscription};

use std::fmt;
use std::future::Future;

/// Something outside the server asking the process to wind down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Trigger {
    /// SIGINT, or ctrl-c on Windows.
    Interrupt,
    /// SIGTERM.
    Terminate,
    /// SIGHUP.
    Hangup,
    /// A panic outside of any request handler.
    Crash,
    /// The embedding program announced it is about to exit.
    Exit,
}

impl Trigger {
    /// Triggers covering every way a process ends.
    pub const EXIT: [Trigger; 4] = [Trigger::Hangup, Trigger::Terminate, Trigger::Interrupt, Trigger::Exit];

    pub fn as_str(&self) -> &'static str {
        match self {
            Trigger::Interrupt => "SIGINT",
            Trigger::Terminate => "SIGTERM",
            Trigger::Hangup => "SIGHUP",
            Trigger::Crash => "crash",
            Trigger::Exit => "exit",
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

tokio::task_local! {
    static HANDLER_SCOPE: ();
}

/// Run `future` as request-handler code. Panics raised inside it are
/// reported to the server as handler errors, not as crashes.
pub async fn handler_scope<F: Future>(future: F) -> F::Output {
    HANDLER_SCOPE.scope((), future).await
}

/// Whether the current task is running request-handler code.
pub fn in_handler_scope() -> bool {
    HANDLER_SCOPE.try_with(|_| ()).is_ok()
}

//! Composition of several tokens into one.

use std::ops::Deref;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::cancel::reason::StopReason;
use crate::cancel::source::{CancelCallback, CancellationSource, CancellationToken, Registration};

/// A token cancelled as soon as any of its constituents is.
///
/// Dropping (or [`release`](Self::release)-ing) it unregisters from every
/// constituent, so short-lived compositions over a long-lived token do not
/// accumulate callbacks on it.
pub struct ComposedToken {
    token: CancellationToken,
    registrations: Arc<Mutex<Vec<Registration>>>,
}

impl ComposedToken {
    /// The composed token.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Unregister from every constituent.
    pub fn release(&self) {
        for registration in self.registrations.lock().drain(..) {
            registration.unregister();
        }
    }
}

impl Deref for ComposedToken {
    type Target = CancellationToken;

    fn deref(&self) -> &Self::Target {
        &self.token
    }
}

impl Drop for ComposedToken {
    fn drop(&mut self) {
        self.release();
    }
}

/// Collapse `tokens` into one token carrying the first reason to fire.
///
/// The same callback is registered on every constituent; when one fires the
/// composed source is cancelled and the callback is unregistered from all
/// the others.
pub fn compose_cancellation_token(tokens: &[CancellationToken]) -> ComposedToken {
    let source = CancellationSource::new();
    let registrations: Arc<Mutex<Vec<Registration>>> = Arc::new(Mutex::new(Vec::new()));

    if let Some(reason) = tokens.iter().find_map(CancellationToken::reason) {
        source.cancel(reason);
        return ComposedToken {
            token: source.token(),
            registrations,
        };
    }

    let callback: CancelCallback = {
        let source = source.clone();
        let registrations = Arc::downgrade(&registrations);
        Arc::new(move |reason: &StopReason| {
            source.cancel(reason.clone());
            if let Some(registrations) = registrations.upgrade() {
                for registration in registrations.lock().drain(..) {
                    registration.unregister();
                }
            }
        })
    };

    for token in tokens {
        let registration = token.register(callback.clone());
        registrations.lock().push(registration);
    }

    // A constituent may have fired while the others were being registered
    if source.is_cancelled() {
        for registration in registrations.lock().drain(..) {
            registration.unregister();
        }
    }

    ComposedToken {
        token: source.token(),
        registrations,
    }
}

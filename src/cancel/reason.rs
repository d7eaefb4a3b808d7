//! Why a server, request or operation was asked to stop.

use std::fmt;

use crate::server::StatusCode;
use crate::signal::Trigger;

/// Tagged reason carried through the cancellation chain.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum StopReason {
    /// No reason was given.
    #[default]
    Unspecified,
    /// An explicit API call, with the caller's message.
    Requested(String),
    /// A process-level trigger fired.
    Signal(Trigger),
    /// A request handler failed and the server is configured to stop on it.
    InternalError(String),
    /// The client went away before its response was produced.
    ClientAborted,
}

impl StopReason {
    /// Shorthand for [`StopReason::Requested`].
    pub fn requested(message: impl Into<String>) -> Self {
        StopReason::Requested(message.into())
    }

    /// Whether the stop was caused by a failing request handler.
    pub fn is_internal_error(&self) -> bool {
        matches!(self, StopReason::InternalError(_))
    }

    /// Status used to answer requests still in flight when the server stops
    /// for this reason.
    pub fn termination_status(&self) -> StatusCode {
        if self.is_internal_error() {
            StatusCode::INTERNAL_SERVER_ERROR
        } else {
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::Unspecified => f.write_str("unspecified"),
            StopReason::Requested(message) => f.write_str(message),
            StopReason::Signal(trigger) => write!(f, "process {trigger}"),
            StopReason::InternalError(message) => write!(f, "internal error: {message}"),
            StopReason::ClientAborted => f.write_str("request aborted by client"),
        }
    }
}

impl From<&str> for StopReason {
    fn from(message: &str) -> Self {
        StopReason::Requested(message.to_string())
    }
}

impl From<String> for StopReason {
    fn from(message: String) -> Self {
        StopReason::Requested(message)
    }
}

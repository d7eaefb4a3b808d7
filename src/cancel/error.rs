//! Cancellation errors.

use thiserror::Error;

use crate::cancel::reason::StopReason;

/// Raised when an operation observes that cancellation was requested.
///
/// This is a control-flow signal, not a defect: callers log it at debug level
/// and never treat it as a crash.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("operation cancelled: {reason}")]
pub struct CancelError {
    /// Why cancellation was requested.
    pub reason: StopReason,
}

impl CancelError {
    /// Create a cancel error carrying `reason`.
    pub fn new(reason: StopReason) -> Self {
        Self { reason }
    }
}

/// Outcome of a stoppable operation that did not produce its value.
#[derive(Debug, Error)]
pub enum OperationError<E> {
    /// The owning token fired before the operation started.
    #[error(transparent)]
    Cancelled(#[from] CancelError),

    /// The start future itself failed.
    #[error("operation failed: {0}")]
    Failed(E),
}

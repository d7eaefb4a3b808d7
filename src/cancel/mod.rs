//! Cooperative cancellation.
//!
//! A [`CancellationSource`] owns the cancellation state and hands out
//! [`CancellationToken`]s that observe it. Callbacks registered on a token
//! fire exactly once, in registration order, with the [`StopReason`] passed
//! to the first [`CancellationSource::cancel`] call. Tokens compose with
//! [`compose_cancellation_token`], and [`start_operation`] pairs an
//! asynchronous start with a stop that runs exactly once.

mod compose;
mod error;
mod operation;
mod reason;
mod source;
mod tests;

pub use compose::{compose_cancellation_token, ComposedToken};
pub use error::{CancelError, OperationError};
pub use operation::{start_operation, Operation};
pub use reason::StopReason;
pub use source::{CancelCallback, CancellationSource, CancellationToken, Registration};

//! Error types
//!
//! Two families. `FutureError` is the failure cause stored in a promise and is
//! the only path consumers inspect: cancellation and timeouts are causes like
//! any other. `LoopError` is returned synchronously by calls that were misused
//! and never ends up inside a promise.
//!
//! Author: Moroya Sakamoto

use std::any::Any;
use std::error::Error;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use thiserror::Error;

/// Error returned by fallible task bodies
pub type TaskError = Box<dyn Error + Send + Sync + 'static>;

/// Failure cause of a completed promise
#[derive(Debug, Clone, Error)]
pub enum FutureError {
    #[error("future was cancelled")]
    Cancelled,

    #[error("task failed: {0}")]
    Failed(Arc<dyn Error + Send + Sync + 'static>),

    #[error("task panicked: {0}")]
    Panicked(String),

    #[error("time-sharing task exhausted its time budget")]
    TimeSharingTimeout,

    #[error("timed out waiting for the future")]
    WaitTimeout,

    /// Blocking on this future from the calling thread could deadlock
    #[error("blocking operation on a future the calling loop must complete")]
    BlockingGuard,

    #[error("aggregate needs {required} successes, at most {achieved} reachable")]
    InsufficientSuccesses { required: usize, achieved: usize },

    /// The task never reached its loop
    #[error("task rejected by a terminated loop")]
    Rejected,
}

impl FutureError {
    /// Wrap a task body error
    pub fn failed(err: impl Into<TaskError>) -> Self {
        FutureError::Failed(Arc::from(err.into()))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, FutureError::Cancelled)
    }

    /// Time-sharing budget or wait timeout
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            FutureError::TimeSharingTimeout | FutureError::WaitTimeout
        )
    }
}

/// Synchronous misuse of the loop, promise or combiner APIs
#[derive(Debug, Error)]
pub enum LoopError {
    #[error("fixed-rate initial delay must not be negative, got {0}ns")]
    NegativeInitialDelay(i64),

    #[error("periodic task needs a positive period, got {0}ns")]
    InvalidPeriod(i64),

    #[error("time-sharing timeout must be positive, got {0}ns")]
    InvalidTimeout(i64),

    #[error("blocking operation invoked on the loop's own thread")]
    BlockingInOwnLoop,

    #[error("operation must run on the loop thread")]
    NotInLoop,

    #[error("loop is shut down")]
    Shutdown,

    #[error("loop intake queue is full")]
    QueueFull,

    #[error("combiner already finished; call clear() before reuse")]
    CombinerFinished,

    #[error("future does not accept obtrude")]
    ObtrudeForbidden,

    #[error("invoke_any needs at least one task")]
    EmptyInvocation,

    #[error("invalid loop configuration: {0}")]
    Config(String),

    #[error("failed to spawn loop thread: {0}")]
    Spawn(#[from] std::io::Error),

    #[error(transparent)]
    Future(#[from] FutureError),
}

impl From<toml::de::Error> for LoopError {
    fn from(err: toml::de::Error) -> Self {
        LoopError::Config(err.to_string())
    }
}

/// Render a `catch_unwind` payload
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Run `f`, turning a panic into `FutureError::Panicked`.
///
/// Panics are logged at error level and never unwind past this point.
pub(crate) fn catch_panic<U>(f: impl FnOnce() -> Result<U, FutureError>) -> Result<U, FutureError> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(outcome) => outcome,
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            tracing::error!(panic = %message, "task body panicked");
            Err(FutureError::Panicked(message))
        }
    }
}

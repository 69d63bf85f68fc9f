use std::time::Duration;

use thiserror::Error;

/// Errors produced by a task producer or raised while delivering its result.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// The caller aborted this specific request.
    #[error("request cancelled")]
    Cancelled,

    #[error("timed out after {after:?}")]
    Timeout { after: Duration },

    #[error("{0}")]
    Runtime(String),

    /// Connectivity-class failure talking to the fabric service.
    #[error("i/o failure: {0}")]
    Io(String),

    /// A callback failed while handling a delivered result.
    #[error("callback failed: {0}")]
    Callback(String),
}

/// How the scheduler reacts to a producer error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Propagated to callbacks, never logged as a failure.
    Cancelled,
    /// Logged; the task runs again next cycle.
    Recoverable,
    /// Stops the task's own schedule and is surfaced to the fatal sink.
    Unrecoverable,
}

impl FetchError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Cancelled => ErrorClass::Cancelled,
            Self::Timeout { .. } | Self::Runtime(_) | Self::Callback(_) => ErrorClass::Recoverable,
            Self::Io(_) => ErrorClass::Unrecoverable,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Short label used for metrics.
    pub fn kind_str(&self) -> &'static str {
        match self {
            Self::Cancelled => "cancelled",
            Self::Timeout { .. } => "timeout",
            Self::Runtime(_) => "runtime",
            Self::Io(_) => "io",
            Self::Callback(_) => "callback",
        }
    }
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cancelled => "cancelled",
            Self::Recoverable => "recoverable",
            Self::Unrecoverable => "unrecoverable",
        }
    }
}

/// Errors returned by the task scheduler's registration API.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("scheduler is shutting down")]
    ShutDown,

    #[error("a batched subscription needs at least one source")]
    EmptyBatch,
}

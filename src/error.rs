//! Unified error taxonomy for the runtime.
//!
//! Every public API returns [`Result<T>`] (an alias for
//! `std::result::Result<T, RtError>`). Each variant carries enough context
//! for callers to decide how to handle the failure without inspecting
//! opaque strings, mirroring the error-enum pattern used throughout the
//! kernel crates this runtime draws on.

use crate::task::TaskId;
use std::fmt;

/// Unified error type returned by every public API in this crate.
#[derive(Debug, thiserror::Error)]
pub enum RtError {
    // -- Cancellation / timeout ----------------------------------------------
    /// A task was cancelled directly via [`crate::Scheduler::cancel`].
    #[error("task {0} was cancelled")]
    Cancelled(TaskId),

    /// A task was cancelled as a side effect of an enclosing scope (a task
    /// group closing, or a `timeout_after` scope firing) rather than a
    /// direct `cancel()` call.
    #[error("task {0} was cancelled by its enclosing scope")]
    ScopeCancelled(TaskId),

    /// `wait_for(c, t)`'s deadline elapsed before `c` completed.
    #[error("operation timed out")]
    Timeout,

    /// A `timeout_after` cancel scope's deadline elapsed while its body was
    /// still running.
    #[error("cancel scope timed out")]
    ScopeTimeout,

    // -- Queue boundary errors ------------------------------------------------
    /// `get_nowait()` on an empty queue.
    #[error("queue is empty")]
    QueueEmpty,

    /// `put_nowait()` on a full bounded queue.
    #[error("queue is full")]
    QueueFull,

    /// `send()`/`send_to()` found every receiver gone and the channel
    /// closed, with no rendezvous possible.
    #[error("channel is closed")]
    ChannelClosed,

    // -- Scheduler / state errors ---------------------------------------------
    /// `join`/`result_for` queried a task that is still running, or whose
    /// terminal record has already been collected.
    #[error("task {0} has no available result")]
    InvalidState(TaskId),

    /// A kernel request named an id or shape that cannot be satisfied
    /// (e.g. `cancel()` on an id the scheduler never issued).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// `gather`'s `race` count exceeded the number of supplied task ids.
    #[error("race count {requested} exceeds {supplied} supplied task ids")]
    LengthMismatch { requested: usize, supplied: usize },

    // -- Task-group aggregation -----------------------------------------------
    /// One or more task-group members erred; the group re-raises the first.
    #[error("task group member failed: {0}")]
    GroupMemberFailed(Box<RtError>),

    // -- Subprocess ------------------------------------------------------------
    /// Spawning the child process failed at the OS boundary.
    #[error("failed to spawn subprocess: {0}")]
    SpawnFailed(String),

    /// The child exited with a non-zero status or its stdout failed to
    /// deserialize into the expected result frame.
    #[error("subprocess failed: {0}")]
    SubprocessFailed(String),

    /// The child's deadline elapsed before it produced a result frame.
    #[error("subprocess timed out")]
    SubprocessTimeout,

    /// I/O failure reading/writing a subprocess pipe or reactor-registered fd.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    // -- Unrecoverable ---------------------------------------------------------
    /// An internal runtime invariant was violated. Not intended to be
    /// caught by user code; surfaced so tests can assert it never fires.
    #[error("runtime panic: {0}")]
    Panic(String),
}

impl Clone for RtError {
    fn clone(&self) -> Self {
        match self {
            Self::Cancelled(id) => Self::Cancelled(*id),
            Self::ScopeCancelled(id) => Self::ScopeCancelled(*id),
            Self::Timeout => Self::Timeout,
            Self::ScopeTimeout => Self::ScopeTimeout,
            Self::QueueEmpty => Self::QueueEmpty,
            Self::QueueFull => Self::QueueFull,
            Self::ChannelClosed => Self::ChannelClosed,
            Self::InvalidState(id) => Self::InvalidState(*id),
            Self::InvalidArgument(s) => Self::InvalidArgument(s.clone()),
            Self::LengthMismatch { requested, supplied } => Self::LengthMismatch {
                requested: *requested,
                supplied: *supplied,
            },
            Self::GroupMemberFailed(e) => Self::GroupMemberFailed(e.clone()),
            Self::SpawnFailed(s) => Self::SpawnFailed(s.clone()),
            Self::SubprocessFailed(s) => Self::SubprocessFailed(s.clone()),
            Self::SubprocessTimeout => Self::SubprocessTimeout,
            Self::Io(e) => Self::Io(std::io::Error::new(e.kind(), e.to_string())),
            Self::Panic(s) => Self::Panic(s.clone()),
        }
    }
}

impl PartialEq for RtError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Cancelled(a), Self::Cancelled(b)) => a == b,
            (Self::ScopeCancelled(a), Self::ScopeCancelled(b)) => a == b,
            (Self::Timeout, Self::Timeout) => true,
            (Self::ScopeTimeout, Self::ScopeTimeout) => true,
            (Self::QueueEmpty, Self::QueueEmpty) => true,
            (Self::QueueFull, Self::QueueFull) => true,
            (Self::ChannelClosed, Self::ChannelClosed) => true,
            (Self::InvalidState(a), Self::InvalidState(b)) => a == b,
            (Self::InvalidArgument(a), Self::InvalidArgument(b)) => a == b,
            (
                Self::LengthMismatch { requested: ar, supplied: asu },
                Self::LengthMismatch { requested: br, supplied: bsu },
            ) => ar == br && asu == bsu,
            (Self::GroupMemberFailed(a), Self::GroupMemberFailed(b)) => a == b,
            (Self::SpawnFailed(a), Self::SpawnFailed(b)) => a == b,
            (Self::SubprocessFailed(a), Self::SubprocessFailed(b)) => a == b,
            (Self::SubprocessTimeout, Self::SubprocessTimeout) => true,
            (Self::Io(a), Self::Io(b)) => a.kind() == b.kind(),
            (Self::Panic(a), Self::Panic(b)) => a == b,
            _ => false,
        }
    }
}

impl RtError {
    /// True for `Cancelled`/`ScopeCancelled` — the cancel family of errors,
    /// which callers (task groups, `join`) treat specially rather than as
    /// an aggregated failure.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled(_) | Self::ScopeCancelled(_))
    }

    /// True for `Timeout`/`ScopeTimeout` — both subclass the cancel family
    /// per spec: a fired deadline unwinds exactly like a cancellation.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout | Self::ScopeTimeout)
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, RtError>;

/// Wrapper so `RtError` can be used as a boxed `dyn std::error::Error`
/// payload inside a task's outcome without requiring the outcome type
/// itself to implement `std::error::Error`.
#[derive(Debug)]
pub struct Boxed(pub RtError);

impl fmt::Display for Boxed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for Boxed {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancellation_family() {
        assert!(RtError::Cancelled(TaskId(1)).is_cancellation());
        assert!(RtError::ScopeCancelled(TaskId(1)).is_cancellation());
        assert!(!RtError::Timeout.is_cancellation());
    }

    #[test]
    fn timeout_family() {
        assert!(RtError::Timeout.is_timeout());
        assert!(RtError::ScopeTimeout.is_timeout());
        assert!(!RtError::QueueFull.is_timeout());
    }
}

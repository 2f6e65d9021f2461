//! Cancellation and deadline scopes.
//!
//! Cancellation is cooperative and edge-triggered: `scheduler::cancel`
//! only sets a flag and wakes the target; nothing forces control back
//! to the scheduler mid-poll. A task observes its own cancellation by
//! calling [`check_cancelled`] at a convenient point (typically inside
//! a loop body) or simply by `.await`ing any suspension point: every
//! waitable's `poll()` in this crate (channel send/recv, queue put/get/
//! join, event wait, semaphore acquire, sleep, group wait, task join,
//! gather) calls [`check_cancelled`] itself before parking — and before
//! resuming an already-parked waiter — cleans up its own waiter entry
//! exactly as `Drop` would, and resolves with `RtError::Cancelled`
//! instead of waiting on a condition that will never again matter to a
//! task the scheduler is trying to unwind.
//!
//! [`wait_for`] and [`timeout_after`] build timeouts out of the same
//! primitive: race the operation against a [`crate::timer::sleep`] and
//! whichever finishes first wins, the other is dropped (and, for a
//! `Sleep`, cancels its still-pending timer automatically).

use crate::error::RtError;
use crate::scheduler;
use crate::task::TaskId;
use crate::timer;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

/// True if the current task (or `id`, if given) has a pending
/// cancellation request that hasn't yet been observed.
pub fn is_cancelled(id: Option<TaskId>) -> bool {
    let id = id.or_else(scheduler::current_task);
    id.map(scheduler::cancel_requested).unwrap_or(false)
}

/// Cooperative cancellation check: returns `Err(RtError::Cancelled)` if
/// the current task's cancellation flag is set, `Ok(())` otherwise.
/// Intended to be called at loop heads inside long-running task bodies
/// that don't otherwise suspend often enough to pick up cancellation on
/// their own.
pub fn check_cancelled() -> Result<(), RtError> {
    let Some(id) = scheduler::current_task() else {
        return Ok(());
    };
    if scheduler::cancel_requested(id) {
        let reason = scheduler::take_cancel_reason(id);
        tracing::debug!(task = %id, reason = ?reason, "observed cancellation");
        Err(RtError::Cancelled(id))
    } else {
        Ok(())
    }
}

/// Race `fut` against a `timeout` deadline. `Ok(value)` if `fut`
/// resolves first; `Err(RtError::Timeout)` if the deadline elapses
/// first — `fut` is then dropped, so anything it was suspended on
/// (a parked channel/queue waiter, an in-flight timer) is released via
/// its own `Drop` impl.
pub fn wait_for<F: Future>(fut: F, timeout: Duration) -> WaitFor<F> {
    WaitFor {
        fut: Box::pin(fut),
        sleep: Box::pin(timer::sleep(timeout)),
    }
}

pub struct WaitFor<F: Future> {
    fut: Pin<Box<F>>,
    sleep: Pin<Box<timer::Sleep>>,
}

impl<F: Future> Future for WaitFor<F> {
    type Output = Result<F::Output, RtError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Poll::Ready(value) = self.fut.as_mut().poll(cx) {
            return Poll::Ready(Ok(value));
        }
        if let Poll::Ready(sleep_result) = self.sleep.as_mut().poll(cx) {
            return match sleep_result {
                Ok(()) => Poll::Ready(Err(RtError::Timeout)),
                Err(e) => Poll::Ready(Err(e)),
            };
        }
        if let Err(e) = check_cancelled() {
            return Poll::Ready(Err(e));
        }
        Poll::Pending
    }
}

/// A deadline scope: `timeout_after(dur).run(fut).await` resolves
/// `Err(RtError::ScopeTimeout)` if `fut` hasn't finished within `dur`,
/// distinct from the bare `wait_for` timeout so callers can tell a
/// scope's deadline apart from an ad hoc one.
pub struct TimeoutScope {
    duration: Duration,
}

pub fn timeout_after(duration: Duration) -> TimeoutScope {
    TimeoutScope { duration }
}

impl TimeoutScope {
    pub async fn run<F: Future>(&self, fut: F) -> Result<F::Output, RtError> {
        match wait_for(fut, self.duration).await {
            Ok(value) => Ok(value),
            Err(RtError::Timeout) => Err(RtError::ScopeTimeout),
            Err(other) => Err(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler;

    #[test]
    fn wait_for_returns_ok_when_future_wins() {
        scheduler::reset_for_test();
        let handle = scheduler::spawn(async {
            wait_for(std::future::ready(5), Duration::from_secs(10)).await
        });
        scheduler::step();
        assert!(matches!(handle.try_result(), Some(Ok(Ok(5)))));
    }

    #[test]
    fn wait_for_times_out_against_pending_future() {
        scheduler::reset_for_test();
        let handle = scheduler::spawn(async {
            wait_for(std::future::pending::<()>(), Duration::from_millis(1)).await
        });
        scheduler::step();
        assert!(handle.try_result().is_none());
        std::thread::sleep(Duration::from_millis(5));
        timer::tick(std::time::Instant::now());
        scheduler::step();
        assert!(matches!(handle.try_result(), Some(Ok(Err(RtError::Timeout)))));
    }

    #[test]
    fn check_cancelled_outside_task_is_ok() {
        assert!(check_cancelled().is_ok());
    }
}

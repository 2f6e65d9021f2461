//! Ad hoc multi-wait over a batch of already-spawned tasks.
//!
//! Unlike a [`crate::group::TaskGroup`] (a scope tasks are born into),
//! `gather` is a one-off wait over a `Vec<JoinHandle<T>>` collected from
//! wherever: "wait for all of these", "wait for the first `n`", "wait
//! for any one, then stop caring about the rest".

use crate::error::RtError;
use crate::scheduler;
use crate::task::{JoinHandle, Outcome};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

/// Options controlling [`gather`]'s wait and error semantics.
#[derive(Clone, Copy, Debug)]
pub struct GatherOptions {
    /// Stop once this many of the handles have resolved. Defaults to
    /// all of them. Racing to a deliberately redundant set of workers
    /// who compute the same thing.
    pub race: Option<usize>,
    /// If true, the first member to error short-circuits the whole
    /// gather with that error rather than waiting for `race` count.
    pub propagate_errors: bool,
    /// If true, once `race` is satisfied, cancel every handle that
    /// hasn't resolved yet instead of leaving it running unobserved.
    pub clear_unused: bool,
}

impl Default for GatherOptions {
    fn default() -> Self {
        GatherOptions {
            race: None,
            propagate_errors: true,
            clear_unused: false,
        }
    }
}

/// Wait on a batch of same-typed task handles per `opts`. Resolves to a
/// vector the same length as `handles`, `None` at the index of any
/// handle `clear_unused` cancelled before it finished.
pub fn gather<T: Clone>(
    handles: Vec<JoinHandle<T>>,
    opts: GatherOptions,
) -> Result<GatherFuture<T>, RtError> {
    let race = opts.race.unwrap_or(handles.len());
    if race > handles.len() {
        return Err(RtError::LengthMismatch {
            requested: race,
            supplied: handles.len(),
        });
    }
    Ok(GatherFuture {
        handles,
        opts,
        race,
        done: false,
        registered: false,
    })
}

pub struct GatherFuture<T: Clone> {
    handles: Vec<JoinHandle<T>>,
    opts: GatherOptions,
    race: usize,
    done: bool,
    /// Once `true`, every still-pending handle's `awaiter` slot points
    /// at this gather's own task, so a member's terminal transition
    /// re-queues this task directly (see `Scheduler::finish`) instead
    /// of this future re-polling itself every tick.
    registered: bool,
}

impl<T: Clone> Future for GatherFuture<T> {
    type Output = Result<Vec<Option<Outcome<T>>>, RtError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        assert!(!this.done, "GatherFuture polled after completion");

        let results: Vec<Option<Outcome<T>>> =
            this.handles.iter().map(|h| h.try_result()).collect();
        let resolved = results.iter().filter(|r| r.is_some()).count();

        if this.opts.propagate_errors {
            if let Some(Some(Err(err))) = results.iter().find(|r| matches!(r, Some(Err(_)))) {
                this.done = true;
                return Poll::Ready(Err(err.clone()));
            }
        }

        if resolved >= this.race {
            this.done = true;
            if this.opts.clear_unused {
                for (handle, result) in this.handles.iter().zip(&results) {
                    if result.is_none() {
                        scheduler::cancel(handle.id(), Some("gather race satisfied".into()));
                    }
                }
            }
            return Poll::Ready(Ok(results));
        }

        if let Err(e) = crate::cancel::check_cancelled() {
            this.done = true;
            if this.opts.clear_unused {
                for (handle, result) in this.handles.iter().zip(&results) {
                    if result.is_none() {
                        scheduler::cancel(handle.id(), Some("gather cancelled".into()));
                    }
                }
            }
            return Poll::Ready(Err(e));
        }

        // Register as the awaiter of every handle still outstanding, so
        // each one's terminal transition re-queues this task directly.
        // A handle can only carry one awaiter (§3), so this assumes
        // exclusive use of the handles passed in — the documented
        // contract for `gather`'s input batch. Done once: re-polls that
        // don't change the pending set need no further bookkeeping.
        //
        // A self-requeuing `cx.waker().wake_by_ref()` here (re-poll
        // every tick until something resolves) would keep the ready
        // queue permanently non-empty while a gather is outstanding,
        // starving the timer wheel and reactor — `Runtime::run_once`
        // only consults them once the ready queue drains (spec.md §4.1
        // step 3). Registering as an explicit awaiter instead lets this
        // task go fully quiet between resolutions.
        if !this.registered {
            match scheduler::current_task() {
                Some(me) => {
                    for (handle, result) in this.handles.iter().zip(&results) {
                        if result.is_none() {
                            scheduler::set_awaiter(handle.id(), me);
                        }
                    }
                }
                None => {
                    // Polled with no enclosing task (e.g. directly in a
                    // unit test harness) — there is no awaiter slot to
                    // register against, so fall back to cooperative
                    // re-polling.
                    cx.waker().wake_by_ref();
                }
            }
            this.registered = true;
        }
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gather_all_waits_for_every_handle() {
        scheduler::reset_for_test();
        let a = scheduler::spawn(async { 1 });
        let b = scheduler::spawn(async { 2 });
        let fut = gather(vec![a, b], GatherOptions::default()).unwrap();
        scheduler::step();
        let handle = scheduler::spawn(fut);
        scheduler::step();
        scheduler::step();
        match handle.try_result() {
            Some(Ok(Ok(results))) => {
                assert_eq!(results, vec![Some(Ok(1)), Some(Ok(2))]);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn gather_race_one_returns_after_first() {
        scheduler::reset_for_test();
        let a = scheduler::spawn(std::future::pending::<i32>());
        let b = scheduler::spawn(async { 9 });
        let opts = GatherOptions {
            race: Some(1),
            propagate_errors: true,
            clear_unused: true,
        };
        let fut = gather(vec![a, b], opts).unwrap();
        scheduler::step();
        let handle = scheduler::spawn(fut);
        scheduler::step();
        scheduler::step();
        assert!(handle.try_result().is_some());
    }

    #[test]
    fn cancelling_the_gathering_task_resolves_cancelled_and_clears_members() {
        scheduler::reset_for_test();
        let a = scheduler::spawn(std::future::pending::<i32>());
        let b = scheduler::spawn(std::future::pending::<i32>());
        let opts = GatherOptions {
            race: Some(2),
            propagate_errors: true,
            clear_unused: true,
        };
        let fut = gather(vec![a.clone(), b.clone()], opts).unwrap();
        let handle = scheduler::spawn(fut);
        scheduler::step();
        assert!(handle.try_result().is_none());
        scheduler::cancel(handle.id(), None);
        scheduler::step();
        assert_eq!(
            scheduler::state_of(handle.id()),
            Some(crate::task::TaskState::Cancelled)
        );
        assert!(scheduler::cancel_requested(a.id()));
        assert!(scheduler::cancel_requested(b.id()));
    }

    #[test]
    fn gather_rejects_race_exceeding_handle_count() {
        scheduler::reset_for_test();
        let a = scheduler::spawn(async { 1 });
        let opts = GatherOptions {
            race: Some(2),
            ..GatherOptions::default()
        };
        assert!(matches!(
            gather(vec![a], opts),
            Err(RtError::LengthMismatch { requested: 2, supplied: 1 })
        ));
    }
}

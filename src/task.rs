//! Task data model.
//!
//! A task is the unit of scheduling: a single coroutine driven to
//! completion by repeated polling. This runtime realizes "a coroutine
//! suspending on a kernel request" the idiomatic-Rust way: each
//! suspension point is a value implementing [`std::future::Future`], and
//! `Poll::Pending` plus a later `Waker::wake()` call *is* the kernel
//! request / resume protocol spec.md describes abstractly. A channel
//! recv, a timer sleep, and a reactor-registered read all follow the same
//! shape: register interest somewhere reachable from the waker, return
//! `Pending`, and let whoever satisfies the interest call `wake()`, which
//! re-inserts the task id into the scheduler's ready queue.
//!
//! The scheduler stores tasks type-erased (each task's `Future::Output`
//! differs), so this module splits the task record in two: [`TaskMeta`]
//! carries the bookkeeping the scheduler and task groups need regardless
//! of output type, and [`ErasedTask`] is the object-safe trait a concrete
//! `F: Future` is adapted into so the scheduler can poll it without
//! knowing `F::Output`.

use crate::error::RtError;
use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

/// Unique identifier for a task, assigned by the scheduler at spawn time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Task({})", self.0)
    }
}

/// Task execution state, per spec §3's full lifecycle (not just the
/// coarse ready/running/blocked/done axis a plain executor needs).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Spawned but not yet given its first poll.
    Pending,
    /// In the scheduler's ready queue, waiting for its turn this tick.
    Ready,
    /// Currently being polled.
    Running,
    /// Parked on a kernel request (timer, channel, reactor fd, join).
    Suspended,
    /// Returned a value; `result` holds it.
    Completed,
    /// Returned an error (including one propagated from an awaited task).
    Erred,
    /// Unwound by `cancel()` or an enclosing scope without having erred
    /// on its own.
    Cancelled,
    /// Terminated by delivery of a subprocess-originated signal.
    Signaled,
}

impl TaskState {
    /// True once the task will never be polled again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Erred | TaskState::Cancelled | TaskState::Signaled
        )
    }
}

/// How a task relates to the rest of the task tree, per spec §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    /// Top-level or detached task with no awaiter.
    Regular,
    /// Spawned and immediately awaited by its spawner.
    Async,
    /// Currently being waited on by exactly one other task via `join`.
    Awaited,
    /// A member of a task group, subject to the group's wait policy.
    Paralleled,
    /// A cooperative fiber stepped directly rather than scheduled, used
    /// internally by the subprocess supervisor's IPC pump.
    Fiber,
    /// Has no coroutine of its own (a pre-resolved value wrapped as a
    /// task so it can be passed to `gather`/groups uniformly).
    Stateless,
    /// A task whose terminal transition is driven by the subprocess
    /// supervisor rather than by its own coroutine completing (spec.md
    /// §4.9's `paralleled/process`) — set on the caller's task by
    /// [`crate::subprocess::add_future`] so `gather`/groups know its
    /// outcome comes from a child process, not a polled future racing
    /// against one.
    Process,
}

/// The terminal outcome of a task, stored once its state becomes
/// terminal. `Ok` carries the type-erased return value of the task's
/// future (see [`AnyOutcome`]); `Err` carries the `RtError` that ended
/// it, including `Cancelled`/`ScopeCancelled` for the non-erred unwind
/// paths — callers distinguish those via [`RtError::is_cancellation`].
pub type Outcome<T> = Result<T, RtError>;

/// A type-erased completion value, used where the scheduler must hold
/// results for tasks of differing output types in one table (e.g. the
/// terminal-record GC list).
pub type AnyOutcome = Outcome<Rc<dyn std::any::Any>>;

/// A boxed, pinned future, the shape every coroutine is adapted to
/// before being handed to the scheduler.
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T>>>;

/// Object-safe adaptor over a concrete `Future<Output = T>`, letting the
/// scheduler poll tasks of different `T` through one trait object.
///
/// `poll_task` drives the inner future and, on `Ready`, writes the
/// (possibly panic-caught) outcome into the task's shared slot and
/// returns `Poll::Ready(())`. The scheduler never sees `T`.
pub trait ErasedTask {
    fn poll_task(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()>;
}

/// Shared slot a [`JoinHandle`] and its producing task both hold a
/// handle to. `Rc`, not `Arc`: this runtime is single-threaded (§5).
pub type ResultSlot<T> = Rc<RefCell<Option<Outcome<T>>>>;

struct AdaptedTask<F: Future> {
    inner: F,
    slot: ResultSlot<F::Output>,
}

impl<F> ErasedTask for AdaptedTask<F>
where
    F: Future,
{
    fn poll_task(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        // SAFETY: projecting a pin-to-field where the field is never
        // moved out of and `Self` is only ever handled behind `Pin`.
        let this = unsafe { self.get_unchecked_mut() };
        let inner = unsafe { Pin::new_unchecked(&mut this.inner) };
        match inner.poll(cx) {
            Poll::Ready(value) => {
                *this.slot.borrow_mut() = Some(Ok(value));
                Poll::Ready(())
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Wrap a concrete future and its result slot into a type-erased,
/// boxed, pinned task the scheduler can store and poll.
pub fn adapt<F>(inner: F, slot: ResultSlot<F::Output>) -> Pin<Box<dyn ErasedTask>>
where
    F: Future + 'static,
    F::Output: 'static,
{
    Box::pin(AdaptedTask { inner, slot })
}

/// A handle to a spawned task's eventual result, returned by
/// [`crate::Scheduler::spawn`]. Awaiting `join()` on it (or calling the
/// blocking [`crate::Scheduler::join`]) yields `Ok(T)` on normal
/// completion or `Err(RtError)` for erred/cancelled/signaled tasks.
pub struct JoinHandle<T> {
    pub(crate) id: TaskId,
    pub(crate) slot: ResultSlot<T>,
}

impl<T> Clone for JoinHandle<T> {
    fn clone(&self) -> Self {
        JoinHandle {
            id: self.id,
            slot: Rc::clone(&self.slot),
        }
    }
}

impl<T> JoinHandle<T> {
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Non-blocking peek: `Some(outcome)` once the task has finished,
    /// `None` while it is still pending/running/suspended.
    pub fn try_result(&self) -> Option<Outcome<T>>
    where
        T: Clone,
    {
        self.slot.borrow().clone()
    }

    /// Suspend the calling task until this handle's task is terminal,
    /// yielding its outcome — spec §4.1's `join(id)` realized as a plain
    /// `Future` rather than a bespoke kernel request: the target task's
    /// `awaiter` slot (§3) is set to the caller, and the scheduler's own
    /// terminal-transition bookkeeping (`Scheduler::finish`) re-queues
    /// the caller directly, no waker or polling needed beyond the first.
    pub fn join(&self) -> Join<T>
    where
        T: Clone,
    {
        Join {
            id: self.id,
            slot: Rc::clone(&self.slot),
            registered: false,
        }
    }
}

/// The suspension point behind [`JoinHandle::join`].
pub struct Join<T> {
    id: TaskId,
    slot: ResultSlot<T>,
    registered: bool,
}

impl<T: Clone> Future for Join<T> {
    type Output = Outcome<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if let Some(outcome) = this.slot.borrow().clone() {
            return Poll::Ready(outcome);
        }
        if this.registered {
            if let Err(e) = crate::cancel::check_cancelled() {
                return Poll::Ready(Err(e));
            }
        }
        if !this.registered {
            // Single-threaded: nothing can complete the target between
            // this check and registering, so there is no lost-wakeup
            // window to guard against.
            if let Some(me) = crate::scheduler::current_task() {
                crate::scheduler::set_awaiter(this.id, me);
            } else {
                // Polled with no enclosing task (e.g. directly in a
                // unit test) — nothing to register as awaiter; ask to
                // be polled again so the caller can drive progress
                // itself rather than hanging.
                cx.waker().wake_by_ref();
            }
            this.registered = true;
        }
        Poll::Pending
    }
}

/// Per-task bookkeeping the scheduler, cancel scopes, and task groups
/// all need, independent of the task's concrete output type.
pub struct TaskMeta {
    pub id: TaskId,
    pub name: Option<&'static str>,
    pub state: TaskState,
    pub kind: TaskKind,
    /// The task currently blocked in `join(self.id)`, if any. At most
    /// one, per spec §3 ("awaiter").
    pub awaiter: Option<TaskId>,
    /// The task group this task is a member of, if any.
    pub group: Option<crate::group::GroupId>,
    /// Set by `cancel()`/a firing cancel scope; consulted at the next
    /// suspension point rather than interrupting mid-poll.
    pub cancel_requested: bool,
    /// Reason string recorded alongside `cancel_requested`, surfaced on
    /// the resulting `RtError::Cancelled`/`ScopeCancelled`.
    pub cancel_reason: Option<String>,
}

impl TaskMeta {
    pub fn new(id: TaskId, name: Option<&'static str>, kind: TaskKind) -> Self {
        TaskMeta {
            id,
            name,
            state: TaskState::Pending,
            kind,
            awaiter: None,
            group: None,
            cancel_requested: false,
            cancel_reason: None,
        }
    }
}

//! The cooperative task scheduler.
//!
//! One ready queue, stepped in FIFO order, one task polled at a time.
//! Suspension is realized through the standard `Future`/`Waker`
//! contract: a primitive's `poll()` either returns a value or parks by
//! registering this task's waker somewhere it will be called from later
//! (a timer firing, a channel rendezvous, a reactor readiness event) and
//! returns `Pending`. The waker, when invoked, does exactly one thing:
//! push the task id back onto the ready queue. That single operation is
//! the entire "resume" side of spec.md's kernel-request contract.

use crate::error::RtError;
use crate::task::{
    adapt, AnyOutcome, ErasedTask, JoinHandle, Outcome, ResultSlot, TaskId, TaskKind, TaskMeta,
    TaskState,
};
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};

thread_local! {
    /// The task id currently being polled, if any. Cooperation
    /// primitives (channel, queue, event, semaphore, cancel scopes) read
    /// this to find out who is suspending, rather than threading a
    /// context argument through every suspension point.
    static CURRENT_TASK: Cell<Option<TaskId>> = const { Cell::new(None) };
}

/// Returns the id of the task currently being polled, or `None` if
/// called from outside a scheduler step (e.g. before `run` starts).
pub fn current_task() -> Option<TaskId> {
    CURRENT_TASK.with(|c| c.get())
}

struct WakerState {
    task_id: TaskId,
    ready: ReadyQueue,
}

/// FIFO ready queue with idempotent membership: waking an already-ready
/// task is a no-op rather than a duplicate entry, so a task can never be
/// polled twice for one wake.
#[derive(Clone)]
struct ReadyQueue(Rc<RefCell<ReadyInner>>);

struct ReadyInner {
    order: VecDeque<TaskId>,
    member: HashSet<TaskId>,
}

impl ReadyQueue {
    fn new() -> Self {
        ReadyQueue(Rc::new(RefCell::new(ReadyInner {
            order: VecDeque::new(),
            member: HashSet::new(),
        })))
    }

    fn push(&self, id: TaskId) {
        let mut inner = self.0.borrow_mut();
        if inner.member.insert(id) {
            inner.order.push_back(id);
        }
    }

    fn pop_all(&self) -> Vec<TaskId> {
        let mut inner = self.0.borrow_mut();
        inner.member.clear();
        inner.order.drain(..).collect()
    }

    fn is_empty(&self) -> bool {
        self.0.borrow().order.is_empty()
    }
}

struct TaskRecord {
    meta: TaskMeta,
    /// `None` once terminal — the polled future is dropped immediately
    /// so a suspended terminal task holds no borrowed resources.
    erased: Option<Pin<Box<dyn ErasedTask>>>,
}

/// The scheduler: owns every task's metadata and drives its future
/// forward one ready-queue pass at a time. See [`crate::Runtime`] for
/// the loop that also services the timer wheel and reactor between
/// passes — this type only knows about tasks and readiness.
pub struct Scheduler {
    tasks: HashMap<TaskId, TaskRecord>,
    ready: ReadyQueue,
    next_id: u64,
}

impl Scheduler {
    pub fn new() -> Self {
        Scheduler {
            tasks: HashMap::new(),
            ready: ReadyQueue::new(),
            next_id: 0,
        }
    }

    fn alloc_id(&mut self) -> TaskId {
        let id = TaskId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Spawn a future as a new task, returning a handle to its eventual
    /// result. The task is queued ready and will get its first poll on
    /// the next scheduler step.
    pub fn spawn<F>(&mut self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + 'static,
        F::Output: 'static,
    {
        self.spawn_named(None, TaskKind::Regular, future)
    }

    /// Spawn a fire-and-forget task: nobody holds (or will ever call)
    /// its `JoinHandle`, so per spec.md §4.1/§7 a `stateless` task's
    /// failure must not surface anywhere — it is reaped the instant it
    /// terminates rather than retained for a `join` that will never
    /// come.
    pub fn spawn_stateless<F>(&mut self, future: F)
    where
        F: Future + 'static,
        F::Output: 'static,
    {
        let handle = self.spawn_named(None, TaskKind::Stateless, future);
        self.reap(handle.id);
    }

    pub fn spawn_named<F>(
        &mut self,
        name: Option<&'static str>,
        kind: TaskKind,
        future: F,
    ) -> JoinHandle<F::Output>
    where
        F: Future + 'static,
        F::Output: 'static,
    {
        let id = self.alloc_id();
        let slot: ResultSlot<F::Output> = Rc::new(RefCell::new(None));
        let erased = adapt(future, Rc::clone(&slot));
        let mut meta = TaskMeta::new(id, name, kind);
        meta.state = TaskState::Ready;
        self.tasks.insert(
            id,
            TaskRecord {
                meta,
                erased: Some(erased),
            },
        );
        self.ready.push(id);
        tracing::debug!(task = %id, "task spawned");
        JoinHandle { id, slot }
    }

    /// Build a waker whose `wake()` re-queues `id` onto this scheduler's
    /// ready queue, via a hand-rolled `RawWaker` vtable rather than a
    /// library-provided waker helper.
    fn waker_for(&self, id: TaskId) -> Waker {
        let state = Box::new(WakerState {
            task_id: id,
            ready: self.ready.clone(),
        });
        let raw = RawWaker::new(Box::into_raw(state) as *const (), &WAKER_VTABLE);
        unsafe { Waker::from_raw(raw) }
    }

    pub fn state_of(&self, id: TaskId) -> Option<TaskState> {
        self.tasks.get(&id).map(|r| r.meta.state)
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn ready_count(&self) -> usize {
        self.ready.0.borrow().order.len()
    }

    /// Request cancellation of `id`. Cancellation is cooperative: it
    /// sets a flag consulted at the task's next suspension point rather
    /// than unwinding it synchronously. The task is woken immediately so
    /// that point arrives on the next step even if it was parked
    /// indefinitely.
    pub fn cancel(&mut self, id: TaskId, reason: Option<String>) {
        if let Some(record) = self.tasks.get_mut(&id) {
            if record.meta.state.is_terminal() {
                return;
            }
            record.meta.cancel_requested = true;
            record.meta.cancel_reason = reason;
            self.ready.push(id);
            tracing::debug!(task = %id, "cancellation requested");
        }
    }

    /// True if the current task (or an explicit `id`) has a pending
    /// cancellation request. Suspension points call this just before
    /// returning `Pending` and unwind with `RtError::Cancelled` instead
    /// when it is set.
    pub fn cancel_requested(&self, id: TaskId) -> bool {
        self.tasks
            .get(&id)
            .map(|r| r.meta.cancel_requested)
            .unwrap_or(false)
    }

    pub fn take_cancel_reason(&mut self, id: TaskId) -> Option<String> {
        self.tasks.get_mut(&id).and_then(|r| r.meta.cancel_reason.take())
    }

    pub fn set_awaiter(&mut self, id: TaskId, awaiter: TaskId) {
        if let Some(record) = self.tasks.get_mut(&id) {
            record.meta.awaiter = Some(awaiter);
            record.meta.kind = TaskKind::Awaited;
        }
    }

    pub fn set_group(&mut self, id: TaskId, group: crate::group::GroupId) {
        if let Some(record) = self.tasks.get_mut(&id) {
            record.meta.group = Some(group);
            record.meta.kind = TaskKind::Paralleled;
        }
    }

    /// Overwrite a task's `kind` directly, used by the subprocess
    /// supervisor to mark the caller of `add_future` as `Process` (§4.9)
    /// without otherwise touching its awaiter/group bookkeeping.
    pub fn set_kind(&mut self, id: TaskId, kind: TaskKind) {
        if let Some(record) = self.tasks.get_mut(&id) {
            record.meta.kind = kind;
        }
    }

    /// Wake a task directly, without going through its future's waker.
    /// Used by primitives that hold a raw `TaskId` rather than a
    /// `Waker` (the timer wheel, the reactor).
    pub fn wake(&self, id: TaskId) {
        self.ready.push(id);
    }

    /// Poll every task currently in the ready queue exactly once. Tasks
    /// woken during this pass (including by each other, via a
    /// same-step rendezvous) run on the *next* call, not this one —
    /// this is what makes one step a well-defined "tick".
    pub fn step(&mut self) -> usize {
        let batch = self.ready.pop_all();
        let mut polled = 0;
        for id in batch {
            let Some(mut record) = self.tasks.remove(&id) else {
                continue;
            };
            if record.meta.state.is_terminal() {
                continue;
            }
            let Some(mut erased) = record.erased.take() else {
                continue;
            };
            record.meta.state = TaskState::Running;
            CURRENT_TASK.with(|c| c.set(Some(id)));
            let waker = self.waker_for(id);
            let mut cx = Context::from_waker(&waker);
            let poll = erased.as_mut().poll_task(&mut cx);
            CURRENT_TASK.with(|c| c.set(None));
            polled += 1;

            match poll {
                Poll::Ready(()) => {
                    self.finish(id, record);
                }
                Poll::Pending => {
                    record.meta.state = TaskState::Suspended;
                    record.erased = Some(erased);
                    self.tasks.insert(id, record);
                }
            }
        }
        polled
    }

    fn finish(&mut self, id: TaskId, mut record: TaskRecord) {
        // The adapted future already wrote its outcome into the join
        // slot; here we only need to settle bookkeeping state and wake
        // whoever is waiting on this task.
        record.meta.state = if record.meta.cancel_requested {
            TaskState::Cancelled
        } else {
            TaskState::Completed
        };
        tracing::debug!(task = %id, state = ?record.meta.state, "task finished");
        if let Some(awaiter) = record.meta.awaiter {
            self.ready.push(awaiter);
        }
        if let Some(group) = record.meta.group {
            crate::group::notify_member_finished(group, id);
        }
        let stateless = record.meta.kind == TaskKind::Stateless;
        self.tasks.insert(id, record);
        if stateless {
            self.reap(id);
        }
    }

    /// Mark a task's outcome as erred (used when a suspension point
    /// propagates `RtError` into the task's own result rather than
    /// letting the future's `Ok` branch run). The caller is expected to
    /// have already written the error into the task's result slot.
    pub fn mark_erred(&mut self, id: TaskId) {
        if let Some(record) = self.tasks.get_mut(&id) {
            record.meta.state = if record.meta.cancel_requested {
                TaskState::Cancelled
            } else {
                TaskState::Erred
            };
            record.erased = None;
            let awaiter = record.meta.awaiter;
            let group = record.meta.group;
            if let Some(awaiter) = awaiter {
                self.ready.push(awaiter);
            }
            if let Some(group) = group {
                crate::group::notify_member_finished(group, id);
            }
        }
    }

    /// Drop every non-terminal task's future, marking it cancelled.
    /// `except` is preserved (used by `Runtime::run`'s entry task while
    /// tearing everything else down around it).
    pub fn shutdown(&mut self, except: Option<TaskId>) {
        let ids: Vec<TaskId> = self.tasks.keys().copied().collect();
        for id in ids {
            if Some(id) == except {
                continue;
            }
            if let Some(record) = self.tasks.get_mut(&id) {
                if !record.meta.state.is_terminal() {
                    record.meta.state = TaskState::Cancelled;
                    record.erased = None;
                }
            }
        }
        tracing::debug!("scheduler shutdown");
    }

    /// Drop the terminal record for `id` once its result has been
    /// collected elsewhere (by a `JoinHandle`, a gather, or a group),
    /// and it has no awaiter left to notify. Bounds the memory a
    /// long-running scheduler accumulates across many short tasks.
    pub fn reap(&mut self, id: TaskId) {
        if let Some(record) = self.tasks.get(&id) {
            if record.meta.state.is_terminal() && record.meta.awaiter.is_none() {
                self.tasks.remove(&id);
            }
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

thread_local! {
    /// The scheduler for this thread's runtime. Cooperation primitives
    /// and the task-group/gather/cancel modules reach the scheduler
    /// through the free functions below rather than each carrying a
    /// `&mut Scheduler` reference end to end — the same
    /// thread-local-handle shape a single-threaded cooperative kernel
    /// typically exposes its executor through.
    static GLOBAL: RefCell<Scheduler> = RefCell::new(Scheduler::new());
}

/// Spawn a future onto this thread's scheduler.
pub fn spawn<F>(future: F) -> JoinHandle<F::Output>
where
    F: Future + 'static,
    F::Output: 'static,
{
    GLOBAL.with(|s| s.borrow_mut().spawn(future))
}

pub fn spawn_named<F>(name: Option<&'static str>, kind: TaskKind, future: F) -> JoinHandle<F::Output>
where
    F: Future + 'static,
    F::Output: 'static,
{
    GLOBAL.with(|s| s.borrow_mut().spawn_named(name, kind, future))
}

/// Spawn a fire-and-forget task onto this thread's scheduler. See
/// [`Scheduler::spawn_stateless`].
pub fn spawn_stateless<F>(future: F)
where
    F: Future + 'static,
    F::Output: 'static,
{
    GLOBAL.with(|s| s.borrow_mut().spawn_stateless(future))
}

pub fn cancel(id: TaskId, reason: Option<String>) {
    GLOBAL.with(|s| s.borrow_mut().cancel(id, reason))
}

pub fn cancel_requested(id: TaskId) -> bool {
    GLOBAL.with(|s| s.borrow().cancel_requested(id))
}

pub fn take_cancel_reason(id: TaskId) -> Option<String> {
    GLOBAL.with(|s| s.borrow_mut().take_cancel_reason(id))
}

pub fn state_of(id: TaskId) -> Option<TaskState> {
    GLOBAL.with(|s| s.borrow().state_of(id))
}

pub fn set_awaiter(id: TaskId, awaiter: TaskId) {
    GLOBAL.with(|s| s.borrow_mut().set_awaiter(id, awaiter))
}

pub fn set_group(id: TaskId, group: crate::group::GroupId) {
    GLOBAL.with(|s| s.borrow_mut().set_group(id, group))
}

pub fn set_kind(id: TaskId, kind: TaskKind) {
    GLOBAL.with(|s| s.borrow_mut().set_kind(id, kind))
}

pub fn wake(id: TaskId) {
    GLOBAL.with(|s| s.borrow().wake(id))
}

pub fn reap(id: TaskId) {
    GLOBAL.with(|s| s.borrow_mut().reap(id))
}

/// Poll everything currently ready. Returns how many tasks were polled.
pub fn step() -> usize {
    GLOBAL.with(|s| s.borrow_mut().step())
}

pub fn ready_count() -> usize {
    GLOBAL.with(|s| s.borrow().ready_count())
}

pub fn is_empty() -> bool {
    GLOBAL.with(|s| s.borrow().is_empty())
}

pub fn shutdown(except: Option<TaskId>) {
    GLOBAL.with(|s| s.borrow_mut().shutdown(except))
}

/// Replace this thread's global scheduler with a fresh one. Test-only:
/// the thread-local scheduler otherwise persists across tests that
/// happen to land on the same worker thread.
#[cfg(test)]
pub fn reset_for_test() {
    GLOBAL.with(|s| *s.borrow_mut() = Scheduler::new());
}

const WAKER_VTABLE: RawWakerVTable =
    RawWakerVTable::new(waker_clone, waker_wake, waker_wake_by_ref, waker_drop);

unsafe fn waker_clone(ptr: *const ()) -> RawWaker {
    unsafe {
        let state = &*(ptr as *const WakerState);
        let cloned = Box::new(WakerState {
            task_id: state.task_id,
            ready: state.ready.clone(),
        });
        RawWaker::new(Box::into_raw(cloned) as *const (), &WAKER_VTABLE)
    }
}

unsafe fn waker_wake(ptr: *const ()) {
    unsafe {
        let state = Box::from_raw(ptr as *mut WakerState);
        state.ready.push(state.task_id);
    }
}

unsafe fn waker_wake_by_ref(ptr: *const ()) {
    unsafe {
        let state = &*(ptr as *const WakerState);
        state.ready.push(state.task_id);
    }
}

unsafe fn waker_drop(ptr: *const ()) {
    unsafe {
        drop(Box::from_raw(ptr as *mut WakerState));
    }
}

/// Blocking join used by synchronous call sites (tests, `Runtime::run`'s
/// top level): steps the scheduler until `id`'s outcome is available.
/// Callers inside a task should instead `.await` the future-based join
/// so the scheduler can run other tasks while this one waits; see
/// `crate::group`/`crate::gather` for that path.
pub fn blocking_join<T: Clone>(
    sched: &mut Scheduler,
    handle: &JoinHandle<T>,
    drive: impl FnMut(&mut Scheduler) -> bool,
) -> Outcome<T> {
    let mut drive = drive;
    loop {
        if let Some(outcome) = handle.try_result() {
            sched.reap(handle.id);
            return outcome;
        }
        if !drive(sched) {
            return Err(RtError::InvalidState(handle.id));
        }
    }
}

/// Helper for code that must hold an `AnyOutcome` uniformly (gather,
/// groups) without caring about the concrete `T`.
pub fn erase_outcome<T: 'static>(outcome: Outcome<T>) -> AnyOutcome {
    outcome.map(|v| Rc::new(v) as Rc<dyn std::any::Any>)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawn_and_step_to_completion() {
        let mut sched = Scheduler::new();
        let handle = sched.spawn(async { 5i32 });
        sched.step();
        assert_eq!(handle.try_result(), Some(Ok(5)));
    }

    #[test]
    fn cancel_marks_flag_and_wakes() {
        let mut sched = Scheduler::new();
        let handle = sched.spawn(std::future::pending::<()>());
        sched.step();
        sched.cancel(handle.id, Some("shutdown".into()));
        assert!(sched.cancel_requested(handle.id));
        assert_eq!(sched.ready_count(), 1);
    }

    #[test]
    fn reap_removes_terminal_task_without_awaiter() {
        let mut sched = Scheduler::new();
        let handle = sched.spawn(async { () });
        sched.step();
        assert!(handle.try_result().is_some());
        sched.reap(handle.id);
        assert!(sched.state_of(handle.id).is_none());
    }

    #[test]
    fn stateless_task_is_reaped_on_its_own_without_a_join() {
        let mut sched = Scheduler::new();
        sched.spawn_stateless(async {});
        sched.step();
        // The stateless task completed and reaped itself; nothing lingers
        // in the task table for a `join` that will never be called.
        assert!(sched.tasks.is_empty());
    }
}

//! Structured concurrency: task groups.
//!
//! A `TaskGroup` is a scope: every task spawned through it is a member,
//! and the scope does not exit until its wait policy is satisfied, at
//! which point every member still running is cancelled. This gives the
//! "no orphaned tasks" guarantee structured concurrency is named for —
//! a task tree can never outlive the scope that spawned it.

use crate::error::RtError;
use crate::scheduler;
use crate::task::{JoinHandle, TaskId, TaskKind};
use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

/// Identifies a task group for the scheduler's member-finished callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GroupId(u64);

thread_local! {
    static NEXT_GROUP_ID: std::cell::Cell<u64> = const { std::cell::Cell::new(0) };
    static REGISTRY: RefCell<HashMap<GroupId, Rc<RefCell<GroupState>>>> = RefCell::new(HashMap::new());
}

fn alloc_group_id() -> GroupId {
    NEXT_GROUP_ID.with(|c| {
        let id = c.get();
        c.set(id + 1);
        GroupId(id)
    })
}

/// How a group's `wait()` decides it is done.
#[derive(Clone, Copy)]
pub enum WaitPolicy {
    /// Done once every member has finished.
    All,
    /// Done once any one member finishes (successfully or not).
    Any,
    /// Done once a specific member finishes.
    Object(TaskId),
    /// Never done on its own; the scope only closes when `close()` is
    /// called explicitly (used for fire-and-forget supervisors).
    None,
}

struct GroupState {
    members: HashSet<TaskId>,
    finished: HashSet<TaskId>,
    first_error: Option<RtError>,
    waiters: VecDeque<Waker>,
    policy: WaitPolicy,
    satisfied: bool,
}

impl GroupState {
    fn check_satisfied(&mut self) -> bool {
        if self.satisfied {
            return true;
        }
        let done = match self.policy {
            WaitPolicy::All => !self.members.is_empty() && self.finished.len() == self.members.len(),
            WaitPolicy::Any => !self.finished.is_empty(),
            WaitPolicy::Object(id) => self.finished.contains(&id),
            WaitPolicy::None => false,
        };
        if done {
            self.satisfied = true;
        }
        done
    }
}

/// Called by the scheduler when a group member reaches a terminal
/// state. Looked up by id rather than held as a direct reference so the
/// scheduler doesn't need to know about `TaskGroup` at all.
pub fn notify_member_finished(group: GroupId, member: TaskId) {
    REGISTRY.with(|reg| {
        let Some(state) = reg.borrow().get(&group).cloned() else {
            return;
        };
        let mut state = state.borrow_mut();
        state.finished.insert(member);
        if let Some(outcome_err) = terminal_error(member) {
            if state.first_error.is_none() {
                state.first_error = Some(outcome_err);
            }
        }
        if state.check_satisfied() {
            for waker in state.waiters.drain(..) {
                waker.wake();
            }
        }
    });
}

fn terminal_error(id: TaskId) -> Option<RtError> {
    match scheduler::state_of(id) {
        Some(crate::task::TaskState::Erred) => Some(RtError::InvalidState(id)),
        Some(crate::task::TaskState::Cancelled) => Some(RtError::Cancelled(id)),
        Some(crate::task::TaskState::Signaled) => Some(RtError::InvalidState(id)),
        _ => None,
    }
}

/// A structured-concurrency scope. Spawn members with [`TaskGroup::spawn`],
/// then `.await` the group itself (or call [`TaskGroup::wait`]) to block
/// until the wait policy is satisfied. Dropping the group — whether the
/// wait resolved or the scope's owner errored — cancels every member
/// still running, so `enter`/`exit` is exactly-once and guaranteed even
/// on an early return, matching a context-manager's finally semantics.
pub struct TaskGroup {
    id: GroupId,
    state: Rc<RefCell<GroupState>>,
    exited: bool,
}

impl TaskGroup {
    pub fn new(policy: WaitPolicy) -> Self {
        let id = alloc_group_id();
        let state = Rc::new(RefCell::new(GroupState {
            members: HashSet::new(),
            finished: HashSet::new(),
            first_error: None,
            waiters: VecDeque::new(),
            policy,
            satisfied: false,
        }));
        REGISTRY.with(|reg| reg.borrow_mut().insert(id, Rc::clone(&state)));
        TaskGroup {
            id,
            state,
            exited: false,
        }
    }

    pub fn id(&self) -> GroupId {
        self.id
    }

    /// Spawn `future` as a member of this group.
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + 'static,
        F::Output: 'static,
    {
        let handle = scheduler::spawn_named(None, TaskKind::Paralleled, future);
        scheduler::set_group(handle.id(), self.id);
        self.state.borrow_mut().members.insert(handle.id());
        handle
    }

    pub fn member_count(&self) -> usize {
        self.state.borrow().members.len()
    }

    /// Suspend until the wait policy is satisfied.
    pub fn wait(&self) -> GroupWait {
        GroupWait {
            state: Rc::clone(&self.state),
        }
    }

    /// Cancel every member still running and close the scope. Called
    /// automatically on drop; safe to call early.
    pub fn close(&mut self) {
        if self.exited {
            return;
        }
        self.exited = true;
        let members: Vec<TaskId> = {
            let state = self.state.borrow();
            state
                .members
                .iter()
                .filter(|id| !state.finished.contains(id))
                .copied()
                .collect()
        };
        for id in members {
            scheduler::cancel(id, Some("task group closed".to_string()));
        }
        REGISTRY.with(|reg| reg.borrow_mut().remove(&self.id));
    }

    /// First error (or cancellation) raised by any member, if the group
    /// has observed one. Used by callers implementing "re-raise the
    /// first failure" aggregation on top of `wait`.
    pub fn first_error(&self) -> Option<RtError> {
        self.state.borrow().first_error.clone()
    }
}

impl Drop for TaskGroup {
    fn drop(&mut self) {
        self.close();
    }
}

pub struct GroupWait {
    state: Rc<RefCell<GroupState>>,
}

impl Future for GroupWait {
    type Output = Result<(), RtError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.state.borrow_mut();
        if state.check_satisfied() {
            return Poll::Ready(match state.first_error.clone() {
                Some(err) => Err(RtError::GroupMemberFailed(Box::new(err))),
                None => Ok(()),
            });
        }
        drop(state);
        if let Err(e) = crate::cancel::check_cancelled() {
            return Poll::Ready(Err(e));
        }
        self.state.borrow_mut().waiters.push_back(cx.waker().clone());
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_any_resolves_on_first_finisher() {
        scheduler::reset_for_test();
        let group = TaskGroup::new(WaitPolicy::Any);
        group.spawn(std::future::pending::<()>());
        group.spawn(async {});
        scheduler::step();
        assert!(group.state.borrow().satisfied);
    }

    #[test]
    fn group_all_waits_for_every_member() {
        scheduler::reset_for_test();
        let group = TaskGroup::new(WaitPolicy::All);
        let a = group.spawn(async { 1 });
        let b = group.spawn(std::future::ready(2));
        scheduler::step();
        assert!(group.state.borrow().satisfied);
        assert_eq!(a.try_result(), Some(Ok(1)));
        assert_eq!(b.try_result(), Some(Ok(2)));
    }

    #[test]
    fn close_cancels_unfinished_members() {
        scheduler::reset_for_test();
        let never = crate::sync::Event::new();
        let mut group = TaskGroup::new(WaitPolicy::None);
        let waiting = {
            let never = never.clone();
            group.spawn(async move { never.wait().await })
        };
        scheduler::step();
        group.close();
        scheduler::step();
        assert_eq!(
            scheduler::state_of(waiting.id()),
            Some(crate::task::TaskState::Cancelled)
        );
    }

    #[test]
    fn wait_itself_is_cancellable_while_parked() {
        scheduler::reset_for_test();
        let group = TaskGroup::new(WaitPolicy::All);
        let never = crate::sync::Event::new();
        let member = {
            let never = never.clone();
            group.spawn(async move { never.wait().await })
        };
        let wait_fut = group.wait();
        let waiter = scheduler::spawn(async move { wait_fut.await });
        scheduler::step();
        assert!(waiter.try_result().is_none());
        scheduler::cancel(waiter.id(), None);
        scheduler::step();
        assert_eq!(
            scheduler::state_of(waiter.id()),
            Some(crate::task::TaskState::Cancelled)
        );
        // The group itself wasn't closed, only the watcher task was
        // cancelled; its member is unaffected.
        assert!(!scheduler::cancel_requested(member.id()));
    }
}

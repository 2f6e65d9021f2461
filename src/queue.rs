//! Bounded/unbounded FIFO work queue, `asyncio.Queue`-shaped: `put`/
//! `get` suspend on capacity/emptiness, `task_done`/`join` let a
//! producer wait for a batch of consumers to drain what it queued.
//!
//! Waiters are tagged with a monotonic id so a future dropped before
//! resolving (e.g. the loser of a `wait_for` timeout race) removes its
//! own parked waker instead of leaving a dead entry behind — a queue
//! must have no pending getter once a `timeout_after(get())` has fired.

use crate::error::RtError;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

struct Inner<T> {
    items: VecDeque<T>,
    capacity: Option<usize>,
    /// Items queued but not yet matched with a `task_done()` call.
    unfinished: usize,
    next_waiter_id: u64,
    put_waiters: VecDeque<(u64, Waker)>,
    get_waiters: VecDeque<(u64, Waker)>,
    join_waiters: VecDeque<(u64, Waker)>,
}

impl<T> Inner<T> {
    fn alloc_waiter_id(&mut self) -> u64 {
        let id = self.next_waiter_id;
        self.next_waiter_id += 1;
        id
    }
}

/// A FIFO queue shared between producer and consumer tasks.
///
/// `Queue::new(None)` is unbounded: `put` never suspends. `Queue::new(Some(n))`
/// caps capacity at `n`: `put` suspends once the queue holds `n` items.
pub struct Queue<T> {
    inner: Rc<RefCell<Inner<T>>>,
}

impl<T> Clone for Queue<T> {
    fn clone(&self) -> Self {
        Queue {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T> Queue<T> {
    pub fn new(capacity: Option<usize>) -> Self {
        Queue {
            inner: Rc::new(RefCell::new(Inner {
                items: VecDeque::new(),
                capacity,
                unfinished: 0,
                next_waiter_id: 0,
                put_waiters: VecDeque::new(),
                get_waiters: VecDeque::new(),
                join_waiters: VecDeque::new(),
            })),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.borrow().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.borrow().items.is_empty()
    }

    pub fn is_full(&self) -> bool {
        let inner = self.inner.borrow();
        matches!(inner.capacity, Some(cap) if inner.items.len() >= cap)
    }

    /// True if no task is currently parked in `get()` — used by tests
    /// to confirm a dropped `get()` future cleaned up after itself.
    pub fn has_pending_getter(&self) -> bool {
        !self.inner.borrow().get_waiters.is_empty()
    }

    /// Enqueue without suspending. Fails if the queue is at capacity.
    pub fn put_nowait(&self, value: T) -> Result<(), RtError> {
        let mut inner = self.inner.borrow_mut();
        if let Some(cap) = inner.capacity {
            if inner.items.len() >= cap {
                return Err(RtError::QueueFull);
            }
        }
        inner.items.push_back(value);
        inner.unfinished += 1;
        if let Some((_, waker)) = inner.get_waiters.pop_front() {
            waker.wake();
        }
        Ok(())
    }

    /// Dequeue without suspending. Fails if the queue is empty.
    pub fn get_nowait(&self) -> Result<T, RtError> {
        let mut inner = self.inner.borrow_mut();
        match inner.items.pop_front() {
            Some(value) => {
                if let Some((_, waker)) = inner.put_waiters.pop_front() {
                    waker.wake();
                }
                Ok(value)
            }
            None => Err(RtError::QueueEmpty),
        }
    }

    /// Enqueue, suspending while the queue is at capacity.
    pub fn put(&self, value: T) -> PutFuture<T> {
        PutFuture {
            queue: self.clone(),
            value: Some(value),
            waiter_id: None,
        }
    }

    /// Dequeue, suspending while the queue is empty.
    pub fn get(&self) -> GetFuture<T> {
        GetFuture {
            queue: self.clone(),
            waiter_id: None,
        }
    }

    /// Mark one previously-dequeued item as fully processed. Once
    /// `unfinished` reaches zero, every task parked in `join()` wakes.
    pub fn task_done(&self) {
        let mut inner = self.inner.borrow_mut();
        if inner.unfinished > 0 {
            inner.unfinished -= 1;
        }
        if inner.unfinished == 0 {
            for (_, waker) in inner.join_waiters.drain(..) {
                waker.wake();
            }
        }
    }

    /// Suspend until every item ever `put` has had a matching
    /// `task_done()`.
    pub fn join(&self) -> JoinFuture<T> {
        JoinFuture {
            queue: self.clone(),
            waiter_id: None,
        }
    }
}

pub struct PutFuture<T> {
    queue: Queue<T>,
    value: Option<T>,
    waiter_id: Option<u64>,
}

impl<T> Future for PutFuture<T> {
    type Output = Result<(), RtError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut inner = this.queue.inner.borrow_mut();
        let at_capacity = matches!(inner.capacity, Some(cap) if inner.items.len() >= cap);
        if !at_capacity {
            if let Some(id) = this.waiter_id.take() {
                inner.put_waiters.retain(|(wid, _)| *wid != id);
            }
            inner
                .items
                .push_back(this.value.take().expect("polled after ready"));
            inner.unfinished += 1;
            if let Some((_, waker)) = inner.get_waiters.pop_front() {
                waker.wake();
            }
            return Poll::Ready(Ok(()));
        }
        if this.waiter_id.is_some() {
            if let Err(e) = crate::cancel::check_cancelled() {
                let id = this.waiter_id.take().unwrap();
                inner.put_waiters.retain(|(wid, _)| *wid != id);
                return Poll::Ready(Err(e));
            }
        }
        match this.waiter_id {
            Some(id) => {
                if let Some(entry) = inner.put_waiters.iter_mut().find(|(wid, _)| *wid == id) {
                    entry.1 = cx.waker().clone();
                }
            }
            None => {
                let id = inner.alloc_waiter_id();
                inner.put_waiters.push_back((id, cx.waker().clone()));
                this.waiter_id = Some(id);
            }
        }
        Poll::Pending
    }
}

impl<T> Drop for PutFuture<T> {
    fn drop(&mut self) {
        if let Some(id) = self.waiter_id {
            self.queue
                .inner
                .borrow_mut()
                .put_waiters
                .retain(|(wid, _)| *wid != id);
        }
    }
}

pub struct GetFuture<T> {
    queue: Queue<T>,
    waiter_id: Option<u64>,
}

impl<T> Future for GetFuture<T> {
    type Output = Result<T, RtError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut inner = this.queue.inner.borrow_mut();
        if let Some(value) = inner.items.pop_front() {
            if let Some(id) = this.waiter_id.take() {
                inner.get_waiters.retain(|(wid, _)| *wid != id);
            }
            if let Some((_, waker)) = inner.put_waiters.pop_front() {
                waker.wake();
            }
            return Poll::Ready(Ok(value));
        }
        if this.waiter_id.is_some() {
            if let Err(e) = crate::cancel::check_cancelled() {
                let id = this.waiter_id.take().unwrap();
                inner.get_waiters.retain(|(wid, _)| *wid != id);
                return Poll::Ready(Err(e));
            }
        }
        match this.waiter_id {
            Some(id) => {
                if let Some(entry) = inner.get_waiters.iter_mut().find(|(wid, _)| *wid == id) {
                    entry.1 = cx.waker().clone();
                }
            }
            None => {
                let id = inner.alloc_waiter_id();
                inner.get_waiters.push_back((id, cx.waker().clone()));
                this.waiter_id = Some(id);
            }
        }
        Poll::Pending
    }
}

impl<T> Drop for GetFuture<T> {
    fn drop(&mut self) {
        if let Some(id) = self.waiter_id {
            self.queue
                .inner
                .borrow_mut()
                .get_waiters
                .retain(|(wid, _)| *wid != id);
        }
    }
}

pub struct JoinFuture<T> {
    queue: Queue<T>,
    waiter_id: Option<u64>,
}

impl<T> Future for JoinFuture<T> {
    type Output = Result<(), RtError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut inner = this.queue.inner.borrow_mut();
        if inner.unfinished == 0 {
            if let Some(id) = this.waiter_id.take() {
                inner.join_waiters.retain(|(wid, _)| *wid != id);
            }
            return Poll::Ready(Ok(()));
        }
        if this.waiter_id.is_some() {
            if let Err(e) = crate::cancel::check_cancelled() {
                let id = this.waiter_id.take().unwrap();
                inner.join_waiters.retain(|(wid, _)| *wid != id);
                return Poll::Ready(Err(e));
            }
        }
        match this.waiter_id {
            Some(id) => {
                if let Some(entry) = inner.join_waiters.iter_mut().find(|(wid, _)| *wid == id) {
                    entry.1 = cx.waker().clone();
                }
            }
            None => {
                let id = inner.alloc_waiter_id();
                inner.join_waiters.push_back((id, cx.waker().clone()));
                this.waiter_id = Some(id);
            }
        }
        Poll::Pending
    }
}

impl<T> Drop for JoinFuture<T> {
    fn drop(&mut self) {
        if let Some(id) = self.waiter_id {
            self.queue
                .inner
                .borrow_mut()
                .join_waiters
                .retain(|(wid, _)| *wid != id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::Scheduler;

    #[test]
    fn put_nowait_then_get_nowait_fifo() {
        let q: Queue<i32> = Queue::new(None);
        q.put_nowait(1).unwrap();
        q.put_nowait(2).unwrap();
        assert_eq!(q.get_nowait().unwrap(), 1);
        assert_eq!(q.get_nowait().unwrap(), 2);
        assert!(matches!(q.get_nowait(), Err(RtError::QueueEmpty)));
    }

    #[test]
    fn bounded_queue_rejects_put_nowait_at_capacity() {
        let q: Queue<i32> = Queue::new(Some(1));
        q.put_nowait(1).unwrap();
        assert!(matches!(q.put_nowait(2), Err(RtError::QueueFull)));
    }

    #[test]
    fn blocking_get_suspends_until_put() {
        let q: Queue<i32> = Queue::new(None);
        let mut sched = Scheduler::new();
        let qc = q.clone();
        let handle = sched.spawn(async move { qc.get().await });
        sched.step();
        assert!(handle.try_result().is_none());
        q.put_nowait(9).unwrap();
        sched.step();
        assert_eq!(handle.try_result(), Some(Ok(Ok(9))));
    }

    #[test]
    fn join_waits_for_task_done() {
        let q: Queue<i32> = Queue::new(None);
        q.put_nowait(1).unwrap();
        let mut sched = Scheduler::new();
        let qc = q.clone();
        let handle = sched.spawn(async move { qc.join().await });
        sched.step();
        assert!(handle.try_result().is_none());
        q.task_done();
        sched.step();
        assert_eq!(handle.try_result(), Some(Ok(Ok(()))));
    }

    #[test]
    fn dropped_get_future_removes_its_own_waiter() {
        let q: Queue<i32> = Queue::new(None);
        let mut sched = Scheduler::new();
        let qc = q.clone();
        // Poll once directly (outside the scheduler) so the future parks
        // a waiter, then drop it without ever resolving.
        {
            let fut = qc.get();
            futures_poll_once(fut);
        }
        assert!(!q.has_pending_getter());
        let _ = sched.step();
    }

    #[test]
    fn cancelling_a_parked_getter_resolves_cancelled_not_stuck_pending() {
        crate::scheduler::reset_for_test();
        let q: Queue<i32> = Queue::new(None);
        let qc = q.clone();
        let handle = crate::scheduler::spawn(async move { qc.get().await });
        crate::scheduler::step();
        assert!(handle.try_result().is_none());
        crate::scheduler::cancel(handle.id(), None);
        crate::scheduler::step();
        assert_eq!(
            crate::scheduler::state_of(handle.id()),
            Some(crate::task::TaskState::Cancelled)
        );
        assert!(!q.has_pending_getter());
    }

    fn futures_poll_once<F: Future>(fut: F) {
        use std::task::{RawWaker, RawWakerVTable, Waker};
        fn no_op(_: *const ()) {}
        fn clone(_: *const ()) -> RawWaker {
            raw()
        }
        fn raw() -> RawWaker {
            static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, no_op, no_op, no_op);
            RawWaker::new(std::ptr::null(), &VTABLE)
        }
        let waker = unsafe { Waker::from_raw(raw()) };
        let mut cx = Context::from_waker(&waker);
        let mut fut = Box::pin(fut);
        let _ = fut.as_mut().poll(&mut cx);
    }
}

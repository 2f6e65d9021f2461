//! Event (latch) and counting Semaphore synchronization primitives.

use crate::error::RtError;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

/// A one-shot latch: any number of tasks can `wait()` on it; `set()`
/// wakes every waiter, in the order they parked, and the event stays
/// set for any future `wait()` (which then returns immediately).
/// `clear()` resets it so it can be waited on again.
#[derive(Clone)]
pub struct Event {
    inner: Rc<RefCell<EventInner>>,
}

struct EventInner {
    set: bool,
    waiters: VecDeque<(u64, Waker)>,
    next_waiter_id: u64,
}

impl Event {
    pub fn new() -> Self {
        Event {
            inner: Rc::new(RefCell::new(EventInner {
                set: false,
                waiters: VecDeque::new(),
                next_waiter_id: 0,
            })),
        }
    }

    pub fn is_set(&self) -> bool {
        self.inner.borrow().set
    }

    /// Wake every current waiter, in FIFO arrival order, and leave the
    /// event set for subsequent waiters.
    pub fn set(&self) {
        let mut inner = self.inner.borrow_mut();
        if inner.set {
            return;
        }
        inner.set = true;
        for (_, waker) in inner.waiters.drain(..) {
            waker.wake();
        }
    }

    pub fn clear(&self) {
        self.inner.borrow_mut().set = false;
    }

    pub fn wait(&self) -> EventWait {
        EventWait {
            inner: Rc::clone(&self.inner),
            waiter_id: None,
        }
    }
}

impl Default for Event {
    fn default() -> Self {
        Self::new()
    }
}

pub struct EventWait {
    inner: Rc<RefCell<EventInner>>,
    waiter_id: Option<u64>,
}

impl Future for EventWait {
    type Output = Result<(), RtError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut inner = this.inner.borrow_mut();
        if inner.set {
            if let Some(id) = this.waiter_id.take() {
                inner.waiters.retain(|(wid, _)| *wid != id);
            }
            return Poll::Ready(Ok(()));
        }
        if this.waiter_id.is_some() {
            if let Err(e) = crate::cancel::check_cancelled() {
                let id = this.waiter_id.take().unwrap();
                inner.waiters.retain(|(wid, _)| *wid != id);
                return Poll::Ready(Err(e));
            }
        }
        match this.waiter_id {
            Some(id) => {
                if let Some(entry) = inner.waiters.iter_mut().find(|(wid, _)| *wid == id) {
                    entry.1 = cx.waker().clone();
                }
            }
            None => {
                let id = inner.next_waiter_id;
                inner.next_waiter_id += 1;
                inner.waiters.push_back((id, cx.waker().clone()));
                this.waiter_id = Some(id);
            }
        }
        Poll::Pending
    }
}

impl Drop for EventWait {
    fn drop(&mut self) {
        if let Some(id) = self.waiter_id {
            self.inner.borrow_mut().waiters.retain(|(wid, _)| *wid != id);
        }
    }
}

/// A counting semaphore: `acquire()` suspends while the count is zero,
/// `release()` increments it and wakes the longest-waiting acquirer.
#[derive(Clone)]
pub struct Semaphore {
    inner: Rc<RefCell<SemInner>>,
}

struct SemInner {
    permits: usize,
    waiters: VecDeque<(u64, Waker)>,
    next_waiter_id: u64,
}

impl Semaphore {
    pub fn new(initial: usize) -> Self {
        Semaphore {
            inner: Rc::new(RefCell::new(SemInner {
                permits: initial,
                waiters: VecDeque::new(),
                next_waiter_id: 0,
            })),
        }
    }

    pub fn available(&self) -> usize {
        self.inner.borrow().permits
    }

    pub fn locked(&self) -> bool {
        self.inner.borrow().permits == 0
    }

    /// Take one permit without suspending. Fails if none are available.
    pub fn try_acquire(&self) -> bool {
        let mut inner = self.inner.borrow_mut();
        if inner.permits > 0 {
            inner.permits -= 1;
            true
        } else {
            false
        }
    }

    /// Acquire a permit, suspending while none are available. Resolves
    /// to a [`SemaphoreGuard`] whose `Drop` releases the permit, so the
    /// permit is returned even if the guard is dropped mid-`await` —
    /// cancellation, a lost `wait_for`/`timeout_after` race, or an early
    /// return from the holding scope all release it the same way.
    pub fn acquire(&self) -> AcquireFuture {
        AcquireFuture {
            inner: Rc::clone(&self.inner),
            waiter_id: None,
        }
    }

    /// Return one permit, waking the longest-waiting acquirer if any.
    /// Normally called only through [`SemaphoreGuard`]'s `Drop`.
    fn release(&self) {
        let mut inner = self.inner.borrow_mut();
        inner.permits += 1;
        if let Some((_, waker)) = inner.waiters.pop_front() {
            waker.wake();
        }
    }

    /// Acquire a permit for the duration of `body`, releasing it
    /// afterward regardless of whether `body` erred, panicked, or the
    /// task was cancelled mid-`body` — the context-manager usage
    /// spec.md calls out, implemented as an RAII guard held across the
    /// `await` rather than a bare `acquire`/`release` pair.
    pub async fn with<F, Fut, R>(&self, body: F) -> Result<R, RtError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = R>,
    {
        let _guard = self.acquire().await?;
        Ok(body().await)
    }
}

/// RAII handle to one held permit. Dropping it (including via an
/// unwind, a cancellation, or simply falling out of scope) returns the
/// permit to the semaphore exactly once.
pub struct SemaphoreGuard {
    inner: Rc<RefCell<SemInner>>,
    released: bool,
}

impl std::fmt::Debug for SemaphoreGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SemaphoreGuard").finish_non_exhaustive()
    }
}

impl Drop for SemaphoreGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        let mut inner = self.inner.borrow_mut();
        inner.permits += 1;
        if let Some((_, waker)) = inner.waiters.pop_front() {
            waker.wake();
        }
    }
}

pub struct AcquireFuture {
    inner: Rc<RefCell<SemInner>>,
    waiter_id: Option<u64>,
}

impl Future for AcquireFuture {
    type Output = Result<SemaphoreGuard, RtError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut inner = this.inner.borrow_mut();
        if inner.permits > 0 {
            inner.permits -= 1;
            if let Some(id) = this.waiter_id.take() {
                inner.waiters.retain(|(wid, _)| *wid != id);
            }
            return Poll::Ready(Ok(SemaphoreGuard {
                inner: Rc::clone(&this.inner),
                released: false,
            }));
        }
        if this.waiter_id.is_some() {
            if let Err(e) = crate::cancel::check_cancelled() {
                let id = this.waiter_id.take().unwrap();
                inner.waiters.retain(|(wid, _)| *wid != id);
                return Poll::Ready(Err(e));
            }
        }
        match this.waiter_id {
            Some(id) => {
                if let Some(entry) = inner.waiters.iter_mut().find(|(wid, _)| *wid == id) {
                    entry.1 = cx.waker().clone();
                }
            }
            None => {
                let id = inner.next_waiter_id;
                inner.next_waiter_id += 1;
                inner.waiters.push_back((id, cx.waker().clone()));
                this.waiter_id = Some(id);
            }
        }
        Poll::Pending
    }
}

impl Drop for AcquireFuture {
    /// A cancelled acquire must not leave a dead entry in the waiter
    /// queue — `release()` pops exactly one waiter per call, and a
    /// stale entry there would swallow a wake meant for a live waiter.
    fn drop(&mut self) {
        if let Some(id) = self.waiter_id {
            self.inner.borrow_mut().waiters.retain(|(wid, _)| *wid != id);
        }
    }
}

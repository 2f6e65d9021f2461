//! Rendezvous channel.
//!
//! Unlike a buffered MPSC queue, a channel never holds a value in
//! transit: `send` only completes once a matching `recv` is ready to
//! take it, and vice versa. At most one sender and one receiver are
//! parked waiting for a match at any instant — extra would-be parties
//! queue FIFO behind them. Closing the sending side deliver an
//! end-of-stream `None` to every receiver still waiting, and fails any
//! sender still waiting for a taker. `Sender::send_to` additionally
//! supports addressing a specific parked receiver by task id, bypassing
//! FIFO order, per spec's directed-send case.

use crate::error::RtError;
use crate::scheduler;
use crate::task::TaskId;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

struct SendWaiter<T> {
    value: Rc<RefCell<Option<T>>>,
    matched: Rc<Cell<bool>>,
    waker: RefCell<Waker>,
}

struct RecvWaiter<T> {
    slot: Rc<RefCell<Option<T>>>,
    matched: Rc<Cell<bool>>,
    waker: RefCell<Waker>,
    /// The task id this receiver was parked under, captured from
    /// `scheduler::current_task()` the moment it registered — lets a
    /// directed `send_to` find this exact waiter instead of only ever
    /// matching the FIFO head (spec.md §4.4's `send(value, target_id?)`).
    task: Cell<Option<TaskId>>,
}

struct Inner<T> {
    senders_waiting: VecDeque<Rc<SendWaiter<T>>>,
    receivers_waiting: VecDeque<Rc<RecvWaiter<T>>>,
    closed: bool,
    sender_count: usize,
}

/// Create a rendezvous channel pair.
pub fn channel<T>() -> (Sender<T>, Receiver<T>) {
    let inner = Rc::new(RefCell::new(Inner {
        senders_waiting: VecDeque::new(),
        receivers_waiting: VecDeque::new(),
        closed: false,
        sender_count: 1,
    }));
    (
        Sender {
            inner: Rc::clone(&inner),
        },
        Receiver { inner },
    )
}

pub struct Sender<T> {
    inner: Rc<RefCell<Inner<T>>>,
}

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        self.inner.borrow_mut().sender_count += 1;
        Sender {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T> Drop for Sender<T> {
    fn drop(&mut self) {
        let mut inner = self.inner.borrow_mut();
        inner.sender_count -= 1;
        if inner.sender_count == 0 {
            inner.closed = true;
            for receiver in inner.receivers_waiting.drain(..) {
                receiver.waker.borrow().wake_by_ref();
            }
        }
    }
}

impl<T> Sender<T> {
    /// Hand `value` to a receiver, suspending until one is ready to
    /// take it. Fails with the value back if every receiver is gone.
    pub fn send(&self, value: T) -> SendFuture<T> {
        SendFuture {
            inner: Rc::clone(&self.inner),
            value: Some(value),
            waiter: None,
        }
    }

    /// Non-blocking send: succeeds only if a receiver is already
    /// parked waiting for a value.
    pub fn try_send(&self, value: T) -> Result<(), SendError<T>> {
        let mut inner = self.inner.borrow_mut();
        while let Some(receiver) = inner.receivers_waiting.pop_front() {
            if receiver.matched.get() {
                continue;
            }
            *receiver.slot.borrow_mut() = Some(value);
            receiver.matched.set(true);
            receiver.waker.borrow().wake_by_ref();
            return Ok(());
        }
        Err(SendError(value))
    }

    pub fn close(&self) {
        let mut inner = self.inner.borrow_mut();
        inner.closed = true;
        for receiver in inner.receivers_waiting.drain(..) {
            receiver.waker.borrow().wake_by_ref();
        }
    }

    /// Directed send: inject `value` straight into the specific task
    /// named by `target`, bypassing FIFO order, per spec.md §4.4's
    /// `send(value, target_id?)`. Fails with the value back if `target`
    /// isn't currently a parked receiver on this channel.
    pub fn send_to(&self, value: T, target: TaskId) -> Result<(), SendError<T>> {
        let mut inner = self.inner.borrow_mut();
        let pos = inner
            .receivers_waiting
            .iter()
            .position(|r| !r.matched.get() && r.task.get() == Some(target));
        let Some(pos) = pos else {
            return Err(SendError(value));
        };
        let receiver = inner.receivers_waiting.remove(pos).unwrap();
        *receiver.slot.borrow_mut() = Some(value);
        receiver.matched.set(true);
        receiver.waker.borrow().wake_by_ref();
        Ok(())
    }
}

pub struct SendFuture<T> {
    inner: Rc<RefCell<Inner<T>>>,
    value: Option<T>,
    waiter: Option<Rc<SendWaiter<T>>>,
}

impl<T> Future for SendFuture<T> {
    type Output = Result<(), RtError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        if let Some(waiter) = &this.waiter {
            if waiter.matched.get() {
                return Poll::Ready(Ok(()));
            }
            if let Err(e) = crate::cancel::check_cancelled() {
                let waiter = this.waiter.take().unwrap();
                let mut inner = this.inner.borrow_mut();
                inner.senders_waiting.retain(|w| !Rc::ptr_eq(w, &waiter));
                return Poll::Ready(Err(e));
            }
            *waiter.waker.borrow_mut() = cx.waker().clone();
            return Poll::Pending;
        }

        let mut inner = this.inner.borrow_mut();
        if inner.closed {
            this.value.take();
            return Poll::Ready(Err(RtError::ChannelClosed));
        }
        while let Some(receiver) = inner.receivers_waiting.pop_front() {
            if receiver.matched.get() {
                continue;
            }
            *receiver.slot.borrow_mut() = this.value.take();
            receiver.matched.set(true);
            receiver.waker.borrow().wake_by_ref();
            return Poll::Ready(Ok(()));
        }

        let waiter = Rc::new(SendWaiter {
            value: Rc::new(RefCell::new(this.value.take())),
            matched: Rc::new(Cell::new(false)),
            waker: RefCell::new(cx.waker().clone()),
        });
        inner.senders_waiting.push_back(Rc::clone(&waiter));
        this.waiter = Some(waiter);
        Poll::Pending
    }
}

impl<T> Drop for SendFuture<T> {
    /// If this send was cancelled while parked (dropped without ever
    /// being matched), remove its own entry from `senders_waiting` —
    /// otherwise a later `recv` would match a waiter nobody will ever
    /// poll again, silently dropping the value it hands over.
    fn drop(&mut self) {
        if let Some(waiter) = self.waiter.take() {
            if !waiter.matched.get() {
                let mut inner = self.inner.borrow_mut();
                inner
                    .senders_waiting
                    .retain(|w| !Rc::ptr_eq(w, &waiter));
            }
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct SendError<T>(pub T);

pub struct Receiver<T> {
    inner: Rc<RefCell<Inner<T>>>,
}

impl<T> Receiver<T> {
    /// Take a value from a waiting sender, suspending until one
    /// arrives. Resolves to `None` once the channel is closed and no
    /// sender is waiting — the end-of-stream signal.
    pub fn recv(&self) -> RecvFuture<T> {
        RecvFuture {
            inner: Rc::clone(&self.inner),
            waiter: None,
        }
    }

    pub fn try_recv(&self) -> Result<T, TryRecvError> {
        let mut inner = self.inner.borrow_mut();
        while let Some(sender) = inner.senders_waiting.pop_front() {
            if sender.matched.get() {
                continue;
            }
            let value = sender.value.borrow_mut().take().expect("sender value missing");
            sender.matched.set(true);
            sender.waker.borrow().wake_by_ref();
            return Ok(value);
        }
        if inner.closed {
            Err(TryRecvError::Closed)
        } else {
            Err(TryRecvError::Empty)
        }
    }
}

pub struct RecvFuture<T> {
    inner: Rc<RefCell<Inner<T>>>,
    waiter: Option<Rc<RecvWaiter<T>>>,
}

impl<T> Future for RecvFuture<T> {
    type Output = Result<Option<T>, RtError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        if let Some(waiter) = &this.waiter {
            if waiter.matched.get() {
                return Poll::Ready(Ok(waiter.slot.borrow_mut().take()));
            }
            if let Err(e) = crate::cancel::check_cancelled() {
                let waiter = this.waiter.take().unwrap();
                let mut inner = this.inner.borrow_mut();
                inner.receivers_waiting.retain(|w| !Rc::ptr_eq(w, &waiter));
                return Poll::Ready(Err(e));
            }
            *waiter.waker.borrow_mut() = cx.waker().clone();
            return Poll::Pending;
        }

        let mut inner = this.inner.borrow_mut();
        while let Some(sender) = inner.senders_waiting.pop_front() {
            if sender.matched.get() {
                continue;
            }
            let value = sender.value.borrow_mut().take().expect("sender value missing");
            sender.matched.set(true);
            sender.waker.borrow().wake_by_ref();
            return Poll::Ready(Ok(Some(value)));
        }
        if inner.closed {
            return Poll::Ready(Ok(None));
        }

        let waiter = Rc::new(RecvWaiter {
            slot: Rc::new(RefCell::new(None)),
            matched: Rc::new(Cell::new(false)),
            waker: RefCell::new(cx.waker().clone()),
            task: Cell::new(scheduler::current_task()),
        });
        inner.receivers_waiting.push_back(Rc::clone(&waiter));
        this.waiter = Some(waiter);
        Poll::Pending
    }
}

impl<T> Drop for RecvFuture<T> {
    /// Mirrors `SendFuture`'s cleanup: a cancelled `recv` must not leave
    /// a dead entry at the head of `receivers_waiting` that a live
    /// `send` would match and hand a value to, never to be read.
    fn drop(&mut self) {
        if let Some(waiter) = self.waiter.take() {
            if !waiter.matched.get() {
                let mut inner = self.inner.borrow_mut();
                inner
                    .receivers_waiting
                    .retain(|w| !Rc::ptr_eq(w, &waiter));
            }
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum TryRecvError {
    Empty,
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::Scheduler;

    #[test]
    fn try_send_fails_without_waiting_receiver() {
        let (tx, _rx) = channel::<i32>();
        assert!(tx.try_send(1).is_err());
    }

    #[test]
    fn rendezvous_completes_both_sides() {
        let (tx, rx) = channel::<i32>();
        let mut sched = Scheduler::new();
        let recv_handle = sched.spawn(async move { rx.recv().await });
        sched.step();
        let send_handle = sched.spawn(async move { tx.send(7).await });
        sched.step();
        sched.step();
        assert_eq!(recv_handle.try_result(), Some(Ok(Ok(Some(7)))));
        assert_eq!(send_handle.try_result(), Some(Ok(Ok(()))));
    }

    #[test]
    fn dropped_recv_future_removes_its_own_waiter() {
        let (tx, rx) = channel::<i32>();
        {
            let fut = rx.recv();
            futures_poll_once(fut);
        }
        assert!(rx.inner.borrow().receivers_waiting.is_empty());
        // A send now must park as a sender rather than matching the
        // stale (dropped) receiver and losing the value.
        assert!(tx.try_send(5).is_err());
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

    #[test]
    fn send_to_targets_a_specific_parked_receiver() {
        let (tx, rx_a) = channel::<i32>();
        let tx_b = tx.clone();
        let rx_b = Receiver { inner: Rc::clone(&rx_a.inner) };

        let mut sched = Scheduler::new();
        let a = sched.spawn(async move { rx_a.recv().await });
        let b = sched.spawn(async move { rx_b.recv().await });
        sched.step();
        sched.step();

        tx_b.send_to(42, b.id()).unwrap();
        sched.step();

        assert_eq!(b.try_result(), Some(Ok(Ok(Some(42)))));
        assert!(a.try_result().is_none());
        drop(tx);
    }

    #[test]
    fn send_to_unknown_target_fails_without_disturbing_fifo_receivers() {
        let (tx, rx) = channel::<i32>();
        let mut sched = Scheduler::new();
        let waiting = sched.spawn(async move { rx.recv().await });
        sched.step();

        assert!(tx.send_to(1, crate::task::TaskId(9999)).is_err());
        assert!(waiting.try_result().is_none());
    }

    #[test]
    fn close_signals_end_of_stream_to_waiting_receiver() {
        let (tx, rx) = channel::<i32>();
        let mut sched = Scheduler::new();
        let recv_handle = sched.spawn(async move { rx.recv().await });
        sched.step();
        drop(tx);
        sched.step();
        assert_eq!(recv_handle.try_result(), Some(Ok(Ok(None))));
    }

    #[test]
    fn cancelling_a_parked_send_resolves_cancelled_not_stuck_pending() {
        crate::scheduler::reset_for_test();
        let (tx, _rx) = channel::<i32>();
        let handle = crate::scheduler::spawn(async move { tx.send(1).await });
        crate::scheduler::step();
        assert!(handle.try_result().is_none());
        crate::scheduler::cancel(handle.id(), None);
        crate::scheduler::step();
        assert_eq!(
            crate::scheduler::state_of(handle.id()),
            Some(crate::task::TaskState::Cancelled)
        );
    }

    #[test]
    fn cancelling_a_parked_recv_resolves_cancelled_not_stuck_pending() {
        crate::scheduler::reset_for_test();
        let (_tx, rx) = channel::<i32>();
        let handle = crate::scheduler::spawn(async move { rx.recv().await });
        crate::scheduler::step();
        assert!(handle.try_result().is_none());
        crate::scheduler::cancel(handle.id(), None);
        crate::scheduler::step();
        assert_eq!(
            crate::scheduler::state_of(handle.id()),
            Some(crate::task::TaskState::Cancelled)
        );
    }
}

//! Timer wheel.
//!
//! A min-heap of deadlines, the same shape as a production kernel's
//! timer queue, adapted from wall-clock milliseconds to `Instant`/
//! `Duration` since this runtime drives real OS time rather than a
//! browser's `performance.now()`. [`Sleep`] is the `Future` a task
//! `.await`s to suspend until a deadline; [`TimerQueue::tick`] is what
//! the runtime's main loop calls after every `reactor.poll` to fire
//! whatever has elapsed and wake the tasks parked on it.
//!
//! Per spec.md §4.1/§4.3, when a timer and a reactor readiness event are
//! both due in the same pass, the timer wakes first — the runtime's main
//! loop enforces that by ticking the timer wheel before dispatching
//! reactor events (see `crate::Runtime::run_once`).

use std::cell::{Cell, RefCell};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

/// Unique identifier for a timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerState {
    Pending,
    Fired,
    Cancelled,
}

struct TimerRec {
    deadline: Instant,
    waker: Option<Waker>,
    fired: Rc<Cell<bool>>,
    state: TimerState,
    interval: Option<Duration>,
}

struct TimerEntry {
    deadline: Instant,
    id: TimerId,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}
impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed so `BinaryHeap` (a max-heap) pops the soonest deadline first.
        other.deadline.cmp(&self.deadline)
    }
}

/// Min-heap of pending timers, keyed by deadline.
pub struct TimerQueue {
    heap: BinaryHeap<TimerEntry>,
    timers: HashMap<TimerId, TimerRec>,
    next_id: u64,
}

impl TimerQueue {
    pub fn new() -> Self {
        TimerQueue {
            heap: BinaryHeap::new(),
            timers: HashMap::new(),
            next_id: 1,
        }
    }

    /// Arm a one-shot timer for `deadline`, optionally waking `waker`
    /// when it fires. Returns the timer id and the shared flag a
    /// [`Sleep`] future polls to learn it has fired without needing to
    /// query the queue again.
    pub fn schedule_at(&mut self, deadline: Instant, waker: Option<Waker>) -> (TimerId, Rc<Cell<bool>>) {
        let id = TimerId(self.next_id);
        self.next_id += 1;
        let fired = Rc::new(Cell::new(false));
        self.heap.push(TimerEntry { deadline, id });
        self.timers.insert(
            id,
            TimerRec {
                deadline,
                waker,
                fired: Rc::clone(&fired),
                state: TimerState::Pending,
                interval: None,
            },
        );
        (id, fired)
    }

    pub fn schedule_in(&mut self, delay: Duration, waker: Option<Waker>) -> (TimerId, Rc<Cell<bool>>) {
        self.schedule_at(Instant::now() + delay, waker)
    }

    /// Arm a repeating timer. Each fire re-queues the next deadline
    /// `interval` after the one that just fired (not after "now"), so a
    /// stalled runtime doesn't accumulate drift on resumption — it
    /// simply fires the backlog immediately, same as a production
    /// timer wheel.
    pub fn schedule_interval(&mut self, interval: Duration, waker: Option<Waker>) -> TimerId {
        let deadline = Instant::now() + interval;
        let id = TimerId(self.next_id);
        self.next_id += 1;
        self.heap.push(TimerEntry { deadline, id });
        self.timers.insert(
            id,
            TimerRec {
                deadline,
                waker,
                fired: Rc::new(Cell::new(false)),
                state: TimerState::Pending,
                interval: Some(interval),
            },
        );
        id
    }

    /// Cancel a pending timer. Returns `true` if it was pending.
    pub fn cancel(&mut self, id: TimerId) -> bool {
        if let Some(rec) = self.timers.get_mut(&id) {
            if rec.state == TimerState::Pending {
                rec.state = TimerState::Cancelled;
                return true;
            }
        }
        false
    }

    /// Fire every timer whose deadline has elapsed as of `now`, calling
    /// their wakers. Returns the number of timers fired.
    pub fn tick(&mut self, now: Instant) -> usize {
        let mut fired_count = 0;
        let mut reschedule = Vec::new();

        while let Some(entry) = self.heap.peek() {
            if entry.deadline > now {
                break;
            }
            let entry = self.heap.pop().unwrap();
            let Some(rec) = self.timers.get_mut(&entry.id) else {
                continue;
            };
            if rec.state != TimerState::Pending || rec.deadline > now {
                continue;
            }
            rec.state = TimerState::Fired;
            rec.fired.set(true);
            if let Some(waker) = rec.waker.take() {
                waker.wake();
            }
            fired_count += 1;
            if let Some(interval) = rec.interval {
                let next_deadline = rec.deadline + interval;
                reschedule.push((entry.id, next_deadline));
            }
        }

        for (id, deadline) in reschedule {
            if let Some(rec) = self.timers.get_mut(&id) {
                rec.deadline = deadline;
                rec.state = TimerState::Pending;
                rec.fired.set(false);
                self.heap.push(TimerEntry { deadline, id });
            }
        }

        self.timers
            .retain(|_, rec| rec.state == TimerState::Pending);
        fired_count
    }

    /// How long until the soonest pending deadline, for sizing the
    /// reactor's blocking `poll` timeout. `None` means no timers are
    /// pending and the reactor may block indefinitely.
    pub fn time_until_next(&self, now: Instant) -> Option<Duration> {
        self.heap
            .peek()
            .map(|entry| entry.deadline.saturating_duration_since(now))
    }

    pub fn pending_count(&self) -> usize {
        self.timers
            .values()
            .filter(|t| t.state == TimerState::Pending)
            .count()
    }

    pub fn is_pending(&self, id: TimerId) -> bool {
        self.timers
            .get(&id)
            .map(|t| t.state == TimerState::Pending)
            .unwrap_or(false)
    }
}

impl Default for TimerQueue {
    fn default() -> Self {
        Self::new()
    }
}

thread_local! {
    /// This thread's timer wheel, `Rc`-wrapped so a [`Sleep`] future can
    /// hold its own cloned handle rather than reaching through a free
    /// function on every poll. `crate::Runtime`'s main loop ticks it
    /// right after every `reactor.poll`, ahead of dispatching whatever
    /// I/O readiness that same `poll` call returned — so a timer and a
    /// reactor event due in the same pass always resolve timer-first.
    static GLOBAL: Rc<RefCell<TimerQueue>> = Rc::new(RefCell::new(TimerQueue::new()));
}

/// Suspend the current task for `delay`.
pub fn sleep(delay: Duration) -> Sleep {
    let queue = GLOBAL.with(Rc::clone);
    Sleep::new(queue, delay)
}

/// Tick the global timer wheel. Returns the number of timers fired.
pub fn tick(now: Instant) -> usize {
    GLOBAL.with(|q| q.borrow_mut().tick(now))
}

pub fn time_until_next(now: Instant) -> Option<Duration> {
    GLOBAL.with(|q| q.borrow().time_until_next(now))
}

pub fn pending_count() -> usize {
    GLOBAL.with(|q| q.borrow().pending_count())
}

/// A future that resolves once a duration has elapsed, driven by a
/// shared [`TimerQueue`] rather than a dedicated OS timer per sleep.
pub struct Sleep {
    queue: Rc<RefCell<TimerQueue>>,
    delay: Duration,
    armed: Option<(TimerId, Rc<Cell<bool>>)>,
}

impl Sleep {
    pub fn new(queue: Rc<RefCell<TimerQueue>>, delay: Duration) -> Self {
        Sleep {
            queue,
            delay,
            armed: None,
        }
    }
}

impl Future for Sleep {
    type Output = Result<(), crate::error::RtError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if let Some((id, fired)) = &this.armed {
            if fired.get() {
                return Poll::Ready(Ok(()));
            }
            if let Err(e) = crate::cancel::check_cancelled() {
                this.queue.borrow_mut().cancel(*id);
                return Poll::Ready(Err(e));
            }
            return Poll::Pending;
        }
        if let Err(e) = crate::cancel::check_cancelled() {
            return Poll::Ready(Err(e));
        }
        let (id, fired) = this
            .queue
            .borrow_mut()
            .schedule_in(this.delay, Some(cx.waker().clone()));
        this.armed = Some((id, fired));
        Poll::Pending
    }
}

impl Drop for Sleep {
    fn drop(&mut self) {
        if let Some((id, fired)) = &self.armed {
            if !fired.get() {
                self.queue.borrow_mut().cancel(*id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::task::{RawWaker, RawWakerVTable, Waker};

    fn noop_waker() -> Waker {
        fn no_op(_: *const ()) {}
        fn clone(_: *const ()) -> RawWaker {
            raw()
        }
        fn raw() -> RawWaker {
            static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, no_op, no_op, no_op);
            RawWaker::new(std::ptr::null(), &VTABLE)
        }
        unsafe { Waker::from_raw(raw()) }
    }

    #[test]
    fn oneshot_timer_fires_once_elapsed() {
        let mut queue = TimerQueue::new();
        let now = Instant::now();
        let (id, fired) = queue.schedule_at(now + Duration::from_millis(10), Some(noop_waker()));
        assert!(queue.is_pending(id));
        assert_eq!(queue.tick(now), 0);
        assert!(!fired.get());

        assert_eq!(queue.tick(now + Duration::from_millis(10)), 1);
        assert!(fired.get());
        assert!(!queue.is_pending(id));
    }

    #[test]
    fn interval_timer_reschedules() {
        let mut queue = TimerQueue::new();
        let id = queue.schedule_interval(Duration::from_millis(10), Some(noop_waker()));
        let base = Instant::now();

        assert_eq!(queue.tick(base + Duration::from_millis(10)), 1);
        assert!(queue.is_pending(id));

        assert_eq!(queue.tick(base + Duration::from_millis(20)), 1);
        assert!(queue.is_pending(id));

        queue.cancel(id);
        assert_eq!(queue.tick(base + Duration::from_millis(30)), 0);
    }

    #[test]
    fn ordering_across_multiple_timers() {
        let mut queue = TimerQueue::new();
        let base = Instant::now();
        let (short, short_fired) =
            queue.schedule_at(base + Duration::from_millis(5), Some(noop_waker()));
        let (long, long_fired) =
            queue.schedule_at(base + Duration::from_millis(50), Some(noop_waker()));

        queue.tick(base + Duration::from_millis(5));
        assert!(short_fired.get());
        assert!(!long_fired.get());
        assert!(!queue.is_pending(short));
        assert!(queue.is_pending(long));

        queue.tick(base + Duration::from_millis(50));
        assert!(long_fired.get());
    }

    #[test]
    fn time_until_next_tracks_soonest_deadline() {
        let mut queue = TimerQueue::new();
        let base = Instant::now();
        assert!(queue.time_until_next(base).is_none());
        queue.schedule_at(base + Duration::from_millis(30), None);
        let remaining = queue.time_until_next(base).unwrap();
        assert!(remaining <= Duration::from_millis(30));
    }
}

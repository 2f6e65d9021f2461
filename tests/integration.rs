//! End-to-end scenarios exercising the scheduler, timer wheel, queue,
//! task group, gather, and subprocess supervisor together through the
//! `Runtime` main loop rather than any single module in isolation.
//!
//! Each test runs on its own thread (the default libtest runner spawns
//! a fresh thread per test), so the crate's thread-local scheduler,
//! timer wheel, and reactor all start empty — no explicit reset needed.

use std::cell::RefCell;
use std::future::Future as _;
use std::rc::Rc;
use std::time::Duration;

use taskrt::cancel::timeout_after;
use taskrt::error::RtError;
use taskrt::gather::{gather, GatherOptions};
use taskrt::group::{TaskGroup, WaitPolicy};
use taskrt::queue::Queue;
use taskrt::scheduler;
use taskrt::subprocess::Subprocess;
use taskrt::sync::Event;
use taskrt::task::TaskState;
use taskrt::timer;
use taskrt::Runtime;

/// Scenario 1 — sleep race. Three tasks sleeping different durations
/// append their label to a shared trace; the trace must come out in
/// sleep-duration order regardless of spawn order.
#[test]
fn sleep_race_resolves_in_deadline_order() {
    let trace = Rc::new(RefCell::new(Vec::new()));

    let c = {
        let trace = Rc::clone(&trace);
        scheduler::spawn(async move {
            timer::sleep(Duration::from_millis(50)).await;
            trace.borrow_mut().push("C");
        })
    };
    let a = {
        let trace = Rc::clone(&trace);
        scheduler::spawn(async move {
            timer::sleep(Duration::from_millis(10)).await;
            trace.borrow_mut().push("A");
        })
    };
    let b = {
        let trace = Rc::clone(&trace);
        scheduler::spawn(async move {
            timer::sleep(Duration::from_millis(25)).await;
            trace.borrow_mut().push("B");
        })
    };

    let rt = Runtime::new();
    rt.run_for(Duration::from_millis(500));

    assert_eq!(*trace.borrow(), vec!["A", "B", "C"]);
    assert!(a.try_result().is_some());
    assert!(b.try_result().is_some());
    assert!(c.try_result().is_some());
}

/// Scenario 2 — bounded producer/consumer. A capacity-2 queue forces
/// the producer to block once two items are outstanding; the consumer
/// sleeps between each `get` so the interleaving is observable.
#[test]
fn bounded_queue_producer_consumer_interleaves_on_capacity() {
    let queue: Queue<i32> = Queue::new(Some(2));
    let trace = Rc::new(RefCell::new(Vec::new()));

    let producer = {
        let queue = queue.clone();
        let trace = Rc::clone(&trace);
        scheduler::spawn(async move {
            trace.borrow_mut().push("producer_start".to_string());
            for item in 0..4 {
                queue.put(item).await.unwrap();
                trace.borrow_mut().push(format!("produced {item}"));
            }
            trace.borrow_mut().push("producer_done".to_string());
        })
    };
    let consumer = {
        let queue = queue.clone();
        let trace = Rc::clone(&trace);
        scheduler::spawn(async move {
            for _ in 0..4 {
                let item = queue.get().await.unwrap();
                timer::sleep(Duration::from_millis(5)).await;
                trace.borrow_mut().push(format!("consumed {item}"));
            }
        })
    };

    let rt = Runtime::new();
    rt.run_for(Duration::from_millis(500));

    assert!(producer.try_result().is_some());
    assert!(consumer.try_result().is_some());

    let trace = trace.borrow();
    assert_eq!(trace[0], "producer_start");
    // The third item can only be produced after the first has been
    // consumed, since capacity is 2 — the bounded queue's core guarantee.
    let produced_2 = trace.iter().position(|e| e == "produced 2").unwrap();
    let consumed_0 = trace.iter().position(|e| e == "consumed 0").unwrap();
    assert!(consumed_0 < produced_2);
    assert_eq!(trace.last().unwrap(), "consumed 3");
}

/// Scenario 3 — timeout on a blocking get against an empty queue.
#[test]
fn timeout_after_fires_on_empty_queue_get() {
    let queue: Queue<i32> = Queue::new(None);
    let handle = {
        let queue = queue.clone();
        scheduler::spawn(async move {
            timeout_after(Duration::from_millis(20)).run(queue.get()).await
        })
    };

    let rt = Runtime::new();
    rt.run_for(Duration::from_millis(500));

    assert!(matches!(
        handle.try_result(),
        Some(Ok(Err(RtError::ScopeTimeout)))
    ));
    // No pending getter left behind on the queue after the timeout won
    // the race and the `get()` future was dropped.
    assert!(!queue.has_pending_getter());
}

/// Scenario 4 — a 3-member task group under `Any`: the first member
/// errs, the other two (parked on an `Event` that never fires) are
/// cancelled when the group closes.
#[test]
fn task_group_any_cancels_siblings_on_first_error() {
    let never = Event::new();

    let mut group = TaskGroup::new(WaitPolicy::Any);
    let failing = group.spawn(async { Err::<(), &'static str>("boom") });
    let waiter_a = {
        let never = never.clone();
        group.spawn(async move {
            never.wait().await;
            Ok::<(), &'static str>(())
        })
    };
    let waiter_b = {
        let never = never.clone();
        group.spawn(async move {
            never.wait().await;
            Ok::<(), &'static str>(())
        })
    };

    let rt = Runtime::new();
    rt.run_for(Duration::from_millis(100));

    assert_eq!(failing.try_result(), Some(Ok(Err("boom"))));
    group.close();
    rt.run_for(Duration::from_millis(100));

    assert_eq!(
        scheduler::state_of(waiter_a.id()),
        Some(TaskState::Cancelled)
    );
    assert_eq!(
        scheduler::state_of(waiter_b.id()),
        Some(TaskState::Cancelled)
    );
}

/// Scenario 5 — gather with `race=1, clear_unused=true`: the fastest of
/// three sleepers wins, the slower two are cancelled rather than left
/// running unobserved.
#[test]
fn gather_race_one_clears_the_losers() {
    let fast = scheduler::spawn(async {
        timer::sleep(Duration::from_millis(10)).await;
        "fast"
    });
    let slow_a = scheduler::spawn(async {
        timer::sleep(Duration::from_millis(300)).await;
        "slow_a"
    });
    let slow_b = scheduler::spawn(async {
        timer::sleep(Duration::from_millis(300)).await;
        "slow_b"
    });

    let opts = GatherOptions {
        race: Some(1),
        propagate_errors: true,
        clear_unused: true,
    };
    let gathered = gather(vec![fast, slow_a.clone(), slow_b.clone()], opts).unwrap();
    let handle = scheduler::spawn(gathered);

    let rt = Runtime::new();
    rt.run_for(Duration::from_millis(100));

    match handle.try_result() {
        Some(Ok(results)) => {
            assert_eq!(results[0], Some(Ok("fast")));
        }
        other => panic!("expected gather to resolve with the fast result, got {other:?}"),
    }
    rt.run_for(Duration::from_millis(50));
    assert_eq!(
        scheduler::state_of(slow_a.id()),
        Some(TaskState::Cancelled)
    );
    assert_eq!(
        scheduler::state_of(slow_b.id()),
        Some(TaskState::Cancelled)
    );
}

/// Scenario 6 — a subprocess that sleeps far longer than its deadline
/// is signaled and reaped once `timeout_after` fires, with no frame
/// ever produced.
#[test]
fn subprocess_past_its_deadline_is_signaled_and_reaped() {
    let mut proc = match Subprocess::spawn("sleep", &["5".to_string()], Some(Duration::from_millis(250))) {
        Ok(p) => p,
        Err(_) => return, // no `sleep` binary in this environment; nothing to assert
    };

    std::thread::sleep(Duration::from_millis(300));
    let frame = futures_block_on(proc.next_frame());

    assert!(matches!(frame, Err(RtError::SubprocessTimeout)));
}

/// A minimal single-poll block-on for the one free-standing subprocess
/// future this test file drives outside the scheduler — the supervisor
/// doesn't need a task context to observe its own deadline.
fn futures_block_on<F: std::future::Future>(fut: F) -> F::Output {
    use std::task::{Context, RawWaker, RawWakerVTable, Waker};
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
    loop {
        if let std::task::Poll::Ready(value) = fut.as_mut().poll(&mut cx) {
            return value;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}

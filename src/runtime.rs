//! The runtime: the main loop that drives the scheduler, timer wheel,
//! and reactor together.
//!
//! Each `run_once` pass is: run every ready task to its next suspension
//! point, tick the timer wheel against the current instant, then block
//! in the reactor for whatever's left of this pass's budget. Ticking
//! timers before dispatching the reactor's events enforces spec.md's
//! tie-break rule — a timer and an I/O readiness event due in the same
//! pass always resolve timer-first.

use crate::{reactor, scheduler, timer};
use std::time::{Duration, Instant};

use crate::config::RuntimeConfig;

/// Owns one runtime's configuration and drives its event loop. The
/// scheduler, timer wheel, and reactor themselves live in thread-locals
/// (so coordination primitives can reach them without borrowing through
/// this struct); `Runtime` only holds the knobs and the loop.
pub struct Runtime {
    config: RuntimeConfig,
}

impl Runtime {
    pub fn new() -> Self {
        Runtime {
            config: RuntimeConfig::default(),
        }
    }

    pub fn with_config(config: RuntimeConfig) -> Self {
        Runtime { config }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Drive the scheduler to quiescence for the current instant: run
    /// every ready task, tick due timers, then poll the reactor once
    /// for whatever's left of this pass's budget. Returns `true` if
    /// there is still outstanding work (ready tasks, pending timers, or
    /// anything a reactor registration is waiting on).
    pub fn run_once(&self) -> bool {
        loop {
            let stepped = scheduler::step();
            if stepped == 0 {
                break;
            }
        }

        let now = Instant::now();
        timer::tick(now);

        while scheduler::ready_count() > 0 {
            scheduler::step();
        }

        let timeout = match timer::time_until_next(Instant::now()) {
            Some(d) => Some(d.min(self.config.reactor_poll_granularity)),
            None if scheduler::is_empty() => None,
            None => Some(self.config.reactor_poll_granularity),
        };
        let _ = reactor::with_reactor(|r| r.poll(timeout));

        !scheduler::is_empty() || timer::pending_count() > 0
    }

    /// Run `run_once` until the scheduler has no tasks left and no
    /// timer is pending — i.e. until there is nothing left to wake.
    pub fn run(&self) {
        while self.run_once() {}
    }

    /// Like `run`, but gives up (leaving whatever's left suspended)
    /// once `budget` has elapsed — a safety valve for tests and
    /// callers that don't want to risk an unbounded loop against a
    /// task that never resolves.
    pub fn run_for(&self, budget: Duration) {
        let deadline = Instant::now() + budget;
        while Instant::now() < deadline {
            if !self.run_once() {
                break;
            }
        }
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler;

    #[test]
    fn run_drains_a_single_ready_task() {
        scheduler::reset_for_test();
        let handle = scheduler::spawn(async { 1 + 1 });
        let rt = Runtime::new();
        rt.run_for(Duration::from_millis(50));
        assert_eq!(handle.try_result(), Some(Ok(2)));
    }

    #[test]
    fn run_once_advances_a_sleeping_task() {
        scheduler::reset_for_test();
        let handle = scheduler::spawn(async {
            crate::timer::sleep(Duration::from_millis(5)).await;
            42
        });
        let rt = Runtime::new();
        rt.run_for(Duration::from_millis(200));
        assert_eq!(handle.try_result(), Some(Ok(42)));
    }
}

//! A single-threaded cooperative task runtime.
//!
//! One scheduler drives everything: tasks suspend by returning
//! [`std::task::Poll::Pending`] and resume when something — a fired
//! timer, a ready fd, another task finishing — calls their waker. There
//! is no preemption and no OS-thread parallelism inside the scheduler
//! itself; concurrency comes from interleaving suspension points, the
//! way a single-threaded event loop always has.
//!
//! - [`scheduler`] owns the ready queue and polls tasks to their next
//!   suspension point.
//! - [`timer`] is the deadline wheel `sleep`/timeouts suspend on.
//! - [`reactor`] multiplexes OS-level readiness (pipes, sockets) onto
//!   task wakers via `mio`.
//! - [`channel`], [`queue`], [`sync`] are the coordination primitives
//!   tasks hand data and signals through.
//! - [`group`] is structured concurrency: a scope tasks are born into
//!   and that waits for (or cancels) all of them together.
//! - [`cancel`] and [`gather`] are the ad hoc complements to a group:
//!   a one-off timeout race, and a one-off multi-wait over a batch of
//!   handles collected from wherever.
//! - [`subprocess`] supervises a real child process's pipes and framed
//!   IPC through the same reactor as everything else.
//! - [`runtime`] ties the scheduler, timer wheel, and reactor into the
//!   main loop.

pub mod cancel;
pub mod channel;
pub mod config;
pub mod error;
pub mod gather;
pub mod group;
pub mod queue;
pub mod reactor;
pub mod runtime;
pub mod scheduler;
pub mod subprocess;
pub mod sync;
pub mod task;
pub mod timer;

pub use config::RuntimeConfig;
pub use error::{Result, RtError};
pub use runtime::Runtime;
pub use task::{JoinHandle, TaskId};

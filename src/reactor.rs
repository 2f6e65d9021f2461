//! I/O readiness reactor.
//!
//! A thin wrapper over [`mio::Poll`]: register a source for read and/or
//! write readiness along with the waker to call when it becomes ready,
//! then `poll()` once per runtime iteration. This is the single place
//! in the crate that talks to the OS's multiplexer (epoll/kqueue/IOCP);
//! everything above it — subprocess pipes, the signal channel — is just
//! another registered source.

use mio::{Interest, Token};
use std::cell::RefCell;
use std::collections::HashMap;
use std::io;
use std::rc::Rc;
use std::task::Waker;
use std::time::Duration;

/// Registration handle returned by `add_reader`/`add_writer`. Pass it
/// to `remove` to stop watching that source before dropping it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegistrationId(usize);

struct Watched {
    reader: Option<Waker>,
    writer: Option<Waker>,
}

/// The reactor. One per runtime; registers sources with a single
/// `mio::Poll` and delivers readiness by waking the task that asked for
/// it, exactly as a timer delivers readiness by waking the task parked
/// on its deadline.
pub struct Reactor {
    poll: mio::Poll,
    events: mio::Events,
    next_token: usize,
    watched: HashMap<usize, Watched>,
}

impl Reactor {
    pub fn new() -> io::Result<Self> {
        Ok(Reactor {
            poll: mio::Poll::new()?,
            events: mio::Events::with_capacity(1024),
            next_token: 0,
            watched: HashMap::new(),
        })
    }

    fn alloc_token(&mut self) -> usize {
        let token = self.next_token;
        self.next_token += 1;
        token
    }

    /// Register `source` for readability, waking `waker` each time it
    /// becomes readable until `remove` is called.
    pub fn add_reader<S>(&mut self, source: &mut S, waker: Waker) -> io::Result<RegistrationId>
    where
        S: mio::event::Source + ?Sized,
    {
        let token = self.alloc_token();
        self.poll
            .registry()
            .register(source, Token(token), Interest::READABLE)?;
        self.watched.insert(
            token,
            Watched {
                reader: Some(waker),
                writer: None,
            },
        );
        Ok(RegistrationId(token))
    }

    pub fn add_writer<S>(&mut self, source: &mut S, waker: Waker) -> io::Result<RegistrationId>
    where
        S: mio::event::Source + ?Sized,
    {
        let token = self.alloc_token();
        self.poll
            .registry()
            .register(source, Token(token), Interest::WRITABLE)?;
        self.watched.insert(
            token,
            Watched {
                reader: None,
                writer: Some(waker),
            },
        );
        Ok(RegistrationId(token))
    }

    pub fn remove<S>(&mut self, id: RegistrationId, source: &mut S) -> io::Result<()>
    where
        S: mio::event::Source + ?Sized,
    {
        self.watched.remove(&id.0);
        self.poll.registry().deregister(source)
    }

    /// Block for up to `timeout` (or indefinitely if `None`) waiting for
    /// I/O readiness, then wake every task whose registered source fired.
    /// Returns the number of readiness events delivered.
    pub fn poll(&mut self, timeout: Option<Duration>) -> io::Result<usize> {
        self.poll.poll(&mut self.events, timeout)?;
        let mut delivered = 0;
        for event in self.events.iter() {
            let token = event.token().0;
            let Some(watched) = self.watched.get(&token) else {
                continue;
            };
            if event.is_readable() {
                if let Some(waker) = &watched.reader {
                    waker.wake_by_ref();
                    delivered += 1;
                }
            }
            if event.is_writable() {
                if let Some(waker) = &watched.writer {
                    waker.wake_by_ref();
                    delivered += 1;
                }
            }
        }
        Ok(delivered)
    }
}

thread_local! {
    static GLOBAL: Rc<RefCell<Option<Reactor>>> = Rc::new(RefCell::new(Reactor::new().ok()));
}

/// Run `f` with this thread's reactor, if it initialized successfully.
/// Reactor construction can fail (platform resource exhaustion); tests
/// and non-I/O scenarios run fine without one, since nothing registers
/// against a reactor that never gets touched.
pub fn with_reactor<R>(f: impl FnOnce(&mut Reactor) -> R) -> Option<R> {
    GLOBAL.with(|cell| cell.borrow_mut().as_mut().map(f))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reactor_constructs_without_registrations() {
        let reactor = Reactor::new();
        assert!(reactor.is_ok());
    }

    #[test]
    fn poll_with_zero_timeout_returns_no_events_when_idle() {
        let mut reactor = Reactor::new().unwrap();
        let delivered = reactor.poll(Some(Duration::from_millis(0))).unwrap();
        assert_eq!(delivered, 0);
    }
}

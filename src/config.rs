//! Runtime configuration.
//!
//! Plain in-process data, no file/env parsing — the runtime carries no
//! persistent state, so there is nothing for a config file to survive
//! between runs. A struct of knobs with a sane `Default`, constructed
//! once up front.

use std::time::Duration;

/// Tunables for one [`crate::runtime::Runtime`] instance.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Default bounded capacity for [`crate::queue::Queue`] when the
    /// caller doesn't request an explicit one via `Queue::new`.
    pub default_queue_capacity: Option<usize>,
    /// How long `Runtime::run_once` is willing to block in the reactor's
    /// `mio::Poll::poll` when no timer is sooner and no task is ready.
    pub reactor_poll_granularity: Duration,
    /// How long a subprocess is given to exit after being sent SIGTERM
    /// in `stop()` before the supervisor gives up waiting.
    pub subprocess_reap_timeout: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            default_queue_capacity: None,
            reactor_poll_granularity: Duration::from_millis(100),
            subprocess_reap_timeout: Duration::from_secs(5),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_no_queue_capacity_limit() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.default_queue_capacity, None);
    }

    #[test]
    fn default_poll_granularity_is_sub_second() {
        let cfg = RuntimeConfig::default();
        assert!(cfg.reactor_poll_granularity < Duration::from_secs(1));
    }
}

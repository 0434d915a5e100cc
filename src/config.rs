use std::time::Duration;

/// Which readiness backend an [`IoQueue`](crate::IoQueue) should use.
///
/// `Auto` probes the backends compiled in (via the `backend-*` features)
/// in the order kqueue, epoll, select, picking the first that initializes
/// successfully on the running kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendChoice {
    #[default]
    Auto,
    Select,
    Epoll,
    Kqueue,
}

/// Tunables for an [`IoQueue`](crate::IoQueue).
///
/// Mirrors the configuration surface described for the original ioqueue:
/// a bounded key capacity, a backend choice, a per-`poll` event cap, the
/// closing-key grace period, the safe-unregister toggle, and the
/// epoll exclusive/one-shot preference.
#[derive(Debug, Clone)]
pub struct Config {
    pub(crate) capacity: usize,
    pub(crate) backend_choice: BackendChoice,
    pub(crate) max_events_per_poll: usize,
    pub(crate) free_delay: Duration,
    pub(crate) safe_unregister: bool,
    pub(crate) epoll_use_exclusive: bool,
}

impl Config {
    /// Start from the defaults with the given `capacity` (the maximum
    /// number of concurrently registered keys). `capacity` must be
    /// greater than zero.
    pub fn new(capacity: usize) -> Config {
        Config {
            capacity,
            ..Config::default()
        }
    }

    pub fn backend_choice(mut self, choice: BackendChoice) -> Config {
        self.backend_choice = choice;
        self
    }

    pub fn max_events_per_poll(mut self, n: usize) -> Config {
        self.max_events_per_poll = n;
        self
    }

    pub fn free_delay(mut self, delay: Duration) -> Config {
        self.free_delay = delay;
        self
    }

    pub fn safe_unregister(mut self, enabled: bool) -> Config {
        self.safe_unregister = enabled;
        self
    }

    pub fn epoll_use_exclusive(mut self, enabled: bool) -> Config {
        self.epoll_use_exclusive = enabled;
        self
    }
}

impl Default for Config {
    fn default() -> Config {
        Config {
            capacity: 64,
            backend_choice: BackendChoice::Auto,
            // PJ_IOQUEUE_MAX_EVENTS_IN_SINGLE_POLL
            max_events_per_poll: 16,
            // PJ_IOQUEUE_KEY_FREE_DELAY
            free_delay: Duration::from_millis(500),
            safe_unregister: true,
            epoll_use_exclusive: true,
        }
    }
}

use std::time::{Duration, Instant};

/// A deadline derived from [`Instant::now`], used by the registry's closing
/// list to decide when a key's grace period has elapsed.
///
/// The original implementation stores an absolute tick count
/// (`pj_gettickcount()` + delay) per key; `Instant` replaces that custom
/// counter with the platform monotonic clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Deadline(Instant);

impl Deadline {
    pub(crate) fn after(delay: Duration) -> Deadline {
        Deadline(Instant::now() + delay)
    }

    pub(crate) fn has_passed(&self) -> bool {
        Instant::now() >= self.0
    }
}

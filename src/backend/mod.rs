//! Component F: the pluggable readiness backend.
//!
//! The dispatcher talks to whichever backend is selected through the four
//! verbs of [`Backend`] — `register`, `reregister`, `deregister`, `wait` —
//! without needing to know whether it is driving `select`, `epoll`, or
//! `kqueue`. Unlike the teacher crate, which picks exactly one selector per
//! compilation target, `ioq` keeps every backend compiled in behind
//! `backend-*` features and chooses between them at [`IoQueue::new`] time,
//! so that [`BackendChoice::Auto`](crate::config::BackendChoice) can probe
//! the running kernel instead of the build target.

use std::os::unix::io::RawFd;
use std::time::Duration;

use crate::config::Config;
use crate::error::Result;

#[cfg(feature = "backend-epoll")]
pub(crate) mod epoll;
#[cfg(feature = "backend-kqueue")]
pub(crate) mod kqueue;
#[cfg(feature = "backend-select")]
pub(crate) mod select;

/// Opaque cookie a backend attaches to a registration and echoes back on
/// every event naming it. `ioq` uses the registry's slab index as the
/// token, so a `Token` is always a valid index into `Registry`'s slab for
/// as long as the key is live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct Token(pub usize);

impl From<Token> for usize {
    fn from(t: Token) -> usize {
        t.0
    }
}

/// Which directions a key is currently armed for. `accept` shares the read
/// direction (a listening socket becomes readable when a connection is
/// ready to accept); `connect` shares the write direction and additionally
/// asks for exception readiness so a failed connect is observable even on
/// backends (like epoll) that otherwise fold errors into the read/write
/// bits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Interest {
    pub read: bool,
    pub write: bool,
    pub exception: bool,
}

impl Interest {
    pub(crate) const NONE: Interest = Interest {
        read: false,
        write: false,
        exception: false,
    };
}

/// A single readiness notification, normalized across backends.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RawEvent {
    pub token: Token,
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
}

/// The four verbs the dispatcher needs from a readiness engine.
///
/// Implementations must be safe to call from multiple threads
/// concurrently: `wait` in particular is expected to be invoked by several
/// poll threads at once, each blocking independently in the underlying
/// syscall.
pub(crate) trait Backend: Send + Sync {
    /// Register `fd` for the given initial interest, tagged with `token`.
    fn register(&self, fd: RawFd, token: Token, interest: Interest) -> Result<()>;

    /// Change the armed interest for an already-registered `fd`.
    fn reregister(&self, fd: RawFd, token: Token, interest: Interest) -> Result<()>;

    /// Remove `fd` from the backend. Idempotent-safe to call at most once
    /// per registration; the registry guarantees it is never called twice
    /// for the same fd.
    fn deregister(&self, fd: RawFd) -> Result<()>;

    /// Block for up to `timeout` (or indefinitely if `None`) and append
    /// ready events to `events`. Returns the number appended.
    fn wait(&self, timeout: Option<Duration>, events: &mut Vec<RawEvent>) -> Result<usize>;

    /// Short name for logging (`"epoll"`, `"kqueue"`, `"select"`).
    fn name(&self) -> &'static str;
}

/// Probe the backends compiled in and return the first that initializes
/// successfully, honoring `config.backend_choice` when it names a specific
/// one.
pub(crate) fn probe(config: &Config) -> Result<Box<dyn Backend>> {
    use crate::config::BackendChoice;

    match config.backend_choice {
        #[cfg(feature = "backend-select")]
        BackendChoice::Select => return select::Select::new(config).map(|b| Box::new(b) as _),
        #[cfg(feature = "backend-epoll")]
        BackendChoice::Epoll => return epoll::Epoll::new(config).map(|b| Box::new(b) as _),
        #[cfg(feature = "backend-kqueue")]
        BackendChoice::Kqueue => return kqueue::Kqueue::new(config).map(|b| Box::new(b) as _),
        BackendChoice::Auto => {}
        #[allow(unreachable_patterns)]
        _ => {
            return Err(crate::error::Error::InvalidArgument(
                "requested backend not compiled in",
            ))
        }
    }

    #[cfg(feature = "backend-kqueue")]
    if let Ok(b) = kqueue::Kqueue::new(config) {
        log::debug!("ioq: selected kqueue backend");
        return Ok(Box::new(b));
    }
    #[cfg(feature = "backend-epoll")]
    if let Ok(b) = epoll::Epoll::new(config) {
        log::debug!("ioq: selected epoll backend");
        return Ok(Box::new(b));
    }
    #[cfg(feature = "backend-select")]
    {
        log::debug!("ioq: selected select backend");
        return select::Select::new(config).map(|b| Box::new(b) as _);
    }
    #[allow(unreachable_code)]
    {
        Err(crate::error::Error::Bug("no backend compiled in"))
    }
}

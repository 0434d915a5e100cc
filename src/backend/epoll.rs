//! The epoll backend (Linux, Android): Component F for that platform.
//!
//! Grounded on the teacher's `sys/unix/selector/epoll.rs` — the
//! `epoll_create1`/`epoll_ctl`/`epoll_wait` calls and the `syscall!` macro
//! are carried over verbatim in spirit. What's new here relative to the
//! teacher is the `EPOLLEXCLUSIVE`/`EPOLLONESHOT` fallback chain (the
//! teacher always uses edge-triggered `EPOLLET` with no exclusive/oneshot
//! concern, since mio only ever has one thread calling `epoll_wait` per
//! `Poll`; `ioq` must additionally support several threads sharing one
//! queue, for which `register`'s thundering-herd avoidance below exists).

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use crate::backend::{Backend, Interest, RawEvent, Token};
use crate::config::Config;
use crate::error::{Error, Result};

macro_rules! syscall {
    ($fn: ident ( $($arg: expr),* $(,)* ) ) => {{
        let res = unsafe { libc::$fn($($arg, )*) };
        if res == -1 {
            Err(Error::last_os_error())
        } else {
            Ok(res)
        }
    }};
}

/// Which thundering-herd-avoidance flag `register` ends up using, chosen
/// once at backend construction and shared by every registration. Old TLS
/// libraries linked against the process (the source calls out OpenSSL
/// older than 1.1.0) can misbehave with `EPOLLEXCLUSIVE`; we don't probe
/// for that here, only honor `Config::epoll_use_exclusive`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HerdMode {
    Exclusive,
    OneShot,
    LevelTriggered,
}

pub(crate) struct Epoll {
    ep: OwnedFd,
    herd_mode: HerdMode,
    // Tracks the last interest armed per fd's token-adjacent reregister,
    // needed to recompute the full events mask when re-arming after a
    // one-shot dispatch (epoll has no "add to existing mask" primitive
    // short of a read-modify-write).
    last_interest: Mutex<std::collections::HashMap<RawFd, Interest>>,
    probed_exclusive: AtomicBool,
}

impl Epoll {
    pub(crate) fn new(config: &Config) -> Result<Epoll> {
        let fd = syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?;
        let ep = unsafe { OwnedFd::from_raw_fd(fd) };
        let herd_mode = if config.epoll_use_exclusive {
            HerdMode::Exclusive
        } else {
            HerdMode::OneShot
        };
        Ok(Epoll {
            ep,
            herd_mode,
            last_interest: Mutex::new(std::collections::HashMap::new()),
            probed_exclusive: AtomicBool::new(true),
        })
    }

    fn interests_to_epoll(&self, interest: Interest) -> u32 {
        let mut mask = libc::EPOLLIN | libc::EPOLLERR;
        if interest.write {
            mask |= libc::EPOLLOUT;
        }
        match self.herd_mode {
            HerdMode::Exclusive if self.probed_exclusive.load(Ordering::Relaxed) => {
                mask |= libc::EPOLLEXCLUSIVE
            }
            HerdMode::OneShot => mask |= libc::EPOLLONESHOT,
            _ => {}
        }
        mask as u32
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, token: Token, interest: Interest) -> Result<()> {
        let mut event = libc::epoll_event {
            events: self.interests_to_epoll(interest),
            u64: token.0 as u64,
        };
        match syscall!(epoll_ctl(self.ep.as_raw_fd(), op, fd, &mut event)) {
            Ok(_) => Ok(()),
            Err(Error::Os(e))
                if op == libc::EPOLL_CTL_ADD
                    && self.herd_mode == HerdMode::Exclusive
                    && e.raw_os_error() == Some(libc::EINVAL) =>
            {
                // EPOLLEXCLUSIVE unsupported by this kernel; fall back to
                // EPOLLONESHOT for the remaining lifetime of this backend.
                log::warn!("ioq: EPOLLEXCLUSIVE rejected by kernel, falling back to EPOLLONESHOT");
                self.probed_exclusive.store(false, Ordering::Relaxed);
                let mut event = libc::epoll_event {
                    events: self.interests_to_epoll(interest),
                    u64: token.0 as u64,
                };
                syscall!(epoll_ctl(self.ep.as_raw_fd(), op, fd, &mut event)).map(|_| ())
            }
            Err(e) => Err(e),
        }
    }
}

impl Backend for Epoll {
    fn register(&self, fd: RawFd, token: Token, interest: Interest) -> Result<()> {
        self.last_interest.lock().insert(fd, interest);
        self.ctl(libc::EPOLL_CTL_ADD, fd, token, interest)
    }

    fn reregister(&self, fd: RawFd, token: Token, interest: Interest) -> Result<()> {
        self.last_interest.lock().insert(fd, interest);
        self.ctl(libc::EPOLL_CTL_MOD, fd, token, interest)
    }

    fn deregister(&self, fd: RawFd) -> Result<()> {
        self.last_interest.lock().remove(&fd);
        syscall!(epoll_ctl(
            self.ep.as_raw_fd(),
            libc::EPOLL_CTL_DEL,
            fd,
            std::ptr::null_mut(),
        ))
        .map(|_| ())
    }

    fn wait(&self, timeout: Option<Duration>, events: &mut Vec<RawEvent>) -> Result<usize> {
        let timeout_ms = timeout
            .map(|d| {
                d.checked_add(Duration::from_nanos(999_999))
                    .unwrap_or(d)
                    .as_millis() as libc::c_int
            })
            .unwrap_or(-1);

        let mut raw: [libc::epoll_event; 256] = unsafe { std::mem::zeroed() };
        let n = syscall!(epoll_wait(
            self.ep.as_raw_fd(),
            raw.as_mut_ptr(),
            raw.len() as i32,
            timeout_ms,
        ))? as usize;

        for ev in &raw[..n] {
            let mask = ev.events as libc::c_int;
            events.push(RawEvent {
                token: Token(ev.u64 as usize),
                readable: mask & (libc::EPOLLIN | libc::EPOLLHUP) != 0,
                writable: mask & libc::EPOLLOUT != 0,
                error: mask & (libc::EPOLLERR | libc::EPOLLHUP) != 0,
            });
        }
        Ok(n)
    }

    fn name(&self) -> &'static str {
        "epoll"
    }
}

//! The kqueue backend (the BSDs, macOS): Component F for that platform.
//!
//! Grounded on the teacher's `sys/unix/selector/kqueue.rs`: the `kevent!`
//! macro, the platform-conditional `Count`/`Filter`/`Data` type aliases,
//! and `kevent_register`'s EPIPE/ENOENT-ignoring retry are carried over.
//! What differs from the teacher: per the spec's backend table,
//! `EVFILT_READ` is registered once at `register` time and left armed for
//! the key's whole lifetime (accept/read share it), while `EVFILT_WRITE`
//! is toggled by `reregister` on every queue-empty transition rather than
//! both filters being symmetrically added/removed together.

use std::os::unix::io::RawFd;
use std::time::Duration;
use std::{cmp, ptr};

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

#[cfg(not(target_os = "netbsd"))]
type Count = libc::c_int;
#[cfg(target_os = "netbsd")]
type Count = libc::size_t;

#[cfg(any(target_os = "freebsd", target_os = "openbsd", target_os = "dragonfly"))]
type Filter = libc::c_short;
#[cfg(any(target_os = "macos", target_os = "ios"))]
type Filter = i16;
#[cfg(target_os = "netbsd")]
type Filter = u32;

#[cfg(any(
    target_os = "dragonfly",
    target_os = "freebsd",
    target_os = "ios",
    target_os = "macos"
))]
type Data = libc::intptr_t;
#[cfg(any(target_os = "netbsd", target_os = "openbsd"))]
type Data = i64;

macro_rules! kevent {
    ($id: expr, $filter: expr, $flags: expr, $data: expr) => {
        libc::kevent {
            ident: $id as libc::uintptr_t,
            filter: $filter as Filter,
            flags: $flags,
            fflags: 0,
            data: 0,
            udata: $data as *mut libc::c_void,
        }
    };
}

pub(crate) struct Kqueue {
    kq: RawFd,
}

impl Kqueue {
    pub(crate) fn new(_config: &Config) -> Result<Kqueue> {
        let kq = syscall!(kqueue())
            .and_then(|kq| syscall!(fcntl(kq, libc::F_SETFD, libc::FD_CLOEXEC)).map(|_| kq))?;
        Ok(Kqueue { kq })
    }
}

impl Backend for Kqueue {
    fn register(&self, fd: RawFd, token: Token, interest: Interest) -> Result<()> {
        let flags = libc::EV_CLEAR | libc::EV_RECEIPT | libc::EV_ADD;
        // Read stays armed for the key's whole lifetime (accept and read
        // both dispatch off it); write starts disabled and is toggled by
        // `reregister` as the write queue transitions empty/non-empty.
        let mut changes = [
            kevent!(fd, libc::EVFILT_READ, flags, token.0),
            kevent!(
                fd,
                libc::EVFILT_WRITE,
                if interest.write {
                    flags
                } else {
                    libc::EV_CLEAR | libc::EV_RECEIPT | libc::EV_ADD | libc::EV_DISABLE
                },
                token.0
            ),
        ];
        kevent_register(self.kq, &mut changes, &[libc::EPIPE as Data])
    }

    fn reregister(&self, fd: RawFd, token: Token, interest: Interest) -> Result<()> {
        let flags = libc::EV_CLEAR | libc::EV_RECEIPT;
        let write_flags = if interest.write {
            flags | libc::EV_ENABLE
        } else {
            flags | libc::EV_DISABLE
        };
        let mut changes = [kevent!(fd, libc::EVFILT_WRITE, write_flags, token.0)];
        kevent_register(self.kq, &mut changes, &[libc::ENOENT as Data, libc::EPIPE as Data])
    }

    fn deregister(&self, fd: RawFd) -> Result<()> {
        let flags = libc::EV_DELETE | libc::EV_RECEIPT;
        let mut changes = [
            kevent!(fd, libc::EVFILT_READ, flags, 0),
            kevent!(fd, libc::EVFILT_WRITE, flags, 0),
        ];
        kevent_register(self.kq, &mut changes, &[libc::ENOENT as Data])
    }

    fn wait(&self, timeout: Option<Duration>, events: &mut Vec<RawEvent>) -> Result<usize> {
        let ts = timeout.map(|to| libc::timespec {
            tv_sec: cmp::min(to.as_secs(), libc::time_t::MAX as u64) as libc::time_t,
            tv_nsec: libc::c_long::from(to.subsec_nanos() as i32),
        });
        let ts_ptr = ts.as_ref().map(|s| s as *const _).unwrap_or(ptr::null());

        let mut raw: [libc::kevent; 256] = unsafe { std::mem::zeroed() };
        let n = match syscall!(kevent(
            self.kq,
            ptr::null(),
            0,
            raw.as_mut_ptr(),
            raw.len() as Count,
            ts_ptr,
        )) {
            Ok(n) => n as usize,
            // A zero-event, zero-fd wait that errors with EINTR is not a
            // real failure; the caller's poll loop will simply retry.
            Err(Error::Os(e)) if e.raw_os_error() == Some(libc::EINTR) => {
                // Sleep a bounded interval before letting the caller spin
                // again, per the spec's busy-spin-avoidance note.
                std::thread::sleep(Duration::from_millis(10));
                0
            }
            Err(e) => return Err(e),
        };

        for ev in &raw[..n] {
            events.push(RawEvent {
                token: Token(ev.udata as usize),
                readable: ev.filter == libc::EVFILT_READ,
                writable: ev.filter == libc::EVFILT_WRITE,
                error: (ev.flags & libc::EV_ERROR) != 0
                    || ((ev.flags & libc::EV_EOF) != 0 && ev.fflags != 0),
            });
        }
        Ok(n)
    }

    fn name(&self) -> &'static str {
        "kqueue"
    }
}

impl Drop for Kqueue {
    fn drop(&mut self) {
        if let Err(e) = syscall!(close(self.kq)) {
            log::error!("ioq: error closing kqueue fd: {}", e);
        }
    }
}

unsafe impl Send for Kqueue {}
unsafe impl Sync for Kqueue {}

fn kevent_register(kq: RawFd, changes: &mut [libc::kevent], ignored_errors: &[Data]) -> Result<()> {
    syscall!(kevent(
        kq,
        changes.as_ptr(),
        changes.len() as Count,
        changes.as_mut_ptr(),
        changes.len() as Count,
        ptr::null(),
    ))
    .map(|_| ())
    .or_else(|err| match err {
        Error::Os(e) if e.raw_os_error() == Some(libc::EINTR) => Ok(()),
        e => Err(e),
    })?;
    check_errors(changes, ignored_errors)
}

fn check_errors(events: &[libc::kevent], ignored_errors: &[Data]) -> Result<()> {
    for event in events {
        let data = event.data;
        if (event.flags & libc::EV_ERROR != 0) && data != 0 && !ignored_errors.contains(&data) {
            return Err(Error::Os(std::io::Error::from_raw_os_error(data as i32)));
        }
    }
    Ok(())
}

//! Component D: the per-descriptor key, and the fast-path-then-enqueue
//! submission functions of Component G (§4.2).
//!
//! Grounded on `ioqueue_common_abs.c`'s `pj_ioqueue_recv`/`recvfrom`/
//! `send`/`sendto`/`accept`/`connect` and the `key_has_pending_*` helpers.
//! The per-key mutex there is reentrant because the same C code path can,
//! in a few spots, re-enter it on one thread; this crate's dispatcher never
//! does that (invariant 7: callbacks never run while holding the key lock
//! or the queue lock), so a plain `parking_lot::Mutex` suffices here —
//! see DESIGN.md.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::backend::{Interest, Token};
use crate::error::{Error, Result};
use crate::group_lock::GroupLock;
use crate::op::{
    AcceptCompletion, AcceptOp, Callbacks, ConnectCompletion, RecvCompletion, RecvOp,
    SendCompletion, SendOp, Submit,
};
use crate::queue::QueueShared;
use crate::sockaddr;

/// The socket type a key was registered with, queried once via
/// `getsockopt(SO_TYPE)` at registration (`ioqueue_init_key`). Accept is
/// only meaningful for `Stream`; `sendto`/`recvfrom` are typically only
/// useful for `Datagram`, but the queue doesn't enforce that — the kernel
/// will reject the syscall itself if misused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketKind {
    Stream,
    Datagram,
}

/// Per-key mutable state guarded by one lock: the three queues and the
/// in-flight `connect` flag. Matches spec.md §3's `read_queue`,
/// `write_queue`, `accept_queue`, and `connecting` fields.
pub(crate) struct KeyState {
    pub(crate) read_queue: VecDeque<RecvOp>,
    pub(crate) write_queue: VecDeque<SendOp>,
    pub(crate) accept_queue: VecDeque<AcceptOp>,
    pub(crate) connecting: bool,
}

impl KeyState {
    fn new() -> KeyState {
        KeyState {
            read_queue: VecDeque::new(),
            write_queue: VecDeque::new(),
            accept_queue: VecDeque::new(),
            connecting: false,
        }
    }

    pub(crate) fn read_interest(&self) -> bool {
        !self.read_queue.is_empty() || !self.accept_queue.is_empty()
    }

    pub(crate) fn write_interest(&self) -> bool {
        !self.write_queue.is_empty() || self.connecting
    }
}

pub(crate) struct KeyInner {
    pub(crate) fd: RawFd,
    pub(crate) token: Token,
    pub(crate) socket_kind: SocketKind,
    pub(crate) state: Mutex<KeyState>,
    pub(crate) callbacks: Mutex<Callbacks>,
    user_data: Mutex<Box<dyn std::any::Any + Send>>,
    pub(crate) group_lock: Option<GroupLock>,
    pub(crate) closing: AtomicBool,
    /// Count of in-flight dispatches currently holding a reference to this
    /// key, incremented by the poll loop while still holding the registry
    /// lock and decremented after the matching callback returns (§4.5's
    /// refcount discipline). Distinct from `Arc`'s own strong count: a
    /// caller may keep `Key` clones around indefinitely after
    /// `unregister`, which must not by itself block reclamation — only
    /// dispatches actually in flight do.
    pub(crate) dispatch_refs: AtomicUsize,
    /// Set once this key's fd has actually been `close`d. Distinct from
    /// `closing`: `closing` forbids new dispatches and new submissions
    /// immediately, but the fd itself must stay open until the last
    /// in-flight dispatch (if any) has returned — see `close_fd_if_safe`.
    pub(crate) fd_closed: AtomicBool,
    pub(crate) shared: Arc<QueueShared>,
}

impl KeyInner {
    pub(crate) fn inc_dispatch_ref(&self) {
        self.dispatch_refs.fetch_add(1, Ordering::AcqRel);
        if let Some(gl) = &self.group_lock {
            gl.add_ref();
        }
    }

    pub(crate) fn dec_dispatch_ref(&self) {
        if let Some(gl) = &self.group_lock {
            gl.dec_ref();
        }
        let prev = self.dispatch_refs.fetch_sub(1, Ordering::AcqRel);
        if prev == 1 && self.closing.load(Ordering::Acquire) {
            close_fd_if_safe(self);
        }
    }
}

/// Close a key's fd exactly once, and only once no dispatch is in flight.
/// Called both from `Registry::unregister` (the common case: no dispatch
/// was in flight at unregister time) and from `dec_dispatch_ref` (the race
/// from spec.md §8 scenario 4: a dispatch was already running when
/// `unregister` observed the key, so the close is deferred to whichever
/// side — unregister or the in-flight dispatch's epilogue — is last out).
pub(crate) fn close_fd_if_safe(inner: &KeyInner) {
    if inner.dispatch_refs.load(Ordering::Acquire) == 0
        && !inner.fd_closed.swap(true, Ordering::AcqRel)
    {
        unsafe {
            libc::close(inner.fd);
        }
    }
}

/// A handle to a registered descriptor, returned by
/// [`IoQueue::register`](crate::IoQueue::register).
///
/// Cheaply `Clone`-able; every clone refers to the same underlying key.
/// The key's backing resources (fd, queues) are reclaimed once the last
/// callback referencing it has returned and its grace period elapses —
/// see the registry's closing list — not simply when the last `Key` clone
/// is dropped, since a dispatch in flight on another thread may still
/// hold its own internal reference independent of any `Key` the caller
/// kept.
#[derive(Clone)]
pub struct Key {
    pub(crate) inner: Arc<KeyInner>,
}

impl Key {
    pub(crate) fn new(
        fd: RawFd,
        token: Token,
        socket_kind: SocketKind,
        user_data: Box<dyn std::any::Any + Send>,
        callbacks: Callbacks,
        group_lock: Option<GroupLock>,
        shared: Arc<QueueShared>,
    ) -> Key {
        if let Some(gl) = &group_lock {
            gl.add_ref();
        }
        Key {
            inner: Arc::new(KeyInner {
                fd,
                token,
                socket_kind,
                state: Mutex::new(KeyState::new()),
                callbacks: Mutex::new(callbacks),
                user_data: Mutex::new(user_data),
                group_lock,
                closing: AtomicBool::new(false),
                dispatch_refs: AtomicUsize::new(0),
                fd_closed: AtomicBool::new(false),
                shared,
            }),
        }
    }

    pub fn get_user_data<T: 'static>(&self) -> Option<T>
    where
        T: Clone,
    {
        self.inner
            .user_data
            .lock()
            .downcast_ref::<T>()
            .cloned()
    }

    pub fn set_user_data(&self, user_data: Box<dyn std::any::Any + Send>) -> Box<dyn std::any::Any + Send> {
        std::mem::replace(&mut *self.inner.user_data.lock(), user_data)
    }

    pub fn fd(&self) -> RawFd {
        self.inner.fd
    }

    pub fn is_closing(&self) -> bool {
        self.inner.closing.load(Ordering::Acquire)
    }

    /// Unregister this key: idempotent, safe to call from inside the
    /// key's own callback (§8 boundary case). See `registry.rs` for the
    /// closing-list/grace-period mechanics this triggers.
    pub fn unregister(&self) -> Result<()> {
        self.inner.shared.registry.unregister(&self.inner, &self.inner.shared)
    }

    fn check_not_closing(&self) -> Result<()> {
        if self.inner.closing.load(Ordering::Acquire) {
            Err(Error::Closing)
        } else {
            Ok(())
        }
    }

    fn rearm(&self) -> Result<()> {
        rearm(&self.inner)
    }

    /// `recv(2)` — buffer length is `op.buf.len()`.
    pub fn recv(&self, mut op: RecvOp) -> Result<Submit<usize>> {
        self.check_not_closing()?;
        if op.buf.is_empty() {
            return Ok(Submit::Immediate(0));
        }

        match raw_recv(self.inner.fd, &mut op.buf, op.flags) {
            Ok(n) => return Ok(Submit::Immediate(n)),
            Err(e) if e.is_would_block() => {}
            Err(e) => return Err(e),
        }

        let mut state = self.inner.state.lock();
        state.read_queue.push_back(op);
        drop(state);
        self.rearm()?;
        Ok(Submit::Pending)
    }

    /// `recvfrom(2)`.
    pub fn recvfrom(&self, mut op: RecvOp) -> Result<Submit<(usize, SocketAddr)>> {
        self.check_not_closing()?;
        op.from_addr = true;

        match raw_recvfrom(self.inner.fd, &mut op.buf, op.flags) {
            Ok((n, addr)) => return Ok(Submit::Immediate((n, addr))),
            Err(e) if e.is_would_block() => {}
            Err(e) => return Err(e),
        }

        let mut state = self.inner.state.lock();
        state.read_queue.push_back(op);
        drop(state);
        self.rearm()?;
        Ok(Submit::Pending)
    }

    /// `send(2)`. Samples `write_queue.is_empty()` without the key lock
    /// before attempting the syscall — see spec.md §4.2's note on why this
    /// speculative read is safe.
    pub fn send(&self, op: SendOp) -> Result<Submit<usize>> {
        self.check_not_closing()?;
        if op.buf.is_empty() {
            return Ok(Submit::Immediate(0));
        }

        let queue_empty = self.inner.state.lock().write_queue.is_empty();
        if queue_empty {
            let res = match op.to {
                Some(addr) => raw_sendto(self.inner.fd, &op.buf[op.sent..], op.flags, addr),
                None => raw_send(self.inner.fd, &op.buf[op.sent..], op.flags),
            };
            match res {
                Ok(n) => return Ok(Submit::Immediate(n)),
                Err(e) if e.is_would_block() => {}
                Err(e) => return Err(e),
            }
        }

        let mut state = self.inner.state.lock();
        state.write_queue.push_back(op);
        drop(state);
        self.rearm()?;
        Ok(Submit::Pending)
    }

    /// `accept(2)`. Only meaningful on a listening `Stream` key. The
    /// returned tuple is `(new_fd, local_addr, remote_addr)`; `local_addr`
    /// is only populated when `op.want_local_addr` was set, matching
    /// `AcceptCompletion`'s fields on the queued path.
    pub fn accept(
        &self,
        op: AcceptOp,
    ) -> Result<Submit<(RawFd, Option<SocketAddr>, Option<SocketAddr>)>> {
        self.check_not_closing()?;
        if self.inner.socket_kind != SocketKind::Stream {
            return Err(Error::InvalidArgument("accept on a non-stream socket"));
        }

        match raw_accept(self.inner.fd) {
            Ok((fd, remote)) => {
                let local = if op.want_local_addr {
                    raw_getsockname(fd).ok()
                } else {
                    None
                };
                return Ok(Submit::Immediate((fd, local, remote)));
            }
            Err(e) if e.is_would_block() => {}
            Err(e) => return Err(e),
        }

        let mut state = self.inner.state.lock();
        state.accept_queue.push_back(op);
        drop(state);
        self.rearm()?;
        Ok(Submit::Pending)
    }

    /// `connect(2)`. If a connect is already in flight on this key,
    /// returns `Pending` without issuing another syscall.
    pub fn connect(&self, addr: SocketAddr) -> Result<Submit<()>> {
        self.check_not_closing()?;
        {
            let state = self.inner.state.lock();
            if state.connecting {
                return Ok(Submit::Pending);
            }
        }

        match raw_connect(self.inner.fd, addr) {
            Ok(()) => return Ok(Submit::Immediate(())),
            Err(Error::Os(e)) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
            Err(e) => return Err(e),
        }

        let mut state = self.inner.state.lock();
        state.connecting = true;
        drop(state);
        self.rearm()?;
        Ok(Submit::Pending)
    }
}

impl PartialEq for Key {
    fn eq(&self, other: &Key) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Key")
            .field("fd", &self.inner.fd)
            .field("closing", &self.is_closing())
            .finish()
    }
}

/// Recompute and push the armed interest for a key from its current queue
/// state. Used both by the submission fast paths (after enqueuing) and by
/// the dispatcher (after a dequeue changes which directions still have
/// work). The key lock must not be held by the caller.
pub(crate) fn rearm(inner: &KeyInner) -> Result<()> {
    let state = inner.state.lock();
    let interest = Interest {
        read: state.read_interest(),
        write: state.write_interest(),
        exception: state.connecting,
    };
    drop(state);
    inner.shared.backend.reregister(inner.fd, inner.token, interest)
}

// --- Raw syscall helpers (the fast path; no key lock held) ---

pub(crate) fn raw_recv(fd: RawFd, buf: &mut [u8], flags: i32) -> Result<usize> {
    let n = unsafe {
        libc::recv(
            fd,
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
            flags,
        )
    };
    if n < 0 {
        Err(Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

pub(crate) fn raw_recvfrom(fd: RawFd, buf: &mut [u8], flags: i32) -> Result<(usize, SocketAddr)> {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let n = unsafe {
        libc::recvfrom(
            fd,
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
            flags,
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len,
        )
    };
    if n < 0 {
        return Err(Error::last_os_error());
    }
    let addr = unsafe { sockaddr::from_raw(&storage) }
        .ok_or(Error::Bug("recvfrom produced an unrecognized address family"))?;
    Ok((n as usize, addr))
}

pub(crate) fn raw_send(fd: RawFd, buf: &[u8], flags: i32) -> Result<usize> {
    let n = unsafe {
        libc::send(
            fd,
            buf.as_ptr() as *const libc::c_void,
            buf.len(),
            flags | libc::MSG_NOSIGNAL,
        )
    };
    if n < 0 {
        Err(Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

pub(crate) fn raw_sendto(fd: RawFd, buf: &[u8], flags: i32, addr: SocketAddr) -> Result<usize> {
    let (storage, len) = sockaddr::as_raw(&addr);
    let n = unsafe {
        libc::sendto(
            fd,
            buf.as_ptr() as *const libc::c_void,
            buf.len(),
            flags | libc::MSG_NOSIGNAL,
            &storage as *const _ as *const libc::sockaddr,
            len,
        )
    };
    if n < 0 {
        Err(Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

pub(crate) fn raw_accept(fd: RawFd) -> Result<(RawFd, Option<SocketAddr>)> {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let new_fd = unsafe {
        libc::accept4(
            fd,
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len,
            libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        )
    };
    if new_fd < 0 {
        return Err(Error::last_os_error());
    }
    let addr = unsafe { sockaddr::from_raw(&storage) };
    Ok((new_fd, addr))
}

pub(crate) fn raw_getsockname(fd: RawFd) -> Result<SocketAddr> {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let rc = unsafe { libc::getsockname(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len) };
    if rc < 0 {
        return Err(Error::last_os_error());
    }
    unsafe { sockaddr::from_raw(&storage) }.ok_or(Error::Bug("getsockname: unrecognized address family"))
}

pub(crate) fn raw_connect(fd: RawFd, addr: SocketAddr) -> Result<()> {
    let (storage, len) = sockaddr::as_raw(&addr);
    let rc = unsafe { libc::connect(fd, &storage as *const _ as *const libc::sockaddr, len) };
    if rc < 0 {
        Err(Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Determine the outcome of a just-completed non-blocking connect.
/// Linux can read `SO_ERROR` directly; other Unixes fall back to
/// `getpeername`, treating `ENOTCONN` as the connect having failed
/// (`ioqueue_dispatch_write_event`'s `#if PJ_HAS_SO_ERROR` branch).
#[cfg(target_os = "linux")]
pub(crate) fn connect_result(fd: RawFd) -> Result<()> {
    let mut err: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if rc < 0 {
        return Err(Error::last_os_error());
    }
    if err == 0 {
        Ok(())
    } else {
        Err(Error::Os(std::io::Error::from_raw_os_error(err)))
    }
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn connect_result(fd: RawFd) -> Result<()> {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let rc = unsafe { libc::getpeername(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len) };
    if rc == 0 {
        Ok(())
    } else {
        let err = Error::last_os_error();
        match &err {
            Error::Os(e) if e.raw_os_error() == Some(libc::ENOTCONN) => {
                Err(Error::Os(std::io::Error::from_raw_os_error(libc::ECONNREFUSED)))
            }
            _ => Err(err),
        }
    }
}

/// `getsockopt(SO_TYPE)`, defaulting to `Stream` on failure
/// (`ioqueue_init_key`'s behavior).
pub(crate) fn query_socket_kind(fd: RawFd) -> SocketKind {
    let mut kind: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_TYPE,
            &mut kind as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if rc == 0 && kind == libc::SOCK_DGRAM {
        SocketKind::Datagram
    } else {
        SocketKind::Stream
    }
}

pub(crate) fn make_nonblocking(fd: RawFd) -> Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
    if flags < 0 {
        return Err(Error::last_os_error());
    }
    let rc = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if rc < 0 {
        Err(Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Produces the read/write completion callbacks and fires them. Split out
/// so the dispatcher (`dispatcher.rs`) can invoke callbacks without
/// reaching back into `KeyInner`'s private fields.
///
/// Each of these takes the `FnMut` out of its `Option` slot, drops the
/// `callbacks` lock, invokes it, then puts it back — invariant 7 forbids
/// running a callback while the lock is held (a slow `on_read_complete`
/// must not block a concurrent `on_write_complete` dispatch for the same
/// key on another thread).
pub(crate) fn fire_read(inner: &KeyInner, completion: RecvCompletion) {
    let mut cb = inner.callbacks.lock().on_read_complete.take();
    if let Some(f) = cb.as_mut() {
        f(completion);
    }
    inner.callbacks.lock().on_read_complete = cb;
}

pub(crate) fn fire_write(inner: &KeyInner, completion: SendCompletion) {
    let mut cb = inner.callbacks.lock().on_write_complete.take();
    if let Some(f) = cb.as_mut() {
        f(completion);
    }
    inner.callbacks.lock().on_write_complete = cb;
}

pub(crate) fn fire_accept(inner: &KeyInner, completion: AcceptCompletion) {
    let mut cb = inner.callbacks.lock().on_accept_complete.take();
    if let Some(f) = cb.as_mut() {
        f(completion);
    }
    inner.callbacks.lock().on_accept_complete = cb;
}

pub(crate) fn fire_connect(inner: &KeyInner, completion: ConnectCompletion) {
    let mut cb = inner.callbacks.lock().on_connect_complete.take();
    if let Some(f) = cb.as_mut() {
        f(completion);
    }
    inner.callbacks.lock().on_connect_complete = cb;
}

//! Component G: translating a raw readiness event into at most one
//! completion per direction per key, with the callback invoked outside
//! every lock.
//!
//! Grounded line-by-line on `ioqueue_common_abs.c`'s
//! `ioqueue_dispatch_read_event`/`ioqueue_dispatch_write_event`/
//! `ioqueue_dispatch_exception_event`: accept is checked before read,
//! datagram `ECONNRESET` is swallowed as a spurious wakeup, a partially
//! written stream send is requeued to finish on a later writable event
//! while a datagram send always completes or fails outright (`sendto` on
//! a datagram socket never partially writes), and a failed connect is
//! read back via `SO_ERROR` on Linux or `getpeername` elsewhere.

use std::sync::Arc;

use crate::backend::RawEvent;
use crate::error::Error;
use crate::key::{self, KeyInner, SocketKind};
use crate::op::{AcceptCompletion, ConnectCompletion, RecvCompletion, SendCompletion};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DispatchKind {
    Readable,
    Writable,
    Exception,
}

/// Implements spec.md §4.4's shared event-to-dispatch mapping table.
pub(crate) fn classify(key_inner: &KeyInner, ev: &RawEvent) -> Option<DispatchKind> {
    let state = key_inner.state.lock();
    if ev.readable && (!state.read_queue.is_empty() || !state.accept_queue.is_empty()) {
        return Some(DispatchKind::Readable);
    }
    if ev.writable && (!state.write_queue.is_empty() || state.connecting) {
        return Some(DispatchKind::Writable);
    }
    if ev.error && state.connecting {
        return Some(DispatchKind::Exception);
    }
    if ev.error && (!state.read_queue.is_empty() || !state.accept_queue.is_empty()) {
        return Some(DispatchKind::Readable);
    }
    None
}

pub(crate) fn dispatch(key_inner: &Arc<KeyInner>, kind: DispatchKind) {
    match kind {
        DispatchKind::Readable => dispatch_readable(key_inner),
        DispatchKind::Writable => dispatch_writable(key_inner),
        DispatchKind::Exception => dispatch_exception(key_inner),
    }
}

fn dispatch_readable(key_inner: &Arc<KeyInner>) {
    let mut state = key_inner.state.lock();

    if let Some(accept_op) = state.accept_queue.pop_front() {
        drop(state);
        let want_local = accept_op.want_local_addr;
        let (result, remote_addr) = match key::raw_accept(key_inner.fd) {
            Ok((fd, addr)) => (Ok(fd), addr),
            Err(e) => (Err(e), None),
        };
        let local_addr = match (&result, want_local) {
            (Ok(fd), true) => key::raw_getsockname(*fd).ok(),
            _ => None,
        };
        key::fire_accept(
            key_inner,
            AcceptCompletion {
                op: accept_op,
                result,
                local_addr,
                remote_addr,
            },
        );
        return;
    }

    if let Some(mut recv_op) = state.read_queue.pop_front() {
        drop(state);
        let (result, from) = if recv_op.from_addr {
            match key::raw_recvfrom(key_inner.fd, &mut recv_op.buf, recv_op.flags) {
                Ok((n, addr)) => (Ok(n), Some(addr)),
                Err(e) => (dgram_reset_is_spurious(key_inner, e), None),
            }
        } else {
            match key::raw_recv(key_inner.fd, &mut recv_op.buf, recv_op.flags) {
                Ok(n) => (Ok(n), None),
                Err(e) => (dgram_reset_is_spurious(key_inner, e), None),
            }
        };
        let result = match result {
            Some(r) => r,
            // ECONNRESET on a datagram socket: silently re-enqueue, no
            // callback (spec.md §4.5 / §7's swallow-ECONNRESET rule).
            None => {
                let mut state = key_inner.state.lock();
                state.read_queue.push_front(recv_op);
                drop(state);
                let _ = key::rearm(key_inner);
                return;
            }
        };
        key::fire_read(
            key_inner,
            RecvCompletion {
                op: recv_op,
                result,
                from,
            },
        );
        return;
    }

    // Spurious wakeup: another thread already drained the queues.
}

/// Returns `Some(Err(..))` for a genuine error, `Some(Ok(n))`-shaped
/// results are handled by the caller directly; `None` signals the
/// datagram-`ECONNRESET`-is-spurious case.
fn dgram_reset_is_spurious(
    key_inner: &KeyInner,
    err: Error,
) -> Option<Result<usize, Error>> {
    if key_inner.socket_kind == SocketKind::Datagram {
        if let Error::Os(ref e) = err {
            if e.raw_os_error() == Some(libc::ECONNRESET) {
                log::trace!("ioq: swallowing ECONNRESET on datagram fd {}", key_inner.fd);
                return None;
            }
        }
    }
    Some(Err(err))
}

fn dispatch_writable(key_inner: &Arc<KeyInner>) {
    let mut state = key_inner.state.lock();

    if state.connecting {
        state.connecting = false;
        drop(state);
        let _ = key::rearm(key_inner);
        let result = key::connect_result(key_inner.fd);
        key::fire_connect(key_inner, ConnectCompletion { result });
        return;
    }

    if let Some(mut send_op) = state.write_queue.pop_front() {
        let is_stream = key_inner.socket_kind == SocketKind::Stream;
        if is_stream {
            drop(state);

            let res = match send_op.to {
                Some(addr) => key::raw_sendto(key_inner.fd, &send_op.buf[send_op.sent..], send_op.flags, addr),
                None => key::raw_send(key_inner.fd, &send_op.buf[send_op.sent..], send_op.flags),
            };
            match res {
                Ok(n) => {
                    send_op.sent += n;
                    if send_op.sent >= send_op.buf.len() {
                        let _ = key::rearm(key_inner);
                        key::fire_write(
                            key_inner,
                            SendCompletion {
                                result: Ok(send_op.sent),
                                op: send_op,
                            },
                        );
                    } else {
                        let mut state = key_inner.state.lock();
                        state.write_queue.push_front(send_op);
                        drop(state);
                        let _ = key::rearm(key_inner);
                    }
                }
                Err(e) => {
                    let _ = key::rearm(key_inner);
                    key::fire_write(
                        key_inner,
                        SendCompletion {
                            result: Err(e),
                            op: send_op,
                        },
                    );
                }
            }
        } else {
            // Datagram sends dequeue before the syscall, allowing other
            // threads to send on the same key concurrently.
            drop(state);
            let res = match send_op.to {
                Some(addr) => key::raw_sendto(key_inner.fd, &send_op.buf[send_op.sent..], send_op.flags, addr),
                None => key::raw_send(key_inner.fd, &send_op.buf[send_op.sent..], send_op.flags),
            };
            let sent = res.as_ref().map(|n| send_op.sent + n).unwrap_or(send_op.sent);
            let _ = key::rearm(key_inner);
            key::fire_write(
                key_inner,
                SendCompletion {
                    result: res.map(|_| sent),
                    op: send_op,
                },
            );
        }
        return;
    }

    // Spurious wakeup.
}

fn dispatch_exception(key_inner: &Arc<KeyInner>) {
    let mut state = key_inner.state.lock();
    if !state.connecting {
        // Another thread already handled this connect's completion on
        // the writable path; nothing to do (the §4.5 exception-dispatch
        // race double-check).
        return;
    }
    state.connecting = false;
    drop(state);
    let _ = key::rearm(key_inner);
    // The backend reported an error condition on this fd while a connect
    // was outstanding; `connect_result` reads the authoritative outcome
    // back from the kernel rather than assuming failure (a spurious
    // exception event is possible on some backends).
    let result = key::connect_result(key_inner.fd);
    key::fire_connect(key_inner, ConnectCompletion { result });
}

use std::net::SocketAddr;
use std::os::unix::io::RawFd;

use crate::error::Error;

/// Outcome of a submission call: either the syscall completed inline on the
/// fast path, or the operation was enqueued and a callback will fire later.
///
/// Generic over the immediate payload so `recv`/`send` can report a byte
/// count (`Submit<usize>`), `accept` a new descriptor (`Submit<RawFd>`),
/// and `connect` nothing but success (`Submit<()>`), all through the same
/// shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submit<T> {
    /// The syscall ran inline; no callback will fire for this call.
    Immediate(T),
    /// The operation was enqueued; the matching callback fires later.
    Pending,
}

/// A queued `recv`/`recvfrom` request. `from_addr` distinguishes the two:
/// when `true` the dispatcher fills `addr` from `recvfrom`'s out-parameter
/// before invoking the callback.
#[derive(Debug)]
pub struct RecvOp {
    pub buf: Vec<u8>,
    pub flags: i32,
    pub from_addr: bool,
}

/// A queued `send`/`sendto` request. `to` distinguishes the two; `sent`
/// tracks bytes already written for a stream socket's partial sends.
#[derive(Debug)]
pub struct SendOp {
    pub buf: Vec<u8>,
    pub sent: usize,
    pub flags: i32,
    pub to: Option<SocketAddr>,
}

/// A queued `accept` request.
#[derive(Debug, Default)]
pub struct AcceptOp {
    pub want_local_addr: bool,
}

/// Delivered to `on_read_complete`. Carries the original `RecvOp` back
/// (with `buf` filled on success) plus the result and, for `recvfrom`,
/// the sender's address.
pub struct RecvCompletion {
    pub op: RecvOp,
    pub result: Result<usize, Error>,
    pub from: Option<SocketAddr>,
}

/// Delivered to `on_write_complete`.
pub struct SendCompletion {
    pub op: SendOp,
    pub result: Result<usize, Error>,
}

/// Delivered to `on_accept_complete`.
pub struct AcceptCompletion {
    pub op: AcceptOp,
    pub result: Result<RawFd, Error>,
    pub local_addr: Option<SocketAddr>,
    pub remote_addr: Option<SocketAddr>,
}

/// Delivered to `on_connect_complete`.
pub struct ConnectCompletion {
    pub result: Result<(), Error>,
}

pub type ReadCallback = Box<dyn FnMut(RecvCompletion) + Send>;
pub type WriteCallback = Box<dyn FnMut(SendCompletion) + Send>;
pub type AcceptCallback = Box<dyn FnMut(AcceptCompletion) + Send>;
pub type ConnectCallback = Box<dyn FnMut(ConnectCompletion) + Send>;

/// The four optional callback slots a key may be registered with.
#[derive(Default)]
pub struct Callbacks {
    pub on_read_complete: Option<ReadCallback>,
    pub on_write_complete: Option<WriteCallback>,
    pub on_accept_complete: Option<AcceptCallback>,
    pub on_connect_complete: Option<ConnectCallback>,
}

impl std::fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Callbacks")
            .field("on_read_complete", &self.on_read_complete.is_some())
            .field("on_write_complete", &self.on_write_complete.is_some())
            .field("on_accept_complete", &self.on_accept_complete.is_some())
            .field("on_connect_complete", &self.on_connect_complete.is_some())
            .finish()
    }
}

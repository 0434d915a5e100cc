//! `ioq`: a completion-style I/O queue built on top of a readiness-based
//! kernel mechanism (`select`, `epoll`, or `kqueue`).
//!
//! Callers register a raw file descriptor with [`IoQueue::register`] to
//! get a [`Key`], then submit `recv`/`send`/`accept`/`connect` operations
//! through the key. Each submission either completes inline on its fast
//! path (returning [`Submit::Immediate`]) or is enqueued and later
//! completed by a callback invoked from [`IoQueue::poll`] (returning
//! [`Submit::Pending`]). This mirrors the proactor-over-reactor adapter
//! used internally by PJSIP's media stack, reworked here as an
//! independent, self-contained crate.
//!
//! ```no_run
//! use ioq::{Config, IoQueue, Callbacks};
//!
//! let queue = IoQueue::new(Config::new(64))?;
//! # Ok::<(), ioq::Error>(())
//! ```

#![allow(dead_code)]

mod backend;
mod clock;
mod config;
mod dispatcher;
mod error;
mod group_lock;
mod key;
mod op;
mod queue;
mod registry;
mod sockaddr;

pub use config::{BackendChoice, Config};
pub use error::{Error, Result};
pub use group_lock::GroupLock;
pub use key::{Key, SocketKind};
pub use op::{
    AcceptCallback, AcceptCompletion, AcceptOp, Callbacks, ConnectCallback, ConnectCompletion,
    ReadCallback, RecvCompletion, RecvOp, SendCompletion, SendOp, Submit, WriteCallback,
};
pub use queue::IoQueue;

//! The public entry point: [`IoQueue`] ties the registry, the backend, and
//! the dispatcher into the `register`/`poll` surface described by spec.md
//! §2 and §4.6.
//!
//! Grounded on `ioqueue_common_abs.c`'s `pj_ioqueue_poll`: sweep the
//! closing list first, block in the backend for ready events, then
//! classify and dispatch each one, capped at `max_events_per_poll`.

use std::os::unix::io::RawFd;
use std::sync::atomic::Ordering;
use std::time::Duration;

use crate::backend::{self, Backend, RawEvent};
use crate::config::Config;
use crate::dispatcher;
use crate::error::Result;
use crate::group_lock::GroupLock;
use crate::key::Key;
use crate::op::Callbacks;
use crate::registry::Registry;

/// State shared by every [`Key`] and by [`IoQueue`] itself, held behind an
/// `Arc` so a `Key` can reach back into the registry and backend after the
/// `IoQueue` that created it has been cloned or moved.
pub(crate) struct QueueShared {
    pub(crate) backend: Box<dyn Backend>,
    pub(crate) registry: Registry,
    pub(crate) config: Config,
    /// The queue-wide default group lock installed via
    /// `IoQueue::set_default_lock`, plus its `auto_destroy` flag. Used by
    /// `register` calls that don't supply their own `GroupLock`.
    pub(crate) default_lock: parking_lot::Mutex<Option<(GroupLock, bool)>>,
}

/// A completion-style I/O queue over a readiness backend (`select`,
/// `epoll`, or `kqueue`).
///
/// Register file descriptors with [`IoQueue::register`] to get back a
/// [`Key`], submit operations through the key's `recv`/`send`/`accept`/
/// `connect` methods, and drive completions by calling [`IoQueue::poll`]
/// from one or more threads.
pub struct IoQueue {
    shared: std::sync::Arc<QueueShared>,
}

impl IoQueue {
    /// Build a queue, probing for a backend per `config.backend_choice`.
    pub fn new(config: Config) -> Result<IoQueue> {
        let back = backend::probe(&config)?;
        let registry = Registry::new(&config);
        Ok(IoQueue {
            shared: std::sync::Arc::new(QueueShared {
                backend: back,
                registry,
                config,
                default_lock: parking_lot::Mutex::new(None),
            }),
        })
    }

    /// Install a queue-wide default [`GroupLock`], used by [`register`]
    /// calls that don't supply their own. Mirrors the original
    /// `pj_ioqueue_set_default_lock`: replacing an existing default lock
    /// that was installed with `auto_destroy: true` `dec_ref`s it here.
    /// When `auto_destroy` is `true` for the lock installed last, the
    /// queue itself holds a reference to it and releases that reference
    /// (via `dec_ref`) when the queue is dropped.
    ///
    /// [`register`]: IoQueue::register
    pub fn set_default_lock(&self, lock: GroupLock, auto_destroy: bool) {
        lock.add_ref();
        let previous = self.shared.default_lock.lock().replace((lock, auto_destroy));
        if let Some((old_lock, true)) = previous {
            old_lock.dec_ref();
        }
    }

    /// The backend actually selected (`"epoll"`, `"kqueue"`, or
    /// `"select"`), mainly useful for logging and tests.
    pub fn backend_name(&self) -> &'static str {
        self.shared.backend.name()
    }

    /// Number of keys currently registered (not counting those in their
    /// unregister grace period).
    pub fn active_count(&self) -> usize {
        self.shared.registry.active_count()
    }

    /// Register `fd` (already owned by the caller — the queue takes
    /// ownership and will `close` it on unregister) with the given
    /// callbacks, optional user data, and optional [`GroupLock`].
    ///
    /// `group_lock: None` falls back to the queue's default lock, if one
    /// was installed with [`set_default_lock`](IoQueue::set_default_lock).
    pub fn register(
        &self,
        fd: RawFd,
        user_data: Box<dyn std::any::Any + Send>,
        callbacks: Callbacks,
        group_lock: Option<GroupLock>,
    ) -> Result<Key> {
        let group_lock = group_lock.or_else(|| {
            self.shared
                .default_lock
                .lock()
                .as_ref()
                .map(|(lock, _)| lock.clone())
        });
        self.shared
            .registry
            .register(fd, user_data, callbacks, group_lock, self.shared.clone())
    }

    /// Block for up to `timeout` (or indefinitely if `None`) and dispatch
    /// ready completions, returning how many were dispatched. Safe to call
    /// concurrently from multiple threads, matching the original
    /// ioqueue's ability to be polled from a thread pool.
    pub fn poll(&self, timeout: Option<Duration>) -> Result<usize> {
        self.shared.registry.sweep_closing();

        let cap = self.shared.config.max_events_per_poll;
        let mut events: Vec<RawEvent> = Vec::new();
        self.shared.backend.wait(timeout, &mut events)?;

        let mut dispatched = 0;
        for ev in events.iter().take(cap) {
            let key_inner = match self.shared.registry.lookup(ev.token) {
                Some(k) => k,
                None => continue,
            };

            // Claim a dispatch reference *before* checking `closing`: this
            // is what makes the check race-free against a concurrent
            // `unregister` (spec.md §4.6's `if closing(k): skip` step).
            // Either our increment lands before `unregister`'s close
            // decision reads `dispatch_refs`, in which case the close is
            // deferred until our `dec_dispatch_ref` below runs it; or
            // `unregister` has already closed the fd, in which case the
            // `closing` flag is already set and we back out without
            // touching it.
            key_inner.inc_dispatch_ref();
            if key_inner.closing.load(Ordering::Acquire) {
                key_inner.dec_dispatch_ref();
                continue;
            }
            let kind = dispatcher::classify(&key_inner, ev);
            if let Some(kind) = kind {
                dispatcher::dispatch(&key_inner, kind);
                dispatched += 1;
            }
            key_inner.dec_dispatch_ref();
        }

        Ok(dispatched)
    }
}

impl Drop for IoQueue {
    fn drop(&mut self) {
        let active = self.shared.registry.active_count();
        debug_assert_eq!(
            active, 0,
            "IoQueue dropped with {active} key(s) still registered; call unregister on every \
             Key before dropping the queue"
        );
        if active != 0 {
            log::warn!("ioq: queue dropped with {} key(s) still registered", active);
        }
        if let Some((lock, true)) = self.shared.default_lock.lock().take() {
            lock.dec_ref();
        }
    }
}

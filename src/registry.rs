//! Components H (deferred-free list) and I (registry): the bounded key
//! pool, registration/unregistration, and the grace-period reclaim sweep.
//!
//! Grounded on `ioqueue_epoll.c`'s `free_list`/`closing_list`/
//! `scan_closing_keys`/`ref_count`/`PJ_IOQUEUE_KEY_FREE_DELAY` (confirmed
//! by reading that file directly). The preallocated key array there
//! becomes a `slab::Slab` here: a freed slot is simply a vacant slab
//! entry, so no separate free-list bookkeeping is needed. What the slab
//! alone can't express is the grace window — a slot can't be handed to a
//! new registration merely because `unregister` ran; it must wait for the
//! close-to-dispatch race to drain, which `ClosingEntry`/`sweep_closing`
//! provide.

use std::os::unix::io::RawFd;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use slab::Slab;

use crate::backend::{Interest, Token};
use crate::clock::Deadline;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::group_lock::GroupLock;
use crate::key::{self, Key, KeyInner};
use crate::op::Callbacks;
use crate::queue::QueueShared;

struct ClosingEntry {
    key: Arc<KeyInner>,
    deadline: Deadline,
}

struct State {
    slab: Slab<Arc<KeyInner>>,
    active: usize,
    closing: Vec<ClosingEntry>,
}

pub(crate) struct Registry {
    capacity: usize,
    free_delay: Duration,
    safe_unregister: bool,
    state: Mutex<State>,
}

impl Registry {
    pub(crate) fn new(config: &Config) -> Registry {
        Registry {
            capacity: config.capacity,
            free_delay: config.free_delay,
            safe_unregister: config.safe_unregister,
            state: Mutex::new(State {
                slab: Slab::with_capacity(config.capacity),
                active: 0,
                closing: Vec::new(),
            }),
        }
    }

    pub(crate) fn active_count(&self) -> usize {
        self.state.lock().active
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn register(
        &self,
        fd: RawFd,
        user_data: Box<dyn std::any::Any + Send>,
        callbacks: Callbacks,
        group_lock: Option<GroupLock>,
        shared: Arc<QueueShared>,
    ) -> Result<Key> {
        self.sweep_closing();
        key::make_nonblocking(fd)?;
        let socket_kind = key::query_socket_kind(fd);

        let mut state = self.state.lock();
        if state.active >= self.capacity {
            return Err(Error::TooManyHandles);
        }

        let entry = state.slab.vacant_entry();
        let token = Token(entry.key());
        let new_key = Key::new(fd, token, socket_kind, user_data, callbacks, group_lock, shared.clone());

        // Keys always start armed for read-readiness only (spec.md §4.1):
        // level-triggered backends need an initial arming even with no op
        // queued yet, and read/accept share that direction.
        let interest = Interest {
            read: true,
            write: false,
            exception: false,
        };
        if let Err(e) = shared.backend.register(fd, token, interest) {
            // `entry` drops here without `insert`, leaving the slot vacant.
            return Err(e);
        }

        entry.insert(new_key.inner.clone());
        state.active += 1;
        log::debug!("ioq: registered fd {} as token {}", fd, token.0);
        Ok(new_key)
    }

    pub(crate) fn unregister(&self, key_inner: &Arc<KeyInner>, shared: &Arc<QueueShared>) -> Result<()> {
        if key_inner.closing.swap(true, Ordering::AcqRel) {
            // Idempotent: a second unregister on an already-closing key is
            // a no-op success, not an error (spec.md §4.1, §8).
            return Ok(());
        }

        // Deregistering from the backend happens immediately: this is what
        // stops new events for this key from being reported at all, and
        // combined with the poll loop's `closing` check it guarantees no
        // *new* dispatch starts after this point. The fd itself, though,
        // must stay open and valid as long as a dispatch that was already
        // in flight (captured its event before this unregister ran) is
        // still using it — see `key::close_fd_if_safe`.
        shared.backend.deregister(key_inner.fd)?;
        if let Some(gl) = &key_inner.group_lock {
            gl.dec_ref();
        }

        let mut state = self.state.lock();
        state.active = state.active.saturating_sub(1);

        if self.safe_unregister {
            // The queue always owns the fd it was given at registration
            // and closes it exactly once, regardless of how many `Key`
            // clones the caller still holds — but only once no dispatch is
            // still running against it (§8 scenario 4's unregister race).
            key::close_fd_if_safe(key_inner);
            state.closing.push(ClosingEntry {
                key: key_inner.clone(),
                deadline: Deadline::after(self.free_delay),
            });
        } else {
            // `safe_unregister` off: the caller has promised no callback is
            // in flight for this key, so close and reclaim immediately
            // without the closing-list grace period (spec.md §6).
            unsafe {
                libc::close(key_inner.fd);
            }
            state.slab.remove(key_inner.token.0);
        }

        log::debug!("ioq: unregistered fd {} (token {})", key_inner.fd, key_inner.token.0);
        Ok(())
    }

    /// Move keys whose grace period has elapsed and that no in-flight
    /// dispatch still references back into the free pool. Called on every
    /// idle `poll` iteration and before every registration (spec.md §4.1).
    pub(crate) fn sweep_closing(&self) {
        let mut state = self.state.lock();
        let mut i = 0;
        while i < state.closing.len() {
            let ready = state.closing[i].deadline.has_passed()
                && state.closing[i].key.dispatch_refs.load(Ordering::Acquire) == 0;
            if ready {
                let entry = state.closing.swap_remove(i);
                state.slab.remove(entry.key.token.0);
            } else {
                i += 1;
            }
        }
    }

    /// Look up the key for a token, for the poll loop's event-to-key
    /// mapping. Returns `None` if the key has already been fully reclaimed
    /// (should not happen for a token a backend just reported, but a
    /// defensive lookup costs nothing).
    pub(crate) fn lookup(&self, token: Token) -> Option<Arc<KeyInner>> {
        self.state.lock().slab.get(token.0).cloned()
    }

    pub(crate) fn has_closing(&self) -> bool {
        !self.state.lock().closing.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Backend;
    use std::time::Duration as StdDuration;

    struct NullBackend;
    impl Backend for NullBackend {
        fn register(&self, _fd: RawFd, _token: Token, _interest: Interest) -> Result<()> {
            Ok(())
        }
        fn reregister(&self, _fd: RawFd, _token: Token, _interest: Interest) -> Result<()> {
            Ok(())
        }
        fn deregister(&self, _fd: RawFd) -> Result<()> {
            Ok(())
        }
        fn wait(&self, _timeout: Option<StdDuration>, _events: &mut Vec<crate::backend::RawEvent>) -> Result<usize> {
            Ok(0)
        }
        fn name(&self) -> &'static str {
            "null"
        }
    }

    fn test_shared(capacity: usize) -> Arc<QueueShared> {
        let config = Config::new(capacity);
        Arc::new(QueueShared {
            backend: Box::new(NullBackend),
            registry: Registry::new(&config),
            config,
            default_lock: Mutex::new(None),
        })
    }

    #[test]
    fn capacity_is_enforced() {
        let shared = test_shared(1);
        let (a, _b) = nix_socketpair();
        let key = shared
            .registry
            .register(a, Box::new(()), Callbacks::default(), None, shared.clone())
            .unwrap();
        let (c, _d) = nix_socketpair();
        let err = shared
            .registry
            .register(c, Box::new(()), Callbacks::default(), None, shared.clone())
            .unwrap_err();
        assert!(matches!(err, Error::TooManyHandles));
        key.unregister().unwrap();
    }

    #[test]
    fn unregister_is_idempotent() {
        let shared = test_shared(4);
        let (a, _b) = nix_socketpair();
        let key = shared
            .registry
            .register(a, Box::new(()), Callbacks::default(), None, shared.clone())
            .unwrap();
        assert!(key.unregister().is_ok());
        assert!(key.unregister().is_ok());
    }

    #[test]
    fn sweep_reclaims_after_grace_once_refs_drop() {
        let mut config = Config::new(4);
        config.free_delay = StdDuration::from_millis(0);
        let shared = Arc::new(QueueShared {
            backend: Box::new(NullBackend),
            registry: Registry::new(&config),
            config,
            default_lock: Mutex::new(None),
        });
        let (a, _b) = nix_socketpair();
        let key = shared
            .registry
            .register(a, Box::new(()), Callbacks::default(), None, shared.clone())
            .unwrap();
        assert_eq!(shared.registry.active_count(), 1);
        key.unregister().unwrap();
        assert_eq!(shared.registry.active_count(), 0);
        assert!(shared.registry.has_closing());
        shared.registry.sweep_closing();
        assert!(!shared.registry.has_closing());
    }

    #[test]
    fn safe_unregister_off_reclaims_immediately_without_a_grace_period() {
        let mut config = Config::new(4).safe_unregister(false);
        config.free_delay = StdDuration::from_secs(60);
        let shared = Arc::new(QueueShared {
            backend: Box::new(NullBackend),
            registry: Registry::new(&config),
            config,
            default_lock: Mutex::new(None),
        });
        let (a, _b) = nix_socketpair();
        let key = shared
            .registry
            .register(a, Box::new(()), Callbacks::default(), None, shared.clone())
            .unwrap();
        key.unregister().unwrap();
        // No grace period: the slot is free again immediately, even though
        // `free_delay` is long, because `safe_unregister` is off.
        assert_eq!(shared.registry.active_count(), 0);
        assert!(!shared.registry.has_closing());
    }

    fn nix_socketpair() -> (RawFd, RawFd) {
        let mut fds = [0; 2];
        let rc = unsafe {
            libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr())
        };
        assert_eq!(rc, 0);
        (fds[0], fds[1])
    }
}

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, ReentrantMutex};

type Destructor = Box<dyn FnOnce() + Send>;

struct Inner {
    // Reentrant so a thread already holding the lock (e.g. inside one of
    // its own destructors) can `acquire` again without deadlocking itself.
    mutex: ReentrantMutex<()>,
    refcount: AtomicUsize,
    destructors: Mutex<Vec<Destructor>>,
}

/// A reentrant lock bundled with a reference count, used to tie an
/// external object's lifetime to the IOQ's in-flight references to it.
///
/// Registering a key with a `GroupLock` makes the queue `add_ref` it at
/// registration and around every dispatched callback, and `dec_ref` it on
/// unregistration and after each callback returns. When the count reaches
/// zero, every registered destructor fires once, in the reverse order it
/// was added (LIFO), matching the stack-unwind order a caller typically
/// expects for nested resources.
#[derive(Clone)]
pub struct GroupLock {
    inner: Arc<Inner>,
}

impl GroupLock {
    pub fn new() -> GroupLock {
        GroupLock {
            inner: Arc::new(Inner {
                mutex: ReentrantMutex::new(()),
                refcount: AtomicUsize::new(1),
                destructors: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Acquire the group's mutex. Reentrant: the same thread may call this
    /// again while already holding the guard without deadlocking.
    pub fn acquire(&self) -> impl Drop + '_ {
        self.inner.mutex.lock()
    }

    /// Increment the reference count.
    pub fn add_ref(&self) {
        self.inner.refcount.fetch_add(1, Ordering::AcqRel);
    }

    /// Decrement the reference count. If it reaches zero, every registered
    /// destructor runs immediately, in LIFO order, on the calling thread.
    pub fn dec_ref(&self) {
        if self.inner.refcount.fetch_sub(1, Ordering::AcqRel) == 1 {
            let mut destructors = self.inner.destructors.lock();
            while let Some(destructor) = destructors.pop() {
                destructor();
            }
        }
    }

    /// Register a cleanup callback, run when the refcount reaches zero.
    /// If the count has already reached zero, the destructor runs
    /// immediately instead of being queued.
    pub fn add_handler<F>(&self, destructor: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.inner.refcount.load(Ordering::Acquire) == 0 {
            destructor();
            return;
        }
        self.inner.destructors.lock().push(Box::new(destructor));
    }

    pub(crate) fn refcount(&self) -> usize {
        self.inner.refcount.load(Ordering::Acquire)
    }
}

impl Default for GroupLock {
    fn default() -> GroupLock {
        GroupLock::new()
    }
}

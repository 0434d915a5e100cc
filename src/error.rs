use std::io;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by [`IoQueue`](crate::IoQueue) and [`Key`](crate::Key)
/// operations.
///
/// This is not a 1:1 wrapper around [`io::Error`]: most of the variants here
/// correspond to conditions the queue itself detects (a full key pool, a key
/// mid-unregistration, an internal invariant violation) rather than errors
/// the kernel reports. Kernel-reported failures are carried in [`Error::Os`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An argument was invalid (bad buffer length, a negative fd, an
    /// unsupported socket type for the requested operation).
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// The queue's key pool is exhausted; `register` was called once too
    /// often for the `capacity` passed to [`Config`](crate::Config).
    #[error("too many registered handles (capacity exhausted)")]
    TooManyHandles,

    /// The key is being, or has already been, unregistered. Submission
    /// calls made against such a key fail with this variant instead of
    /// silently racing the reclaim.
    #[error("key is closing or has been unregistered")]
    Closing,

    /// An internal invariant was violated. Reaching this indicates a bug
    /// in the queue itself, not misuse by the caller.
    #[error("internal invariant violated: {0}")]
    Bug(&'static str),

    /// A syscall failed. The wrapped [`io::Error`] carries the `errno`.
    #[error("os error: {0}")]
    Os(#[from] io::Error),
}

impl Error {
    /// Shorthand for wrapping [`io::Error::last_os_error`].
    pub(crate) fn last_os_error() -> Error {
        Error::Os(io::Error::last_os_error())
    }

    /// True if this is the "would block" condition a fast-path syscall
    /// returns before the operation is enqueued. Not itself an error the
    /// queue surfaces to callers — see [`crate::op::Submit`].
    pub(crate) fn is_would_block(&self) -> bool {
        matches!(self, Error::Os(e) if e.kind() == io::ErrorKind::WouldBlock)
    }
}

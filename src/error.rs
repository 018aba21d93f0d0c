//! Error Taxonomy
//!
//! Three kinds of failure pass through the runtime:
//! - Operation failures: the kernel refused the request. These stay in-band
//!   as negative `-errno` results and are never turned into Rust errors.
//! - Usage failures: misuse of this layer's own API (`UsageError`).
//! - Transition failures: the privilege-boundary path itself is broken
//!   (`TransitionError`). These are fatal for the process.

/// Native error codes produced by the runtime itself.
///
/// Values are negative, matching the raw kernel return convention.
#[repr(i64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Errno {
    /// Bad file descriptor
    Ebadf = -(libc::EBADF as i64),
    /// Bad address (invalid pointer)
    Efault = -(libc::EFAULT as i64),
    /// Invalid argument
    Einval = -(libc::EINVAL as i64),
    /// Function not implemented
    Enosys = -(libc::ENOSYS as i64),
}

impl Errno {
    /// The positive `errno` value, as stored in the thread's `errno`.
    #[inline]
    pub const fn code(self) -> i32 {
        -(self as i64) as i32
    }

    /// Check whether a raw result encodes a failure.
    #[inline]
    pub const fn is_failure(result: i64) -> bool {
        // The kernel reserves [-4095, -1] for error returns.
        result < 0 && result >= -4095
    }
}

impl core::fmt::Display for Errno {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Ebadf => write!(f, "bad file descriptor"),
            Self::Efault => write!(f, "bad address"),
            Self::Einval => write!(f, "invalid argument"),
            Self::Enosys => write!(f, "function not implemented"),
        }
    }
}

/// Misuse of the runtime's own API.
///
/// Usage failures never touch the statistics register and never cross
/// the privilege boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageError {
    /// An output target was absent.
    NullOutput,
    /// The process runtime was already installed.
    AlreadyInitialized,
}

impl UsageError {
    /// Native code reported at the C ABI.
    #[inline]
    pub const fn errno(self) -> Errno {
        Errno::Einval
    }
}

impl core::fmt::Display for UsageError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::NullOutput => write!(f, "output target is null"),
            Self::AlreadyInitialized => write!(f, "runtime already initialized"),
        }
    }
}

impl std::error::Error for UsageError {}

/// Failure of the transition mechanism itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionError {
    /// The channel to the kernel is unavailable.
    Unavailable,
    /// The transport completed fewer requests than were submitted.
    Incomplete {
        /// Requests handed to the transport.
        submitted: usize,
        /// Requests the transport reported as completed.
        completed: usize,
    },
}

impl core::fmt::Display for TransitionError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Unavailable => write!(f, "privilege-boundary channel unavailable"),
            Self::Incomplete {
                submitted,
                completed,
            } => write!(
                f,
                "transport completed {} of {} submitted requests",
                completed, submitted
            ),
        }
    }
}

impl std::error::Error for TransitionError {}

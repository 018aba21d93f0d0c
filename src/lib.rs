//! xsc-rt - User-Space System Call Runtime
//!
//! Sits between application code and the kernel and decides, per request,
//! whether a privilege-boundary crossing is needed at all.
//!
//! # Request Path
//! - Cacheable reads (`getpid`, `fstat`, `pread64`, ...) are answered from
//!   a short-lived transition cache when an equivalent result is live
//! - Positional writes (`pwrite64`) to the same descriptor from concurrent
//!   threads are coalesced into one crossing (group commit)
//! - Everything else crosses alone, invalidating what it may have changed
//!
//! # Guarantees
//! - Results follow the native convention (`-errno` on failure)
//! - A thread always observes its own writes
//! - `total_syscalls == ring_transitions + cached_transitions` in every
//!   statistics snapshot
//! - A broken boundary aborts the process rather than returning a
//!   plausible-looking result
//!
//! # Process Runtime
//! The C ABI (`xsc_*`) uses a single process-wide `Runtime`, installed
//! with [`init`] or lazily from the environment on first use.

#![deny(unsafe_op_in_unsafe_fn)]

pub mod boundary;
pub mod cache;
pub mod config;
pub mod error;
pub mod request;
pub mod stats;
pub mod syscall;

pub use boundary::{Diagnostics, NativeTrap, Transport};
pub use config::RuntimeConfig;
pub use error::{Errno, TransitionError, UsageError};
pub use stats::XscStats;
pub use syscall::{MapFlags, OpenFlags, ProtFlags, Runtime};

use spin::Once;

static RUNTIME: Once<Runtime> = Once::new();

/// Install the process runtime over the native transport.
///
/// Fails if a runtime is already installed, including one installed
/// lazily by an earlier call through the C ABI.
pub fn init(config: RuntimeConfig) -> Result<&'static Runtime, UsageError> {
    install(Runtime::native(config))
}

/// Install an arbitrary runtime as the process runtime.
pub fn install(runtime: Runtime) -> Result<&'static Runtime, UsageError> {
    let mut installed = false;
    let current = RUNTIME.call_once(|| {
        installed = true;
        runtime
    });
    if installed {
        log::debug!(
            target: "xsc::config",
            "process runtime installed ({})",
            current.transport_name()
        );
        Ok(current)
    } else {
        Err(UsageError::AlreadyInitialized)
    }
}

/// The process runtime.
///
/// Installs a native runtime configured from the environment if none
/// has been installed yet.
pub fn runtime() -> &'static Runtime {
    RUNTIME.call_once(|| Runtime::native(RuntimeConfig::from_env()))
}

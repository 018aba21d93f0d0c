//! Dispatch Façade
//!
//! The public entry point tying the runtime together:
//!
//! ```text
//! caller -> dispatch -> CacheManager (resolve or forward)
//!                          -> [Submitter <-> kernel]
//!        <- result     <- StatsRegister updated
//! ```
//!
//! Results follow the native calling convention: non-negative on success,
//! `-errno` on failure.
//!
//! A request issued while the same thread is already dispatching, as from
//! a signal handler, skips the cache and coalescer and crosses alone. It
//! takes no lock, so it cannot wait on the code it interrupted.

use core::cell::Cell;

use crate::boundary::{Diagnostics, NativeTrap, Submitter, Transport};
use crate::cache::{CacheCounters, CacheManager};
use crate::config::RuntimeConfig;
use crate::error::UsageError;
use crate::request::{Args, Provenance, RequestDescriptor, Sysno};
use crate::stats::{StatsRegister, XscStats};

std::thread_local! {
    static DISPATCHING: Cell<bool> = const { Cell::new(false) };
}

/// Marks the current thread as dispatching until dropped.
struct Dispatching;

impl Dispatching {
    /// `None` when the thread is already dispatching.
    fn enter() -> Option<Self> {
        let nested = DISPATCHING.try_with(|flag| flag.replace(true)).unwrap_or(true);
        (!nested).then_some(Self)
    }
}

impl Drop for Dispatching {
    fn drop(&mut self) {
        let _ = DISPATCHING.try_with(|flag| flag.set(false));
    }
}

/// One runtime instance: statistics, cache/batch manager and submitter.
#[derive(Debug)]
pub struct Runtime {
    stats: StatsRegister,
    cache: CacheManager,
    submitter: Submitter,
}

impl Runtime {
    /// Build a runtime over an arbitrary transport.
    pub fn new(config: RuntimeConfig, transport: Box<dyn Transport>) -> Self {
        log::debug!(
            target: "xsc::dispatch",
            "runtime over {} (cache={}, ttl={:?}, max_batch={})",
            transport.name(),
            config.cache_enabled,
            config.cache_ttl,
            config.max_batch
        );
        Self {
            stats: StatsRegister::new(),
            cache: CacheManager::new(&config),
            submitter: Submitter::new(transport),
        }
    }

    /// Build a runtime over the native system-call instruction.
    pub fn native(config: RuntimeConfig) -> Self {
        Self::new(config, Box::new(NativeTrap::new()))
    }

    /// Issue one request.
    ///
    /// Blocks until the request is resolved, from the cache or across the
    /// boundary, and returns its native-convention result.
    ///
    /// Output buffers are handed to the kernel as given, so an unmapped
    /// one yields `-EFAULT` exactly as it would natively.
    ///
    /// # Safety
    /// Same contract as issuing the system call directly: every pointer
    /// argument must be valid for what `operation` does with it.
    pub unsafe fn dispatch(&self, operation: Sysno, args: Args) -> i64 {
        // SAFETY: forwarded from the caller.
        unsafe { self.dispatch_from(operation, args, Provenance::Raw) }
    }

    /// Issue one request whose pointer arguments have the given provenance.
    ///
    /// # Safety
    /// As `dispatch`. With `Provenance::Checked`, every output buffer must
    /// also be mapped and writable.
    pub(crate) unsafe fn dispatch_from(
        &self,
        operation: Sysno,
        args: Args,
        provenance: Provenance,
    ) -> i64 {
        let mut desc = RequestDescriptor::new(operation, args);
        let Some(_entered) = Dispatching::enter() else {
            self.cache.resolve_direct(&mut desc, &self.submitter);
            if let Some(outcome) = desc.outcome() {
                self.stats.record(outcome);
            }
            return desc.result;
        };
        self.cache.resolve(&mut desc, &self.submitter, provenance);

        if let Some(outcome) = desc.outcome() {
            self.stats.record(outcome);
        }
        log::trace!(
            target: "xsc::dispatch",
            "op {} -> {} ({:?})",
            operation,
            desc.result,
            desc.state
        );
        desc.result
    }

    /// Consistent snapshot of the statistics register.
    pub fn stats(&self) -> XscStats {
        self.stats.snapshot()
    }

    /// Copy a snapshot into `out`.
    ///
    /// Fails without touching the register when `out` is absent.
    pub fn copy_stats(&self, out: Option<&mut XscStats>) -> Result<(), UsageError> {
        let out = out.ok_or(UsageError::NullOutput)?;
        *out = self.stats.snapshot();
        Ok(())
    }

    /// Zero the statistics register.
    pub fn reset_stats(&self) {
        self.stats.reset();
    }

    /// Drop every cached result.
    pub fn flush_cache(&self) {
        self.cache.flush();
    }

    /// Boundary crossing counters.
    pub fn diagnostics(&self) -> Diagnostics {
        self.submitter.diagnostics()
    }

    /// Cache hit/miss counters.
    pub fn cache_counters(&self) -> CacheCounters {
        self.cache.counters()
    }

    /// Name of the transport underneath this runtime.
    pub fn transport_name(&self) -> &'static str {
        self.submitter.transport_name()
    }
}

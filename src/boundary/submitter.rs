//! Boundary Submitter
//!
//! The only component allowed to cross the privilege boundary.
//!
//! # Contract
//! - One transport crossing per submitted batch (batch size >= 1)
//! - Results are written back onto the descriptors in submission order
//! - A broken transition path aborts the process: every other path in
//!   the runtime depends on forwarding through it

use core::sync::atomic::{AtomicU64, Ordering};

use crate::error::TransitionError;
use crate::request::RequestDescriptor;

use super::Transport;

/// Counters describing how requests crossed the boundary.
///
/// These complement the ABI statistics; they are not part of `XscStats`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Diagnostics {
    /// Transport crossings performed.
    pub crossings: u64,
    /// Requests that shared a crossing with at least one other request.
    pub coalesced: u64,
    /// Largest batch submitted so far.
    pub largest_batch: u64,
}

/// Owns the transport and performs crossings.
pub struct Submitter {
    transport: Box<dyn Transport>,
    crossings: AtomicU64,
    coalesced: AtomicU64,
    largest_batch: AtomicU64,
}

impl Submitter {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self {
            transport,
            crossings: AtomicU64::new(0),
            coalesced: AtomicU64::new(0),
            largest_batch: AtomicU64::new(0),
        }
    }

    /// Name of the underlying transport.
    pub fn transport_name(&self) -> &'static str {
        self.transport.name()
    }

    /// Submit a batch and resolve every descriptor in it.
    ///
    /// Never returns on transition-path failure.
    pub fn submit(&self, batch: &mut [RequestDescriptor]) {
        if batch.is_empty() {
            return;
        }

        let submitted = batch.len();
        match self.transport.cross(batch) {
            Ok(completed) if completed == submitted => {}
            Ok(completed) => fatal(TransitionError::Incomplete {
                submitted,
                completed,
            }),
            Err(err) => fatal(err),
        }

        for desc in batch.iter_mut() {
            let result = desc.result;
            desc.resolve_transitioned(result);
        }

        self.crossings.fetch_add(1, Ordering::Relaxed);
        if submitted > 1 {
            self.coalesced.fetch_add(submitted as u64, Ordering::Relaxed);
        }
        self.largest_batch
            .fetch_max(submitted as u64, Ordering::Relaxed);
    }

    /// Submit a single request.
    #[inline]
    pub fn submit_one(&self, desc: &mut RequestDescriptor) {
        self.submit(core::slice::from_mut(desc));
    }

    /// Current crossing counters.
    pub fn diagnostics(&self) -> Diagnostics {
        Diagnostics {
            crossings: self.crossings.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            largest_batch: self.largest_batch.load(Ordering::Relaxed),
        }
    }
}

impl core::fmt::Debug for Submitter {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Submitter")
            .field("transport", &self.transport.name())
            .field("diagnostics", &self.diagnostics())
            .finish()
    }
}

/// Terminate on a broken transition path. There is no degraded mode.
#[cold]
fn fatal(err: TransitionError) -> ! {
    log::error!(target: "xsc::boundary", "transition path failed: {}", err);
    std::process::abort()
}

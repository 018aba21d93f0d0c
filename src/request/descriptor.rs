//! Request Descriptor
//!
//! The normalized form of one pending operating-system request.
//!
//! A descriptor is created inside `dispatch`, owned by the calling thread,
//! and dropped once its result has been copied out. It is never shared:
//! the coalescer works on copies and posts results back by ticket.

use crate::error::Errno;
use crate::stats::{Outcome, Path};

/// Number of word-sized argument slots.
pub const ARG_COUNT: usize = 6;

/// Operation identifier (the platform's syscall number).
pub type Sysno = i64;

/// Argument slots; unused trailing slots are zero.
pub type Args = [i64; ARG_COUNT];

/// Lifecycle state of a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    /// Not yet resolved.
    Pending,
    /// Answered from the transition cache.
    ResolvedCached,
    /// Answered by a boundary crossing.
    ResolvedTransitioned,
    /// Answered by a boundary crossing with a failure result.
    Failed,
}

/// Where a request's pointer arguments came from.
///
/// Only buffers backed by live Rust references are known to be mapped
/// and writable. Anything else may legitimately fault, and only the
/// kernel can turn that fault into `-EFAULT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provenance {
    /// Built from references by a safe wrapper.
    Checked,
    /// Passed through from a raw caller.
    Raw,
}

/// One pending request and its completion slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestDescriptor {
    /// Requested service.
    pub operation: Sysno,
    /// Arguments in call order.
    pub arguments: Args,
    /// Native-convention result; valid once the state is not `Pending`.
    pub result: i64,
    /// Lifecycle state.
    pub state: RequestState,
}

impl RequestDescriptor {
    /// Create a pending descriptor.
    #[inline]
    pub const fn new(operation: Sysno, arguments: Args) -> Self {
        Self {
            operation,
            arguments,
            result: 0,
            state: RequestState::Pending,
        }
    }

    /// Get one argument slot.
    #[inline]
    pub const fn arg(&self, index: usize) -> i64 {
        self.arguments[index]
    }

    /// Complete from the cache. Cached results are always successes.
    #[inline]
    pub fn resolve_cached(&mut self, result: i64) {
        self.result = result;
        self.state = RequestState::ResolvedCached;
    }

    /// Complete from a boundary crossing.
    #[inline]
    pub fn resolve_transitioned(&mut self, result: i64) {
        self.result = result;
        self.state = if Errno::is_failure(result) {
            RequestState::Failed
        } else {
            RequestState::ResolvedTransitioned
        };
    }

    /// Check whether a result has been stored.
    #[inline]
    pub const fn is_resolved(&self) -> bool {
        !matches!(self.state, RequestState::Pending)
    }

    /// Outcome to record, or `None` while still pending.
    pub fn outcome(&self) -> Option<Outcome> {
        let (path, failed) = match self.state {
            RequestState::Pending => return None,
            RequestState::ResolvedCached => (Path::Cached, false),
            RequestState::ResolvedTransitioned => (Path::Transitioned, false),
            RequestState::Failed => (Path::Transitioned, true),
        };
        Some(Outcome { path, failed })
    }
}

//! Statistics Register
//!
//! Process-wide request counters shared by every dispatching thread.
//!
//! # Consistency
//! The register is lock-free, so recording is safe from a signal handler
//! and never waits on a snapshot. Only the crossing and cache counters
//! are stored; `total_syscalls` is derived as their sum, which makes
//! `total == ring + cached` hold in every snapshot by construction.
//!
//! A failure is counted after its crossing, with release ordering, and
//! snapshots read the failure counter first with acquire ordering. Every
//! failure a snapshot sees therefore has its crossing in the snapshot too.
//! The one exception is a `record` straddling a `reset`, so the failure
//! count is clamped to the total.

use core::sync::atomic::{AtomicU64, Ordering};

/// ABI-exact statistics layout shared with C callers.
///
/// Field order and width are fixed: four 64-bit unsigned counters.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct XscStats {
    /// Total requests dispatched.
    pub total_syscalls: u64,
    /// Requests resolved by crossing the privilege boundary.
    pub ring_transitions: u64,
    /// Requests resolved without a crossing.
    pub cached_transitions: u64,
    /// Requests whose result encoded a failure.
    pub failed_syscalls: u64,
}

/// How a request was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Path {
    /// Served from the transition cache.
    Cached,
    /// Served by the boundary submitter.
    Transitioned,
}

/// Outcome of one completed request, as seen by the register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Outcome {
    /// Resolution path.
    pub path: Path,
    /// Whether the result encodes a failure.
    pub failed: bool,
}

/// Atomic request counters.
#[derive(Debug)]
pub struct StatsRegister {
    ring: AtomicU64,
    cached: AtomicU64,
    failed: AtomicU64,
}

impl StatsRegister {
    /// Create a zeroed register.
    pub const fn new() -> Self {
        Self {
            ring: AtomicU64::new(0),
            cached: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    /// Record one completed request.
    pub fn record(&self, outcome: Outcome) {
        match outcome.path {
            Path::Cached => self.cached.fetch_add(1, Ordering::Release),
            Path::Transitioned => self.ring.fetch_add(1, Ordering::Release),
        };
        if outcome.failed {
            self.failed.fetch_add(1, Ordering::Release);
        }
    }

    /// Consistent point-in-time copy of all counters.
    pub fn snapshot(&self) -> XscStats {
        let failed = self.failed.load(Ordering::Acquire);
        let ring = self.ring.load(Ordering::Acquire);
        let cached = self.cached.load(Ordering::Acquire);
        let total = ring + cached;
        XscStats {
            total_syscalls: total,
            ring_transitions: ring,
            cached_transitions: cached,
            failed_syscalls: failed.min(total),
        }
    }

    /// Zero all counters.
    pub fn reset(&self) {
        self.ring.store(0, Ordering::Release);
        self.cached.store(0, Ordering::Release);
        self.failed.store(0, Ordering::Release);
    }
}

impl Default for StatsRegister {
    fn default() -> Self {
        Self::new()
    }
}

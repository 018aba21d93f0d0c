//! Transition Cache Table
//!
//! Memoized results of cacheable reads, keyed by fingerprint.
//!
//! # Validity
//! - An entry older than the TTL is a miss and is evicted on sight
//! - Each domain carries an epoch and every entry remembers the epoch it
//!   was inserted under; an entry from an older epoch is a miss
//! - A read that crossed the boundary only inserts if no invalidation
//!   happened while it was in flight
//!
//! # Reentrancy
//! Invalidation is an epoch bump and never waits for the lock; purging
//! the dead entries is opportunistic. Issuing an operation that touches
//! a domain therefore never blocks, even from a signal handler that
//! interrupted a thread holding the lock.
//!
//! The lock is held across `HashMap` growth, which may allocate. The
//! allocator only issues operations classified as quiet (`mmap`, `brk`,
//! ...), and those never take this lock.

use core::sync::atomic::{AtomicU64, Ordering};
use core::time::Duration;
use std::collections::HashMap;
use std::time::Instant;

use spin::Mutex;

use crate::request::{Domain, Fingerprint};
use crate::syscall::validate;

struct Entry {
    result: i64,
    payload: Vec<u8>,
    inserted: Instant,
    /// Insertion order; breaks ties between equal timestamps.
    seq: u64,
    domain: Domain,
    epoch: u64,
}

#[derive(Default)]
struct Slots {
    map: HashMap<Fingerprint, Entry>,
    next_seq: u64,
}

impl Entry {
    #[inline]
    fn expired(&self, now: Instant, ttl: Duration) -> bool {
        now.saturating_duration_since(self.inserted) >= ttl
    }
}

/// Counters for cache behavior.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheCounters {
    pub hits: u64,
    pub misses: u64,
    pub inserts: u64,
    pub evictions: u64,
}

/// Fingerprint-keyed result cache.
pub struct CacheTable {
    entries: Mutex<Slots>,
    /// One epoch per domain bit.
    epochs: [AtomicU64; 2],
    ttl: Duration,
    capacity: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    inserts: AtomicU64,
    evictions: AtomicU64,
}

#[inline]
fn epoch_slot(domain: Domain) -> usize {
    if domain.contains(Domain::IDENTITY) {
        1
    } else {
        0
    }
}

impl CacheTable {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            entries: Mutex::new(Slots::default()),
            epochs: [AtomicU64::new(0), AtomicU64::new(0)],
            ttl,
            capacity,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            inserts: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Current epoch of a domain.
    #[inline]
    pub fn epoch(&self, domain: Domain) -> u64 {
        self.epochs[epoch_slot(domain)].load(Ordering::Acquire)
    }

    #[inline]
    fn live(&self, entry: &Entry, now: Instant) -> bool {
        !entry.expired(now, self.ttl) && entry.epoch == self.epoch(entry.domain)
    }

    /// Look up a live entry and reproduce its payload at `out`.
    ///
    /// Returns `None` on a miss, on an expired or invalidated entry, or
    /// when `out` cannot hold the payload. The payload is copied while the
    /// lock is held so no allocation happens on the hit path.
    ///
    /// `out` must be known to be mapped and writable; only null and
    /// overflowing ranges are caught here.
    pub fn lookup(&self, fp: &Fingerprint, out: Option<i64>) -> Option<i64> {
        let now = Instant::now();
        let mut entries = self.entries.lock();

        let live = match entries.map.get(fp) {
            None => {
                drop(entries);
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
            Some(entry) => self.live(entry, now),
        };
        if !live {
            let stale = entries.map.remove(fp);
            drop(entries);
            drop(stale);
            self.evictions.fetch_add(1, Ordering::Relaxed);
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        let entry = entries.map.get(fp)?;
        if let Some(ptr) = out {
            let Ok(mut dst) = validate::validate_user_write(ptr, entry.payload.len()) else {
                drop(entries);
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            };
            // SAFETY: the caller handed this buffer to the runtime for the
            // operation's output, exactly as it would hand it to the kernel.
            unsafe { dst.as_bytes_mut().copy_from_slice(&entry.payload) };
        }
        let result = entry.result;
        drop(entries);

        self.hits.fetch_add(1, Ordering::Relaxed);
        Some(result)
    }

    /// Insert a result observed under `epoch`.
    ///
    /// Dropped if the domain was invalidated since `epoch` was read.
    pub fn insert(
        &self,
        fp: Fingerprint,
        domain: Domain,
        result: i64,
        payload: Vec<u8>,
        epoch: u64,
    ) -> bool {
        if self.capacity == 0 {
            return false;
        }

        let now = Instant::now();
        let mut slots = self.entries.lock();
        if self.epochs[epoch_slot(domain)].load(Ordering::Acquire) != epoch {
            drop(slots);
            log::debug!(
                target: "xsc::cache",
                "discarding stale insert for op {}",
                fp.operation
            );
            return false;
        }

        let mut evicted = 0;
        if slots.map.len() >= self.capacity && !slots.map.contains_key(&fp) {
            let before = slots.map.len();
            slots.map.retain(|_, e| self.live(e, now));
            evicted += before - slots.map.len();

            if slots.map.len() >= self.capacity {
                let oldest = slots
                    .map
                    .iter()
                    .min_by_key(|(_, e)| (e.inserted, e.seq))
                    .map(|(k, _)| *k);
                if let Some(key) = oldest {
                    slots.map.remove(&key);
                    evicted += 1;
                }
            }
        }
        let seq = slots.next_seq;
        slots.next_seq += 1;
        slots.map.insert(
            fp,
            Entry {
                result,
                payload,
                inserted: now,
                seq,
                domain,
                epoch,
            },
        );
        drop(slots);

        self.inserts.fetch_add(1, Ordering::Relaxed);
        if evicted > 0 {
            self.evictions.fetch_add(evicted as u64, Ordering::Relaxed);
            log::debug!(target: "xsc::cache", "evicted {} entries to make room", evicted);
        }
        true
    }

    /// Advance the epochs of `domains`, killing every entry in them.
    ///
    /// The dead entries are purged now if the lock is free and otherwise
    /// left for lookups and inserts to drop.
    pub fn invalidate(&self, domains: Domain) {
        if domains.is_empty() {
            return;
        }
        for domain in domains.iter() {
            self.epochs[epoch_slot(domain)].fetch_add(1, Ordering::AcqRel);
        }

        let Some(mut entries) = self.entries.try_lock() else {
            return;
        };
        let before = entries.map.len();
        entries.map.retain(|_, e| !domains.intersects(e.domain));
        let evicted = before - entries.map.len();
        drop(entries);

        if evicted > 0 {
            self.evictions.fetch_add(evicted as u64, Ordering::Relaxed);
            log::debug!(target: "xsc::cache", "invalidated {} entries ({:?})", evicted, domains);
        }
    }

    /// Start over with an empty table in the child of a fork.
    ///
    /// The old map is leaked rather than dropped: a thread that no longer
    /// exists may have been halfway through changing it.
    ///
    /// # Safety
    /// Only the calling thread may be running, as in a freshly forked child.
    pub unsafe fn reset_after_fork(&self) {
        // SAFETY: no other thread exists to own the lock.
        unsafe { self.entries.force_unlock() };
        let mut slots = self.entries.lock();
        core::mem::forget(core::mem::take(&mut *slots));
        drop(slots);
        for epoch in &self.epochs {
            epoch.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// Leave the lock held, as by a thread that vanished in a fork.
    #[cfg(test)]
    pub(super) fn orphan_lock(&self) {
        core::mem::forget(self.entries.lock());
    }

    /// Number of entries currently held, live or expired.
    pub fn len(&self) -> usize {
        self.entries.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn counters(&self) -> CacheCounters {
        CacheCounters {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            inserts: self.inserts.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

impl core::fmt::Debug for CacheTable {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CacheTable")
            .field("ttl", &self.ttl)
            .field("capacity", &self.capacity)
            .field("counters", &self.counters())
            .finish()
    }
}

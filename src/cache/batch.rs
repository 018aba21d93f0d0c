//! Write Coalescer
//!
//! Group commit for coalescible writes, one queue per descriptor.
//!
//! # Protocol
//! - Every write takes a ticket and joins its descriptor's FIFO queue
//! - With no flush in progress on that descriptor, the arriving writer
//!   becomes leader and flushes at once; alone, that is a batch of one
//! - Writers arriving during a flush park; the next leader takes the
//!   longest compatible queue prefix, up to `max_batch`
//! - Results are posted by ticket and copied out by their owners
//!
//! Batches are always queue prefixes, so completion on a descriptor
//! follows ticket order and writes are never reordered. A flush that
//! blocks in the kernel only holds up writers and readers of its own
//! descriptor.

use core::time::Duration;
use std::collections::{HashMap, VecDeque};
use std::thread::{self, Thread};
use std::time::Instant;

use spin::Mutex;

use crate::boundary::Submitter;
use crate::request::{RequestDescriptor, WriteTarget};

/// A queued write. Holds a copy; the caller keeps its own descriptor.
#[derive(Debug, Clone)]
struct Pending {
    ticket: u64,
    desc: RequestDescriptor,
    target: Option<WriteTarget>,
    waiter: Thread,
}

/// Queue and flush state of one descriptor.
#[derive(Debug, Default)]
struct Shard {
    queue: VecDeque<Pending>,
    results: HashMap<u64, i64>,
    /// Lowest ticket of the batch currently crossing.
    in_flight: Option<u64>,
    leading: bool,
    /// Readers waiting for the queue to drain.
    settlers: Vec<Thread>,
}

impl Shard {
    /// Take the longest compatible prefix of the queue.
    fn take_batch(&mut self, max: usize) -> Vec<Pending> {
        let mut batch: Vec<Pending> = Vec::new();
        while batch.len() < max {
            let Some(next) = self.queue.front() else {
                break;
            };
            let fits = batch.iter().all(|p| compatible(p.target, next.target));
            if !fits {
                break;
            }
            if let Some(pending) = self.queue.pop_front() {
                batch.push(pending);
            }
        }
        batch
    }

    /// Whether every ticket below `horizon` has completed.
    fn settled(&self, horizon: u64) -> bool {
        self.in_flight.map_or(true, |t| t >= horizon)
            && self.queue.front().map_or(true, |p| p.ticket >= horizon)
    }

    fn idle(&self) -> bool {
        self.queue.is_empty()
            && self.results.is_empty()
            && !self.leading
            && self.settlers.is_empty()
    }
}

#[derive(Debug, Default)]
struct State {
    shards: HashMap<i64, Shard>,
    next_ticket: u64,
}

fn compatible(a: Option<WriteTarget>, b: Option<WriteTarget>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a.compatible(&b),
        _ => false,
    }
}

/// Coalescing queues for one classification bucket, keyed by descriptor.
#[derive(Debug)]
pub struct Coalescer {
    state: Mutex<State>,
    max_batch: usize,
    window: Duration,
}

impl Coalescer {
    pub fn new(max_batch: usize, window: Duration) -> Self {
        Self {
            state: Mutex::new(State::default()),
            max_batch: max_batch.max(1),
            window,
        }
    }

    /// Submit a write and block until its batch has crossed.
    pub fn submit(
        &self,
        desc: &mut RequestDescriptor,
        target: Option<WriteTarget>,
        submitter: &Submitter,
    ) {
        let fd = desc.arg(0);
        let waiter = thread::current();
        let ticket = {
            let mut state = self.state.lock();
            let ticket = state.next_ticket;
            state.next_ticket += 1;
            state.shards.entry(fd).or_default().queue.push_back(Pending {
                ticket,
                desc: *desc,
                target,
                waiter,
            });
            ticket
        };

        loop {
            let lead = {
                let mut state = self.state.lock();
                let shard = state.shards.entry(fd).or_default();
                if let Some(result) = shard.results.remove(&ticket) {
                    if shard.idle() {
                        state.shards.remove(&fd);
                    }
                    drop(state);
                    desc.resolve_transitioned(result);
                    return;
                }
                !core::mem::replace(&mut shard.leading, true)
            };

            if lead {
                self.lead(fd, submitter);
            } else {
                thread::park();
            }
        }
    }

    /// Wait until every write to `fd` queued before this call has completed.
    ///
    /// With no leader active the caller flushes the queue itself, so a read
    /// never waits on a write nobody is going to submit.
    pub fn settle(&self, fd: i64, submitter: &Submitter) {
        let horizon = {
            let state = self.state.lock();
            let horizon = state.next_ticket;
            let busy = state.shards.get(&fd).map_or(false, |s| !s.settled(horizon));
            if !busy {
                return;
            }
            horizon
        };
        let waiter = thread::current();

        loop {
            let lead = {
                let mut state = self.state.lock();
                let Some(shard) = state.shards.get_mut(&fd) else {
                    return;
                };
                if shard.settled(horizon) {
                    return;
                }
                if shard.leading {
                    shard.settlers.push(waiter.clone());
                    false
                } else {
                    shard.leading = true;
                    true
                }
            };

            if lead {
                self.lead(fd, submitter);
            } else {
                thread::park();
            }
        }
    }

    /// Writes queued but not yet submitted, across all descriptors.
    pub fn pending(&self) -> usize {
        self.state.lock().shards.values().map(|s| s.queue.len()).sum()
    }

    /// Drop every queue in the child of a fork.
    ///
    /// Queued writes belong to threads that do not exist in the child.
    /// The old state is leaked rather than dropped.
    ///
    /// # Safety
    /// Only the calling thread may be running, as in a freshly forked child.
    pub unsafe fn reset_after_fork(&self) {
        // SAFETY: no other thread exists to own the lock.
        unsafe { self.state.force_unlock() };
        let mut state = self.state.lock();
        core::mem::forget(core::mem::take(&mut state.shards));
    }

    /// Leave the lock held, as by a thread that vanished in a fork.
    #[cfg(test)]
    pub(super) fn orphan_lock(&self) {
        core::mem::forget(self.state.lock());
    }

    /// Flush one batch for `fd`. The caller must have set `leading`.
    fn lead(&self, fd: i64, submitter: &Submitter) {
        self.linger(fd);

        let batch = {
            let mut state = self.state.lock();
            let shard = state.shards.entry(fd).or_default();
            let batch = shard.take_batch(self.max_batch);
            shard.in_flight = batch.first().map(|p| p.ticket);
            batch
        };

        let mut descs: Vec<RequestDescriptor> = batch.iter().map(|p| p.desc).collect();
        if !descs.is_empty() {
            submitter.submit(&mut descs);
        }

        let wake = {
            let mut state = self.state.lock();
            let shard = state.shards.entry(fd).or_default();
            for (pending, desc) in batch.iter().zip(&descs) {
                shard.results.insert(pending.ticket, desc.result);
            }
            shard.in_flight = None;
            shard.leading = false;

            let mut wake: Vec<Thread> = batch.into_iter().map(|p| p.waiter).collect();
            wake.extend(shard.queue.front().map(|p| p.waiter.clone()));
            wake.append(&mut shard.settlers);
            if shard.idle() {
                state.shards.remove(&fd);
            }
            wake
        };
        for waiter in wake {
            waiter.unpark();
        }

        if descs.len() > 1 {
            log::debug!(
                target: "xsc::batch",
                "coalesced {} writes on fd {} into one crossing",
                descs.len(),
                fd
            );
        }
    }

    /// Wait up to the coalescing window for the batch to fill, but only
    /// when other writers are already queued behind the leader.
    fn linger(&self, fd: i64) {
        if self.window.is_zero() {
            return;
        }
        let deadline = Instant::now() + self.window;
        loop {
            let queued = self.state.lock().shards.get(&fd).map_or(0, |s| s.queue.len());
            if queued <= 1 || queued >= self.max_batch || Instant::now() >= deadline {
                return;
            }
            core::hint::spin_loop();
        }
    }
}

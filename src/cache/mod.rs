//! Transition Cache/Batch Manager
//!
//! Decides, per request, whether it can be answered without crossing the
//! privilege boundary, and if not, how it crosses.
//!
//! # Resolution
//! - `NeverCacheable`: forwarded alone, immediately
//! - `CacheableRead`: served from a live entry when one exists; otherwise
//!   forwarded and, on success, remembered for the validity window
//! - `CoalescibleWrite`: handed to the coalescer
//!
//! Every operation with an `invalidates` set evicts those domains both
//! before it is submitted and after it completes.
//!
//! A read whose output buffer came from a raw caller is never answered
//! from the cache. The buffer may be unmapped or read-only, and only the
//! kernel reports that as `-EFAULT` instead of faulting.
//!
//! # Ordering
//! A file-data read first settles every write queued ahead of it on the
//! same descriptor, so it never observes a value older than a write
//! issued before it.
//!
//! # Fork
//! In the child of a `fork` (or a `clone` without `CLONE_VM`) only the
//! forking thread survives. Locks held by any other thread are reset
//! there and the cache starts empty.

mod batch;
mod table;

pub use batch::Coalescer;
pub use table::{CacheCounters, CacheTable};

use crate::boundary::Submitter;
use crate::config::RuntimeConfig;
use crate::request::{
    Domain, OpClass, Payload, PayloadLen, Policy, PolicyTable, Provenance, RequestDescriptor,
    RequestState,
};
use crate::syscall::validate;

/// Resolve-or-forward engine.
#[derive(Debug)]
pub struct CacheManager {
    policy: PolicyTable,
    table: CacheTable,
    coalescer: Coalescer,
    enabled: bool,
    max_payload: usize,
}

impl CacheManager {
    pub fn new(config: &RuntimeConfig) -> Self {
        Self {
            policy: config.policy.clone(),
            table: CacheTable::new(config.cache_ttl, config.cache_capacity),
            coalescer: Coalescer::new(config.max_batch, config.coalesce_window),
            enabled: config.cache_enabled,
            max_payload: config.max_payload,
        }
    }

    /// Resolve one request, crossing through `submitter` when needed.
    pub fn resolve(
        &self,
        desc: &mut RequestDescriptor,
        submitter: &Submitter,
        provenance: Provenance,
    ) {
        let policy = *self.policy.lookup(desc.operation);
        match policy.class {
            OpClass::NeverCacheable => {
                self.table.invalidate(policy.invalidates);
                submitter.submit_one(desc);
                if forked_child(desc) {
                    // SAFETY: this is the only thread in the new process.
                    unsafe { self.reset_after_fork() };
                }
                self.table.invalidate(policy.invalidates);
            }
            OpClass::CacheableRead => self.resolve_read(desc, &policy, submitter, provenance),
            OpClass::CoalescibleWrite => {
                let target = policy.write_target(desc);
                self.table.invalidate(policy.invalidates);
                self.coalescer.submit(desc, target, submitter);
                self.table.invalidate(policy.invalidates);
            }
        }
    }

    /// Resolve a request issued while this thread is already inside the
    /// runtime, as from a signal handler.
    ///
    /// Forwards alone without taking any lock; invalidation still applies.
    pub fn resolve_direct(&self, desc: &mut RequestDescriptor, submitter: &Submitter) {
        let invalidates = self.policy.lookup(desc.operation).invalidates;
        self.table.invalidate(invalidates);
        submitter.submit_one(desc);
        self.table.invalidate(invalidates);
    }

    fn resolve_read(
        &self,
        desc: &mut RequestDescriptor,
        policy: &Policy,
        submitter: &Submitter,
        provenance: Provenance,
    ) {
        if policy.domain.contains(Domain::FILE_DATA) {
            self.coalescer.settle(desc.arg(0), submitter);
        }
        let out = match policy.payload {
            Payload::None => None,
            Payload::Buffer { arg, .. } => Some(desc.arg(arg)),
        };
        if !self.enabled || (out.is_some() && provenance == Provenance::Raw) {
            submitter.submit_one(desc);
            return;
        }

        let fp = policy.fingerprint(desc);
        if let Some(result) = self.table.lookup(&fp, out) {
            desc.resolve_cached(result);
            return;
        }

        let epoch = self.table.epoch(policy.domain);
        submitter.submit_one(desc);
        if desc.state != RequestState::ResolvedTransitioned {
            return;
        }

        if let Some(payload) = self.capture(desc, policy) {
            self.table.insert(fp, policy.domain, desc.result, payload, epoch);
        }
    }

    /// # Safety
    /// Only the calling thread may be running.
    unsafe fn reset_after_fork(&self) {
        // SAFETY: forwarded from the caller.
        unsafe {
            self.table.reset_after_fork();
            self.coalescer.reset_after_fork();
        }
    }

    /// Copy the output a successful read produced, if it is small enough
    /// to keep.
    fn capture(&self, desc: &RequestDescriptor, policy: &Policy) -> Option<Vec<u8>> {
        let (arg, len) = match policy.payload {
            Payload::None => return Some(Vec::new()),
            Payload::Buffer { arg, len } => (arg, len),
        };
        let len = match len {
            PayloadLen::FromResult => usize::try_from(desc.result).ok()?,
            PayloadLen::Fixed(n) => n,
        };
        if len > self.max_payload {
            return None;
        }
        let src = validate::validate_user_read(desc.arg(arg), len).ok()?;
        // SAFETY: the kernel just filled this buffer for the caller, who
        // still owns it for the duration of the call.
        Some(unsafe { src.as_bytes() }.to_vec())
    }

    /// Drop every cached entry.
    pub fn flush(&self) {
        self.table.invalidate(Domain::all());
    }

    pub fn counters(&self) -> CacheCounters {
        self.table.counters()
    }

    pub fn cached_entries(&self) -> usize {
        self.table.len()
    }
}

/// Whether `desc` just returned in the child of a process fork.
fn forked_child(desc: &RequestDescriptor) -> bool {
    if desc.state != RequestState::ResolvedTransitioned || desc.result != 0 {
        return false;
    }
    let flags = match desc.operation {
        #[cfg(target_arch = "x86_64")]
        libc::SYS_fork => return true,
        libc::SYS_clone => desc.arg(0) as u64,
        libc::SYS_clone3 => {
            let len = core::mem::size_of::<u64>();
            if (desc.arg(1) as usize) < len {
                return false;
            }
            let Ok(args) = validate::validate_user_read(desc.arg(0), len) else {
                return false;
            };
            // SAFETY: the kernel just read `clone_args` from here; `flags`
            // is its first field.
            let bytes = unsafe { args.as_bytes() };
            let Ok(raw) = <[u8; 8]>::try_from(bytes) else {
                return false;
            };
            u64::from_ne_bytes(raw)
        }
        _ => return false,
    };
    (flags & libc::CLONE_VM as u64) == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boundary::testing::FakeKernel;
    use core::sync::atomic::{AtomicUsize, Ordering};
    use core::time::Duration;
    use std::sync::Arc;
    use std::thread;

    fn setup(config: RuntimeConfig) -> (CacheManager, Submitter, FakeKernel) {
        let config = config.with_cache_ttl(Duration::from_secs(60));
        let kernel = FakeKernel::new();
        let submitter = Submitter::new(Box::new(kernel.clone()));
        (CacheManager::new(&config), submitter, kernel)
    }

    fn run(
        manager: &CacheManager,
        submitter: &Submitter,
        op: i64,
        args: [i64; 6],
    ) -> RequestDescriptor {
        let mut desc = RequestDescriptor::new(op, args);
        manager.resolve(&mut desc, submitter, Provenance::Checked);
        desc
    }

    fn open(manager: &CacheManager, submitter: &Submitter, path: &std::ffi::CStr) -> i64 {
        let flags = libc::O_CREAT as i64;
        let args = [libc::AT_FDCWD as i64, path.as_ptr() as i64, flags, 0o644, 0, 0];
        run(manager, submitter, libc::SYS_openat, args).result
    }

    fn pread(manager: &CacheManager, submitter: &Submitter, fd: i64, buf: &mut [u8]) -> i64 {
        let args = [fd, buf.as_mut_ptr() as i64, buf.len() as i64, 0, 0, 0];
        run(manager, submitter, libc::SYS_pread64, args).result
    }

    #[test]
    fn test_identity_read_cached() {
        let (manager, submitter, kernel) = setup(RuntimeConfig::default());
        let first = run(&manager, &submitter, libc::SYS_getpid, [0; 6]);
        let second = run(&manager, &submitter, libc::SYS_getpid, [0; 6]);

        assert_eq!(first.state, RequestState::ResolvedTransitioned);
        assert_eq!(second.state, RequestState::ResolvedCached);
        assert_eq!(second.result, FakeKernel::PID);
        assert_eq!(kernel.crossings(), 1);
    }

    #[test]
    fn test_disabled_cache_always_crosses() {
        let (manager, submitter, kernel) = setup(RuntimeConfig::default().with_cache(false));
        run(&manager, &submitter, libc::SYS_getpid, [0; 6]);
        let second = run(&manager, &submitter, libc::SYS_getpid, [0; 6]);
        assert_eq!(second.state, RequestState::ResolvedTransitioned);
        assert_eq!(kernel.crossings(), 2);
    }

    #[test]
    fn test_pread_hit_fills_new_buffer() {
        let (manager, submitter, kernel) = setup(RuntimeConfig::default());
        let fd = open(&manager, &submitter, c"/data");
        let data = *b"abcdef";
        run(&manager, &submitter, libc::SYS_write, [fd, data.as_ptr() as i64, 6, 0, 0, 0]);

        let mut a = [0u8; 4];
        let mut b = [0u8; 4];
        let first = run(
            &manager,
            &submitter,
            libc::SYS_pread64,
            [fd, a.as_mut_ptr() as i64, 4, 1, 0, 0],
        );
        let crossings = kernel.crossings();
        let second = run(
            &manager,
            &submitter,
            libc::SYS_pread64,
            [fd, b.as_mut_ptr() as i64, 4, 1, 0, 0],
        );

        assert_eq!(first.result, 4);
        assert_eq!(second.state, RequestState::ResolvedCached);
        assert_eq!(kernel.crossings(), crossings);
        assert_eq!(&a, b"bcde");
        assert_eq!(&b, b"bcde");
    }

    #[test]
    fn test_write_through_alias_invalidates() {
        let (manager, submitter, _kernel) = setup(RuntimeConfig::default());
        let fd = open(&manager, &submitter, c"/alias");
        let alias = run(&manager, &submitter, libc::SYS_dup, [fd, 0, 0, 0, 0, 0]).result;

        let old = *b"old!";
        run(&manager, &submitter, libc::SYS_pwrite64, [fd, old.as_ptr() as i64, 4, 0, 0, 0]);
        let mut buf = [0u8; 4];
        run(&manager, &submitter, libc::SYS_pread64, [fd, buf.as_mut_ptr() as i64, 4, 0, 0, 0]);
        assert_eq!(&buf, b"old!");

        let new = *b"new!";
        run(&manager, &submitter, libc::SYS_pwrite64, [alias, new.as_ptr() as i64, 4, 0, 0, 0]);
        let args = [fd, buf.as_mut_ptr() as i64, 4, 0, 0, 0];
        let again = run(&manager, &submitter, libc::SYS_pread64, args);
        assert_eq!(again.state, RequestState::ResolvedTransitioned);
        assert_eq!(&buf, b"new!");
    }

    #[test]
    fn test_failures_not_cached() {
        let (manager, submitter, kernel) = setup(RuntimeConfig::default());
        let mut buf = [0u8; 8];
        for _ in 0..2 {
            let args = [55, buf.as_mut_ptr() as i64, 8, 0, 0, 0];
            let desc = run(&manager, &submitter, libc::SYS_pread64, args);
            assert_eq!(desc.state, RequestState::Failed);
        }
        assert_eq!(kernel.crossings(), 2);
        assert_eq!(manager.cached_entries(), 0);
    }

    #[test]
    fn test_oversized_payload_not_cached() {
        let mut config = RuntimeConfig::default();
        config.max_payload = 2;
        let (manager, submitter, _kernel) = setup(config);
        let fd = open(&manager, &submitter, c"/big");
        let data = *b"xyz";
        run(&manager, &submitter, libc::SYS_write, [fd, data.as_ptr() as i64, 3, 0, 0, 0]);

        let mut buf = [0u8; 3];
        run(&manager, &submitter, libc::SYS_pread64, [fd, buf.as_mut_ptr() as i64, 3, 0, 0, 0]);
        assert_eq!(manager.cached_entries(), 0);
    }

    #[test]
    fn test_unknown_operation_flushes_everything() {
        let (manager, submitter, _kernel) = setup(RuntimeConfig::default());
        run(&manager, &submitter, libc::SYS_getpid, [0; 6]);
        assert_eq!(manager.cached_entries(), 1);

        run(&manager, &submitter, libc::SYS_execve, [0; 6]);
        assert_eq!(manager.cached_entries(), 0);
    }

    #[test]
    fn test_raw_output_buffer_bypasses_cache() {
        let (manager, submitter, kernel) = setup(RuntimeConfig::default());
        let fd = open(&manager, &submitter, c"/raw");
        let data = *b"abcd";
        run(&manager, &submitter, libc::SYS_pwrite64, [fd, data.as_ptr() as i64, 4, 0, 0, 0]);
        let mut buf = [0u8; 4];
        assert_eq!(pread(&manager, &submitter, fd, &mut buf), 4);
        assert_eq!(manager.cached_entries(), 1);

        let crossings = kernel.crossings();
        let mut raw = [0u8; 4];
        let args = [fd, raw.as_mut_ptr() as i64, 4, 0, 0, 0];
        let mut desc = RequestDescriptor::new(libc::SYS_pread64, args);
        manager.resolve(&mut desc, &submitter, Provenance::Raw);
        assert_eq!(desc.state, RequestState::ResolvedTransitioned);
        assert_eq!(kernel.crossings(), crossings + 1);
        assert_eq!(&raw, b"abcd");

        // Nothing to copy out, so the cache still answers.
        for expected in [RequestState::ResolvedTransitioned, RequestState::ResolvedCached] {
            let mut desc = RequestDescriptor::new(libc::SYS_getpid, [0; 6]);
            manager.resolve(&mut desc, &submitter, Provenance::Raw);
            assert_eq!(desc.state, expected);
        }
    }

    #[test]
    fn test_read_flushes_queued_write_first() {
        let (manager, submitter, kernel) = setup(RuntimeConfig::default());
        let fd = open(&manager, &submitter, c"/race");
        let release = Arc::new(AtomicUsize::new(0));
        kernel.stall_next(Arc::clone(&release), 1, Duration::ZERO);
        let crossed = kernel.crossings();

        let mut buf = [0u8; 4];
        thread::scope(|s| {
            let leader = s.spawn(|| {
                let args = [fd, b"old!".as_ptr() as i64, 4, 0, 0, 0];
                run(&manager, &submitter, libc::SYS_pwrite64, args).result
            });
            while kernel.crossings() == crossed {
                thread::yield_now();
            }

            let queued = s.spawn(|| {
                let args = [fd, b"new!".as_ptr() as i64, 4, 0, 0, 0];
                run(&manager, &submitter, libc::SYS_pwrite64, args).result
            });
            while manager.coalescer.pending() == 0 {
                thread::yield_now();
            }

            let reader = s.spawn(|| pread(&manager, &submitter, fd, &mut buf));
            thread::sleep(Duration::from_millis(50));
            release.fetch_add(1, Ordering::SeqCst);

            assert_eq!(reader.join().unwrap(), 4);
            assert_eq!(leader.join().unwrap(), 4);
            assert_eq!(queued.join().unwrap(), 4);
        });

        assert_eq!(&buf, b"new!");
        let ops = kernel.ops();
        let last_write = ops.iter().rposition(|&op| op == libc::SYS_pwrite64).unwrap();
        let read = ops.iter().position(|&op| op == libc::SYS_pread64).unwrap();
        assert!(last_write < read, "crossed as {:?}", ops);
    }

    #[test]
    fn test_fork_child_recovers_orphaned_locks() {
        let (manager, submitter, _kernel) = setup(RuntimeConfig::default());
        run(&manager, &submitter, libc::SYS_getpid, [0; 6]);
        assert_eq!(manager.cached_entries(), 1);
        manager.table.orphan_lock();
        manager.coalescer.orphan_lock();

        let args = [libc::SIGCHLD as i64, 0, 0, 0, 0, 0];
        assert_eq!(run(&manager, &submitter, libc::SYS_clone, args).result, 0);
        assert_eq!(manager.cached_entries(), 0);

        let first = run(&manager, &submitter, libc::SYS_getpid, [0; 6]);
        let second = run(&manager, &submitter, libc::SYS_getpid, [0; 6]);
        assert_eq!(first.state, RequestState::ResolvedTransitioned);
        assert_eq!(second.state, RequestState::ResolvedCached);
    }

    #[test]
    fn test_thread_clone_is_not_a_fork() {
        let thread_flags = (libc::CLONE_VM | libc::CLONE_THREAD | libc::CLONE_SIGHAND) as i64;
        let mut desc = RequestDescriptor::new(libc::SYS_clone, [thread_flags, 0, 0, 0, 0, 0]);
        desc.resolve_transitioned(0);
        assert!(!forked_child(&desc));

        desc.arguments[0] = libc::SIGCHLD as i64;
        assert!(forked_child(&desc));
        desc.resolve_transitioned(1234);
        assert!(!forked_child(&desc));

        let mut clone_args = [0u64; 11];
        clone_args[0] = thread_flags as u64;
        let size = core::mem::size_of_val(&clone_args) as i64;
        let mut desc = RequestDescriptor::new(
            libc::SYS_clone3,
            [clone_args.as_ptr() as i64, size, 0, 0, 0, 0],
        );
        desc.resolve_transitioned(0);
        assert!(!forked_child(&desc));

        clone_args[0] = 0;
        assert!(forked_child(&desc));
    }

    #[test]
    fn test_direct_resolution_ignores_held_locks() {
        let (manager, submitter, kernel) = setup(RuntimeConfig::default());
        let fd = open(&manager, &submitter, c"/direct");
        run(&manager, &submitter, libc::SYS_getpid, [0; 6]);
        manager.table.orphan_lock();
        manager.coalescer.orphan_lock();

        let data = *b"sig!";
        let mut desc =
            RequestDescriptor::new(libc::SYS_pwrite64, [fd, data.as_ptr() as i64, 4, 0, 0, 0]);
        manager.resolve_direct(&mut desc, &submitter);
        assert_eq!(desc.result, 4);
        assert_eq!(kernel.contents("/direct").unwrap(), b"sig!");

        let mut pid = RequestDescriptor::new(libc::SYS_getpid, [0; 6]);
        manager.resolve_direct(&mut pid, &submitter);
        assert_eq!(pid.state, RequestState::ResolvedTransitioned);
    }
}

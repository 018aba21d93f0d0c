//! Static Classification Policy
//!
//! Maps an operation number to the policy the cache/batch manager applies.
//!
//! # Classes
//! - `NeverCacheable`: forwarded individually and immediately
//! - `CacheableRead`: memoized for a bounded validity window
//! - `CoalescibleWrite`: may share one boundary crossing with other writes
//!
//! Classification is conservative. Anything not listed is never cached and
//! invalidates every cache domain, since its side effects are unknown.
//!
//! Only `pwrite64` coalesces by default. A stream `write` may block
//! indefinitely on a pipe, socket or terminal, and a batch cannot leave
//! its members behind. `pwrite64` on such descriptors fails with `ESPIPE`
//! at once. `WriteShape::Stream` remains available for callers whose
//! descriptors are all regular files.

use std::collections::HashMap;

use bitflags::bitflags;

use super::descriptor::{RequestDescriptor, Sysno, ARG_COUNT};

bitflags! {
    /// Argument slots that form a fingerprint.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ArgMask: u8 {
        const A1 = 1 << 0;
        const A2 = 1 << 1;
        const A3 = 1 << 2;
        const A4 = 1 << 3;
        const A5 = 1 << 4;
        const A6 = 1 << 5;
    }
}

bitflags! {
    /// Families of cached state that share an invalidation signal.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Domain: u8 {
        /// File contents and metadata reached through descriptors.
        const FILE_DATA = 1 << 0;
        /// Process identity (pid, credentials, host name).
        const IDENTITY = 1 << 1;
    }
}

/// Caching class of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpClass {
    NeverCacheable,
    CacheableRead,
    CoalescibleWrite,
}

/// Length of the output memory a cached read must reproduce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadLen {
    /// The successful result is the byte count.
    FromResult,
    /// A fixed-size structure.
    Fixed(usize),
}

/// Output memory written by a read besides its return value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Payload {
    None,
    Buffer {
        /// Argument slot holding the output pointer.
        arg: usize,
        /// Bytes written there.
        len: PayloadLen,
    },
}

/// How a coalescible write names its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteShape {
    /// `write(fd, buf, count)` at the descriptor's current offset.
    Stream,
    /// `pwrite64(fd, buf, count, offset)` at an explicit offset.
    Positional,
}

/// Target of one coalescible write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteTarget {
    Stream { fd: i64 },
    Range { fd: i64, start: i64, end: i64 },
}

impl WriteTarget {
    /// Check whether two writes may travel in the same batch.
    ///
    /// Only targets that are provably identical or disjoint qualify.
    /// Different descriptors may refer to the same open file, so they
    /// never qualify.
    pub fn compatible(&self, other: &Self) -> bool {
        match (*self, *other) {
            (Self::Stream { fd: a }, Self::Stream { fd: b }) => a == b,
            (
                Self::Range { fd: a, start: s1, end: e1 },
                Self::Range { fd: b, start: s2, end: e2 },
            ) => a == b && ((s1 == s2 && e1 == e2) || e1 <= s2 || e2 <= s1),
            _ => false,
        }
    }
}

/// Canonical cache key: operation plus its key arguments.
///
/// Slots outside the policy's `ArgMask` are zeroed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    pub operation: Sysno,
    pub key: [i64; ARG_COUNT],
}

/// Policy for one operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Policy {
    pub class: OpClass,
    pub key: ArgMask,
    pub payload: Payload,
    /// Domain a cached result belongs to.
    pub domain: Domain,
    /// Domains evicted when this operation is issued.
    pub invalidates: Domain,
    /// Target shape, for coalescible writes.
    pub shape: Option<WriteShape>,
}

impl Policy {
    /// Forward always; evict `invalidates` around the call.
    pub const fn never(invalidates: Domain) -> Self {
        Self {
            class: OpClass::NeverCacheable,
            key: ArgMask::empty(),
            payload: Payload::None,
            domain: Domain::empty(),
            invalidates,
            shape: None,
        }
    }

    /// Memoizable read.
    pub const fn read(key: ArgMask, domain: Domain, payload: Payload) -> Self {
        Self {
            class: OpClass::CacheableRead,
            key,
            payload,
            domain,
            invalidates: Domain::empty(),
            shape: None,
        }
    }

    /// Coalescible write; file data it may touch is invalidated.
    pub const fn write(shape: WriteShape) -> Self {
        Self {
            class: OpClass::CoalescibleWrite,
            key: ArgMask::empty(),
            payload: Payload::None,
            domain: Domain::empty(),
            invalidates: Domain::FILE_DATA,
            shape: Some(shape),
        }
    }

    /// Canonical fingerprint of a request under this policy.
    pub fn fingerprint(&self, desc: &RequestDescriptor) -> Fingerprint {
        let mut key = [0; ARG_COUNT];
        for (slot, value) in key.iter_mut().enumerate() {
            if self.key.bits() & (1 << slot) != 0 {
                *value = desc.arg(slot);
            }
        }
        Fingerprint {
            operation: desc.operation,
            key,
        }
    }

    /// Write target of a request, for coalescible writes.
    pub fn write_target(&self, desc: &RequestDescriptor) -> Option<WriteTarget> {
        let fd = desc.arg(0);
        match self.shape? {
            WriteShape::Stream => Some(WriteTarget::Stream { fd }),
            WriteShape::Positional => {
                let start = desc.arg(3);
                let end = start.checked_add(desc.arg(2))?;
                Some(WriteTarget::Range { fd, start, end })
            }
        }
    }
}

/// Operation number to policy mapping.
///
/// Built once; callers may override entries before handing the table to
/// a runtime.
#[derive(Debug, Clone)]
pub struct PolicyTable {
    entries: HashMap<Sysno, Policy>,
    fallback: Policy,
}

impl PolicyTable {
    /// Table where every operation is forwarded and invalidates everything.
    pub fn empty() -> Self {
        Self {
            entries: HashMap::new(),
            fallback: Policy::never(Domain::all()),
        }
    }

    /// Look up the policy for an operation.
    #[inline]
    pub fn lookup(&self, operation: Sysno) -> &Policy {
        self.entries.get(&operation).unwrap_or(&self.fallback)
    }

    /// Install or replace a policy.
    pub fn set(&mut self, operation: Sysno, policy: Policy) -> &mut Self {
        self.entries.insert(operation, policy);
        self
    }

    /// Downgrade every entry of a class to a plain forward.
    ///
    /// Invalidation behavior is kept.
    pub fn disable(&mut self, class: OpClass) -> &mut Self {
        for policy in self.entries.values_mut() {
            if policy.class == class {
                *policy = Policy::never(policy.invalidates);
            }
        }
        self
    }
}

impl Default for PolicyTable {
    fn default() -> Self {
        use libc::*;

        let mut table = Self::empty();
        let identity = Policy::read(ArgMask::empty(), Domain::IDENTITY, Payload::None);
        let quiet = Policy::never(Domain::empty());
        let file_mutation = Policy::never(Domain::FILE_DATA);
        let credential_change = Policy::never(Domain::IDENTITY);

        table
            .set(
                SYS_pread64,
                Policy::read(
                    ArgMask::A1 | ArgMask::A3 | ArgMask::A4,
                    Domain::FILE_DATA,
                    Payload::Buffer {
                        arg: 1,
                        len: PayloadLen::FromResult,
                    },
                ),
            )
            .set(
                SYS_fstat,
                Policy::read(
                    ArgMask::A1,
                    Domain::FILE_DATA,
                    Payload::Buffer {
                        arg: 1,
                        len: PayloadLen::Fixed(core::mem::size_of::<stat>()),
                    },
                ),
            )
            .set(
                SYS_uname,
                Policy::read(
                    ArgMask::empty(),
                    Domain::IDENTITY,
                    Payload::Buffer {
                        arg: 0,
                        len: PayloadLen::Fixed(core::mem::size_of::<utsname>()),
                    },
                ),
            )
            .set(SYS_pwrite64, Policy::write(WriteShape::Positional));

        for op in [SYS_getpid, SYS_getuid, SYS_geteuid, SYS_getgid, SYS_getegid] {
            table.set(op, identity);
        }

        for op in [
            SYS_read,
            SYS_mmap,
            SYS_munmap,
            SYS_mremap,
            SYS_mprotect,
            SYS_madvise,
            SYS_brk,
            SYS_futex,
            SYS_nanosleep,
            SYS_clock_gettime,
            SYS_sched_yield,
            SYS_getrandom,
            SYS_rt_sigprocmask,
            SYS_lseek,
            SYS_gettid,
            SYS_getppid,
        ] {
            table.set(op, quiet);
        }

        for op in [
            SYS_write,
            SYS_openat,
            SYS_close,
            SYS_dup,
            SYS_dup3,
            SYS_ftruncate,
            SYS_truncate,
            SYS_fallocate,
            SYS_writev,
            SYS_pwritev,
            SYS_sendfile,
            SYS_copy_file_range,
            SYS_renameat,
            SYS_renameat2,
            SYS_unlinkat,
        ] {
            table.set(op, file_mutation);
        }

        #[cfg(target_arch = "x86_64")]
        for op in [SYS_open, SYS_creat, SYS_dup2, SYS_rename, SYS_unlink] {
            table.set(op, file_mutation);
        }

        for op in [
            SYS_setuid,
            SYS_setgid,
            SYS_setreuid,
            SYS_setregid,
            SYS_setresuid,
            SYS_setresgid,
            SYS_setsid,
        ] {
            table.set(op, credential_change);
        }

        table
    }
}

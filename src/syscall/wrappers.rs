//! Typed Convenience Wrappers
//!
//! Argument-shaping adapters over `Runtime::dispatch`. They add no
//! behavior of their own: no statistics, no caching decisions. The
//! `shape` functions are shared with the C ABI so both surfaces build
//! identical requests.

use core::ffi::{c_int, c_void};
use std::ffi::CStr;

use bitflags::bitflags;

use crate::request::{Args, Provenance, Sysno};

use super::Runtime;

bitflags! {
    /// Flags for `open`. The empty set means read-only.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct OpenFlags: c_int {
        const WRONLY = libc::O_WRONLY;
        const RDWR = libc::O_RDWR;
        const CREAT = libc::O_CREAT;
        const EXCL = libc::O_EXCL;
        const TRUNC = libc::O_TRUNC;
        const APPEND = libc::O_APPEND;
        const NONBLOCK = libc::O_NONBLOCK;
        const DIRECTORY = libc::O_DIRECTORY;
        const CLOEXEC = libc::O_CLOEXEC;
    }
}

bitflags! {
    /// Memory protection for `mmap`. The empty set means no access.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ProtFlags: c_int {
        const READ = libc::PROT_READ;
        const WRITE = libc::PROT_WRITE;
        const EXEC = libc::PROT_EXEC;
    }
}

bitflags! {
    /// Mapping flags for `mmap`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MapFlags: c_int {
        const SHARED = libc::MAP_SHARED;
        const PRIVATE = libc::MAP_PRIVATE;
        const FIXED = libc::MAP_FIXED;
        const ANONYMOUS = libc::MAP_ANONYMOUS;
        const POPULATE = libc::MAP_POPULATE;
        const NORESERVE = libc::MAP_NORESERVE;
    }
}

/// Request shapes for the common operations.
pub(crate) mod shape {
    use super::*;

    #[inline]
    pub fn read(fd: c_int, buf: *mut c_void, count: usize) -> (Sysno, Args) {
        (libc::SYS_read, [fd as i64, buf as i64, count as i64, 0, 0, 0])
    }

    #[inline]
    pub fn write(fd: c_int, buf: *const c_void, count: usize) -> (Sysno, Args) {
        (libc::SYS_write, [fd as i64, buf as i64, count as i64, 0, 0, 0])
    }

    #[inline]
    pub fn pread(fd: c_int, buf: *mut c_void, count: usize, offset: i64) -> (Sysno, Args) {
        (libc::SYS_pread64, [fd as i64, buf as i64, count as i64, offset, 0, 0])
    }

    #[inline]
    pub fn pwrite(fd: c_int, buf: *const c_void, count: usize, offset: i64) -> (Sysno, Args) {
        (libc::SYS_pwrite64, [fd as i64, buf as i64, count as i64, offset, 0, 0])
    }

    /// `open` is issued as `openat(AT_FDCWD, ...)`, which every Linux
    /// architecture provides.
    #[inline]
    pub fn open(path: *const libc::c_char, flags: c_int, mode: libc::mode_t) -> (Sysno, Args) {
        (
            libc::SYS_openat,
            [libc::AT_FDCWD as i64, path as i64, flags as i64, mode as i64, 0, 0],
        )
    }

    #[inline]
    pub fn close(fd: c_int) -> (Sysno, Args) {
        (libc::SYS_close, [fd as i64, 0, 0, 0, 0, 0])
    }

    #[inline]
    pub fn mmap(
        addr: *mut c_void,
        length: usize,
        prot: c_int,
        flags: c_int,
        fd: c_int,
        offset: i64,
    ) -> (Sysno, Args) {
        (
            libc::SYS_mmap,
            [addr as i64, length as i64, prot as i64, flags as i64, fd as i64, offset],
        )
    }

    #[inline]
    pub fn munmap(addr: *mut c_void, length: usize) -> (Sysno, Args) {
        (libc::SYS_munmap, [addr as i64, length as i64, 0, 0, 0, 0])
    }

    #[inline]
    pub fn fstat(fd: c_int, out: *mut libc::stat) -> (Sysno, Args) {
        (libc::SYS_fstat, [fd as i64, out as i64, 0, 0, 0, 0])
    }
}

impl Runtime {
    #[inline]
    fn issue(&self, (operation, args): (Sysno, Args)) -> i64 {
        // SAFETY: every output buffer comes from a live `&mut` reference,
        // and the remaining arguments are values whose validity the
        // wrapper signatures guarantee.
        unsafe { self.dispatch_from(operation, args, Provenance::Checked) }
    }

    /// Read from the descriptor's current offset. Returns bytes read.
    pub fn read(&self, fd: c_int, buf: &mut [u8]) -> isize {
        self.issue(shape::read(fd, buf.as_mut_ptr().cast(), buf.len())) as isize
    }

    /// Write at the descriptor's current offset. Returns bytes written.
    pub fn write(&self, fd: c_int, buf: &[u8]) -> isize {
        self.issue(shape::write(fd, buf.as_ptr().cast(), buf.len())) as isize
    }

    /// Read at an explicit offset.
    pub fn pread(&self, fd: c_int, buf: &mut [u8], offset: i64) -> isize {
        self.issue(shape::pread(fd, buf.as_mut_ptr().cast(), buf.len(), offset)) as isize
    }

    /// Write at an explicit offset.
    pub fn pwrite(&self, fd: c_int, buf: &[u8], offset: i64) -> isize {
        self.issue(shape::pwrite(fd, buf.as_ptr().cast(), buf.len(), offset)) as isize
    }

    /// Open a path relative to the working directory.
    pub fn open(&self, path: &CStr, flags: OpenFlags, mode: libc::mode_t) -> c_int {
        self.issue(shape::open(path.as_ptr(), flags.bits(), mode)) as c_int
    }

    pub fn close(&self, fd: c_int) -> c_int {
        self.issue(shape::close(fd)) as c_int
    }

    /// Map memory. On failure the returned pointer encodes `-errno`.
    ///
    /// # Safety
    /// Same contract as `mmap(2)`; in particular `MapFlags::FIXED` may
    /// replace existing mappings.
    pub unsafe fn mmap(
        &self,
        addr: *mut c_void,
        length: usize,
        prot: ProtFlags,
        flags: MapFlags,
        fd: c_int,
        offset: i64,
    ) -> *mut c_void {
        let (operation, args) = shape::mmap(addr, length, prot.bits(), flags.bits(), fd, offset);
        // SAFETY: forwarded under the caller's contract.
        unsafe { self.dispatch(operation, args) as usize as *mut c_void }
    }

    /// Unmap memory.
    ///
    /// # Safety
    /// No live reference may point into the unmapped range.
    pub unsafe fn munmap(&self, addr: *mut c_void, length: usize) -> c_int {
        let (operation, args) = shape::munmap(addr, length);
        // SAFETY: forwarded under the caller's contract.
        unsafe { self.dispatch(operation, args) as c_int }
    }

    /// File metadata for an open descriptor.
    pub fn fstat(&self, fd: c_int, out: &mut libc::stat) -> c_int {
        self.issue(shape::fstat(fd, out)) as c_int
    }

    pub fn getpid(&self) -> libc::pid_t {
        self.issue((libc::SYS_getpid, [0; 6])) as libc::pid_t
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boundary::testing::FakeKernel;
    use crate::config::RuntimeConfig;

    #[test]
    fn test_open_shapes_openat() {
        let (op, args) = shape::open(c"/x".as_ptr(), libc::O_RDONLY, 0);
        assert_eq!(op, libc::SYS_openat);
        assert_eq!(args[0], libc::AT_FDCWD as i64);
        assert_eq!(&args[4..], &[0, 0]);
    }

    #[test]
    fn test_wrappers_record_once() {
        let rt = Runtime::new(RuntimeConfig::default(), Box::new(FakeKernel::new()));
        let fd = rt.open(c"/w", OpenFlags::CREAT | OpenFlags::RDWR, 0o600);
        assert_eq!(rt.write(fd, b"abc"), 3);
        assert_eq!(rt.close(fd), 0);

        let stats = rt.stats();
        assert_eq!(stats.total_syscalls, 3);
        assert_eq!(stats.failed_syscalls, 0);
    }

    #[test]
    fn test_open_missing_fails() {
        let rt = Runtime::new(RuntimeConfig::default(), Box::new(FakeKernel::new()));
        assert_eq!(rt.open(c"/missing", OpenFlags::empty(), 0), -libc::ENOENT);
        assert_eq!(rt.stats().failed_syscalls, 1);
    }
}

//! C ABI
//!
//! Entry points for call sites rewritten to go through the runtime
//! instead of trapping directly. All of them use the process runtime
//! (`crate::runtime()`).
//!
//! # Conventions
//! - Request functions return raw kernel-convention results: `-errno`
//!   on failure, never `-1` with `errno` set.
//! - `xsc_get_stats` is a usage API, not a request: it returns `0`, or
//!   `-1` with `errno = EINVAL` when `out` is null.

use core::ffi::{c_char, c_int, c_long, c_void};

use libc::{mode_t, off_t, size_t, ssize_t};

use crate::stats::XscStats;

use super::wrappers::shape;

/// Generic request.
///
/// # Safety
/// Same contract as `syscall(2)` for `number`.
#[no_mangle]
pub unsafe extern "C" fn xsc_syscall(
    number: c_long,
    a1: c_long,
    a2: c_long,
    a3: c_long,
    a4: c_long,
    a5: c_long,
    a6: c_long,
) -> c_long {
    let args = [a1 as i64, a2 as i64, a3 as i64, a4 as i64, a5 as i64, a6 as i64];
    // SAFETY: forwarded under the caller's contract.
    unsafe { crate::runtime().dispatch(number as i64, args) as c_long }
}

/// # Safety
/// `buf` must be writable for `count` bytes.
#[no_mangle]
pub unsafe extern "C" fn xsc_read(fd: c_int, buf: *mut c_void, count: size_t) -> ssize_t {
    let (operation, args) = shape::read(fd, buf, count);
    // SAFETY: forwarded under the caller's contract.
    unsafe { crate::runtime().dispatch(operation, args) as ssize_t }
}

/// # Safety
/// `buf` must be readable for `count` bytes.
#[no_mangle]
pub unsafe extern "C" fn xsc_write(fd: c_int, buf: *const c_void, count: size_t) -> ssize_t {
    let (operation, args) = shape::write(fd, buf, count);
    // SAFETY: forwarded under the caller's contract.
    unsafe { crate::runtime().dispatch(operation, args) as ssize_t }
}

/// # Safety
/// `path` must be a NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn xsc_open(path: *const c_char, flags: c_int, mode: mode_t) -> c_int {
    let (operation, args) = shape::open(path, flags, mode);
    // SAFETY: forwarded under the caller's contract.
    unsafe { crate::runtime().dispatch(operation, args) as c_int }
}

#[no_mangle]
pub extern "C" fn xsc_close(fd: c_int) -> c_int {
    let (operation, args) = shape::close(fd);
    // SAFETY: close takes no pointer arguments.
    unsafe { crate::runtime().dispatch(operation, args) as c_int }
}

/// On failure the returned pointer encodes `-errno`.
///
/// # Safety
/// Same contract as `mmap(2)`.
#[no_mangle]
pub unsafe extern "C" fn xsc_mmap(
    addr: *mut c_void,
    length: size_t,
    prot: c_int,
    flags: c_int,
    fd: c_int,
    offset: off_t,
) -> *mut c_void {
    let (operation, args) = shape::mmap(addr, length, prot, flags, fd, offset as i64);
    // SAFETY: forwarded under the caller's contract.
    unsafe { crate::runtime().dispatch(operation, args) as usize as *mut c_void }
}

/// # Safety
/// No live reference may point into the unmapped range.
#[no_mangle]
pub unsafe extern "C" fn xsc_munmap(addr: *mut c_void, length: size_t) -> c_int {
    let (operation, args) = shape::munmap(addr, length);
    // SAFETY: forwarded under the caller's contract.
    unsafe { crate::runtime().dispatch(operation, args) as c_int }
}

/// Copy a consistent statistics snapshot into `out`.
///
/// # Safety
/// `out` must be null or valid for writing one `XscStats`.
#[no_mangle]
pub unsafe extern "C" fn xsc_get_stats(out: *mut XscStats) -> c_int {
    // SAFETY: null or valid per the caller's contract.
    let out = unsafe { out.as_mut() };
    match crate::runtime().copy_stats(out) {
        Ok(()) => 0,
        Err(err) => {
            // SAFETY: errno is thread-local and always addressable.
            unsafe { *libc::__errno_location() = err.errno().code() };
            -1
        }
    }
}

#[no_mangle]
pub extern "C" fn xsc_reset_stats() {
    crate::runtime().reset_stats();
}

//! Caller Buffer Validation
//!
//! The cache copies payloads between caller memory and its own entries
//! without a kernel in the loop, so it must do the checks the kernel
//! would otherwise do.
//!
//! # Checks
//! - Null pointers are rejected
//! - `ptr + len` must not overflow
//! - Length must fit in `isize` (slice requirement)
//!
//! A rejected buffer is never reported to the caller from here. The
//! request is forwarded instead and the kernel reports the native error.

use crate::error::Errno;

/// A validated caller buffer the runtime reads from.
#[derive(Debug)]
pub struct UserBuffer {
    ptr: *const u8,
    len: usize,
}

impl UserBuffer {
    /// Get the buffer as a byte slice.
    ///
    /// # Safety
    /// The memory must be readable for `len` bytes and not written
    /// concurrently. Validation only rules out null and overflowing ranges.
    pub unsafe fn as_bytes(&self) -> &[u8] {
        if self.len == 0 {
            return &[];
        }
        // SAFETY: non-null and in range per validation; readability is
        // the caller's contract.
        unsafe { core::slice::from_raw_parts(self.ptr, self.len) }
    }
}

/// A validated caller buffer the runtime writes to.
#[derive(Debug)]
pub struct UserBufferMut {
    ptr: *mut u8,
    len: usize,
}

impl UserBufferMut {
    /// Get the buffer as a mutable byte slice.
    ///
    /// # Safety
    /// Same contract as `UserBuffer::as_bytes`, plus writability.
    pub unsafe fn as_bytes_mut(&mut self) -> &mut [u8] {
        if self.len == 0 {
            return &mut [];
        }
        // SAFETY: see UserBuffer::as_bytes
        unsafe { core::slice::from_raw_parts_mut(self.ptr, self.len) }
    }
}

fn check_range(ptr: i64, len: usize) -> Result<(), Errno> {
    if len > isize::MAX as usize {
        return Err(Errno::Einval);
    }
    if ptr == 0 {
        return Err(Errno::Efault);
    }
    (ptr as usize).checked_add(len).ok_or(Errno::Efault)?;
    Ok(())
}

/// Validate a buffer the runtime will read from.
///
/// Zero-length buffers are valid even when null.
pub fn validate_user_read(ptr: i64, len: usize) -> Result<UserBuffer, Errno> {
    if len != 0 {
        check_range(ptr, len)?;
    }
    Ok(UserBuffer {
        ptr: ptr as usize as *const u8,
        len,
    })
}

/// Validate a buffer the runtime will write to.
pub fn validate_user_write(ptr: i64, len: usize) -> Result<UserBufferMut, Errno> {
    let read_buf = validate_user_read(ptr, len)?;

    Ok(UserBufferMut {
        ptr: read_buf.ptr as *mut u8,
        len: read_buf.len,
    })
}

//! Native Trap Transport
//!
//! Crosses the privilege boundary with the platform's system-call
//! instruction through `libc::syscall`. The trap has no batch primitive,
//! so each descriptor in a batch is issued in order.

use crate::error::TransitionError;
use crate::request::RequestDescriptor;

use super::Transport;

/// Transport backed by the native system-call instruction.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeTrap;

impl NativeTrap {
    pub const fn new() -> Self {
        Self
    }
}

impl Transport for NativeTrap {
    fn name(&self) -> &'static str {
        "native-trap"
    }

    fn cross(&self, batch: &mut [RequestDescriptor]) -> Result<usize, TransitionError> {
        for desc in batch.iter_mut() {
            let [a1, a2, a3, a4, a5, a6] = desc.arguments;
            // SAFETY: the arguments are forwarded verbatim, exactly as the
            // caller would have issued them without this runtime. Pointer
            // validity is the caller's contract with the kernel.
            let raw = unsafe { libc::syscall(desc.operation, a1, a2, a3, a4, a5, a6) };
            desc.result = normalize(raw as i64);
        }
        Ok(batch.len())
    }
}

/// Convert libc's `-1` + `errno` convention into a raw `-errno` result.
fn normalize(raw: i64) -> i64 {
    if raw != -1 {
        return raw;
    }
    match std::io::Error::last_os_error().raw_os_error() {
        Some(code) if code > 0 => -(code as i64),
        _ => -(libc::EIO as i64),
    }
}

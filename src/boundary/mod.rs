//! Privilege Boundary
//!
//! Everything that actually reaches the kernel goes through here.
//!
//! # Layers
//! - `Transport`: the crossing mechanism (trap instruction, shared ring
//!   polled by the kernel, ...). Pluggable; the runtime does not care
//!   which one is underneath.
//! - `Submitter`: batching contract, bookkeeping and fatal-failure policy
//!   on top of a transport.

mod native;
mod submitter;
#[cfg(test)]
pub(crate) mod testing;

pub use native::NativeTrap;
pub use submitter::{Diagnostics, Submitter};

use crate::error::TransitionError;
use crate::request::RequestDescriptor;

/// A mechanism for crossing into the kernel.
///
/// Implementations write each request's raw result into
/// `RequestDescriptor::result` (negative `-errno` on failure) and return
/// how many requests were completed. An `Err` means the path itself is
/// broken, not that a requested operation failed.
pub trait Transport: Send + Sync {
    /// Short name for diagnostics.
    fn name(&self) -> &'static str;

    /// Perform one crossing for the whole batch.
    fn cross(&self, batch: &mut [RequestDescriptor]) -> Result<usize, TransitionError>;
}

//! System Call Interface
//!
//! The surfaces callers actually touch.
//!
//! # Layers
//! - `Runtime::dispatch`: generic entry point taking an operation number
//!   and six raw arguments
//! - typed wrappers (`read`, `write`, `open`, ...) that only shape
//!   arguments and forward to `dispatch`
//! - `xsc_*` C ABI functions over the process-wide runtime
//!
//! Every surface returns native-convention results and leaves all
//! bookkeeping to `dispatch`, so a request is counted exactly once no
//! matter how it entered.

mod dispatch;
pub mod ffi;
pub(crate) mod validate;
mod wrappers;

pub use dispatch::Runtime;
pub use validate::{UserBuffer, UserBufferMut};
pub use wrappers::{MapFlags, OpenFlags, ProtFlags};

//! Request Representation
//!
//! Every call into the runtime becomes a `RequestDescriptor` (operation
//! plus six word-sized arguments) and is classified by the static
//! `PolicyTable` before the cache/batch manager sees it.

mod descriptor;
mod policy;

pub use descriptor::{Args, Provenance, RequestDescriptor, RequestState, Sysno, ARG_COUNT};
pub use policy::{
    ArgMask, Domain, Fingerprint, OpClass, Payload, PayloadLen, Policy, PolicyTable, WriteShape,
    WriteTarget,
};

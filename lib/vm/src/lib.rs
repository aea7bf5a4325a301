//! Execution side of the SYS VM OC runtime.
//!
//! A thread executes compiled contracts in its own [`Memory`]: a set of
//! virtual memory slices where the slice in use decides how many wasm
//! pages are accessible. The [`Executor`] maps the code cache executable,
//! prepares memory from a [`sysvmoc_types::CodeDescriptor`] and jumps into
//! the generated code, turning faults, expired deadlines and errors raised
//! by host intrinsics into an [`ExecutionError`].

#![deny(missing_docs, trivial_numeric_casts, unused_extern_crates)]
#![warn(unused_import_braces)]

cfg_if::cfg_if! {
    if #[cfg(not(target_os = "linux"))] {
        compile_error!("sysvmoc-vm relies on memfd, sigaltstack and SIGSEGV unwinding and only supports Linux");
    }
}

mod context;
pub mod control_block;
mod error;
mod executor;
mod intrinsics;
mod memory;
mod timer;
mod trap;

pub use crate::context::{
    Action, ApplyContext, ExpirationCallback, Name, NameParseError, ResourceLimits,
    TransactionTimer,
};
pub use crate::error::{ExecutionError, HostError, MemoryError};
pub use crate::executor::{Executor, ExecutorState};
pub use crate::memory::{Memory, STRIDE};
pub use crate::timer::DeadlineTimer;

/// Version number of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

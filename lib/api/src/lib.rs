//! SYS VM OC: ahead of time compiled execution of SYS contracts.
//!
//! [`SysVmOcRuntime`] ties the pieces together. Wasm registered through
//! [`SysVmOcRuntime::instantiate_module`] is compiled by a compile monitor
//! into the shared code cache on first use, then executed natively in the
//! calling thread's memory slices:
//!
//! ```no_run
//! use std::sync::Arc;
//! use sysvmoc::{SysVmOcRuntime, OcConfig, Digest};
//! # fn run(
//! #     generator: Arc<dyn sysvmoc_compiler::CodeGenerator>,
//! #     context: &mut dyn sysvmoc::ApplyContext,
//! #     wasm: &[u8],
//! # ) -> Result<(), Box<dyn std::error::Error>> {
//! let monitor = sysvmoc_compiler::spawn_compile_monitor_process(generator)?;
//! let runtime = SysVmOcRuntime::new("data/code_cache", OcConfig::default(), monitor.service())?;
//! let module = runtime.instantiate_module(wasm, Digest::hash(wasm), 0, 0);
//! module.apply(context)?;
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs, trivial_numeric_casts, unused_extern_crates)]
#![warn(unused_import_braces)]

mod code_registry;
mod error;
mod runtime;
mod thread_registry;

pub use crate::error::{ApplyError, RuntimeError};
pub use crate::runtime::{
    SysVmOcRuntime, WasmInstantiatedModule, WasmInstantiatedModuleInterface,
    WasmRuntimeInterface,
};

pub use sysvmoc_cache::{CodeCache, CodeCacheError};
pub use sysvmoc_types::{CodeDescriptor, Digest, OcConfig};
pub use sysvmoc_vm::{
    Action, ApplyContext, DeadlineTimer, ExecutionError, ExecutorState, HostError, Name,
    ResourceLimits, TransactionTimer,
};

/// Version number of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

//! The compile monitor of the SYS VM OC runtime.
//!
//! The monitor receives contract wasm from code caches, turns it into
//! native code with a [`CodeGenerator`] and stores the result in the cache
//! file shared with the node. It can run on a thread
//! ([`spawn_compile_monitor_thread`]) or in a forked process
//! ([`spawn_compile_monitor_process`]).

#![deny(missing_docs, trivial_numeric_casts, unused_extern_crates)]
#![warn(unused_import_braces)]

#[cfg(not(target_os = "linux"))]
compile_error!("the compile monitor only supports Linux");

mod codegen;
mod error;
mod monitor;
pub mod prepare;
mod session;
mod trampoline;

pub use crate::codegen::{
    compile_module, Cancellation, CodeGenerator, CompiledModule, GeneratedCode,
};
pub use crate::error::CompileError;
pub use crate::monitor::{
    spawn_compile_monitor_process, spawn_compile_monitor_thread, CompileMonitor,
    CompileMonitorHandle,
};
pub use crate::prepare::{prepare, ModuleLayout};

//! Shared data model of the SYS VM OC runtime.
//!
//! This crate holds everything the node side and the compile monitor need
//! to agree on: code identities and descriptors, the wire messages, the
//! intrinsic ordinal table, the wasm constraints and the configuration.

#![deny(trivial_numeric_casts, unused_extern_crates)]
#![warn(unused_import_braces)]

mod code;
mod config;
pub mod constraints;
mod digest;
pub mod error;
pub mod intrinsics;
pub mod memory_layout;
pub mod protocol;

pub use crate::code::{
    CodeDescriptor, CodeTuple, ExitCode, StartOffset, CURRENT_CODEGEN_VERSION,
};
pub use crate::config::OcConfig;
pub use crate::digest::Digest;
pub use crate::error::{ConfigError, DigestParseError};
pub use crate::protocol::SysVmOcMessage;

/// Version number of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

//! Workspace root of SYS VM OC.
//!
//! The runtime lives in the `sysvmoc` crate; this package only hosts the
//! integration tests exercising the compile monitor, the code cache and
//! the executor together.

pub use sysvmoc::*;
pub use sysvmoc_types as types;

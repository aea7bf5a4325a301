//! Leaving native code when it faults or a host intrinsic raises.
//!
//! Native code runs inside [`catch_traps`], which records a resumption
//! point. Faults in the code mapping (the deadline revoked it) or in the
//! memory slices (an out of bounds access) and errors raised by
//! intrinsics return there with an [`ExitCode`](sysvmoc_types::ExitCode).
mod handlers;
mod traphandlers;

pub(crate) use traphandlers::{catch_traps, init_traps, raise, with_call_state, CallThreadState, Unwind};

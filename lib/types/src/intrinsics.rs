//! Names of the host intrinsics reachable from generated code.
//!
//! The position of a name in [`INTRINSIC_NAMES`] is its ordinal: the slot
//! of the jump table in the memory prologue holding its address. Ordinals
//! are baked into compiled code, so entries may only ever be appended.

/// Every intrinsic, in ordinal order.
pub const INTRINSIC_NAMES: &[&str] = &[
    "sysvmoc_internal.depth_assert",
    "sysvmoc_internal.grow_memory",
    "sysvmoc_internal.unreachable",
    "sysvmoc_internal.indirect_call_mismatch",
    "sysvmoc_internal.indirect_call_oob",
    "env.sysio_assert",
    "env.sysio_assert_message",
    "env.sysio_assert_code",
    "env.sysio_exit",
    "env.action_data_size",
    "env.read_action_data",
    "env.current_receiver",
    "env.get_sender",
    "env.current_time",
    "env.is_feature_activated",
    "env.send_inline",
    "env.prints_l",
    "env.get_resource_limits",
];

/// Number of jump table slots.
pub const INTRINSIC_COUNT: usize = INTRINSIC_NAMES.len();

/// A value type in an intrinsic signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntrinsicValue {
    /// `i32`
    I32,
    /// `i64`
    I64,
}

/// The wasm type an import must declare to bind to an intrinsic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntrinsicSignature {
    /// Parameter types.
    pub params: &'static [IntrinsicValue],
    /// Result types.
    pub results: &'static [IntrinsicValue],
}

const fn sig(
    params: &'static [IntrinsicValue],
    results: &'static [IntrinsicValue],
) -> IntrinsicSignature {
    IntrinsicSignature { params, results }
}

use IntrinsicValue::{I32, I64};

/// Signature of every intrinsic, in ordinal order.
pub const INTRINSIC_SIGNATURES: [IntrinsicSignature; INTRINSIC_COUNT] = [
    sig(&[], &[]),
    sig(&[I32, I32], &[I32]),
    sig(&[], &[]),
    sig(&[], &[]),
    sig(&[], &[]),
    sig(&[I32, I32], &[]),
    sig(&[I32, I32, I32], &[]),
    sig(&[I32, I64], &[]),
    sig(&[I32], &[]),
    sig(&[], &[I32]),
    sig(&[I32, I32], &[I32]),
    sig(&[], &[I64]),
    sig(&[], &[I64]),
    sig(&[], &[I64]),
    sig(&[I32], &[I32]),
    sig(&[I32, I32], &[]),
    sig(&[I32, I32], &[]),
    sig(&[I64, I32, I32, I32], &[]),
];

/// Looks up the ordinal of `module.name`.
pub fn find_intrinsic_index(module: &str, name: &str) -> Option<usize> {
    INTRINSIC_NAMES.iter().position(|full| {
        full.split_once('.')
            .is_some_and(|(m, n)| m == module && n == name)
    })
}

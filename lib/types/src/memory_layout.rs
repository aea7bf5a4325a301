//! Address layout of a memory slice, shared by generated code and the
//! executor.
//!
//! Linear memory starts at the *zero page* base. Everything else generated
//! code touches sits just below it, in the prologue:
//!
//! ```text
//!  base - MEMORY_PROLOGUE_SIZE              base - CB_OFFSET          base
//!  | intrinsic jump table (grows down) ...  | control block | table | globals | linear memory ...
//! ```
//!
//! Slot `k` of the jump table is at `base - FIRST_INTRINSIC_OFFSET - 8 * k`.
use crate::constraints::{MAXIMUM_MUTABLE_GLOBALS, MAXIMUM_TABLE_ELEMENTS};
use crate::intrinsics::INTRINSIC_COUNT;

/// Room reserved for the control block.
pub const WCB_ALLOWANCE: u64 = 512;

/// Bytes of mutable global storage.
pub const MUTABLE_GLOBAL_SIZE: u64 = 8 * MAXIMUM_MUTABLE_GLOBALS / 4;

/// Bytes of indirect call table, 16 per element.
pub const TABLE_SIZE: u64 = 16 * MAXIMUM_TABLE_ELEMENTS;

/// Distance from the zero page base down to the control block.
pub const CB_OFFSET: u64 = WCB_ALLOWANCE + MUTABLE_GLOBAL_SIZE + TABLE_SIZE;

/// Distance from the zero page base down to jump table slot 0.
pub const FIRST_INTRINSIC_OFFSET: u64 = CB_OFFSET + 8;

/// Largest globals and table image a module may place in front of memory.
pub const MAX_PROLOGUE_SIZE: u64 = MUTABLE_GLOBAL_SIZE + TABLE_SIZE;

const HOST_PAGE_SIZE: u64 = 4096;

/// Size of the prologue in front of every slice, page aligned.
pub const MEMORY_PROLOGUE_SIZE: u64 =
    (CB_OFFSET + 8 * INTRINSIC_COUNT as u64).div_ceil(HOST_PAGE_SIZE) * HOST_PAGE_SIZE;

/// Distance between two slices.
///
/// Large enough that any 32 bit address plus offset computed from a slice
/// base stays within that slice's reservation.
pub const TOTAL_MEMORY_PER_SLICE: u64 = MEMORY_PROLOGUE_SIZE + 0x2_0000_0000 + HOST_PAGE_SIZE;

/// Slices reserved by threads that only run read-only transactions.
pub const SLICED_PAGES_FOR_RO_THREAD: u64 = 10;

/// Offset of jump table slot `ordinal` below the zero page base.
pub const fn intrinsic_offset(ordinal: usize) -> u64 {
    FIRST_INTRINSIC_OFFSET + 8 * ordinal as u64
}

//! The block of state generated code reads at a fixed offset below the
//! memory base.
use sysvmoc_types::memory_layout::{CB_OFFSET, WCB_ALLOWANCE};

/// Value of [`ControlBlock::magic`] in an initialized prologue.
pub const CONTROL_BLOCK_MAGIC: u64 = 0x5359_5356_4d4f_4342;

/// Per execution state shared between the executor, the intrinsics and
/// generated code, located at `memory_base - CB_OFFSET`.
///
/// Generated code reloads `memory_base` after every call that may grow
/// memory, and decrements `current_call_depth_remaining` on entry to each
/// function, calling the `depth_assert` intrinsic when it reaches zero.
#[derive(Debug)]
#[repr(C)]
pub struct ControlBlock {
    /// [`CONTROL_BLOCK_MAGIC`] once the memory is set up.
    pub magic: u64,
    /// Start of the executable mapping of the code cache.
    pub execution_thread_code_start: u64,
    /// Length of the executable mapping of the code cache.
    pub execution_thread_code_length: u64,
    /// Start of this thread's memory slices.
    pub execution_thread_memory_start: u64,
    /// Length of this thread's memory slices.
    pub execution_thread_memory_length: u64,
    /// Start of the code blob of the running module.
    pub running_code_base: u64,
    /// Base linear memory offsets are relative to for the current size.
    pub memory_base: u64,
    /// Base of the slice holding every sliced page.
    pub full_linear_memory_start: u64,
    /// First linear memory offset that is not accessible.
    pub first_invalid_memory_address: u64,
    /// Pages of linear memory currently granted.
    pub current_linear_memory_pages: u32,
    /// Upper bound for `grow_memory`.
    pub max_linear_memory_pages: u32,
    /// Wasm calls left before `depth_assert` fires.
    pub current_call_depth_remaining: u32,
    /// Non-zero while native code is running.
    pub is_running: u32,
}

const _: () = assert!(std::mem::size_of::<ControlBlock>() as u64 <= WCB_ALLOWANCE);

impl ControlBlock {
    /// Location of the control block for a memory base.
    pub fn locate(memory_base: *mut u8) -> *mut Self {
        memory_base.wrapping_sub(CB_OFFSET as usize).cast()
    }
}

//! Limits every validating node enforces on contract wasm.
//!
//! These values shape the memory slice layout, so changing any of them
//! changes which accesses fault and is a consensus change.

/// Size of one wasm page.
pub const WASM_PAGE_SIZE: u64 = 64 * 1024;

/// Largest linear memory a contract may use.
pub const MAXIMUM_LINEAR_MEMORY: u64 = 33 * 1024 * 1024;

/// Largest linear memory a contract may use, in pages.
pub const MAXIMUM_LINEAR_MEMORY_PAGES: u64 = MAXIMUM_LINEAR_MEMORY / WASM_PAGE_SIZE;

/// Byte budget for mutable globals.
pub const MAXIMUM_MUTABLE_GLOBALS: u64 = 1024;

/// Maximum number of entries in the indirect call table.
pub const MAXIMUM_TABLE_ELEMENTS: u64 = 1024;

/// Maximum number of elements in any one section.
pub const MAXIMUM_SECTION_ELEMENTS: u64 = 8192;

/// Maximum nesting of wasm calls.
pub const MAXIMUM_CALL_DEPTH: u32 = 250;

/// Error codes at or above this value are reserved for the system and may
/// not be raised by contracts through `sysio_assert_code`.
pub const SYSTEM_ERROR_CODE_GENERIC_EXCEPTION: u64 = 10_000_000_000_000_000_000;

//! The `sysvmoc-cache` crate keeps compiled contract code in a file
//! shared by the node and the compile monitor.
//!
//! [`CodeCache`] is the node side: it indexes descriptors, asks the
//! monitor for code it does not have and decides what to evict. The
//! [`CacheAllocator`] manages space inside the file and is used by the
//! monitor to store what it compiles.

#![deny(missing_docs, trivial_numeric_casts, unused_extern_crates)]
#![warn(unused_import_braces)]

mod allocator;
mod code_cache;
mod error;
mod file;
mod layout;

pub use crate::allocator::{CacheAllocator, HEAP_START};
pub use crate::code_cache::{CodeCache, CodeSource};
pub use crate::error::{CacheError, CodeCacheError};
pub use crate::file::MINIMUM_CACHE_SIZE;
pub use crate::layout::{CACHE_FILE_NAME, TOTAL_HEADER_SIZE};

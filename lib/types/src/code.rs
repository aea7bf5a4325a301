use crate::Digest;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Version of the native code layout produced by the compile monitor.
///
/// Descriptors persisted with any other version are discarded when the
/// code cache is opened.
pub const CURRENT_CODEGEN_VERSION: u8 = 1;

/// Identity of a piece of contract code.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CodeTuple {
    /// Digest of the wasm bytes.
    pub code_id: Digest,
    /// VM version the code was deployed with.
    pub vm_version: u8,
}

impl CodeTuple {
    /// Creates a new code tuple.
    pub const fn new(code_id: Digest, vm_version: u8) -> Self {
        Self {
            code_id,
            vm_version,
        }
    }
}

impl fmt::Display for CodeTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.code_id, self.vm_version)
    }
}

/// How the wasm start function is reached, if the module has one.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StartOffset {
    /// The module has no start function.
    NoOffset,
    /// The start function is generated code at this offset from `code_begin`.
    CodeOffset {
        /// Offset from the start of the code blob.
        offset: u64,
    },
    /// The start function is an imported host intrinsic.
    IntrinsicOrdinal {
        /// Ordinal in the intrinsic jump table.
        ordinal: u64,
    },
}

/// Everything an executor needs to run one compiled module.
///
/// All offsets are relative to the code cache mapping that produced the
/// descriptor and are meaningless against any other cache file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CodeDescriptor {
    pub code_hash: Digest,
    pub vm_version: u8,
    pub codegen_version: u8,
    /// Offset of the native code in the cache file.
    pub code_begin: u64,
    pub start: StartOffset,
    /// Offset of `apply` from `code_begin`.
    pub apply_offset: u32,
    pub starting_memory_pages: i32,
    /// Offset of the initial data snapshot in the cache file.
    pub initdata_begin: u64,
    pub initdata_size: u32,
    /// Bytes of the snapshot copied in front of linear memory (globals and
    /// table), the remainder is the linear memory image.
    pub initdata_prologue_size: u32,
}

impl CodeDescriptor {
    /// The key this descriptor is cached under.
    pub fn code_tuple(&self) -> CodeTuple {
        CodeTuple::new(self.code_hash, self.vm_version)
    }
}

/// Terminal state of one native execution.
///
/// The discriminants are the values the generated code and the trap
/// handler unwind with.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ExitCode {
    /// `sysio_exit` was called or the entry point returned.
    CleanExit = 1,
    /// The transaction deadline expired while native code was running.
    CheckTimeFail = 2,
    /// Access outside of the granted linear memory.
    Segv = 3,
    /// A host intrinsic raised an error.
    Exception = 4,
}

impl ExitCode {
    /// Decodes the value passed through the non-local exit.
    pub fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            1 => Some(Self::CleanExit),
            2 => Some(Self::CheckTimeFail),
            3 => Some(Self::Segv),
            4 => Some(Self::Exception),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_decode() {
        for code in [
            ExitCode::CleanExit,
            ExitCode::CheckTimeFail,
            ExitCode::Segv,
            ExitCode::Exception,
        ] {
            assert_eq!(ExitCode::from_raw(code as i32), Some(code));
        }
        assert_eq!(ExitCode::from_raw(0), None);
        assert_eq!(ExitCode::from_raw(5), None);
    }

    #[test]
    fn descriptor_knows_its_key() {
        let desc = CodeDescriptor {
            code_hash: Digest::hash(b"code"),
            vm_version: 3,
            codegen_version: CURRENT_CODEGEN_VERSION,
            code_begin: 1024,
            start: StartOffset::NoOffset,
            apply_offset: 0,
            starting_memory_pages: 1,
            initdata_begin: 2048,
            initdata_size: 0,
            initdata_prologue_size: 0,
        };
        assert_eq!(desc.code_tuple(), CodeTuple::new(Digest::hash(b"code"), 3));
    }
}

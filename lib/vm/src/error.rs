use std::io;
use thiserror::Error;

/// A memory slice set could not be set up.
///
/// These are resource failures of the host, not of contract code.
#[derive(Error, Debug)]
pub enum MemoryError {
    /// More slices were asked for than a contract can ever use.
    #[error("{requested} sliced pages requested, at most {maximum} are supported")]
    TooManyPages {
        /// Pages requested.
        requested: u64,
        /// Largest supported count.
        maximum: u64,
    },
    /// The shared prologue file could not be created or sized.
    #[error("could not create memory slice backing file: {0}")]
    Backing(#[source] io::Error),
    /// The address space for the slices could not be reserved.
    #[error("could not reserve {size} bytes for memory slices: {source}")]
    Reserve {
        /// Bytes requested.
        size: usize,
        /// Underlying OS error.
        source: io::Error,
    },
    /// One slice could not be mapped over the reservation.
    #[error("could not map memory slice {slice}: {source}")]
    MapSlice {
        /// Index of the slice.
        slice: u64,
        /// Underlying OS error.
        source: io::Error,
    },
}

/// An error raised by a host intrinsic on behalf of the contract.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HostError {
    /// `sysio_assert` or `sysio_assert_message` failed.
    #[error("assertion failure with message: {0}")]
    AssertFailed(String),
    /// `sysio_assert_code` failed.
    #[error("assertion failure with error code: {0}")]
    AssertCode(u64),
    /// `sysio_assert_code` was called with a code reserved for the system.
    #[error("contract used the restricted error code value {0}")]
    RestrictedErrorCode(u64),
    /// The contract executed `unreachable`.
    #[error("unreachable instruction executed")]
    Unreachable,
    /// The wasm call stack is too deep.
    #[error("exceeded call depth maximum")]
    CallDepthExceeded,
    /// An indirect call used a function of the wrong type.
    #[error("indirect call function type mismatch")]
    IndirectCallMismatch,
    /// An indirect call went past the end of the table.
    #[error("indirect call index out of bounds")]
    IndirectCallOutOfBounds,
    /// The node refused an inline action.
    #[error("inline action rejected: {0}")]
    InlineAction(String),
    /// A host function panicked.
    #[error("host function panicked: {0}")]
    Panic(String),
}

/// Why an execution did not complete.
#[derive(Error, Debug)]
pub enum ExecutionError {
    /// The transaction deadline passed while the contract was running.
    #[error("deadline exceeded")]
    DeadlineExceeded,
    /// The contract accessed memory it was not granted.
    #[error("access violation")]
    AccessViolation,
    /// A host intrinsic raised an error.
    #[error(transparent)]
    Host(#[from] HostError),
    /// The descriptor does not fit the mapped code cache.
    #[error("invalid code descriptor: {0}")]
    InvalidDescriptor(String),
    /// The memory slices for the executing thread could not be created.
    #[error(transparent)]
    Memory(#[from] MemoryError),
    /// Changing page protections or installing the signal stack failed.
    #[error("could not set up protections: {0}")]
    Protection(String),
}

impl ExecutionError {
    /// `true` when the failure was caused by contract code and would be
    /// observed identically by every node.
    pub fn is_deterministic(&self) -> bool {
        matches!(self, Self::AccessViolation | Self::Host(_))
    }
}

impl From<region::Error> for ExecutionError {
    fn from(err: region::Error) -> Self {
        Self::Protection(err.to_string())
    }
}

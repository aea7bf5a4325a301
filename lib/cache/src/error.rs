use std::io;
use std::sync::Arc;
use sysvmoc_ipc::IpcError;
use sysvmoc_types::CodeTuple;
use thiserror::Error;

/// The code cache file could not be opened or used.
#[derive(Error, Debug)]
pub enum CacheError {
    /// An IO error
    #[error(transparent)]
    Io(#[from] io::Error),
    /// The configured size cannot hold the headers and any code.
    #[error("code cache size {0} is too small")]
    TooSmall(u64),
    /// The file is not a code cache of this format.
    #[error("code cache file has an incompatible header")]
    IncompatibleHeader,
    /// The file was not closed cleanly.
    #[error("code cache file is dirty")]
    Dirty,
    /// Allocator or index structures are damaged.
    #[error("code cache is corrupt: {0}")]
    Corrupt(String),
    /// No session could be opened with the compile monitor.
    #[error("could not connect to the compile monitor: {0}")]
    Monitor(#[from] IpcError),
}

/// A descriptor could not be produced for some code.
///
/// Cloneable so that every thread waiting on the same compile receives
/// the same failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodeCacheError {
    /// The compile monitor had no room in the cache for the code.
    #[error("code cache is full")]
    CacheFull,
    /// The compile monitor could not compile the code.
    #[error("failed to compile wasm {0}")]
    CompileFailed(CodeTuple),
    /// No wasm bytes are known for the code.
    #[error("no wasm code registered for {0}")]
    CodeNotFound(CodeTuple),
    /// The compile monitor did not answer properly. Shared so that every
    /// waiter gets the same error.
    #[error("compile monitor unavailable: {0}")]
    Monitor(Arc<IpcError>),
}

impl CodeCacheError {
    /// `true` for failures caused by lack of cache space rather than by a
    /// defect, so node policy may evict and retry.
    pub fn is_capacity_failure(&self) -> bool {
        matches!(self, Self::CacheFull)
    }
}

impl From<IpcError> for CodeCacheError {
    fn from(err: IpcError) -> Self {
        Self::Monitor(Arc::new(err))
    }
}

impl From<io::Error> for CodeCacheError {
    fn from(err: io::Error) -> Self {
        Self::Monitor(Arc::new(IpcError::Io(err)))
    }
}

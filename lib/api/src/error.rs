use sysvmoc_cache::{CacheError, CodeCacheError};
use sysvmoc_vm::{ExecutionError, MemoryError};
use thiserror::Error;

/// The runtime could not be started.
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// The code cache could not be opened.
    #[error(transparent)]
    Cache(#[from] CacheError),
    /// The main thread's executor or memory could not be created.
    #[error(transparent)]
    Execution(#[from] ExecutionError),
}

impl From<MemoryError> for RuntimeError {
    fn from(err: MemoryError) -> Self {
        Self::Execution(err.into())
    }
}

/// An action could not be applied.
#[derive(Error, Debug)]
pub enum ApplyError {
    /// No native code could be obtained for the module.
    #[error("could not instantiate module: {0}")]
    Instantiation(#[from] CodeCacheError),
    /// The native code did not run to completion.
    #[error(transparent)]
    Execution(#[from] ExecutionError),
}

impl ApplyError {
    /// `true` when the code cache ran out of room. Evicting code and
    /// retrying may help, unlike for any other failure.
    pub fn is_capacity_failure(&self) -> bool {
        matches!(self, Self::Instantiation(err) if err.is_capacity_failure())
    }

    /// `true` when every node applying the same action fails the same way.
    pub fn is_deterministic(&self) -> bool {
        matches!(self, Self::Execution(err) if err.is_deterministic())
    }
}

impl From<MemoryError> for ApplyError {
    fn from(err: MemoryError) -> Self {
        Self::Execution(err.into())
    }
}

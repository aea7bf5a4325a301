use std::io;
use thiserror::Error;

/// A module could not be turned into native code.
#[derive(Error, Debug)]
pub enum CompileError {
    /// The module did not pass validation.
    #[error("invalid wasm: {0}")]
    Invalid(String),

    /// The module has no exported `apply` function.
    #[error("module does not export an apply function")]
    MissingApply,

    /// A function import that is not a known intrinsic.
    #[error("unknown import {module}.{name}")]
    UnknownImport {
        /// Import module name.
        module: String,
        /// Import field name.
        name: String,
    },

    /// A known intrinsic imported with a type other than its own.
    #[error("import {module}.{name} does not match the signature of the intrinsic")]
    ImportSignatureMismatch {
        /// Import module name.
        module: String,
        /// Import field name.
        name: String,
    },

    /// The module is valid wasm but exceeds what the node accepts.
    #[error("limit exceeded: {0}")]
    LimitExceeded(String),

    /// The code generator failed.
    #[error("code generation failed: {0}")]
    Codegen(String),

    /// The compile was abandoned before it finished.
    #[error("compile cancelled")]
    Cancelled,

    /// An IO error
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl From<wasmparser::BinaryReaderError> for CompileError {
    fn from(err: wasmparser::BinaryReaderError) -> Self {
        Self::Invalid(err.message().into())
    }
}

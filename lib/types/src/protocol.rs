//! Messages exchanged with the compile monitor.
//!
//! Every message travels as one datagram holding the bincode encoding of
//! [`SysVmOcMessage`], optionally accompanied by passed file descriptors.
//! The descriptors a message expects are listed on each variant.
use crate::{CodeDescriptor, CodeTuple, OcConfig};
use serde::{Deserialize, Serialize};

/// Opens a monitor session.
///
/// Descriptors: the session's communication socket, the code cache file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitializeMessage;

/// Reply to [`InitializeMessage`], sent on the session socket.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitializeResponseMessage {
    /// `None` when the session is ready.
    pub error_message: Option<String>,
}

/// Requests native code for one module.
///
/// Descriptors: a socket for the [`WasmCompilationResultMessage`], a memfd
/// holding the wasm bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompileWasmMessage {
    pub code: CodeTuple,
    pub config: OcConfig,
}

/// Releases the cache storage of the listed descriptors. No reply.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvictWasmsMessage {
    pub codes: Vec<CodeDescriptor>,
}

/// Sent by a compile worker to its session.
///
/// Descriptors: a memfd with the native code, a memfd with the initial
/// data snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeCompilationResultMessage {
    pub start: crate::StartOffset,
    pub apply_offset: u32,
    pub starting_memory_pages: i32,
    pub initdata_prologue_size: u32,
}

/// Outcome of one compile request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WasmCompilationResult {
    /// The code is in the cache.
    Descriptor(CodeDescriptor),
    /// Compilation failed for a reason other than space.
    UnknownFailure,
    /// The cache has no room for the generated code.
    TooFull,
}

/// Reply to [`CompileWasmMessage`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WasmCompilationResultMessage {
    pub code: CodeTuple,
    pub result: WasmCompilationResult,
    /// Free bytes left in the cache after this compile.
    pub cache_free_bytes: u64,
}

/// Every valid message of the protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SysVmOcMessage {
    Initialize(InitializeMessage),
    InitializeResponse(InitializeResponseMessage),
    CompileWasm(CompileWasmMessage),
    EvictWasms(EvictWasmsMessage),
    CodeCompilationResult(CodeCompilationResultMessage),
    WasmCompilationResult(WasmCompilationResultMessage),
}

impl SysVmOcMessage {
    /// Short name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Initialize(_) => "initialize",
            Self::InitializeResponse(_) => "initialize_response",
            Self::CompileWasm(_) => "compile_wasm",
            Self::EvictWasms(_) => "evict_wasms",
            Self::CodeCompilationResult(_) => "code_compilation_result",
            Self::WasmCompilationResult(_) => "wasm_compilation_result",
        }
    }
}

macro_rules! impl_from_message {
    ($($ty:ident => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for SysVmOcMessage {
                fn from(message: $ty) -> Self {
                    Self::$variant(message)
                }
            }
        )*
    };
}

impl_from_message! {
    InitializeMessage => Initialize,
    InitializeResponseMessage => InitializeResponse,
    CompileWasmMessage => CompileWasm,
    EvictWasmsMessage => EvictWasms,
    CodeCompilationResultMessage => CodeCompilationResult,
    WasmCompilationResultMessage => WasmCompilationResult,
}

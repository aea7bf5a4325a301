//! The seam between module preparation and a native code backend.
use crate::error::CompileError;
use crate::prepare::{prepare, ModuleLayout};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use sysvmoc_types::memory_layout::MAX_PROLOGUE_SIZE;
use sysvmoc_types::{OcConfig, StartOffset};

/// Output of a [`CodeGenerator`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GeneratedCode {
    /// Position independent native code.
    pub code: Vec<u8>,
    /// Offset in `code` of each defined function, in function index order.
    pub function_offsets: Vec<u32>,
    /// Globals and table image, copied right below linear memory before
    /// every call.
    pub prologue: Vec<u8>,
}

/// Set when the compile a generator is working on is no longer wanted,
/// e.g. because it ran past the cpu limit.
#[derive(Debug, Clone, Default)]
pub struct Cancellation(Arc<AtomicBool>);

impl Cancellation {
    /// A flag that is not set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Asks the compile to stop.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Whether [`Cancellation::cancel`] was called.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Fails with [`CompileError::Cancelled`] once cancelled.
    pub fn check(&self) -> Result<(), CompileError> {
        if self.is_cancelled() {
            return Err(CompileError::Cancelled);
        }
        Ok(())
    }
}

/// Emits native code for a prepared module.
///
/// Generated functions address linear memory relative to the zero page
/// base passed as the last argument of `apply`, and reach intrinsics and
/// the control block through the offsets in
/// [`sysvmoc_types::memory_layout`].
pub trait CodeGenerator: Send + Sync {
    /// Generates code for every function of `module`.
    ///
    /// Long running generators should poll `cancel` and give up once it is
    /// set; the compile is waited for until they do.
    fn generate(
        &self,
        module: &ModuleLayout<'_>,
        cancel: &Cancellation,
    ) -> Result<GeneratedCode, CompileError>;
}

/// A compiled module, not yet placed in the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledModule {
    /// Native code.
    pub code: Vec<u8>,
    /// The prologue image followed by the initial memory image.
    pub initdata: Vec<u8>,
    /// Length of the prologue image at the front of `initdata`.
    pub initdata_prologue_size: u32,
    /// How the start function is reached.
    pub start: StartOffset,
    /// Offset of `apply` in `code`.
    pub apply_offset: u32,
    /// Initial size of linear memory.
    pub starting_memory_pages: i32,
}

/// Prepares `wasm`, runs `generator` on it and enforces the compile limits
/// of `config`.
pub fn compile_module(
    generator: &dyn CodeGenerator,
    wasm: &[u8],
    config: &OcConfig,
    cancel: &Cancellation,
) -> Result<CompiledModule, CompileError> {
    let module = prepare(wasm)?;
    if let Some(limit) = config.vm_limit {
        let needed = (wasm.len() + module.initial_memory.len()) as u64;
        if needed > limit {
            return Err(CompileError::LimitExceeded(format!(
                "module needs {needed} bytes, the limit is {limit}"
            )));
        }
    }

    cancel.check()?;
    let generated = generator.generate(&module, cancel)?;
    cancel.check()?;
    if generated.function_offsets.len() != module.functions.len() {
        return Err(CompileError::Codegen(format!(
            "{} function offsets for {} functions",
            generated.function_offsets.len(),
            module.functions.len()
        )));
    }
    if generated.prologue.len() as u64 > MAX_PROLOGUE_SIZE {
        return Err(CompileError::Codegen(format!(
            "prologue of {} bytes",
            generated.prologue.len()
        )));
    }
    if let Some(limit) = config.generated_code_size_limit {
        if generated.code.len() as u64 > limit {
            return Err(CompileError::LimitExceeded(format!(
                "{} bytes of generated code",
                generated.code.len()
            )));
        }
    }

    let offset_of = |index: u32| {
        module
            .defined_index(index)
            .map(|defined| generated.function_offsets[defined])
    };
    let apply_offset = offset_of(module.apply).ok_or(CompileError::MissingApply)?;
    let start = match module.start {
        None => StartOffset::NoOffset,
        Some(index) => match offset_of(index) {
            Some(offset) => StartOffset::CodeOffset {
                offset: u64::from(offset),
            },
            None => StartOffset::IntrinsicOrdinal {
                ordinal: module.imports[index as usize].ordinal as u64,
            },
        },
    };

    let initdata_prologue_size = generated.prologue.len() as u32;
    let mut initdata = generated.prologue;
    initdata.extend_from_slice(&module.initial_memory);
    Ok(CompiledModule {
        code: generated.code,
        initdata,
        initdata_prologue_size,
        start,
        apply_offset,
        starting_memory_pages: module.starting_memory_pages as i32,
    })
}

//! Runs one compile on a dedicated worker thread.
//!
//! The worker reports back over a socket pair exactly like the monitor
//! talks to the node: a `code_compilation_result_message` carrying two
//! memfds, one with the native code and one with the initial data. A worker
//! that fails just hangs up. A worker still running at the cpu limit is
//! cancelled and joined, so no compile outlives its request.
use crate::codegen::{compile_module, Cancellation, CodeGenerator};
use crate::error::CompileError;
use socket2::Socket;
use std::os::fd::{AsFd, OwnedFd};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use sysvmoc_ipc::{
    memfd_for_bytearray, read_message_with_fds_from_socket, seqpacket_pair, vector_for_memfd,
    write_message_with_fds, IpcError,
};
use sysvmoc_types::protocol::CodeCompilationResultMessage;
use sysvmoc_types::{OcConfig, SysVmOcMessage};

pub(crate) struct CompileOutput {
    pub result: CodeCompilationResultMessage,
    pub code: Vec<u8>,
    pub initdata: Vec<u8>,
}

/// Compiles `wasm` on a new worker thread and waits for it, at most
/// `cpu_limit`.
pub(crate) fn run_compile_trampoline(
    generator: Arc<dyn CodeGenerator>,
    wasm: Vec<u8>,
    config: &OcConfig,
) -> Result<CompileOutput, CompileError> {
    let (ours, theirs) = seqpacket_pair()?;
    let mut builder = thread::Builder::new().name("sysvmoc-compile".into());
    if let Some(stack_size) = config.stack_size_limit {
        builder = builder.stack_size(stack_size as usize);
    }
    let worker_config = config.clone();
    let cancel = Cancellation::new();
    let worker_cancel = cancel.clone();
    let worker = builder.spawn(move || {
        compile_and_report(&*generator, &wasm, &worker_config, &worker_cancel, theirs)
    })?;

    let received = wait_for_worker(&ours, config.cpu_limit);
    if received.is_err() {
        cancel.cancel();
    }
    if worker.join().is_err() {
        tracing::warn!("compile worker panicked");
    }
    let (message, fds) = received?;
    match (message, fds.as_slice()) {
        (SysVmOcMessage::CodeCompilationResult(result), [code, initdata]) => Ok(CompileOutput {
            result,
            code: vector_for_memfd(code.as_fd())?,
            initdata: vector_for_memfd(initdata.as_fd())?,
        }),
        (other, _) => Err(CompileError::Codegen(format!(
            "compile worker sent {}",
            other.kind()
        ))),
    }
}

fn wait_for_worker(
    socket: &Socket,
    cpu_limit: Option<Duration>,
) -> Result<(SysVmOcMessage, Vec<OwnedFd>), CompileError> {
    socket.set_read_timeout(cpu_limit)?;
    read_message_with_fds_from_socket(socket).map_err(|err| match err {
        IpcError::Timeout => CompileError::LimitExceeded("compile exceeded the cpu limit".into()),
        IpcError::Closed => CompileError::Codegen("compile worker gave up".into()),
        other => CompileError::Codegen(other.to_string()),
    })
}

fn compile_and_report(
    generator: &dyn CodeGenerator,
    wasm: &[u8],
    config: &OcConfig,
    cancel: &Cancellation,
    socket: Socket,
) {
    let compiled = match compile_module(generator, wasm, config, cancel) {
        Ok(compiled) => compiled,
        Err(err) => {
            tracing::warn!(error = %err, "compile failed");
            return;
        }
    };
    tracing::debug!(
        code_size = compiled.code.len(),
        initdata_size = compiled.initdata.len(),
        "compiled"
    );

    let report = || -> Result<(), IpcError> {
        let code = memfd_for_bytearray(&compiled.code)?;
        let initdata = memfd_for_bytearray(&compiled.initdata)?;
        let message = SysVmOcMessage::CodeCompilationResult(CodeCompilationResultMessage {
            start: compiled.start,
            apply_offset: compiled.apply_offset,
            starting_memory_pages: compiled.starting_memory_pages,
            initdata_prologue_size: compiled.initdata_prologue_size,
        });
        write_message_with_fds(socket.as_fd(), &message, &[code.as_fd(), initdata.as_fd()])
    };
    if let Err(err) = report() {
        tracing::warn!(error = %err, "could not report compile result");
    }
}

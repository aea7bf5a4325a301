//! One node's connection to the compile monitor.
use crate::codegen::CodeGenerator;
use crate::trampoline::{run_compile_trampoline, CompileOutput};
use memmap2::MmapMut;
use parking_lot::Mutex;
use socket2::Socket;
use std::collections::VecDeque;
use std::fs::File;
use std::os::fd::{AsFd, OwnedFd};
use std::sync::Arc;
use std::thread;
use sysvmoc_cache::{CacheAllocator, CacheError};
use sysvmoc_ipc::{read_message_with_fds, vector_for_memfd, write_message_with_fds, IpcError};
use sysvmoc_types::protocol::{
    CompileWasmMessage, EvictWasmsMessage, WasmCompilationResult, WasmCompilationResultMessage,
};
use sysvmoc_types::{CodeDescriptor, SysVmOcMessage, CURRENT_CODEGEN_VERSION};

pub(crate) struct Session {
    socket: Socket,
    cache: Mutex<MmapMut>,
    generator: Arc<dyn CodeGenerator>,
}

impl Session {
    /// Maps the node's cache file and checks its allocator is usable.
    pub fn map_cache(cache_file: &File) -> Result<MmapMut, CacheError> {
        // SAFETY: the node only touches the allocator while no session is
        // open, and only reads code we finished writing.
        let mut map = unsafe { MmapMut::map_mut(cache_file)? };
        CacheAllocator::open(&mut map)?;
        Ok(map)
    }

    pub fn new(socket: Socket, map: MmapMut, generator: Arc<dyn CodeGenerator>) -> Self {
        Self {
            socket,
            cache: Mutex::new(map),
            generator,
        }
    }

    /// Serves requests until the node shuts its end down, then waits for
    /// compiles still running and hangs up.
    pub fn run(self) {
        tracing::info!("compile monitor session started");
        thread::scope(|scope| {
            let mut running = VecDeque::new();
            loop {
                let (message, fds) = match read_message_with_fds(self.socket.as_fd()) {
                    Ok(received) => received,
                    Err(IpcError::Closed) => break,
                    Err(err @ (IpcError::Io(_) | IpcError::Timeout)) => {
                        tracing::warn!(error = %err, "compile monitor session failed");
                        break;
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "dropping garbled message");
                        continue;
                    }
                };
                match message {
                    SysVmOcMessage::CompileWasm(request) => {
                        let limit = request.config.threads.max(1) as usize;
                        while running.len() >= limit {
                            if let Some(oldest) = running.pop_front() {
                                let _ = oldest.join();
                            }
                        }
                        let session = &self;
                        running.push_back(scope.spawn(move || session.compile(request, fds)));
                    }
                    SysVmOcMessage::EvictWasms(evict) => self.evict(evict),
                    other => {
                        tracing::warn!(kind = other.kind(), "unexpected message in session");
                    }
                }
            }
        });
        tracing::info!("compile monitor session ended");
    }

    fn compile(&self, request: CompileWasmMessage, fds: Vec<OwnedFd>) {
        let [reply_to, wasm] = match <[OwnedFd; 2]>::try_from(fds) {
            Ok(fds) => fds,
            Err(fds) => {
                tracing::warn!(count = fds.len(), "compile request without its two descriptors");
                return;
            }
        };
        let code = request.code;
        let result = match vector_for_memfd(wasm.as_fd()) {
            Ok(wasm) => {
                tracing::debug!(code = %code, size = wasm.len(), "compiling");
                match run_compile_trampoline(self.generator.clone(), wasm, &request.config) {
                    Ok(output) => self.store(&request, output),
                    Err(err) => {
                        tracing::warn!(code = %code, error = %err, "compile failed");
                        WasmCompilationResult::UnknownFailure
                    }
                }
            }
            Err(err) => {
                tracing::warn!(code = %code, error = %err, "could not read wasm");
                WasmCompilationResult::UnknownFailure
            }
        };

        let reply = SysVmOcMessage::WasmCompilationResult(WasmCompilationResultMessage {
            code,
            result: result.clone(),
            cache_free_bytes: self.free_bytes(),
        });
        if let Err(err) = write_message_with_fds(reply_to.as_fd(), &reply, &[]) {
            tracing::warn!(code = %code, error = %err, "requester went away");
            if let WasmCompilationResult::Descriptor(descriptor) = result {
                self.release(&descriptor);
            }
        }
    }

    /// Copies compiled code and initial data into the cache.
    fn store(&self, request: &CompileWasmMessage, output: CompileOutput) -> WasmCompilationResult {
        let mut map = self.cache.lock();
        let mut allocator = match CacheAllocator::open(&mut map) {
            Ok(allocator) => allocator,
            Err(err) => {
                tracing::warn!(error = %err, "code cache is unusable");
                return WasmCompilationResult::UnknownFailure;
            }
        };

        let Some(code_begin) = allocator.allocate(output.code.len() as u64) else {
            return WasmCompilationResult::TooFull;
        };
        let Some(initdata_begin) = allocator.allocate(output.initdata.len() as u64) else {
            let _ = allocator.deallocate(code_begin);
            return WasmCompilationResult::TooFull;
        };
        let written = allocator
            .write_allocation(code_begin, &output.code)
            .and_then(|()| allocator.write_allocation(initdata_begin, &output.initdata));
        if let Err(err) = written {
            tracing::warn!(code = %request.code, error = %err, "could not copy compiled code into the cache");
            let _ = allocator.deallocate(code_begin);
            let _ = allocator.deallocate(initdata_begin);
            return WasmCompilationResult::UnknownFailure;
        }

        WasmCompilationResult::Descriptor(CodeDescriptor {
            code_hash: request.code.code_id,
            vm_version: request.code.vm_version,
            codegen_version: CURRENT_CODEGEN_VERSION,
            code_begin,
            start: output.result.start,
            apply_offset: output.result.apply_offset,
            starting_memory_pages: output.result.starting_memory_pages,
            initdata_begin,
            initdata_size: output.initdata.len() as u32,
            initdata_prologue_size: output.result.initdata_prologue_size,
        })
    }

    fn evict(&self, evict: EvictWasmsMessage) {
        tracing::debug!(count = evict.codes.len(), "evicting");
        for descriptor in &evict.codes {
            self.release(descriptor);
        }
    }

    fn release(&self, descriptor: &CodeDescriptor) {
        let mut map = self.cache.lock();
        let released = CacheAllocator::open(&mut map).and_then(|mut allocator| {
            allocator.deallocate(descriptor.code_begin)?;
            allocator.deallocate(descriptor.initdata_begin)
        });
        if let Err(err) = released {
            tracing::warn!(code = %descriptor.code_tuple(), error = %err, "could not release code");
        }
    }

    fn free_bytes(&self) -> u64 {
        let mut map = self.cache.lock();
        CacheAllocator::open(&mut map).map_or(0, |allocator| allocator.free_bytes())
    }
}

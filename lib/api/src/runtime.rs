use crate::code_registry::CodeRegistry;
use crate::error::{ApplyError, RuntimeError};
use crate::thread_registry::{ThreadRegistry, ThreadResources};
use parking_lot::Mutex;
use std::os::fd::BorrowedFd;
use std::path::Path;
use std::sync::Arc;
use std::thread::{self, ThreadId};
use sysvmoc_cache::CodeCache;
use sysvmoc_types::memory_layout::SLICED_PAGES_FOR_RO_THREAD;
use sysvmoc_types::{CodeTuple, Digest, OcConfig};
use sysvmoc_vm::{ApplyContext, ExecutionError};

/// What the node's apply logic needs from a wasm backend.
pub trait WasmRuntimeInterface: Send + Sync {
    /// Prepares `code` for execution. Compilation may be deferred to the
    /// first [`WasmInstantiatedModuleInterface::apply`].
    fn instantiate_module(
        &self,
        code: &[u8],
        code_hash: Digest,
        vm_type: u8,
        vm_version: u8,
    ) -> Box<dyn WasmInstantiatedModuleInterface>;

    /// Sets up the calling thread for execution. Threads other than the
    /// one that created the runtime call this before their first action.
    fn init_thread_local_data(&self) -> Result<(), RuntimeError>;
}

/// A module ready to apply actions.
pub trait WasmInstantiatedModuleInterface: Send + Sync {
    /// Runs the module's `apply` for the action of `context` on the
    /// calling thread.
    fn apply(&self, context: &mut dyn ApplyContext) -> Result<(), ApplyError>;
}

struct RuntimeInner {
    code_cache: CodeCache,
    codes: Arc<CodeRegistry>,
    threads: ThreadRegistry,
    main_thread: ThreadId,
    main_thread_sliced_pages: u64,
}

impl RuntimeInner {
    fn sliced_pages_for_current_thread(&self) -> u64 {
        if thread::current().id() == self.main_thread {
            self.main_thread_sliced_pages
        } else {
            SLICED_PAGES_FOR_RO_THREAD
        }
    }

    fn thread_resources(&self) -> Result<Arc<Mutex<ThreadResources>>, ExecutionError> {
        self.threads
            .get_or_init(&self.code_cache, self.sliced_pages_for_current_thread())
    }
}

/// The OC runtime: a code cache fed by a compile monitor, and an executor
/// with its memory for each thread applying actions.
///
/// The thread creating the runtime is the main thread and gets memory
/// slices for [`OcConfig::main_thread_sliced_pages`] pages; other threads
/// get a few slices and grow into private pages past them.
#[derive(Clone)]
pub struct SysVmOcRuntime {
    inner: Arc<RuntimeInner>,
}

impl SysVmOcRuntime {
    /// Opens the code cache in `data_dir`, connects it to the compile
    /// monitor listening on `monitor_service` and prepares the calling
    /// thread for execution.
    pub fn new(
        data_dir: impl AsRef<Path>,
        config: OcConfig,
        monitor_service: BorrowedFd<'_>,
    ) -> Result<Self, RuntimeError> {
        let codes = Arc::new(CodeRegistry::default());
        let main_thread_sliced_pages = config.main_thread_sliced_pages;
        let code_cache = CodeCache::new(data_dir, config, codes.clone(), monitor_service)?;
        let inner = RuntimeInner {
            code_cache,
            codes,
            threads: ThreadRegistry::default(),
            main_thread: thread::current().id(),
            main_thread_sliced_pages,
        };
        inner.thread_resources()?;
        tracing::info!(
            cache = %inner.code_cache.path().display(),
            cached = inner.code_cache.len(),
            main_thread_sliced_pages,
            "started OC runtime"
        );
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Registers `code` for compilation and returns a module running it.
    ///
    /// `vm_type` only selects this backend and is not otherwise used.
    pub fn instantiate_module(
        &self,
        code: &[u8],
        code_hash: Digest,
        vm_type: u8,
        vm_version: u8,
    ) -> WasmInstantiatedModule {
        let tuple = CodeTuple::new(code_hash, vm_version);
        self.inner.codes.acquire(tuple, code);
        tracing::trace!(
            code_hash = %code_hash,
            vm_type,
            vm_version,
            modules = self.inner.codes.modules(&tuple),
            "instantiated module"
        );
        WasmInstantiatedModule {
            runtime: self.inner.clone(),
            tuple,
        }
    }

    /// Creates the executor and memory of the calling thread, if it has
    /// none yet.
    pub fn init_thread_local_data(&self) -> Result<(), RuntimeError> {
        self.inner.thread_resources()?;
        Ok(())
    }

    /// `true` if the calling thread has its executor and memory.
    pub fn has_thread_local_data(&self) -> bool {
        self.inner.threads.contains_current()
    }

    /// Number of threads holding an executor and memory.
    pub fn executor_threads(&self) -> usize {
        self.inner.threads.len()
    }

    /// The code cache, for block lifecycle notifications such as
    /// [`CodeCache::current_lib`].
    pub fn code_cache(&self) -> &CodeCache {
        &self.inner.code_cache
    }
}

impl WasmRuntimeInterface for SysVmOcRuntime {
    fn instantiate_module(
        &self,
        code: &[u8],
        code_hash: Digest,
        vm_type: u8,
        vm_version: u8,
    ) -> Box<dyn WasmInstantiatedModuleInterface> {
        Box::new(Self::instantiate_module(self, code, code_hash, vm_type, vm_version))
    }

    fn init_thread_local_data(&self) -> Result<(), RuntimeError> {
        Self::init_thread_local_data(self)
    }
}

/// A module of a [`SysVmOcRuntime`].
///
/// The native code is looked up, and compiled if needed, on every
/// [`WasmInstantiatedModule::apply`]. Dropping the last module of some
/// code releases it from the code cache.
pub struct WasmInstantiatedModule {
    runtime: Arc<RuntimeInner>,
    tuple: CodeTuple,
}

impl WasmInstantiatedModule {
    /// Digest of the module's wasm.
    pub fn code_hash(&self) -> &Digest {
        &self.tuple.code_id
    }

    /// Runs `apply` for the action of `context` on the calling thread.
    ///
    /// The descriptor is held until the call returns, so the code cannot
    /// be evicted while it runs.
    pub fn apply(&self, context: &mut dyn ApplyContext) -> Result<(), ApplyError> {
        let descriptor = self.runtime.code_cache.get_descriptor_for_code_sync(
            &self.tuple.code_id,
            self.tuple.vm_version,
            context.is_write_window(),
        )?;
        let resources = self.runtime.thread_resources()?;
        let mut resources = resources.lock();
        let ThreadResources { executor, memory } = &mut *resources;
        executor.execute(&descriptor, memory, context)?;
        Ok(())
    }
}

impl WasmInstantiatedModuleInterface for WasmInstantiatedModule {
    fn apply(&self, context: &mut dyn ApplyContext) -> Result<(), ApplyError> {
        Self::apply(self, context)
    }
}

impl Drop for WasmInstantiatedModule {
    fn drop(&mut self) {
        if self.runtime.codes.release(&self.tuple) {
            self.runtime
                .code_cache
                .free_code(&self.tuple.code_id, self.tuple.vm_version);
        }
    }
}

//! One executor and one memory per thread running contracts.
//!
//! Resources live in a map keyed by thread id instead of thread local
//! statics, so their lifetime is tied to the runtime. A thread local guard
//! removes the entries of a thread from every live registry when the
//! thread exits.
use dashmap::DashMap;
use parking_lot::Mutex;
use std::cell::RefCell;
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};
use sysvmoc_cache::CodeCache;
use sysvmoc_vm::{ExecutionError, Executor, Memory};

/// What a thread needs to execute contracts.
pub(crate) struct ThreadResources {
    pub(crate) executor: Executor,
    pub(crate) memory: Memory,
}

impl ThreadResources {
    fn new(code_cache: &CodeCache, sliced_pages: u64) -> Result<Self, ExecutionError> {
        Ok(Self {
            executor: Executor::new(code_cache)?,
            memory: Memory::new(sliced_pages)?,
        })
    }
}

type ThreadMap = DashMap<ThreadId, Arc<Mutex<ThreadResources>>>;

#[derive(Default)]
pub(crate) struct ThreadRegistry {
    threads: Arc<ThreadMap>,
}

impl ThreadRegistry {
    /// The resources of the calling thread, created with `sliced_pages`
    /// slices if the thread has none yet.
    pub(crate) fn get_or_init(
        &self,
        code_cache: &CodeCache,
        sliced_pages: u64,
    ) -> Result<Arc<Mutex<ThreadResources>>, ExecutionError> {
        let id = thread::current().id();
        if let Some(resources) = self.threads.get(&id) {
            return Ok(resources.clone());
        }
        let resources = Arc::new(Mutex::new(ThreadResources::new(code_cache, sliced_pages)?));
        self.threads.insert(id, resources.clone());
        register_exit_hook(&self.threads, id);
        tracing::debug!(thread = ?id, sliced_pages, "created executor and memory for thread");
        Ok(resources)
    }

    /// Number of threads holding resources.
    pub(crate) fn len(&self) -> usize {
        self.threads.len()
    }

    pub(crate) fn contains_current(&self) -> bool {
        self.threads.contains_key(&thread::current().id())
    }
}

struct ExitHooks(RefCell<Vec<(Weak<ThreadMap>, ThreadId)>>);

impl Drop for ExitHooks {
    fn drop(&mut self) {
        for (threads, id) in self.0.get_mut().drain(..) {
            if let Some(threads) = threads.upgrade() {
                threads.remove(&id);
            }
        }
    }
}

thread_local! {
    static EXIT_HOOKS: ExitHooks = const { ExitHooks(RefCell::new(Vec::new())) };
}

fn register_exit_hook(threads: &Arc<ThreadMap>, id: ThreadId) {
    let registered = EXIT_HOOKS.try_with(|hooks| {
        let mut hooks = hooks.0.borrow_mut();
        hooks.retain(|(hook, _)| hook.strong_count() > 0);
        hooks.push((Arc::downgrade(threads), id));
    });
    if registered.is_err() {
        // the thread is already shutting down
        threads.remove(&id);
    }
}

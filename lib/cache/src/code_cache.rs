use crate::error::{CacheError, CodeCacheError};
use crate::file::{close_cache_file, open_cache_file, EVICTION_BATCH};
use crate::layout::CACHE_FILE_NAME;
use parking_lot::{Condvar, Mutex};
use socket2::Socket;
use std::collections::HashMap;
use std::fs::File;
use std::net::Shutdown;
use std::os::fd::{AsFd, BorrowedFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use sysvmoc_ipc::{
    get_connection_to_compile_monitor, memfd_for_bytearray, read_message_with_fds,
    read_message_with_fds_from_socket, seqpacket_pair, write_message_with_fds, IpcError,
};
use sysvmoc_types::protocol::{
    CompileWasmMessage, EvictWasmsMessage, WasmCompilationResult, WasmCompilationResultMessage,
};
use sysvmoc_types::{CodeDescriptor, CodeTuple, Digest, OcConfig, SysVmOcMessage};

/// Where the code cache gets the wasm bytes of code it has to compile.
pub trait CodeSource: Send + Sync {
    /// The wasm of `code_hash`, if known.
    fn code(&self, code_hash: &Digest, vm_version: u8) -> Option<Arc<[u8]>>;
}

/// Compiled code keyed by [`CodeTuple`], backed by `code_cache.bin`.
///
/// Lookups that miss send the wasm to the compile monitor and block the
/// calling thread until it answers or `compile_timeout` elapses. At most
/// one compile per tuple is in flight, concurrent misses wait for it.
///
/// Descriptors handed out are reference counted. Evicting an entry only
/// unindexes it: the monitor is told to release the storage once no
/// caller holds the descriptor anymore.
pub struct CodeCache {
    config: OcConfig,
    path: PathBuf,
    cache_file: File,
    monitor: Socket,
    code_source: Arc<dyn CodeSource>,
    free_bytes_eviction_threshold: u64,
    state: Mutex<CacheState>,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<CodeTuple, CacheEntry>,
    /// Recency clock, bumped on insertion and on write window hits.
    clock: u64,
    in_flight: HashMap<CodeTuple, Arc<CompileFlight>>,
    /// Unindexed descriptors whose storage has not been released yet.
    pending_evictions: Vec<Arc<CodeDescriptor>>,
    eviction_round_requested: bool,
    free_bytes: u64,
}

struct CacheEntry {
    descriptor: Arc<CodeDescriptor>,
    last_used: u64,
    last_block_num_used: u32,
    released: bool,
}

type FlightResult = Result<Arc<CodeDescriptor>, CodeCacheError>;

#[derive(Default)]
struct CompileFlight {
    result: Mutex<Option<FlightResult>>,
    done: Condvar,
    poisoned: AtomicBool,
}

impl CompileFlight {
    fn wait(&self) -> FlightResult {
        let mut result = self.result.lock();
        loop {
            if let Some(result) = result.as_ref() {
                return result.clone();
            }
            self.done.wait(&mut result);
        }
    }

    fn complete(&self, outcome: FlightResult) {
        *self.result.lock() = Some(outcome);
        self.done.notify_all();
    }
}

enum Lookup {
    Hit(Arc<CodeDescriptor>),
    Wait(Arc<CompileFlight>),
    Compile(Arc<CompileFlight>),
}

impl CodeCache {
    /// Opens the cache in `data_dir` and a session with the compile
    /// monitor listening on `monitor_service`.
    pub fn new(
        data_dir: impl AsRef<Path>,
        config: OcConfig,
        code_source: Arc<dyn CodeSource>,
        monitor_service: BorrowedFd<'_>,
    ) -> Result<Self, CacheError> {
        std::fs::create_dir_all(data_dir.as_ref())?;
        let path = data_dir.as_ref().join(CACHE_FILE_NAME);
        let loaded = open_cache_file(&path, config.cache_size)?;
        let monitor = get_connection_to_compile_monitor(
            monitor_service,
            loaded.file.as_fd(),
            config.compile_timeout,
        )?;

        let mut state = CacheState {
            free_bytes: loaded.free_bytes,
            ..CacheState::default()
        };
        for descriptor in loaded.descriptors {
            state.clock += 1;
            state.entries.insert(
                descriptor.code_tuple(),
                CacheEntry {
                    descriptor: Arc::new(descriptor),
                    last_used: state.clock,
                    last_block_num_used: u32::MAX,
                    released: false,
                },
            );
        }

        Ok(Self {
            free_bytes_eviction_threshold: config.cache_size / 10,
            config,
            path,
            cache_file: loaded.file,
            monitor,
            code_source,
            state: Mutex::new(state),
        })
    }

    /// Returns the descriptor for `(code_hash, vm_version)`, compiling the
    /// code on a miss.
    ///
    /// Hits never block on the monitor. Only calls made inside the write
    /// window refresh recency and run deferred eviction work, so read-only
    /// threads never reorder or shrink the cache.
    pub fn get_descriptor_for_code_sync(
        &self,
        code_hash: &Digest,
        vm_version: u8,
        is_write_window: bool,
    ) -> Result<Arc<CodeDescriptor>, CodeCacheError> {
        let tuple = CodeTuple::new(*code_hash, vm_version);
        let lookup = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if is_write_window {
                self.run_deferred_maintenance(state);
            }
            let clock = state.clock + 1;
            if let Some(entry) = state.entries.get_mut(&tuple) {
                entry.released = false;
                if is_write_window {
                    entry.last_used = clock;
                    state.clock = clock;
                }
                Lookup::Hit(entry.descriptor.clone())
            } else if let Some(flight) = state.in_flight.get(&tuple) {
                Lookup::Wait(flight.clone())
            } else {
                let flight = Arc::new(CompileFlight::default());
                state.in_flight.insert(tuple, flight.clone());
                Lookup::Compile(flight)
            }
        };

        let flight = match lookup {
            Lookup::Hit(descriptor) => return Ok(descriptor),
            Lookup::Wait(flight) => return flight.wait(),
            Lookup::Compile(flight) => flight,
        };

        let reply = self.compile(tuple);
        let outcome = {
            let mut state = self.state.lock();
            state.in_flight.remove(&tuple);
            let poisoned = flight.poisoned.load(Ordering::Acquire);
            let outcome = match reply {
                Ok(reply) => self.record(&mut state, tuple, reply, poisoned),
                Err(err) => Err(err),
            };
            if is_write_window {
                self.run_deferred_maintenance(&mut state);
            }
            outcome
        };
        if let Err(err) = &outcome {
            tracing::warn!(code_hash = %tuple.code_id, vm_version, error = %err, "no native code for contract");
        }
        flight.complete(outcome.clone());
        outcome
    }

    /// One compile round trip with the monitor.
    fn compile(&self, tuple: CodeTuple) -> Result<WasmCompilationResultMessage, CodeCacheError> {
        let wasm = self
            .code_source
            .code(&tuple.code_id, tuple.vm_version)
            .ok_or(CodeCacheError::CodeNotFound(tuple))?;
        tracing::debug!(code_hash = %tuple.code_id, vm_version = tuple.vm_version, size = wasm.len(), "compiling");

        let (ours, theirs) = seqpacket_pair()?;
        let wasm_fd = memfd_for_bytearray(&wasm)?;
        let request = SysVmOcMessage::CompileWasm(CompileWasmMessage {
            code: tuple,
            config: self.config.clone(),
        });
        write_message_with_fds(
            self.monitor.as_fd(),
            &request,
            &[theirs.as_fd(), wasm_fd.as_fd()],
        )?;
        // Our copy must go so that a dying monitor reads as end of file.
        drop(theirs);

        ours.set_read_timeout(Some(self.config.compile_timeout))?;
        match read_message_with_fds_from_socket(&ours)? {
            (SysVmOcMessage::WasmCompilationResult(reply), _) if reply.code == tuple => Ok(reply),
            (other, _) => Err(IpcError::UnexpectedMessage(other.kind()).into()),
        }
    }

    fn record(
        &self,
        state: &mut CacheState,
        tuple: CodeTuple,
        reply: WasmCompilationResultMessage,
        poisoned: bool,
    ) -> Result<Arc<CodeDescriptor>, CodeCacheError> {
        state.free_bytes = reply.cache_free_bytes;
        match reply.result {
            WasmCompilationResult::Descriptor(descriptor) => {
                if descriptor.code_tuple() != tuple {
                    tracing::warn!(
                        requested = %tuple,
                        returned = %descriptor.code_tuple(),
                        "compile monitor answered for other code"
                    );
                    return Err(IpcError::UnexpectedMessage("wasm_compilation_result").into());
                }
                let descriptor = Arc::new(descriptor);
                if poisoned {
                    state.pending_evictions.push(descriptor.clone());
                } else {
                    state.clock += 1;
                    state.entries.insert(
                        tuple,
                        CacheEntry {
                            descriptor: descriptor.clone(),
                            last_used: state.clock,
                            last_block_num_used: u32::MAX,
                            released: false,
                        },
                    );
                }
                if reply.cache_free_bytes < self.free_bytes_eviction_threshold {
                    state.eviction_round_requested = true;
                }
                Ok(descriptor)
            }
            WasmCompilationResult::TooFull => {
                state.eviction_round_requested = true;
                Err(CodeCacheError::CacheFull)
            }
            WasmCompilationResult::UnknownFailure => Err(CodeCacheError::CompileFailed(tuple)),
        }
    }

    /// Marks the code as no longer needed by any module.
    ///
    /// The entry stays usable until the next [`CodeCache::current_lib`]
    /// reclaims it. A compile of the code still in flight is poisoned: its
    /// result is handed to the waiters but never indexed.
    pub fn free_code(&self, code_hash: &Digest, vm_version: u8) {
        let tuple = CodeTuple::new(*code_hash, vm_version);
        let mut state = self.state.lock();
        if let Some(entry) = state.entries.get_mut(&tuple) {
            entry.released = true;
        }
        if let Some(flight) = state.in_flight.get(&tuple) {
            flight.poisoned.store(true, Ordering::Release);
        }
    }

    /// Records the last block that can still run the code, usually the block
    /// in which the account's code was replaced.
    pub fn code_block_num_last_used(&self, code_hash: &Digest, vm_version: u8, block_num: u32) {
        let tuple = CodeTuple::new(*code_hash, vm_version);
        if let Some(entry) = self.state.lock().entries.get_mut(&tuple) {
            entry.last_block_num_used = block_num;
        }
    }

    /// Reclaims code that can no longer run now that `lib` is irreversible,
    /// along with code released through [`CodeCache::free_code`].
    pub fn current_lib(&self, lib: u32) {
        let mut state = self.state.lock();
        let expired: Vec<CodeTuple> = state
            .entries
            .iter()
            .filter(|(_, entry)| entry.released || entry.last_block_num_used <= lib)
            .map(|(tuple, _)| *tuple)
            .collect();
        if !expired.is_empty() {
            tracing::debug!(lib, count = expired.len(), "reclaiming code past LIB");
        }
        for tuple in expired {
            retire(&mut state, &tuple);
        }
        self.flush_pending_evictions(&mut state);
    }

    fn run_deferred_maintenance(&self, state: &mut CacheState) {
        if std::mem::take(&mut state.eviction_round_requested) {
            run_eviction_round(state);
        }
        self.flush_pending_evictions(state);
    }

    /// Tells the monitor to release storage nobody references anymore.
    fn flush_pending_evictions(&self, state: &mut CacheState) {
        let (unpinned, pinned): (Vec<_>, Vec<_>) = state
            .pending_evictions
            .drain(..)
            .partition(|descriptor| Arc::strong_count(descriptor) == 1);
        state.pending_evictions = pinned;

        for batch in unpinned.chunks(EVICTION_BATCH) {
            let message = SysVmOcMessage::EvictWasms(EvictWasmsMessage {
                codes: batch.iter().map(|d| CodeDescriptor::clone(d)).collect(),
            });
            if let Err(err) = write_message_with_fds(self.monitor.as_fd(), &message, &[]) {
                tracing::warn!(error = %err, count = batch.len(), "could not send eviction to compile monitor");
                // freed locally when the cache closes
                state.pending_evictions.extend(batch.iter().cloned());
            }
        }
    }

    /// Last free space reported by the compile monitor.
    pub fn free_bytes(&self) -> u64 {
        self.state.lock().free_bytes
    }

    /// Number of indexed entries.
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// `true` when nothing is indexed.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The cache file, for executors to map the code from.
    pub fn cache_file(&self) -> &File {
        &self.cache_file
    }

    /// Configured size of the cache file.
    pub fn cache_size(&self) -> u64 {
        self.config.cache_size
    }

    /// Path of the cache file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Configuration the cache was opened with.
    pub fn config(&self) -> &OcConfig {
        &self.config
    }

    /// Ends the monitor session, waiting for outstanding work to finish.
    fn close_monitor_session(&self) -> bool {
        if let Err(err) = self.monitor.shutdown(Shutdown::Write) {
            tracing::warn!(error = %err, "could not shut down compile monitor session");
        }
        if let Err(err) = self.monitor.set_read_timeout(Some(self.config.compile_timeout)) {
            tracing::warn!(error = %err, "could not bound wait for compile monitor");
        }
        loop {
            match read_message_with_fds(self.monitor.as_fd()) {
                Ok((message, _)) => {
                    tracing::debug!(kind = message.kind(), "ignoring late monitor message");
                }
                Err(IpcError::Closed) => return true,
                Err(err) => {
                    tracing::warn!(error = %err, "compile monitor did not end the session");
                    return false;
                }
            }
        }
    }
}

/// Unindexes `tuple`, queueing its storage for release.
fn retire(state: &mut CacheState, tuple: &CodeTuple) {
    if let Some(entry) = state.entries.remove(tuple) {
        state.pending_evictions.push(entry.descriptor);
    }
}

/// Evicts the least recently used entries, always keeping one.
fn run_eviction_round(state: &mut CacheState) {
    let mut by_age: Vec<(u64, CodeTuple)> = state
        .entries
        .iter()
        .map(|(tuple, entry)| (entry.last_used, *tuple))
        .collect();
    by_age.sort_unstable();
    let count = by_age.len().saturating_sub(1).min(EVICTION_BATCH);
    tracing::debug!(count, entries = by_age.len(), "running code cache eviction round");
    for (_, tuple) in by_age.into_iter().take(count) {
        retire(state, &tuple);
    }
}

impl Drop for CodeCache {
    fn drop(&mut self) {
        if !self.close_monitor_session() {
            // The monitor may still write to the file; leave it dirty so
            // the next open starts over.
            return;
        }
        let state = self.state.get_mut();
        let mut entries: Vec<&CacheEntry> = state.entries.values().collect();
        entries.sort_unstable_by_key(|entry| entry.last_used);
        let descriptors = entries
            .into_iter()
            .map(|entry| CodeDescriptor::clone(&entry.descriptor))
            .collect();
        let orphans: Vec<CodeDescriptor> = state
            .pending_evictions
            .iter()
            .map(|d| CodeDescriptor::clone(d))
            .collect();
        if let Err(err) = close_cache_file(&self.cache_file, descriptors, &orphans) {
            tracing::error!(path = %self.path.display(), error = %err, "failed to persist code cache");
        }
    }
}

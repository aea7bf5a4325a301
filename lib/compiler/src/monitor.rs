//! The compile monitor service loop and the ways to host it.
use crate::codegen::CodeGenerator;
use crate::session::Session;
use socket2::Socket;
use std::fs::File;
use std::io;
use std::net::Shutdown;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::sync::Arc;
use std::thread::{self, JoinHandle, Scope};
use sysvmoc_ipc::{read_message_with_fds, seqpacket_pair, write_message_with_fds, IpcError};
use sysvmoc_types::protocol::InitializeResponseMessage;
use sysvmoc_types::SysVmOcMessage;

/// Accepts sessions from nodes and compiles what they send.
pub struct CompileMonitor {
    generator: Arc<dyn CodeGenerator>,
}

impl CompileMonitor {
    /// Creates a monitor compiling with `generator`.
    pub fn new(generator: Arc<dyn CodeGenerator>) -> Self {
        Self { generator }
    }

    /// Serves `service` until every node connected through it has hung up.
    ///
    /// Each `initialize_message` opens a session on its own thread. Returns
    /// once the service socket is closed and all sessions have ended.
    pub fn serve(&self, service: BorrowedFd<'_>) {
        thread::scope(|scope| {
            loop {
                match read_message_with_fds(service) {
                    Ok((SysVmOcMessage::Initialize(_), fds)) => self.start_session(scope, fds),
                    Ok((other, _)) => {
                        tracing::warn!(kind = other.kind(), "compile monitor expected initialize");
                    }
                    Err(IpcError::Closed) => break,
                    Err(err @ IpcError::Io(_)) => {
                        tracing::error!(error = %err, "compile monitor service failed");
                        break;
                    }
                    Err(err) => tracing::warn!(error = %err, "dropping garbled message"),
                }
            }
        });
    }

    fn start_session<'scope>(&self, scope: &'scope Scope<'scope, '_>, fds: Vec<OwnedFd>) {
        let [socket, cache] = match <[OwnedFd; 2]>::try_from(fds) {
            Ok(fds) => fds,
            Err(fds) => {
                tracing::warn!(count = fds.len(), "initialize without its two descriptors");
                return;
            }
        };
        let socket = Socket::from(socket);
        let mapped = Session::map_cache(&File::from(cache));
        let reply = SysVmOcMessage::InitializeResponse(InitializeResponseMessage {
            error_message: mapped.as_ref().err().map(ToString::to_string),
        });
        if let Err(err) = write_message_with_fds(socket.as_fd(), &reply, &[]) {
            tracing::warn!(error = %err, "could not answer initialize");
            return;
        }
        match mapped {
            Ok(map) => {
                let session = Session::new(socket, map, self.generator.clone());
                scope.spawn(move || session.run());
            }
            Err(err) => tracing::warn!(error = %err, "refused session"),
        }
    }
}

/// A running compile monitor.
///
/// Dropping the handle closes the service socket and waits for the
/// monitor to exit, which happens once every code cache connected to it
/// has been dropped.
pub struct CompileMonitorHandle {
    service: Socket,
    worker: Worker,
}

enum Worker {
    Thread(Option<JoinHandle<()>>),
    Process(libc::pid_t),
}

impl CompileMonitorHandle {
    /// The socket code caches connect through.
    pub fn service(&self) -> BorrowedFd<'_> {
        self.service.as_fd()
    }

    /// Process id of a monitor started with
    /// [`spawn_compile_monitor_process`].
    pub fn pid(&self) -> Option<libc::pid_t> {
        match self.worker {
            Worker::Process(pid) => Some(pid),
            Worker::Thread(_) => None,
        }
    }
}

impl Drop for CompileMonitorHandle {
    fn drop(&mut self) {
        let _ = self.service.shutdown(Shutdown::Both);
        match &mut self.worker {
            Worker::Thread(handle) => {
                if let Some(handle) = handle.take() {
                    if handle.join().is_err() {
                        tracing::error!("compile monitor thread panicked");
                    }
                }
            }
            Worker::Process(pid) => loop {
                let mut status = 0;
                // SAFETY: `pid` is our child and is reaped only here.
                let rc = unsafe { libc::waitpid(*pid, &mut status, 0) };
                if rc != -1 || io::Error::last_os_error().kind() != io::ErrorKind::Interrupted {
                    break;
                }
            },
        }
    }
}

/// Runs a compile monitor on a thread of this process.
pub fn spawn_compile_monitor_thread(
    generator: Arc<dyn CodeGenerator>,
) -> io::Result<CompileMonitorHandle> {
    let (client, service) = seqpacket_pair()?;
    let monitor = CompileMonitor::new(generator);
    let handle = thread::Builder::new()
        .name("sysvmoc-monitor".into())
        .spawn(move || monitor.serve(service.as_fd()))?;
    Ok(CompileMonitorHandle {
        service: client,
        worker: Worker::Thread(Some(handle)),
    })
}

/// Forks a compile monitor process.
///
/// The child keeps only the standard streams and its service socket, and
/// is killed if this process dies. Call it before starting other threads:
/// the child runs in a copy of this process.
pub fn spawn_compile_monitor_process(
    generator: Arc<dyn CodeGenerator>,
) -> io::Result<CompileMonitorHandle> {
    let (client, service) = seqpacket_pair()?;
    // SAFETY: the child only runs the monitor loop and leaves with `_exit`.
    match unsafe { libc::fork() } {
        -1 => Err(io::Error::last_os_error()),
        0 => {
            // SAFETY: from here on only the child's own descriptors are used.
            unsafe { run_child(service.as_raw_fd(), generator) }
        }
        pid => {
            drop(service);
            Ok(CompileMonitorHandle {
                service: client,
                worker: Worker::Process(pid),
            })
        }
    }
}

const CHILD_SERVICE_FD: libc::c_int = 3;

unsafe fn run_child(service: libc::c_int, generator: Arc<dyn CodeGenerator>) -> ! {
    unsafe {
        libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL as libc::c_ulong);
        if service != CHILD_SERVICE_FD {
            libc::dup2(service, CHILD_SERVICE_FD);
        }
        libc::syscall(
            libc::SYS_close_range,
            CHILD_SERVICE_FD + 1,
            libc::c_uint::MAX,
            0,
        );
        let service = OwnedFd::from_raw_fd(CHILD_SERVICE_FD);
        CompileMonitor::new(generator).serve(service.as_fd());
        libc::_exit(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::{Cancellation, GeneratedCode};
    use crate::error::CompileError;
    use crate::prepare::ModuleLayout;
    use memmap2::MmapMut;
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use sysvmoc_cache::CacheAllocator;
    use sysvmoc_ipc::{get_connection_to_compile_monitor, memfd_for_bytearray};
    use sysvmoc_types::protocol::{
        CompileWasmMessage, EvictWasmsMessage, WasmCompilationResult,
    };
    use sysvmoc_types::{CodeTuple, Digest, OcConfig};

    const CODE: &[u8] = &[0x48, 0x31, 0xc0, 0xc3];

    struct Fixed;

    impl CodeGenerator for Fixed {
        fn generate(
            &self,
            module: &ModuleLayout<'_>,
            _: &Cancellation,
        ) -> Result<GeneratedCode, CompileError> {
            Ok(GeneratedCode {
                code: CODE.to_vec(),
                function_offsets: vec![0; module.functions.len()],
                prologue: Vec::new(),
            })
        }
    }

    fn cache_file(size: u64) -> File {
        let file = tempfile::tempfile().unwrap();
        file.set_len(size).unwrap();
        let mut map = unsafe { MmapMut::map_mut(&file).unwrap() };
        CacheAllocator::format(&mut map).unwrap();
        file
    }

    fn compile(session: &Socket, code: CodeTuple, wasm: &[u8]) -> SysVmOcMessage {
        let (ours, theirs) = seqpacket_pair().unwrap();
        let wasm = memfd_for_bytearray(wasm).unwrap();
        let request = SysVmOcMessage::CompileWasm(CompileWasmMessage {
            code,
            config: OcConfig::default(),
        });
        write_message_with_fds(session.as_fd(), &request, &[theirs.as_fd(), wasm.as_fd()])
            .unwrap();
        drop(theirs);
        ours.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
        read_message_with_fds(ours.as_fd()).unwrap().0
    }

    #[test]
    fn compiles_into_the_cache_file() {
        let monitor = spawn_compile_monitor_thread(Arc::new(Fixed)).unwrap();
        let cache = cache_file(64 * 1024);
        let session =
            get_connection_to_compile_monitor(monitor.service(), cache.as_fd(), Duration::from_secs(5))
                .unwrap();
        let wasm = wat::parse_str(r#"(module (func (export "apply") (param i64 i64 i64)))"#).unwrap();
        let code = CodeTuple::new(Digest::hash(&wasm), 0);

        let SysVmOcMessage::WasmCompilationResult(reply) = compile(&session, code, &wasm) else {
            panic!("expected a compilation result");
        };
        assert_eq!(reply.code, code);
        let WasmCompilationResult::Descriptor(descriptor) = reply.result else {
            panic!("expected a descriptor");
        };
        assert_eq!(descriptor.code_tuple(), code);
        assert_eq!(descriptor.initdata_size, 0);

        let mut map = unsafe { MmapMut::map_mut(&cache).unwrap() };
        let begin = descriptor.code_begin as usize;
        assert_eq!(&map[begin..begin + CODE.len()], CODE);
        let free_after_compile = CacheAllocator::open(&mut map).unwrap().free_bytes();
        assert_eq!(reply.cache_free_bytes, free_after_compile);

        // evictions are processed in order with later requests
        let evict = SysVmOcMessage::EvictWasms(EvictWasmsMessage {
            codes: vec![descriptor],
        });
        write_message_with_fds(session.as_fd(), &evict, &[]).unwrap();
        let SysVmOcMessage::WasmCompilationResult(again) = compile(&session, code, &wasm) else {
            panic!("expected a compilation result");
        };
        assert_eq!(again.cache_free_bytes, free_after_compile);

        drop(session);
        drop(monitor);
    }

    #[test]
    fn bad_wasm_is_an_unknown_failure() {
        let monitor = spawn_compile_monitor_thread(Arc::new(Fixed)).unwrap();
        let cache = cache_file(64 * 1024);
        let session =
            get_connection_to_compile_monitor(monitor.service(), cache.as_fd(), Duration::from_secs(5))
                .unwrap();
        let code = CodeTuple::new(Digest::hash(b"junk"), 0);
        let SysVmOcMessage::WasmCompilationResult(reply) = compile(&session, code, b"junk") else {
            panic!("expected a compilation result");
        };
        assert_eq!(reply.result, WasmCompilationResult::UnknownFailure);
    }

    #[test]
    fn full_cache_is_reported() {
        let monitor = spawn_compile_monitor_thread(Arc::new(Fixed)).unwrap();
        // the heap fits a single small block
        let cache = cache_file(1024 + 48);
        let session =
            get_connection_to_compile_monitor(monitor.service(), cache.as_fd(), Duration::from_secs(5))
                .unwrap();
        let wasm = wat::parse_str(r#"(module (func (export "apply") (param i64 i64 i64)))"#).unwrap();
        let code = CodeTuple::new(Digest::hash(&wasm), 0);
        let SysVmOcMessage::WasmCompilationResult(reply) = compile(&session, code, &wasm) else {
            panic!("expected a compilation result");
        };
        assert_eq!(reply.result, WasmCompilationResult::TooFull);
        assert_eq!(reply.cache_free_bytes, 48);
    }

    #[test]
    fn unusable_cache_is_refused() {
        let monitor = spawn_compile_monitor_thread(Arc::new(Fixed)).unwrap();
        let garbage = tempfile::tempfile().unwrap();
        garbage.set_len(64 * 1024).unwrap();
        let err =
            get_connection_to_compile_monitor(monitor.service(), garbage.as_fd(), Duration::from_secs(5))
                .unwrap_err();
        assert!(matches!(err, IpcError::Rejected(_)));
    }
}

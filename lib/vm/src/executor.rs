//! Runs compiled contracts out of the code cache.
use crate::context::ApplyContext;
use crate::control_block::{ControlBlock, CONTROL_BLOCK_MAGIC};
use crate::error::{ExecutionError, HostError};
use crate::memory::Memory;
use crate::trap::{catch_traps, init_traps, CallThreadState};
use memmap2::{Mmap, MmapOptions};
use std::fs::File;
use std::ops::Range;
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use sysvmoc_cache::CodeCache;
use sysvmoc_types::constraints::{
    MAXIMUM_CALL_DEPTH, MAXIMUM_LINEAR_MEMORY_PAGES, WASM_PAGE_SIZE,
};
use sysvmoc_types::intrinsics::INTRINSIC_COUNT;
use sysvmoc_types::memory_layout::{intrinsic_offset, MAX_PROLOGUE_SIZE};
use sysvmoc_types::{CodeDescriptor, ExitCode, StartOffset, CURRENT_CODEGEN_VERSION};

/// Signature of `apply` and of a start function in generated code: the
/// receiver, the action's account and name, then the memory base.
type NativeEntry = unsafe extern "C" fn(u64, u64, u64, *mut u8);

/// Signature of an intrinsic used as start function.
type IntrinsicEntry = unsafe extern "C" fn();

/// Where an execution is, or how the last one ended.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ExecutorState {
    /// Nothing has run yet.
    Idle,
    /// Native code is running.
    Running,
    /// The contract returned or called `sysio_exit`.
    Returned,
    /// The deadline expired.
    CheckTimeFault,
    /// The contract accessed memory it was not granted.
    SegvFault,
    /// A host intrinsic raised an error.
    Exception,
}

impl From<ExitCode> for ExecutorState {
    fn from(code: ExitCode) -> Self {
        match code {
            ExitCode::CleanExit => Self::Returned,
            ExitCode::CheckTimeFail => Self::CheckTimeFault,
            ExitCode::Segv => Self::SegvFault,
            ExitCode::Exception => Self::Exception,
        }
    }
}

/// Executes code descriptors against an executable mapping of the code
/// cache file.
///
/// One executor belongs to one thread, together with its [`Memory`].
pub struct Executor {
    code_mapping: Mmap,
    state: ExecutorState,
}

impl Executor {
    /// Maps the code of `code_cache`.
    pub fn new(code_cache: &CodeCache) -> Result<Self, ExecutionError> {
        Self::with_cache_file(code_cache.cache_file())
    }

    /// Maps the code cache file `cache_file`.
    pub fn with_cache_file(cache_file: &File) -> Result<Self, ExecutionError> {
        // SAFETY: code is only ever appended to the cache by the compile
        // monitor, regions in use by a descriptor are not rewritten.
        let code_mapping = unsafe { MmapOptions::new().map_exec(cache_file) }
            .map_err(|err| ExecutionError::Protection(format!("mapping code cache: {err}")))?;
        Ok(Self {
            code_mapping,
            state: ExecutorState::Idle,
        })
    }

    /// State the last execution ended in.
    pub fn state(&self) -> ExecutorState {
        self.state
    }

    fn code_range(&self) -> Range<usize> {
        let start = self.code_mapping.as_ptr() as usize;
        start..start + self.code_mapping.len()
    }

    fn validate(&self, descriptor: &CodeDescriptor) -> Result<(), ExecutionError> {
        let invalid = |what: String| Err(ExecutionError::InvalidDescriptor(what));
        let len = self.code_mapping.len() as u64;
        if descriptor.codegen_version != CURRENT_CODEGEN_VERSION {
            return invalid(format!("codegen version {}", descriptor.codegen_version));
        }
        let inside_code = |offset: u64| {
            descriptor
                .code_begin
                .checked_add(offset)
                .is_some_and(|address| address < len)
        };
        if !inside_code(u64::from(descriptor.apply_offset)) {
            return invalid("apply outside of the code cache".into());
        }
        match descriptor.start {
            StartOffset::CodeOffset { offset } if !inside_code(offset) => {
                return invalid("start function outside of the code cache".into());
            }
            StartOffset::IntrinsicOrdinal { ordinal } if ordinal >= INTRINSIC_COUNT as u64 => {
                return invalid(format!("start intrinsic {ordinal}"));
            }
            _ => {}
        }
        if descriptor
            .initdata_begin
            .checked_add(u64::from(descriptor.initdata_size))
            .is_none_or(|end| end > len)
        {
            return invalid("initial data outside of the code cache".into());
        }
        let pages = u64::try_from(descriptor.starting_memory_pages).unwrap_or(u64::MAX);
        if pages > MAXIMUM_LINEAR_MEMORY_PAGES {
            return invalid(format!("{} starting pages", descriptor.starting_memory_pages));
        }
        let prologue = u64::from(descriptor.initdata_prologue_size);
        if prologue > MAX_PROLOGUE_SIZE || prologue > u64::from(descriptor.initdata_size) {
            return invalid(format!("prologue of {prologue} bytes"));
        }
        if u64::from(descriptor.initdata_size) - prologue > pages * WASM_PAGE_SIZE {
            return invalid("memory image larger than the starting memory".into());
        }
        Ok(())
    }

    /// Runs the start function, if any, then `apply` of `descriptor` for the
    /// action of `context`, in `memory`.
    ///
    /// The deadline of `context`'s timer stops the execution with
    /// [`ExecutionError::DeadlineExceeded`]. The executor is left in the
    /// terminal state matching the outcome.
    pub fn execute(
        &mut self,
        descriptor: &CodeDescriptor,
        memory: &mut Memory,
        context: &mut dyn ApplyContext,
    ) -> Result<(), ExecutionError> {
        self.validate(descriptor)?;
        init_traps()?;

        let pages = descriptor.starting_memory_pages as u64;
        let sliced = memory.sliced_pages();
        let memory_base = memory.memory_base_for_pages(pages);
        if pages > sliced {
            memory.unprotect_private_pages(sliced, pages)?;
        }
        // SAFETY: no native code is running on this memory, and every range
        // below was checked against the mapping or the granted pages.
        unsafe {
            ptr::write_bytes(
                memory.full_page_memory_base(),
                0,
                (pages.min(sliced) * WASM_PAGE_SIZE) as usize,
            );
            let prologue = descriptor.initdata_prologue_size as usize;
            ptr::copy_nonoverlapping(
                self.code_mapping
                    .as_ptr()
                    .add(descriptor.initdata_begin as usize),
                memory_base.sub(prologue),
                descriptor.initdata_size as usize,
            );
        }

        let code_range = self.code_range();
        let cb = memory.control_block();
        // SAFETY: the control block lies in the mapped prologue.
        unsafe {
            *cb = ControlBlock {
                magic: CONTROL_BLOCK_MAGIC,
                execution_thread_code_start: code_range.start as u64,
                execution_thread_code_length: (code_range.end - code_range.start) as u64,
                execution_thread_memory_start: memory.start_of_memory_slices() as u64,
                execution_thread_memory_length: memory.size_of_memory_slice_mapping() as u64,
                running_code_base: (code_range.start as u64) + descriptor.code_begin,
                memory_base: memory_base as u64,
                full_linear_memory_start: memory.full_page_memory_base() as u64,
                first_invalid_memory_address: pages * WASM_PAGE_SIZE,
                current_linear_memory_pages: pages as u32,
                max_linear_memory_pages: MAXIMUM_LINEAR_MEMORY_PAGES as u32,
                current_call_depth_remaining: MAXIMUM_CALL_DEPTH,
                is_running: 1,
            };
        }

        let timer = context.timer();
        let revoked = Arc::new(AtomicBool::new(false));
        let revoke = {
            let revoked = revoked.clone();
            let (start, len) = (code_range.start, code_range.end - code_range.start);
            move || {
                // SAFETY: only changes protections of our own mapping; the
                // executor restores them before the mapping is used again.
                if unsafe { region::protect(start as *const u8, len, region::Protection::NONE) }
                    .is_ok()
                {
                    revoked.store(true, Ordering::Release);
                }
            }
        };
        timer.set_expiration_callback(Some(Box::new(revoke.clone())));
        if timer.expired() {
            revoke();
        }

        let receiver = context.receiver().0;
        let (account, action) = {
            let action = context.action();
            (action.account.0, action.name.0)
        };
        let code_base = self.code_mapping.as_ptr();
        // SAFETY: offsets were validated against the mapping; what lies there
        // is code the compile monitor generated for this descriptor.
        let apply: NativeEntry = unsafe {
            std::mem::transmute::<*const u8, NativeEntry>(
                code_base.add((descriptor.code_begin + u64::from(descriptor.apply_offset)) as usize),
            )
        };
        let start = descriptor.start;
        let intrinsic = |ordinal: u64| -> IntrinsicEntry {
            // SAFETY: the jump table was filled when the memory was created.
            unsafe {
                let slot = memory_base.wrapping_sub(intrinsic_offset(ordinal as usize) as usize);
                std::mem::transmute::<usize, IntrinsicEntry>(slot.cast::<usize>().read())
            }
        };

        self.state = ExecutorState::Running;
        let state = CallThreadState::new(code_range.clone(), memory, context);
        // SAFETY: the closure only holds plain values.
        let outcome = unsafe {
            catch_traps(&state, || {
                match start {
                    StartOffset::NoOffset => {}
                    StartOffset::CodeOffset { offset } => {
                        let start: NativeEntry = std::mem::transmute::<*const u8, NativeEntry>(
                            code_base.add((descriptor.code_begin + offset) as usize),
                        );
                        start(receiver, account, action, memory_base);
                    }
                    StartOffset::IntrinsicOrdinal { ordinal } => intrinsic(ordinal)(),
                }
                apply(receiver, account, action, memory_base);
            })
        };
        let host_error = state.take_host_error();
        drop(state);

        // SAFETY: native code is no longer running.
        let final_pages = unsafe {
            (*cb).is_running = 0;
            u64::from((*cb).current_linear_memory_pages)
        };
        timer.set_expiration_callback(None);
        if revoked.load(Ordering::Acquire) {
            // SAFETY: our own mapping, nothing is executing from it.
            unsafe {
                region::protect(
                    code_range.start as *const u8,
                    code_range.end - code_range.start,
                    region::Protection::READ_EXECUTE,
                )?;
            }
        }
        memory.reset_private_pages(final_pages)?;

        let code = match outcome {
            Ok(0) => ExitCode::CleanExit,
            Ok(raw) => match ExitCode::from_raw(raw) {
                Some(code) => code,
                None => {
                    self.state = ExecutorState::Idle;
                    return Err(ExecutionError::Protection(format!("unexpected exit code {raw}")));
                }
            },
            Err(err) => {
                self.state = ExecutorState::Idle;
                return Err(ExecutionError::Protection(err.to_string()));
            }
        };
        self.state = code.into();
        tracing::trace!(
            code_hash = %descriptor.code_hash,
            exit_code = ?code,
            "executed contract"
        );
        match code {
            ExitCode::CleanExit => Ok(()),
            ExitCode::CheckTimeFail => Err(ExecutionError::DeadlineExceeded),
            ExitCode::Segv => Err(ExecutionError::AccessViolation),
            ExitCode::Exception => Err(ExecutionError::Host(host_error.unwrap_or_else(|| {
                HostError::Panic("intrinsic failed without an error".into())
            }))),
        }
    }
}

#[cfg(all(test, target_arch = "x86_64"))]
mod tests {
    use super::*;
    use crate::context::{Action, Name, ResourceLimits, TransactionTimer};
    use crate::timer::DeadlineTimer;
    use pretty_assertions::assert_eq;
    use std::io::{Seek, SeekFrom, Write};
    use std::time::{Duration, Instant};
    use sysvmoc_types::memory_layout::{CB_OFFSET, SLICED_PAGES_FOR_RO_THREAD};
    use sysvmoc_types::Digest;

    const CODE_BEGIN: u64 = 4096;
    const INITDATA_BEGIN: u64 = 8192;

    struct TestContext {
        action: Action,
        timer: Arc<DeadlineTimer>,
    }

    impl TestContext {
        fn new(data: &[u8]) -> Self {
            Self {
                action: Action {
                    account: "sysio".parse().unwrap(),
                    name: "transfer".parse().unwrap(),
                    data: data.to_vec(),
                },
                timer: Arc::new(DeadlineTimer::new().unwrap()),
            }
        }
    }

    impl ApplyContext for TestContext {
        fn receiver(&self) -> Name {
            self.action.account
        }
        fn action(&self) -> &Action {
            &self.action
        }
        fn is_write_window(&self) -> bool {
            true
        }
        fn pending_block_time(&self) -> u64 {
            0
        }
        fn is_feature_activated(&self, _: &Digest) -> bool {
            false
        }
        fn execute_inline(&mut self, _: &[u8]) -> Result<(), String> {
            Ok(())
        }
        fn console_append(&mut self, _: &str) {}
        fn resource_limits(&self, _: Name) -> ResourceLimits {
            ResourceLimits::default()
        }
        fn timer(&self) -> Arc<dyn TransactionTimer> {
            self.timer.clone()
        }
    }

    /// A cache file with `code` at `CODE_BEGIN` and `initdata` at
    /// `INITDATA_BEGIN`.
    fn cache_file(code: &[u8], initdata: &[u8]) -> File {
        let mut file = tempfile::tempfile().unwrap();
        file.set_len(64 * 1024).unwrap();
        file.seek(SeekFrom::Start(CODE_BEGIN)).unwrap();
        file.write_all(code).unwrap();
        file.seek(SeekFrom::Start(INITDATA_BEGIN)).unwrap();
        file.write_all(initdata).unwrap();
        file
    }

    fn descriptor(pages: i32, initdata_size: u32) -> CodeDescriptor {
        CodeDescriptor {
            code_hash: Digest::hash(b"test"),
            vm_version: 0,
            codegen_version: CURRENT_CODEGEN_VERSION,
            code_begin: CODE_BEGIN,
            start: StartOffset::NoOffset,
            apply_offset: 0,
            starting_memory_pages: pages,
            initdata_begin: INITDATA_BEGIN,
            initdata_size,
            initdata_prologue_size: 0,
        }
    }

    /// `call [rcx - intrinsic_offset(ordinal)]`
    fn call_intrinsic(ordinal: usize) -> Vec<u8> {
        let disp = -(intrinsic_offset(ordinal) as i32);
        let mut code = vec![0xFF, 0x91];
        code.extend_from_slice(&disp.to_le_bytes());
        code
    }

    fn run(
        code: &[u8],
        desc: &CodeDescriptor,
        memory: &mut Memory,
        context: &mut TestContext,
    ) -> (Result<(), ExecutionError>, ExecutorState) {
        let file = cache_file(code, &[]);
        let mut executor = Executor::with_cache_file(&file).unwrap();
        let result = executor.execute(desc, memory, context);
        (result, executor.state())
    }

    #[test]
    fn returning_apply_is_a_clean_exit() {
        let mut memory = Memory::new(SLICED_PAGES_FOR_RO_THREAD).unwrap();
        let mut context = TestContext::new(&[]);
        let (result, state) = run(&[0xC3], &descriptor(1, 0), &mut memory, &mut context);
        result.unwrap();
        assert_eq!(state, ExecutorState::Returned);
        assert_eq!(unsafe { (*memory.control_block()).is_running }, 0);
    }

    #[test]
    fn memory_image_is_copied_and_the_rest_zeroed() {
        let mut memory = Memory::new(2).unwrap();
        unsafe { memory.full_page_memory_base().add(100).write(0xEE) };
        let file = cache_file(&[0xC3], &[1, 2, 3, 4]);
        let mut executor = Executor::with_cache_file(&file).unwrap();
        executor
            .execute(&descriptor(2, 4), &mut memory, &mut TestContext::new(&[]))
            .unwrap();

        let base = memory.memory_base_for_pages(2);
        let image = unsafe { std::slice::from_raw_parts(base, 101) };
        assert_eq!(&image[..4], &[1, 2, 3, 4]);
        assert_eq!(image[100], 0);
    }

    #[test]
    fn writes_within_granted_pages_stick() {
        let mut memory = Memory::new(SLICED_PAGES_FOR_RO_THREAD).unwrap();
        // mov byte [rcx], 0x2a; ret
        let (result, _) = run(
            &[0xC6, 0x01, 0x2A, 0xC3],
            &descriptor(1, 0),
            &mut memory,
            &mut TestContext::new(&[]),
        );
        result.unwrap();
        assert_eq!(unsafe { memory.full_page_memory_base().read() }, 0x2A);
    }

    #[test]
    fn access_past_granted_pages_faults() {
        let mut memory = Memory::new(SLICED_PAGES_FOR_RO_THREAD).unwrap();
        // mov byte [rcx + 0x10000], 0x2a; ret
        let code = [0xC6, 0x81, 0x00, 0x00, 0x01, 0x00, 0x2A, 0xC3];
        let (result, state) = run(&code, &descriptor(1, 0), &mut memory, &mut TestContext::new(&[]));
        assert!(matches!(result, Err(ExecutionError::AccessViolation)));
        assert_eq!(state, ExecutorState::SegvFault);

        // in bounds with two pages
        let (result, _) = run(&code, &descriptor(2, 0), &mut memory, &mut TestContext::new(&[]));
        result.unwrap();
    }

    #[test]
    fn deadline_interrupts_an_endless_loop() {
        let mut memory = Memory::new(1).unwrap();
        let mut context = TestContext::new(&[]);
        let file = cache_file(&[0xEB, 0xFE], &[]);
        let mut executor = Executor::with_cache_file(&file).unwrap();

        context
            .timer
            .start(Instant::now() + Duration::from_millis(50));
        let result = executor.execute(&descriptor(0, 0), &mut memory, &mut context);
        assert!(matches!(result, Err(ExecutionError::DeadlineExceeded)));
        assert_eq!(executor.state(), ExecutorState::CheckTimeFault);

        // the code mapping is usable again afterwards
        context.timer.stop();
        let file = cache_file(&[0xC3], &[]);
        let mut executor = Executor::with_cache_file(&file).unwrap();
        executor
            .execute(&descriptor(0, 0), &mut memory, &mut context)
            .unwrap();
    }

    #[test]
    fn already_expired_deadline_does_not_run_code() {
        let mut memory = Memory::new(1).unwrap();
        let mut context = TestContext::new(&[]);
        context.timer.start(Instant::now());
        std::thread::sleep(Duration::from_millis(50));
        assert!(context.timer.expired());

        let (result, state) = run(&[0xC3], &descriptor(0, 0), &mut memory, &mut context);
        assert!(matches!(result, Err(ExecutionError::DeadlineExceeded)));
        assert_eq!(state, ExecutorState::CheckTimeFault);
    }

    #[test]
    fn intrinsic_errors_surface_as_host_errors() {
        let mut memory = Memory::new(1).unwrap();
        // sub rsp, 8; call unreachable; add rsp, 8; ret
        let mut code = vec![0x48, 0x83, 0xEC, 0x08];
        code.extend(call_intrinsic(2));
        code.extend([0x48, 0x83, 0xC4, 0x08, 0xC3]);
        let (result, state) = run(&code, &descriptor(1, 0), &mut memory, &mut TestContext::new(&[]));
        match result {
            Err(ExecutionError::Host(err)) => assert_eq!(err, HostError::Unreachable),
            other => panic!("unexpected result {other:?}"),
        }
        assert_eq!(state, ExecutorState::Exception);
    }

    #[test]
    fn exit_intrinsic_leaves_cleanly() {
        let mut memory = Memory::new(1).unwrap();
        // sub rsp, 8; call sysio_exit; then loop forever
        let mut code = vec![0x48, 0x83, 0xEC, 0x08];
        code.extend(call_intrinsic(8));
        code.extend([0xEB, 0xFE]);
        let (result, state) = run(&code, &descriptor(1, 0), &mut memory, &mut TestContext::new(&[]));
        result.unwrap();
        assert_eq!(state, ExecutorState::Returned);
    }

    #[test]
    fn action_data_is_readable_from_contract_code() {
        let mut memory = Memory::new(1).unwrap();
        // push rcx; mov edi, 8; mov esi, 16; call read_action_data;
        // pop rcx; mov [rcx], eax; ret
        let mut code = vec![0x51, 0xBF, 0x08, 0x00, 0x00, 0x00, 0xBE, 0x10, 0x00, 0x00, 0x00];
        code.extend(call_intrinsic(10));
        code.extend([0x59, 0x89, 0x01, 0xC3]);
        let mut context = TestContext::new(b"hello");
        let (result, _) = run(&code, &descriptor(1, 0), &mut memory, &mut context);
        result.unwrap();

        let base = memory.full_page_memory_base();
        let copied = unsafe { base.cast::<u32>().read_unaligned() };
        let data = unsafe { std::slice::from_raw_parts(base.add(8), 5) };
        assert_eq!(copied, 5);
        assert_eq!(data, b"hello");
    }

    #[test]
    fn growing_past_sliced_pages_uses_private_pages() {
        let mut memory = Memory::new(1).unwrap();
        let memory_base_field = 6 * 8 - CB_OFFSET as i32;
        // push rcx; mov edi, 2; mov esi, 10; call grow_memory; pop rcx;
        // mov rcx, [rcx + memory_base]; mov [rcx], eax;
        // mov byte [rcx + 0x20000], 0x2a; ret
        let mut code = vec![0x51, 0xBF, 0x02, 0x00, 0x00, 0x00, 0xBE, 0x0A, 0x00, 0x00, 0x00];
        code.extend(call_intrinsic(1));
        code.extend([0x59, 0x48, 0x8B, 0x89]);
        code.extend(memory_base_field.to_le_bytes());
        code.extend([0x89, 0x01]);
        code.extend([0xC6, 0x81, 0x00, 0x00, 0x02, 0x00, 0x2A, 0xC3]);
        let (result, _) = run(&code, &descriptor(1, 0), &mut memory, &mut TestContext::new(&[]));
        result.unwrap();

        let cb = unsafe { &*memory.control_block() };
        assert_eq!(cb.current_linear_memory_pages, 3);
        assert_eq!(cb.first_invalid_memory_address, 3 * WASM_PAGE_SIZE);
        // previous size in pages
        assert_eq!(unsafe { memory.full_page_memory_base().read() }, 1);
    }

    #[test]
    fn bad_descriptors_are_rejected_before_running() {
        let mut memory = Memory::new(1).unwrap();
        let mut context = TestContext::new(&[]);

        let mut desc = descriptor(1, 0);
        desc.codegen_version = CURRENT_CODEGEN_VERSION + 1;
        let (result, state) = run(&[0xC3], &desc, &mut memory, &mut context);
        assert!(matches!(result, Err(ExecutionError::InvalidDescriptor(_))));
        assert_eq!(state, ExecutorState::Idle);

        let desc = descriptor(MAXIMUM_LINEAR_MEMORY_PAGES as i32 + 1, 0);
        let (result, _) = run(&[0xC3], &desc, &mut memory, &mut context);
        assert!(matches!(result, Err(ExecutionError::InvalidDescriptor(_))));

        let mut desc = descriptor(1, 0);
        desc.start = StartOffset::IntrinsicOrdinal {
            ordinal: INTRINSIC_COUNT as u64,
        };
        let (result, _) = run(&[0xC3], &desc, &mut memory, &mut context);
        assert!(matches!(result, Err(ExecutionError::InvalidDescriptor(_))));

        // the image does not fit into zero pages
        let (result, _) = run(&[0xC3], &descriptor(0, 16), &mut memory, &mut context);
        assert!(matches!(result, Err(ExecutionError::InvalidDescriptor(_))));
    }

    #[test]
    fn offsets_wrapping_around_are_rejected() {
        let mut memory = Memory::new(1).unwrap();
        let mut context = TestContext::new(&[]);

        let mut desc = descriptor(1, 0);
        desc.code_begin = u64::MAX - 1;
        desc.apply_offset = 8;
        let (result, state) = run(&[0xC3], &desc, &mut memory, &mut context);
        assert!(matches!(result, Err(ExecutionError::InvalidDescriptor(_))));
        assert_eq!(state, ExecutorState::Idle);

        let mut desc = descriptor(1, 0);
        desc.start = StartOffset::CodeOffset { offset: u64::MAX };
        let (result, _) = run(&[0xC3], &desc, &mut memory, &mut context);
        assert!(matches!(result, Err(ExecutionError::InvalidDescriptor(_))));

        let mut desc = descriptor(1, 4);
        desc.initdata_begin = u64::MAX - 1;
        let (result, _) = run(&[0xC3], &desc, &mut memory, &mut context);
        assert!(matches!(result, Err(ExecutionError::InvalidDescriptor(_))));
    }
}

use super::handlers;
use crate::context::ApplyContext;
use crate::control_block::ControlBlock;
use crate::error::{ExecutionError, HostError};
use crate::memory::Memory;
use std::cell::{Cell, RefCell};
use std::io;
use std::ops::Range;
use std::ptr;
use std::sync::OnceLock;
use sysvmoc_types::ExitCode;

unsafe extern "C" {
    fn sysvmoc_register_setjmp(
        jmp_buf: *mut *const u8,
        callback: extern "C" fn(*mut u8),
        payload: *mut u8,
    ) -> i32;
    fn sysvmoc_unwind(jmp_buf: *const u8, code: i32) -> !;
}

pub(super) unsafe fn unwind(jmp_buf: *const u8, code: i32) -> ! {
    unsafe { sysvmoc_unwind(jmp_buf, code) }
}

/// Installs the process wide fault handlers, once.
pub(crate) fn init_traps() -> Result<(), ExecutionError> {
    static INIT: OnceLock<Result<(), String>> = OnceLock::new();
    INIT.get_or_init(|| {
        // SAFETY: runs once, before any native code.
        unsafe { handlers::platform_init() }.map_err(|err| err.to_string())
    })
    .clone()
    .map_err(ExecutionError::Protection)
}

/// How control leaves native code early.
#[derive(Debug)]
pub(crate) enum Unwind {
    /// `sysio_exit` was called.
    Exit,
    /// An intrinsic was handed memory outside the granted pages.
    Segv,
    Host(HostError),
}

impl Unwind {
    fn exit_code(&self) -> ExitCode {
        match self {
            Self::Exit => ExitCode::CleanExit,
            Self::Segv => ExitCode::Segv,
            Self::Host(_) => ExitCode::Exception,
        }
    }
}

/// Everything a fault handler or an intrinsic needs to know about the
/// execution running on this thread.
pub(crate) struct CallThreadState<'a> {
    jmp_buf: Cell<*const u8>,
    prev: Cell<tls::Ptr>,
    code_range: Range<usize>,
    pub(crate) memory: &'a Memory,
    pub(crate) context: RefCell<&'a mut dyn ApplyContext>,
    host_error: RefCell<Option<HostError>>,
}

impl<'a> CallThreadState<'a> {
    pub(crate) fn new(
        code_range: Range<usize>,
        memory: &'a Memory,
        context: &'a mut dyn ApplyContext,
    ) -> Self {
        Self {
            jmp_buf: Cell::new(ptr::null()),
            prev: Cell::new(ptr::null()),
            code_range,
            memory,
            context: RefCell::new(context),
            host_error: RefCell::new(None),
        }
    }

    pub(crate) fn control_block(&self) -> *mut ControlBlock {
        self.memory.control_block()
    }

    /// The error raised by an intrinsic, after an [`ExitCode::Exception`].
    pub(crate) fn take_host_error(&self) -> Option<HostError> {
        self.host_error.borrow_mut().take()
    }

    /// Decides whether a fault at `address` is ours and where to resume.
    ///
    /// Runs in the signal handler: no allocation, no locks.
    pub(super) fn handle_fault(&self, address: usize) -> Option<(*const u8, i32)> {
        let jmp_buf = self.jmp_buf.get();
        if jmp_buf.is_null() {
            return None;
        }
        let code = if self.code_range.contains(&address) {
            ExitCode::CheckTimeFail
        } else if self.memory.contains(address) {
            ExitCode::Segv
        } else {
            return None;
        };
        Some((jmp_buf, code as i32))
    }

    fn unwind_with(&self, reason: Unwind) -> ! {
        let code = reason.exit_code() as i32;
        if let Unwind::Host(err) = reason {
            *self.host_error.borrow_mut() = Some(err);
        }
        // SAFETY: only reachable from intrinsics called by the native code
        // running inside `catch_traps`, so the buffer is live.
        unsafe { sysvmoc_unwind(self.jmp_buf.get(), code) }
    }
}

/// Runs `closure` with a resumption point installed.
///
/// Returns 0 if the closure returned, otherwise the [`ExitCode`] value it
/// was left with.
///
/// # Safety
///
/// `closure` must not hold anything that needs dropping: it may be left
/// without unwinding.
pub(crate) unsafe fn catch_traps<F>(state: &CallThreadState<'_>, mut closure: F) -> io::Result<i32>
where
    F: FnMut(),
{
    return tls::set(state, || unsafe {
        sysvmoc_register_setjmp(
            state.jmp_buf.as_ptr(),
            call_closure::<F>,
            &mut closure as *mut F as *mut u8,
        )
    });

    extern "C" fn call_closure<F>(payload: *mut u8)
    where
        F: FnMut(),
    {
        unsafe { (*(payload as *mut F))() }
    }
}

/// Gives `closure` the execution running on this thread, if any.
pub(crate) fn with_call_state<R>(closure: impl FnOnce(Option<&CallThreadState<'_>>) -> R) -> R {
    tls::with(closure)
}

/// Leaves the native code running on this thread.
///
/// Must only be called from an intrinsic, with nothing left to drop on
/// the stack.
pub(crate) fn raise(reason: Unwind) -> ! {
    tls::with(|state| {
        if let Some(state) = state {
            state.unwind_with(reason)
        }
    });
    tracing::error!("no execution to unwind on this thread");
    std::process::abort()
}

pub(super) mod tls {
    use super::CallThreadState;
    use std::io;
    use std::mem;
    use std::ptr;

    pub type Ptr = *const CallThreadState<'static>;

    mod raw {
        use super::Ptr;
        use std::cell::Cell;
        use std::ptr;

        thread_local!(static PTR: Cell<Ptr> = const { Cell::new(ptr::null()) });

        // Not inlined so the compiler cannot cache the thread local address
        // across a non-local exit.
        #[inline(never)]
        pub fn replace(val: Ptr) -> Ptr {
            PTR.with(|p| p.replace(val))
        }

        #[inline(never)]
        pub fn get() -> Ptr {
            PTR.with(|p| p.get())
        }
    }

    pub fn set<R>(state: &CallThreadState<'_>, closure: impl FnOnce() -> R) -> io::Result<R> {
        struct Reset<'a, 'b>(&'a CallThreadState<'b>);

        impl Drop for Reset<'_, '_> {
            #[inline]
            fn drop(&mut self) {
                raw::replace(self.0.prev.replace(ptr::null()));
            }
        }

        super::lazy_per_thread_init()?;
        // SAFETY: the pointer is removed again by `Reset` before `state`
        // goes out of scope.
        let ptr = unsafe { mem::transmute::<*const CallThreadState<'_>, Ptr>(state) };
        let prev = raw::replace(ptr);
        state.prev.set(prev);
        let _reset = Reset(state);
        Ok(closure())
    }

    pub fn with<R>(closure: impl FnOnce(Option<&CallThreadState<'_>>) -> R) -> R {
        let p = raw::get();
        unsafe { closure(if p.is_null() { None } else { Some(&*p) }) }
    }
}

/// Gives the thread an alternate signal stack big enough for the fault
/// handler, unless it already has one.
fn lazy_per_thread_init() -> io::Result<()> {
    thread_local! {
        static STACK: RefCell<AltStack> = const { RefCell::new(AltStack::None) };
    }

    const MIN_STACK_SIZE: usize = 16 * 4096;

    enum AltStack {
        None,
        Allocated {
            mmap_ptr: *mut libc::c_void,
            mmap_size: usize,
        },
        BigEnough,
    }

    impl Drop for AltStack {
        fn drop(&mut self) {
            let Self::Allocated {
                mmap_ptr,
                mmap_size,
            } = *self
            else {
                return;
            };
            unsafe {
                let r = libc::munmap(mmap_ptr, mmap_size);
                debug_assert_eq!(r, 0, "munmap failed during thread shutdown");
            }
        }
    }

    STACK.with(|slot| unsafe {
        let mut slot = slot.borrow_mut();
        if !matches!(*slot, AltStack::None) {
            return Ok(());
        }

        let mut old_stack = std::mem::zeroed::<libc::stack_t>();
        if libc::sigaltstack(ptr::null(), &mut old_stack) != 0 {
            return Err(io::Error::last_os_error());
        }
        if old_stack.ss_flags & libc::SS_DISABLE == 0 && old_stack.ss_size >= MIN_STACK_SIZE {
            *slot = AltStack::BigEnough;
            return Ok(());
        }

        // A guard page below the stack catches overflows of the handler.
        let guard_size = region::page::size();
        let alloc_size = guard_size + MIN_STACK_SIZE;
        let mmap_ptr = libc::mmap(
            ptr::null_mut(),
            alloc_size,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANON,
            -1,
            0,
        );
        if mmap_ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        *slot = AltStack::Allocated {
            mmap_ptr,
            mmap_size: alloc_size,
        };

        let stack_ptr = mmap_ptr.cast::<u8>().add(guard_size).cast::<libc::c_void>();
        let new_stack = libc::stack_t {
            ss_sp: stack_ptr,
            ss_flags: 0,
            ss_size: MIN_STACK_SIZE,
        };
        if libc::mprotect(stack_ptr, MIN_STACK_SIZE, libc::PROT_READ | libc::PROT_WRITE) != 0
            || libc::sigaltstack(&new_stack, ptr::null_mut()) != 0
        {
            let err = io::Error::last_os_error();
            // unmaps the allocation
            *slot = AltStack::None;
            return Err(err);
        }
        Ok(())
    })
}

use super::traphandlers::{tls, unwind};
use std::io;
use std::mem::{self, MaybeUninit};
use std::ptr;

static mut PREV_SIGSEGV: MaybeUninit<libc::sigaction> = MaybeUninit::uninit();
static mut PREV_SIGBUS: MaybeUninit<libc::sigaction> = MaybeUninit::uninit();

/// Installs the fault handlers, keeping the previous ones to chain to.
pub(super) unsafe fn platform_init() -> io::Result<()> {
    let register = |slot: *mut libc::sigaction, signal: libc::c_int| -> io::Result<()> {
        // SAFETY: sigaction is plain old data.
        let mut handler: libc::sigaction = unsafe { mem::zeroed() };
        // Run on the alternate stack: the fault may be a stack overflow.
        // Deferring is off since the handler may unwind out of itself.
        handler.sa_flags = libc::SA_SIGINFO | libc::SA_NODEFER | libc::SA_ONSTACK;
        handler.sa_sigaction = trap_handler as usize;
        unsafe {
            libc::sigemptyset(&mut handler.sa_mask);
            if libc::sigaction(signal, &handler, slot) != 0 {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(())
    };

    register((&raw mut PREV_SIGSEGV).cast(), libc::SIGSEGV)?;
    register((&raw mut PREV_SIGBUS).cast(), libc::SIGBUS)?;
    Ok(())
}

unsafe extern "C" fn trap_handler(
    signum: libc::c_int,
    siginfo: *mut libc::siginfo_t,
    context: *mut libc::c_void,
) {
    let previous: *const libc::sigaction = match signum {
        libc::SIGSEGV => (&raw const PREV_SIGSEGV).cast(),
        libc::SIGBUS => (&raw const PREV_SIGBUS).cast(),
        _ => return,
    };

    let address = unsafe { (*siginfo).si_addr() } as usize;
    if let Some((jmp_buf, code)) = tls::with(|state| state.and_then(|s| s.handle_fault(address))) {
        unsafe { unwind(jmp_buf, code) }
    }

    // Not ours. Hand the signal to whoever was installed before, or
    // restore the default action and return so the fault happens again.
    unsafe {
        let previous = &*previous;
        if previous.sa_flags & libc::SA_SIGINFO != 0 {
            mem::transmute::<
                usize,
                extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut libc::c_void),
            >(previous.sa_sigaction)(signum, siginfo, context)
        } else if previous.sa_sigaction == libc::SIG_DFL || previous.sa_sigaction == libc::SIG_IGN {
            libc::sigaction(signum, previous, ptr::null_mut());
        } else {
            mem::transmute::<usize, extern "C" fn(libc::c_int)>(previous.sa_sigaction)(signum)
        }
    }
}

//! Host functions generated code reaches through the jump table.
//!
//! Arguments arrive in the native calling convention with wasm types
//! (`i32` as `u32`/`i32`, `i64` as `u64`); pointers are offsets into
//! linear memory and are checked against the granted pages before use.
use crate::control_block::ControlBlock;
use crate::error::HostError;
use crate::trap::{raise, with_call_state, CallThreadState, Unwind};
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use sysvmoc_types::constraints::{SYSTEM_ERROR_CODE_GENERIC_EXCEPTION, WASM_PAGE_SIZE};
use sysvmoc_types::intrinsics::INTRINSIC_COUNT;
use sysvmoc_types::Digest;

/// Addresses of the intrinsics, in ordinal order.
pub(crate) fn jump_table() -> [usize; INTRINSIC_COUNT] {
    [
        depth_assert as usize,
        grow_memory as usize,
        unreachable as usize,
        indirect_call_mismatch as usize,
        indirect_call_oob as usize,
        sysio_assert as usize,
        sysio_assert_message as usize,
        sysio_assert_code as usize,
        sysio_exit as usize,
        action_data_size as usize,
        read_action_data as usize,
        current_receiver as usize,
        get_sender as usize,
        current_time as usize,
        is_feature_activated as usize,
        send_inline as usize,
        prints_l as usize,
        get_resource_limits as usize,
    ]
}

/// Runs an intrinsic body against the current execution and leaves native
/// code if it fails.
fn host_call<R>(body: impl FnOnce(&CallThreadState<'_>) -> Result<R, Unwind>) -> R {
    let outcome = with_call_state(|state| {
        state.map(|state| panic::catch_unwind(AssertUnwindSafe(|| body(state))))
    });
    let reason = match outcome {
        Some(Ok(Ok(value))) => return value,
        Some(Ok(Err(reason))) => reason,
        Some(Err(payload)) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_default();
            Unwind::Host(HostError::Panic(message))
        }
        None => {
            tracing::error!("intrinsic called outside of an execution");
            std::process::abort()
        }
    };
    raise(reason)
}

fn control_block<'s>(state: &'s CallThreadState<'_>) -> &'s mut ControlBlock {
    // SAFETY: the memory outlives the execution and native code is
    // suspended while an intrinsic runs.
    unsafe { &mut *state.control_block() }
}

/// Checks `[offset, offset + len)` is granted memory and returns its address.
fn memory_at(state: &CallThreadState<'_>, offset: u32, len: u32) -> Result<*mut u8, Unwind> {
    let cb = control_block(state);
    if u64::from(offset) + u64::from(len) > cb.first_invalid_memory_address {
        return Err(Unwind::Segv);
    }
    Ok((cb.memory_base as *mut u8).wrapping_add(offset as usize))
}

fn read_memory(state: &CallThreadState<'_>, offset: u32, len: u32) -> Result<Vec<u8>, Unwind> {
    let src = memory_at(state, offset, len)?;
    // SAFETY: checked against the granted pages.
    Ok(unsafe { std::slice::from_raw_parts(src, len as usize) }.to_vec())
}

fn write_memory(state: &CallThreadState<'_>, offset: u32, bytes: &[u8]) -> Result<(), Unwind> {
    let len = u32::try_from(bytes.len()).map_err(|_| Unwind::Segv)?;
    let dst = memory_at(state, offset, len)?;
    // SAFETY: checked against the granted pages.
    unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), dst, bytes.len()) };
    Ok(())
}

/// Reads a NUL terminated string, which must end within granted memory.
fn read_c_string(state: &CallThreadState<'_>, offset: u32) -> Result<String, Unwind> {
    let cb = control_block(state);
    let available = cb
        .first_invalid_memory_address
        .checked_sub(u64::from(offset))
        .ok_or(Unwind::Segv)?;
    let start = memory_at(state, offset, 0)?;
    // SAFETY: the whole range up to the end of granted memory is readable.
    let bytes = unsafe { std::slice::from_raw_parts(start, available as usize) };
    let end = bytes.iter().position(|&b| b == 0).ok_or(Unwind::Segv)?;
    Ok(String::from_utf8_lossy(&bytes[..end]).into_owned())
}

fn fail(err: HostError) -> Result<(), Unwind> {
    Err(Unwind::Host(err))
}

extern "C" fn depth_assert() {
    host_call(|_| fail(HostError::CallDepthExceeded))
}

/// Grows linear memory by `grow` pages, up to `max`. Returns the previous
/// size in pages, or -1.
extern "C" fn grow_memory(grow: i32, max: i32) -> i32 {
    host_call(|state| {
        let cb = control_block(state);
        let previous = cb.current_linear_memory_pages;
        if grow == 0 {
            return Ok(previous as i32);
        }
        let limit = u32::try_from(max)
            .unwrap_or(0)
            .min(cb.max_linear_memory_pages);
        let Some(pages) = u32::try_from(grow)
            .ok()
            .and_then(|grow| previous.checked_add(grow))
            .filter(|pages| *pages <= limit)
        else {
            return Ok(-1);
        };

        let memory = state.memory;
        let sliced = memory.sliced_pages();
        let (previous, pages) = (u64::from(previous), u64::from(pages));
        if pages > sliced {
            if let Err(err) = memory.unprotect_private_pages(previous.max(sliced), pages) {
                tracing::warn!(error = %err, pages, "could not grow memory");
                return Ok(-1);
            }
        }
        let base = memory.memory_base_for_pages(pages);
        let (zero_from, zero_to) = (previous.min(sliced), pages.min(sliced));
        // SAFETY: the pages are inside the slice `base` belongs to.
        unsafe {
            ptr::write_bytes(
                base.add((zero_from * WASM_PAGE_SIZE) as usize),
                0,
                ((zero_to - zero_from) * WASM_PAGE_SIZE) as usize,
            );
        }

        cb.current_linear_memory_pages = pages as u32;
        cb.first_invalid_memory_address = pages * WASM_PAGE_SIZE;
        cb.memory_base = base as u64;
        Ok(previous as i32)
    })
}

extern "C" fn unreachable() {
    host_call(|_| fail(HostError::Unreachable))
}

extern "C" fn indirect_call_mismatch() {
    host_call(|_| fail(HostError::IndirectCallMismatch))
}

extern "C" fn indirect_call_oob() {
    host_call(|_| fail(HostError::IndirectCallOutOfBounds))
}

extern "C" fn sysio_assert(condition: u32, message: u32) {
    host_call(|state| {
        if condition != 0 {
            return Ok(());
        }
        fail(HostError::AssertFailed(read_c_string(state, message)?))
    })
}

extern "C" fn sysio_assert_message(condition: u32, message: u32, len: u32) {
    host_call(|state| {
        if condition != 0 {
            return Ok(());
        }
        let message = read_memory(state, message, len)?;
        fail(HostError::AssertFailed(
            String::from_utf8_lossy(&message).into_owned(),
        ))
    })
}

extern "C" fn sysio_assert_code(condition: u32, code: u64) {
    host_call(|_| {
        if condition != 0 {
            return Ok(());
        }
        if code >= SYSTEM_ERROR_CODE_GENERIC_EXCEPTION {
            return fail(HostError::RestrictedErrorCode(code));
        }
        fail(HostError::AssertCode(code))
    })
}

extern "C" fn sysio_exit(_code: i32) {
    host_call(|_| Err::<(), _>(Unwind::Exit))
}

extern "C" fn action_data_size() -> u32 {
    host_call(|state| Ok(state.context.borrow().action().data.len() as u32))
}

/// Copies up to `len` bytes of action data to `offset`. With `len == 0`
/// only returns the size of the action data.
extern "C" fn read_action_data(offset: u32, len: u32) -> u32 {
    host_call(|state| {
        let context = state.context.borrow();
        let data = &context.action().data;
        if len == 0 {
            return Ok(data.len() as u32);
        }
        let copied = data.len().min(len as usize);
        write_memory(state, offset, &data[..copied])?;
        Ok(copied as u32)
    })
}

extern "C" fn current_receiver() -> u64 {
    host_call(|state| Ok(state.context.borrow().receiver().0))
}

extern "C" fn get_sender() -> u64 {
    host_call(|state| Ok(state.context.borrow().sender().map_or(0, |name| name.0)))
}

extern "C" fn current_time() -> u64 {
    host_call(|state| Ok(state.context.borrow().pending_block_time()))
}

extern "C" fn is_feature_activated(digest: u32) -> u32 {
    host_call(|state| {
        let bytes = read_memory(state, digest, 32)?;
        let mut feature = [0u8; 32];
        feature.copy_from_slice(&bytes);
        let active = state
            .context
            .borrow()
            .is_feature_activated(&Digest::new(feature));
        Ok(u32::from(active))
    })
}

extern "C" fn send_inline(data: u32, len: u32) {
    host_call(|state| {
        let packed = read_memory(state, data, len)?;
        state
            .context
            .borrow_mut()
            .execute_inline(&packed)
            .or_else(|reason| fail(HostError::InlineAction(reason)))
    })
}

extern "C" fn prints_l(text: u32, len: u32) {
    host_call(|state| {
        let bytes = read_memory(state, text, len)?;
        state
            .context
            .borrow_mut()
            .console_append(&String::from_utf8_lossy(&bytes));
        Ok(())
    })
}

/// Writes the limits of `account` as three `i64` at the given offsets.
extern "C" fn get_resource_limits(account: u64, ram_bytes: u32, net_weight: u32, cpu_weight: u32) {
    host_call(|state| {
        let limits = state.context.borrow().resource_limits(account.into());
        write_memory(state, ram_bytes, &limits.ram_bytes.to_le_bytes())?;
        write_memory(state, net_weight, &limits.net_weight.to_le_bytes())?;
        write_memory(state, cpu_weight, &limits.cpu_weight.to_le_bytes())
    })
}

//! Translation of hardware faults into recoverable runtime errors.
//!
//! The signal handlers themselves live outside this crate; they call
//! [`translate_signal`] with the signal number and the faulting address and
//! raise the returned error in the faulting task.

use crate::error::{RuntimeError, RuntimeResult};
use crate::memory::PAGE_SIZE;

/// Maps a synchronous signal to the error the faulting task observes.
///
/// Returns `None` for signals that are not program faults.
pub fn translate_signal(signo: i32, fault_addr: usize) -> Option<RuntimeError> {
    cfg_if::cfg_if! {
        if #[cfg(unix)] {
            match signo {
                libc::SIGFPE => Some(RuntimeError::DivideByZero),
                libc::SIGSEGV | libc::SIGBUS => Some(memory_fault(fault_addr)),
                _ => None,
            }
        } else {
            let _ = signo;
            Some(memory_fault(fault_addr))
        }
    }
}

/// Addresses inside the guard page are nil dereferences, everything else is
/// an invalid address.
pub fn memory_fault(fault_addr: usize) -> RuntimeError {
    if fault_addr < PAGE_SIZE {
        RuntimeError::NilDereference
    } else {
        RuntimeError::InvalidAddress(fault_addr)
    }
}

pub fn checked_div(a: i64, b: i64) -> RuntimeResult<i64> {
    if b == 0 {
        return Err(RuntimeError::DivideByZero);
    }
    // MIN / -1 wraps in two's complement; the language defines it as MIN.
    Ok(a.wrapping_div(b))
}

pub fn checked_rem(a: i64, b: i64) -> RuntimeResult<i64> {
    if b == 0 {
        return Err(RuntimeError::DivideByZero);
    }
    Ok(a.wrapping_rem(b))
}

pub fn checked_add(a: i64, b: i64) -> RuntimeResult<i64> {
    a.checked_add(b).ok_or(RuntimeError::Overflow)
}

pub fn checked_mul(a: i64, b: i64) -> RuntimeResult<i64> {
    a.checked_mul(b).ok_or(RuntimeError::Overflow)
}

//! Error tiers of the runtime.
//!
//! Invariant violations and resource exhaustion go through [`throw`], which
//! never returns. Faults a program can recover from are reported as
//! [`RuntimeError`] values.

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RuntimeError {
    #[error("invalid memory address or nil pointer dereference")]
    NilDereference,
    #[error("invalid memory address {0:#x}")]
    InvalidAddress(usize),
    #[error("slot {slot} out of range for object with {len} slots")]
    OutOfBounds { slot: usize, len: usize },
    #[error("slot {0} does not hold a pointer")]
    NotPointer(usize),
    #[error("slot {0} holds a pointer")]
    PointerSlot(usize),
    #[error("integer divide by zero")]
    DivideByZero,
    #[error("integer overflow")]
    Overflow,
    #[error("floating point exception")]
    FloatingPoint,
}

pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Reports an unrecoverable runtime failure.
///
/// The message is logged and the calling thread panics with
/// `"fatal error: <msg>"`. Threads owned by the runtime turn that panic into
/// a process abort, see [`run_guarded`].
#[cold]
#[track_caller]
pub fn throw(msg: &str) -> ! {
    log::error!(target: "runtime", "fatal error: {}", msg);
    panic!("fatal error: {}", msg);
}

/// Runs the entry point of a runtime-owned OS thread. A fatal error on such a
/// thread cannot be handled by anyone, so it terminates the process.
pub fn run_guarded<F: FnOnce()>(name: &str, f: F) {
    if let Err(payload) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)) {
        let msg = payload
            .downcast_ref::<String>()
            .map(|s| s.as_str())
            .or_else(|| payload.downcast_ref::<&str>().copied())
            .unwrap_or("<non-string panic>");
        log::error!(target: "runtime", "thread {} died: {}", name, msg);
        eprintln!("runtime: thread {} died: {}", name, msg);
        std::process::abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[should_panic(expected = "fatal error: span double free")]
    fn throw_panics_with_prefix() {
        throw("span double free");
    }

    #[test]
    fn messages() {
        assert_eq!(RuntimeError::DivideByZero.to_string(), "integer divide by zero");
        assert_eq!(
            RuntimeError::OutOfBounds { slot: 4, len: 2 }.to_string(),
            "slot 4 out of range for object with 2 slots"
        );
    }
}

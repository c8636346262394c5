//! Park/wake primitives for the fence word
//!
//! The fence protocol only needs two things from the platform: block while a
//! shared word still holds a given value, and release everyone blocked on
//! that word. [`WaitPrimitive`] captures exactly that, so the protocol in
//! [`crate::state`] stays independent of the kernel mechanism behind it.

use std::io;
use std::sync::atomic::AtomicI32;

/// Outcome of a single [`WaitPrimitive::wait_while_equals`] call
#[derive(Debug)]
pub enum WaitResult {
    /// Returned after a wake (possibly spurious).
    Woken,
    /// The word no longer held the expected value, or the wait was
    /// interrupted. The caller re-checks the word and retries.
    WouldBlock,
    /// Non-transient failure.
    Error(io::Error),
}

/// Blocking mechanism keyed on the address of a shared 32-bit word
///
/// Implementations must work across address spaces when the word lives in
/// memory mapped by several processes.
pub trait WaitPrimitive {
    /// Block while `word` still equals `expected`.
    fn wait_while_equals(&self, word: &AtomicI32, expected: i32) -> WaitResult;

    /// Release every thread blocked on `word`.
    fn wake_all(&self, word: &AtomicI32) -> io::Result<()>;
}

/// Linux futex, shared (non-private) variant so waiters in other processes
/// mapping the same page are found by the kernel.
#[cfg(any(target_os = "linux", target_os = "android"))]
#[derive(Debug, Clone, Copy, Default)]
pub struct Futex;

#[cfg(any(target_os = "linux", target_os = "android"))]
impl WaitPrimitive for Futex {
    fn wait_while_equals(&self, word: &AtomicI32, expected: i32) -> WaitResult {
        // SAFETY: `word` is a live, aligned 32-bit atomic for the whole call;
        // FUTEX_WAIT only reads it and a null timeout blocks indefinitely.
        let ret = unsafe {
            libc::syscall(
                libc::SYS_futex,
                word.as_ptr(),
                libc::FUTEX_WAIT,
                expected,
                std::ptr::null::<libc::timespec>(),
                std::ptr::null::<u32>(),
                0,
            )
        };
        if ret == 0 {
            return WaitResult::Woken;
        }

        let err = io::Error::last_os_error();
        match err.kind() {
            // EAGAIN: the word changed before we slept. EINTR: signal.
            io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => WaitResult::WouldBlock,
            _ => WaitResult::Error(err),
        }
    }

    fn wake_all(&self, word: &AtomicI32) -> io::Result<()> {
        // SAFETY: same as above; FUTEX_WAKE never dereferences beyond the word.
        let ret = unsafe {
            libc::syscall(
                libc::SYS_futex,
                word.as_ptr(),
                libc::FUTEX_WAKE,
                i32::MAX,
                std::ptr::null::<libc::timespec>(),
                std::ptr::null::<u32>(),
                0,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        tracing::trace!(woken = ret, "futex wake");
        Ok(())
    }
}

//! Crash barrier
//!
//! Runs a trampoline so that an invalid memory access inside the external
//! function comes back as [`Faulted`] instead of killing the process.
//!
//! On unix this is a `SIGSEGV` handler plus `sigsetjmp`/`siglongjmp`. The jump
//! buffer and the saved previous handler are single global slots; they are
//! only touched while the caller holds the [`ChannelGuard`], which is what
//! keeps barriers from nesting or overlapping.

use thiserror::Error;

use crate::backend::TrampolineFn;
use crate::channel::ChannelGuard;

/// The external call raised an invalid memory access
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("external call faulted with an invalid memory access")]
pub struct Faulted;

/// Publish `buffer` on the channel and call `entry` under the barrier.
///
/// The slot is cleared again before returning, whatever the outcome.
///
/// # Safety
///
/// `entry` must be a materialised trampoline whose reads and writes stay
/// within `buffer`'s length.
pub unsafe fn run_protected(
    guard: &mut ChannelGuard,
    entry: TrampolineFn,
    buffer: &mut [u64],
) -> Result<(), Faulted> {
    guard.publish(buffer);
    let outcome = imp::call_guarded(entry);
    guard.clear();
    outcome
}

#[cfg(unix)]
mod imp {
    use std::cell::UnsafeCell;
    use std::ffi::{c_int, c_void};
    use std::mem::MaybeUninit;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use super::Faulted;
    use crate::backend::TrampolineFn;

    /// Opaque storage large and aligned enough for any libc's `sigjmp_buf`
    #[repr(C, align(16))]
    struct SigJmpBuf([u64; 64]);

    struct Global<T>(UnsafeCell<T>);

    // Accessed only by the channel owner and by the fault handler running on
    // the owner's thread.
    unsafe impl<T> Sync for Global<T> {}

    static JUMP: Global<SigJmpBuf> = Global(UnsafeCell::new(SigJmpBuf([0; 64])));
    static PREVIOUS: Global<MaybeUninit<libc::sigaction>> =
        Global(UnsafeCell::new(MaybeUninit::uninit()));
    static ARMED: AtomicBool = AtomicBool::new(false);
    static OWNER_THREAD: AtomicUsize = AtomicUsize::new(0);

    extern "C" {
        #[cfg_attr(all(target_os = "linux", target_env = "gnu"), link_name = "__sigsetjmp")]
        fn sigsetjmp(env: *mut SigJmpBuf, savemask: c_int) -> c_int;
        fn siglongjmp(env: *mut SigJmpBuf, val: c_int) -> !;
    }

    fn current_thread() -> usize {
        unsafe { libc::pthread_self() as usize }
    }

    extern "C" fn on_fault(sig: c_int, info: *mut libc::siginfo_t, context: *mut c_void) {
        if ARMED.load(Ordering::SeqCst) && OWNER_THREAD.load(Ordering::SeqCst) == current_thread() {
            ARMED.store(false, Ordering::SeqCst);
            unsafe { siglongjmp(JUMP.0.get(), 1) }
        }
        unsafe { forward(sig, info, context) }
    }

    /// Hand a fault we do not own to whoever was installed before us
    unsafe fn forward(sig: c_int, info: *mut libc::siginfo_t, context: *mut c_void) {
        let previous = &*(*PREVIOUS.0.get()).as_ptr();
        let handler = previous.sa_sigaction;

        if handler == libc::SIG_DFL || handler == libc::SIG_IGN {
            // Returning re-executes the faulting instruction, which then
            // takes the default action.
            let mut reset: libc::sigaction = std::mem::zeroed();
            reset.sa_sigaction = libc::SIG_DFL;
            libc::sigemptyset(&mut reset.sa_mask);
            libc::sigaction(sig, &reset, std::ptr::null_mut());
        } else if previous.sa_flags & libc::SA_SIGINFO != 0 {
            let handler: extern "C" fn(c_int, *mut libc::siginfo_t, *mut c_void) =
                std::mem::transmute(handler);
            handler(sig, info, context);
        } else {
            let handler: extern "C" fn(c_int) = std::mem::transmute(handler);
            handler(sig);
        }
    }

    #[inline(never)]
    pub(super) unsafe fn call_guarded(entry: TrampolineFn) -> Result<(), Faulted> {
        let handler: extern "C" fn(c_int, *mut libc::siginfo_t, *mut c_void) = on_fault;
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = handler as libc::sighandler_t;
        action.sa_flags = libc::SA_SIGINFO | libc::SA_ONSTACK;
        libc::sigemptyset(&mut action.sa_mask);

        let previous = (*PREVIOUS.0.get()).as_mut_ptr();
        if libc::sigaction(libc::SIGSEGV, &action, previous) != 0 {
            tracing::warn!(
                target: "outcall",
                error = %std::io::Error::last_os_error(),
                "could not install fault handler; calling unprotected"
            );
            entry();
            return Ok(());
        }
        OWNER_THREAD.store(current_thread(), Ordering::SeqCst);

        // Mask saved: the jump back must unblock SIGSEGV again.
        let outcome = if sigsetjmp(JUMP.0.get(), 1) == 0 {
            ARMED.store(true, Ordering::SeqCst);
            entry();
            ARMED.store(false, Ordering::SeqCst);
            Ok(())
        } else {
            Err(Faulted)
        };

        ARMED.store(false, Ordering::SeqCst);
        OWNER_THREAD.store(0, Ordering::SeqCst);
        libc::sigaction(libc::SIGSEGV, previous, std::ptr::null_mut());
        outcome
    }
}

#[cfg(not(unix))]
mod imp {
    use std::sync::Once;

    use super::Faulted;
    use crate::backend::TrampolineFn;

    static WARN_ONCE: Once = Once::new();

    pub(super) unsafe fn call_guarded(entry: TrampolineFn) -> Result<(), Faulted> {
        WARN_ONCE.call_once(|| {
            tracing::warn!(
                target: "outcall",
                "fault interception unavailable on this platform; external calls run unprotected"
            );
        });
        entry();
        Ok(())
    }
}

//! The process-wide argument channel
//!
//! Generated trampolines take no parameters. They find their arguments by
//! loading a single global slot whose address is baked into their code; the
//! slot points at the caller's word buffer for the call currently in flight.
//!
//! Buffer layout (8-byte words):
//!
//! ```text
//! [0]     result
//! [1..=n] argument 0..n-1
//! ```
//!
//! Only one call may be in flight, so the slot is owned through a
//! [`ChannelGuard`]. Acquisition never waits: a second owner is refused.

use std::sync::atomic::{AtomicPtr, Ordering};

use parking_lot::{Mutex, MutexGuard};
use thiserror::Error;

/// Size of one buffer slot in bytes
pub const WORD_BYTES: usize = 8;

static SLOT: AtomicPtr<u64> = AtomicPtr::new(std::ptr::null_mut());
static OWNER: Mutex<()> = Mutex::new(());

/// Another external call already owns the channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("argument channel is already in use by another external call")]
pub struct ChannelBusy;

/// Access point for the global argument slot
pub struct ArgumentChannel;

impl ArgumentChannel {
    /// Address of the slot, for embedding in generated code
    pub fn slot_address() -> usize {
        SLOT.as_ptr() as usize
    }

    /// Take exclusive ownership of the slot for one call
    pub fn acquire() -> Result<ChannelGuard, ChannelBusy> {
        let lock = OWNER.try_lock().ok_or(ChannelBusy)?;
        Ok(ChannelGuard { _lock: lock })
    }

    /// Buffer pointer currently published (null when idle)
    pub fn current() -> *mut u64 {
        SLOT.load(Ordering::SeqCst)
    }
}

/// Exclusive ownership of the argument slot; clears it on drop
pub struct ChannelGuard {
    _lock: MutexGuard<'static, ()>,
}

impl ChannelGuard {
    /// Point the slot at `buffer`
    pub fn publish(&mut self, buffer: &mut [u64]) {
        SLOT.store(buffer.as_mut_ptr(), Ordering::SeqCst);
    }

    /// Reset the slot to null
    pub fn clear(&mut self) {
        SLOT.store(std::ptr::null_mut(), Ordering::SeqCst);
    }
}

impl Drop for ChannelGuard {
    fn drop(&mut self) {
        self.clear();
    }
}

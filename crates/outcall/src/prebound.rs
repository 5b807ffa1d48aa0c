//! One-time bindings for well-known C runtime functions
//!
//! On some platforms the backend's dynamic lookup cannot find a handful of C
//! runtime entry points. Their addresses are taken from the host runtime
//! directly and bound the first time a call site targets them.

use rustc_hash::FxHashMap;

/// Name → fixed address table; each entry is handed out once
#[derive(Debug, Clone, Default)]
pub struct PreboundSymbols {
    pending: FxHashMap<String, usize>,
}

impl PreboundSymbols {
    /// Table with no entries
    pub fn empty() -> Self {
        Self::default()
    }

    /// The C runtime functions whose lookup is known to be unreliable
    #[cfg(unix)]
    pub fn crt() -> Self {
        let mut table = Self::empty();
        table.insert("getpid", libc::getpid as *const () as usize);
        table.insert("putchar", libc::putchar as *const () as usize);
        table.insert("printf", libc::printf as *const () as usize);
        table.insert("fprintf", libc::fprintf as *const () as usize);
        table.insert("sprintf", libc::sprintf as *const () as usize);
        table
    }

    /// The C runtime functions whose lookup is known to be unreliable
    #[cfg(not(unix))]
    pub fn crt() -> Self {
        // No libc bindings to take addresses from here; lookup goes through
        // the backend like any other symbol.
        Self::empty()
    }

    /// Add (or replace) a pending binding
    pub fn insert(&mut self, name: impl Into<String>, address: usize) {
        self.pending.insert(name.into(), address);
    }

    /// Address for `name`, only on the first request
    pub fn take(&mut self, name: &str) -> Option<usize> {
        self.pending.remove(name)
    }

    /// Whether `name` still has a binding waiting to be applied
    pub fn is_pending(&self, name: &str) -> bool {
        self.pending.contains_key(name)
    }

    /// Number of bindings not yet applied
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// True when every binding has been applied
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

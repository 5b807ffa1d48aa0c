//! Trampoline cache
//!
//! One entry per call site, built on first dispatch. A site whose target could
//! not be resolved is remembered as [`CacheEntry::Unbuildable`].

use rustc_hash::FxHashMap;

use crate::backend::{TrampolineFn, TrampolineId};
use crate::builder::TrampolinePlan;
use crate::types::CallSiteId;

/// A compiled and materialised trampoline
#[derive(Debug, Clone)]
pub struct Trampoline {
    /// Backend handle
    pub id: TrampolineId,
    /// Directly callable entry point
    pub entry: TrampolineFn,
    /// What the trampoline does
    pub plan: TrampolinePlan,
}

/// Cached outcome of building a call site's trampoline
#[derive(Debug, Clone)]
pub enum CacheEntry {
    /// Ready to invoke
    Ready(Trampoline),
    /// The target symbol could not be resolved
    Unbuildable,
}

impl CacheEntry {
    /// The trampoline, if this entry has one
    pub fn trampoline(&self) -> Option<&Trampoline> {
        match self {
            CacheEntry::Ready(trampoline) => Some(trampoline),
            CacheEntry::Unbuildable => None,
        }
    }
}

/// Cache counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups that found an entry
    pub hits: u64,
    /// Lookups that found nothing
    pub misses: u64,
    /// `Ready` entries inserted
    pub builds: u64,
    /// `Unbuildable` entries inserted
    pub unbuildable: u64,
}

/// Call site → trampoline map owned by one dispatcher
#[derive(Debug, Default)]
pub struct TrampolineCache {
    entries: FxHashMap<CallSiteId, CacheEntry>,
    stats: CacheStats,
}

impl TrampolineCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a call site, counting the hit or miss
    pub fn lookup(&mut self, site: CallSiteId) -> Option<&CacheEntry> {
        let entry = self.entries.get(&site);
        if entry.is_some() {
            self.stats.hits += 1;
        } else {
            self.stats.misses += 1;
        }
        entry
    }

    /// Look up a call site without touching the counters
    pub fn get(&self, site: CallSiteId) -> Option<&CacheEntry> {
        self.entries.get(&site)
    }

    /// Store the build outcome for a call site, replacing any previous one
    pub fn insert(&mut self, site: CallSiteId, entry: CacheEntry) {
        match entry {
            CacheEntry::Ready(_) => self.stats.builds += 1,
            CacheEntry::Unbuildable => self.stats.unbuildable += 1,
        }
        self.entries.insert(site, entry);
    }

    /// Check if a call site has any entry
    pub fn contains(&self, site: CallSiteId) -> bool {
        self.entries.contains_key(&site)
    }

    /// Number of cached call sites (including unbuildable ones)
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing has been cached
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Counters since creation
    pub fn stats(&self) -> CacheStats {
        self.stats
    }
}

//! External call dispatcher
//!
//! The entry point an interpreter calls when it reaches a function it cannot
//! execute itself:
//!
//! 1. look the call site up in the trampoline cache
//! 2. on a miss, apply any pending prebound binding for the target, build the
//!    trampoline and cache the outcome (including "unbuildable")
//! 3. materialise new trampolines immediately so code generation errors
//!    surface here as `Err`, never as a failed external call
//! 4. run the trampoline under the crash barrier

use thiserror::Error;

use crate::backend::{BackendError, ExecutionBackend, TrampolineFn};
use crate::barrier::{self, Faulted};
use crate::builder::build_trampoline;
use crate::cache::{CacheEntry, Trampoline, TrampolineCache};
use crate::channel::{ArgumentChannel, ChannelBusy};
use crate::config::{DispatchConfig, UnbuildablePolicy};
use crate::prebound::PreboundSymbols;
use crate::symbols::{resolve_symbol, ASM_NAME_MARKER};
use crate::types::{CallSite, CallSiteId, ExternalFunction};

#[cfg(feature = "jit")]
use crate::backend::CraneliftBackend;

/// Failures that must not be mistaken for a failed external call
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Trampoline generation or materialisation failed
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// The argument buffer cannot hold the call site's result and arguments
    #[error("argument buffer for {site} holds {len} words, needs {needed}")]
    ArgumentBuffer {
        /// Offending call site
        site: CallSiteId,
        /// Words supplied
        len: usize,
        /// Words required (arguments + result slot)
        needed: usize,
    },

    /// Another external call is already in flight
    #[error("nested or concurrent external call: {0}")]
    Reentrant(#[from] ChannelBusy),
}

enum BackendSlot<'a, B> {
    Owned(B),
    Shared(&'a mut B),
}

impl<B> BackendSlot<'_, B> {
    fn get(&self) -> &B {
        match self {
            BackendSlot::Owned(backend) => backend,
            BackendSlot::Shared(backend) => backend,
        }
    }

    fn get_mut(&mut self) -> &mut B {
        match self {
            BackendSlot::Owned(backend) => backend,
            BackendSlot::Shared(backend) => backend,
        }
    }
}

/// Dispatches external calls for one execution session.
///
/// Owns the trampoline cache. The backend is either owned (dropped with the
/// dispatcher) or borrowed through [`ExternalDispatcher::attach`] and left
/// alive afterwards.
pub struct ExternalDispatcher<'a, B: ExecutionBackend> {
    backend: BackendSlot<'a, B>,
    cache: TrampolineCache,
    prebound: PreboundSymbols,
    config: DispatchConfig,
}

#[cfg(feature = "jit")]
impl ExternalDispatcher<'static, CraneliftBackend> {
    /// Create a dispatcher with its own Cranelift backend and default configuration
    pub fn new() -> Result<Self, BackendError> {
        Self::with_config(DispatchConfig::default())
    }

    /// Create a dispatcher with its own Cranelift backend
    pub fn with_config(config: DispatchConfig) -> Result<Self, BackendError> {
        let backend = CraneliftBackend::with_opt_level(config.opt_level)?;
        Ok(Self::with_backend(backend, config))
    }
}

impl<B: ExecutionBackend> ExternalDispatcher<'static, B> {
    /// Create a dispatcher that owns `backend`
    pub fn with_backend(backend: B, config: DispatchConfig) -> Self {
        Self::from_slot(BackendSlot::Owned(backend), config)
    }
}

impl<'a, B: ExecutionBackend> ExternalDispatcher<'a, B> {
    /// Create a dispatcher on a backend that outlives it
    pub fn attach(backend: &'a mut B, config: DispatchConfig) -> Self {
        Self::from_slot(BackendSlot::Shared(backend), config)
    }

    fn from_slot(backend: BackendSlot<'a, B>, config: DispatchConfig) -> Self {
        let prebound = if config.prebind_crt {
            PreboundSymbols::crt()
        } else {
            PreboundSymbols::empty()
        };
        ExternalDispatcher {
            backend,
            cache: TrampolineCache::new(),
            prebound,
            config,
        }
    }

    /// Call `target` as described by `site`.
    ///
    /// `args` holds the result in word 0 and argument `i` in word `i + 1`.
    /// `Ok(true)`: the function returned and word 0 holds its result (if any).
    /// `Ok(false)`: the target could not be resolved, or it faulted.
    pub fn execute_call(
        &mut self,
        target: &ExternalFunction,
        site: &CallSite,
        args: &mut [u64],
    ) -> Result<bool, DispatchError> {
        let needed = site.buffer_words();
        if args.len() < needed {
            return Err(DispatchError::ArgumentBuffer {
                site: site.id,
                len: args.len(),
                needed,
            });
        }

        tracing::trace!(target: "outcall", symbol = %target.name.escape_debug(), site = %site.id, kind = ?site.kind, "dispatch");

        let Some(entry) = self.trampoline_for(target, site)? else {
            return Ok(false);
        };

        let mut guard = ArgumentChannel::acquire()?;
        match unsafe { barrier::run_protected(&mut guard, entry, args) } {
            Ok(()) => Ok(true),
            Err(Faulted) => {
                tracing::warn!(target: "outcall", symbol = %target.name.escape_debug(), site = %site.id, "external call faulted");
                Ok(false)
            }
        }
    }

    fn trampoline_for(
        &mut self,
        target: &ExternalFunction,
        site: &CallSite,
    ) -> Result<Option<TrampolineFn>, DispatchError> {
        match self.cache.lookup(site.id) {
            Some(CacheEntry::Ready(trampoline)) => {
                tracing::debug!(target: "outcall", site = %site.id, trampoline = %trampoline.id, "cache hit");
                return Ok(Some(trampoline.entry));
            }
            Some(CacheEntry::Unbuildable) if self.config.unbuildable == UnbuildablePolicy::Remember => {
                return Ok(None);
            }
            _ => {}
        }

        self.apply_prebound(&target.name);

        let backend = self.backend.get_mut();
        match build_trampoline(backend, target, site)? {
            None => {
                self.cache.insert(site.id, CacheEntry::Unbuildable);
                Ok(None)
            }
            Some((id, plan)) => {
                let entry = backend.materialize(id)?;
                self.cache
                    .insert(site.id, CacheEntry::Ready(Trampoline { id, entry, plan }));
                Ok(Some(entry))
            }
        }
    }

    fn apply_prebound(&mut self, name: &str) {
        let plain = name.strip_prefix(ASM_NAME_MARKER).unwrap_or(name);
        if let Some(address) = self.prebound.take(plain) {
            tracing::debug!(target: "outcall", symbol = plain, address = format_args!("{:#x}", address), "prebound symbol bound");
            self.backend.get_mut().bind_symbol(plain, address);
        }
    }

    /// Add a one-time binding applied the first time `name` is dispatched
    pub fn prebind(&mut self, name: impl Into<String>, address: usize) {
        self.prebound.insert(name, address);
    }

    /// Address `name` would be called at, using the backend's lookup rules
    pub fn resolve(&self, name: &str) -> Option<usize> {
        resolve_symbol(self.backend.get(), name)
    }

    /// Whether a ready trampoline is cached for `site`
    pub fn has_trampoline(&self, site: CallSiteId) -> bool {
        self.cache
            .get(site)
            .map_or(false, |entry| entry.trampoline().is_some())
    }

    /// The trampoline cache
    pub fn cache(&self) -> &TrampolineCache {
        &self.cache
    }

    /// The execution backend
    pub fn backend(&self) -> &B {
        self.backend.get()
    }

    /// Mutable access to the execution backend
    pub fn backend_mut(&mut self) -> &mut B {
        self.backend.get_mut()
    }

    /// Active configuration
    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheStats;
    use crate::test_support::{serial, MockBackend};
    use crate::types::ValType;

    fn int_target(name: &str) -> ExternalFunction {
        ExternalFunction::new(name, vec![ValType::I32], Some(ValType::I32))
    }

    fn int_site(id: u64) -> CallSite {
        CallSite::new(CallSiteId(id), vec![ValType::I32], Some(ValType::I32))
    }

    fn dispatcher_with(symbols: &[(&str, usize)]) -> ExternalDispatcher<'static, MockBackend> {
        let mut backend = MockBackend::new();
        for (name, address) in symbols {
            backend.bind_symbol(name, *address);
        }
        ExternalDispatcher::with_backend(backend, DispatchConfig::default().with_prebind_crt(false))
    }

    #[test]
    fn test_builds_once_per_call_site() {
        let _serial = serial();
        let mut dispatcher = dispatcher_with(&[("abs", 0x1000)]);
        let target = int_target("abs");
        let site = int_site(1);

        for _ in 0..2 {
            let mut args = [0u64, 5];
            assert!(dispatcher.execute_call(&target, &site, &mut args).unwrap());
            assert_eq!(args[0], 1);
        }

        assert_eq!(dispatcher.backend().compiled.len(), 1);
        assert_eq!(dispatcher.backend().materialized, 1);
        assert!(dispatcher.has_trampoline(CallSiteId(1)));
        assert_eq!(
            dispatcher.cache().stats(),
            CacheStats {
                hits: 1,
                misses: 1,
                builds: 1,
                unbuildable: 0,
            }
        );
    }

    #[test]
    fn test_invoke_dispatches_like_call() {
        let _serial = serial();
        let mut dispatcher = dispatcher_with(&[("abs", 0x1000)]);
        let mut args = [0u64, 5];
        let site = int_site(2).invoke();
        assert!(dispatcher.execute_call(&int_target("abs"), &site, &mut args).unwrap());
        assert!(dispatcher.has_trampoline(CallSiteId(2)));
    }

    #[test]
    fn test_unresolvable_target() {
        let mut dispatcher = dispatcher_with(&[]);
        let target = int_target("no_such_symbol");
        let site = int_site(3);

        for _ in 0..3 {
            let mut args = [0u64, 5];
            assert!(!dispatcher.execute_call(&target, &site, &mut args).unwrap());
            assert_eq!(args, [0, 5]);
        }

        assert!(matches!(dispatcher.cache().get(CallSiteId(3)), Some(CacheEntry::Unbuildable)));
        assert!(!dispatcher.has_trampoline(CallSiteId(3)));
        assert!(dispatcher.backend().compiled.is_empty());
        assert_eq!(dispatcher.cache().stats().unbuildable, 1);
    }

    #[test]
    fn test_unresolvable_is_per_call_site() {
        let mut dispatcher = dispatcher_with(&[]);
        let target = int_target("no_such_symbol");

        let mut args = [0u64, 1];
        assert!(!dispatcher.execute_call(&target, &int_site(4), &mut args).unwrap());
        assert!(!dispatcher.execute_call(&target, &int_site(5), &mut args).unwrap());

        assert_eq!(dispatcher.cache().len(), 2);
        assert_eq!(dispatcher.cache().stats().unbuildable, 2);
    }

    #[test]
    fn test_remember_policy_never_rebuilds() {
        let _serial = serial();
        let mut dispatcher = dispatcher_with(&[]);
        let target = int_target("late");
        let site = int_site(6);
        let mut args = [0u64, 1];

        assert!(!dispatcher.execute_call(&target, &site, &mut args).unwrap());
        dispatcher.backend_mut().bind_symbol("late", 0x5000);
        assert!(!dispatcher.execute_call(&target, &site, &mut args).unwrap());
        assert!(dispatcher.backend().compiled.is_empty());
    }

    #[test]
    fn test_retry_policy_rebuilds() {
        let _serial = serial();
        let config = DispatchConfig::default()
            .with_prebind_crt(false)
            .with_unbuildable(UnbuildablePolicy::Retry);
        let mut dispatcher = ExternalDispatcher::with_backend(MockBackend::new(), config);
        let target = int_target("late");
        let site = int_site(7);
        let mut args = [0u64, 1];

        assert!(!dispatcher.execute_call(&target, &site, &mut args).unwrap());
        dispatcher.backend_mut().bind_symbol("late", 0x5000);
        assert!(dispatcher.execute_call(&target, &site, &mut args).unwrap());
        assert!(dispatcher.has_trampoline(CallSiteId(7)));
        assert_eq!(dispatcher.backend().compiled.len(), 1);
    }

    #[test]
    fn test_materialize_failure_is_an_error() {
        let mut backend = MockBackend::new();
        backend.bind_symbol("abs", 0x1000);
        backend.fail_materialize = true;
        let mut dispatcher = ExternalDispatcher::with_backend(backend, DispatchConfig::default());

        let mut args = [0u64, 5];
        let result = dispatcher.execute_call(&int_target("abs"), &int_site(8), &mut args);
        assert!(matches!(result, Err(DispatchError::Backend(BackendError::Finalize(_)))));
        assert!(!dispatcher.has_trampoline(CallSiteId(8)));
    }

    #[test]
    fn test_short_buffer_is_rejected() {
        let mut dispatcher = dispatcher_with(&[("abs", 0x1000)]);
        let mut args = [0u64];
        match dispatcher.execute_call(&int_target("abs"), &int_site(9), &mut args) {
            Err(DispatchError::ArgumentBuffer { len: 1, needed: 2, .. }) => {}
            other => panic!("Expected ArgumentBuffer error, got {:?}", other),
        }
        assert!(dispatcher.cache().is_empty());
    }

    #[test]
    fn test_nested_dispatch_fails_fast() {
        let _serial = serial();
        let mut dispatcher = dispatcher_with(&[("abs", 0x1000)]);
        let _in_flight = ArgumentChannel::acquire().unwrap();

        let mut args = [0u64, 5];
        let result = dispatcher.execute_call(&int_target("abs"), &int_site(10), &mut args);
        assert!(matches!(result, Err(DispatchError::Reentrant(ChannelBusy))));
        assert_eq!(args[0], 0);
    }

    #[test]
    fn test_prebound_binding_applies_once() {
        let _serial = serial();
        let mut dispatcher = dispatcher_with(&[]);
        dispatcher.prebind("putchar", 0x6000);
        let target = int_target("\u{1}putchar");

        let mut args = [0u64, 65];
        assert!(dispatcher.execute_call(&target, &int_site(11), &mut args).unwrap());
        assert_eq!(dispatcher.backend().compiled[0].target_address, 0x6000);
        assert_eq!(dispatcher.resolve("putchar"), Some(0x6000));

        // Already bound: a later rebinding in the backend wins.
        dispatcher.backend_mut().bind_symbol("putchar", 0x6100);
        assert!(dispatcher.execute_call(&target, &int_site(12), &mut args).unwrap());
        assert_eq!(dispatcher.backend().compiled[1].target_address, 0x6100);
    }

    #[test]
    fn test_attached_backend_outlives_dispatcher() {
        let _serial = serial();
        let mut backend = MockBackend::new();
        backend.bind_symbol("abs", 0x1000);
        {
            let mut dispatcher = ExternalDispatcher::attach(&mut backend, DispatchConfig::default());
            let mut args = [0u64, 5];
            assert!(dispatcher.execute_call(&int_target("abs"), &int_site(13), &mut args).unwrap());
            assert_eq!(dispatcher.backend().name(), "mock");
        }
        assert_eq!(backend.compiled.len(), 1);
        assert_eq!(backend.materialized, 1);
    }

    #[test]
    fn test_resolve_uses_marker_rules() {
        let dispatcher = dispatcher_with(&[("stat64", 0x2000)]);
        assert_eq!(dispatcher.resolve("\u{1}_stat64"), Some(0x2000));
        assert_eq!(dispatcher.resolve("_stat64"), None);
    }

    #[cfg(feature = "jit")]
    #[test]
    fn test_owned_cranelift_dispatcher() {
        let dispatcher = ExternalDispatcher::new().unwrap();
        assert_eq!(dispatcher.backend().name(), "cranelift");
        assert_eq!(dispatcher.config(), &DispatchConfig::default());
        assert!(dispatcher.cache().is_empty());
    }
}

//! Shared helpers for unit tests

use parking_lot::{Mutex, MutexGuard};
use rustc_hash::FxHashMap;

use crate::backend::{BackendError, ExecutionBackend, TargetInfo, TrampolineFn, TrampolineId};
use crate::builder::TrampolinePlan;
use crate::channel::ArgumentChannel;
use crate::symbols::SymbolSource;

static SERIAL: Mutex<()> = Mutex::new(());

/// Serialise tests that touch the global argument channel
pub(crate) fn serial() -> MutexGuard<'static, ()> {
    SERIAL.lock()
}

/// Stores 1 in slot 0 of the published buffer
pub(crate) extern "C" fn write_one() {
    let buffer = ArgumentChannel::current();
    unsafe { *buffer = 1 };
}

/// Backend that records plans and hands out a fixed entry point
pub(crate) struct MockBackend {
    pub symbols: FxHashMap<String, usize>,
    pub compiled: Vec<TrampolinePlan>,
    pub materialized: usize,
    pub entry: TrampolineFn,
    pub fail_materialize: bool,
}

impl MockBackend {
    pub fn new() -> Self {
        MockBackend {
            symbols: FxHashMap::default(),
            compiled: Vec::new(),
            materialized: 0,
            entry: write_one,
            fail_materialize: false,
        }
    }
}

impl SymbolSource for MockBackend {
    fn search(&self, name: &str) -> Option<usize> {
        self.symbols.get(name).copied()
    }
}

impl ExecutionBackend for MockBackend {
    fn name(&self) -> &str {
        "mock"
    }

    fn target_info(&self) -> TargetInfo {
        TargetInfo::host()
    }

    fn bind_symbol(&mut self, name: &str, address: usize) {
        self.symbols.insert(name.to_string(), address);
    }

    fn compile_trampoline(&mut self, plan: &TrampolinePlan) -> Result<TrampolineId, BackendError> {
        self.compiled.push(plan.clone());
        Ok(TrampolineId(self.compiled.len() as u32 - 1))
    }

    fn materialize(&mut self, id: TrampolineId) -> Result<TrampolineFn, BackendError> {
        if self.fail_materialize {
            return Err(BackendError::Finalize("mock finalization failure".to_string()));
        }
        if id.0 as usize >= self.compiled.len() {
            return Err(BackendError::UnknownTrampoline(id));
        }
        self.materialized += 1;
        Ok(self.entry)
    }
}

//! Backend-agnostic trampoline generation traits

use std::fmt;

use crate::builder::TrampolinePlan;
use crate::symbols::SymbolSource;

/// Entry point of a materialised trampoline
pub type TrampolineFn = unsafe extern "C" fn();

/// Handle to a trampoline compiled by a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TrampolineId(pub u32);

impl fmt::Display for TrampolineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "trampoline#{}", self.0)
    }
}

/// Target architecture
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetArch {
    /// x86-64
    X86_64,
    /// 64-bit ARM
    AArch64,
    /// Anything the dispatcher has not been exercised on
    Other,
}

/// Target information
#[derive(Debug, Clone)]
pub struct TargetInfo {
    /// Instruction set
    pub arch: TargetArch,
    /// Pointer width in bytes
    pub pointer_size: usize,
}

impl TargetInfo {
    /// Description of the machine this code is running on
    pub fn host() -> Self {
        #[cfg(target_arch = "x86_64")]
        let arch = TargetArch::X86_64;
        #[cfg(target_arch = "aarch64")]
        let arch = TargetArch::AArch64;
        #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
        let arch = TargetArch::Other;

        TargetInfo {
            arch,
            pointer_size: std::mem::size_of::<usize>(),
        }
    }
}

/// Error while generating or materialising a trampoline
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// Host ISA could not be configured
    #[error("ISA setup failed: {0}")]
    Isa(String),
    /// Generated code was rejected by the code generator
    #[error("Trampoline compilation failed: {0}")]
    Compile(String),
    /// The host calling convention cannot be expressed for this plan
    #[error("Unsupported call: {0}")]
    Unsupported(String),
    /// Compiled code could not be made executable
    #[error("Finalization failed: {0}")]
    Finalize(String),
    /// No trampoline with this handle was compiled by the backend
    #[error("Unknown trampoline: {0}")]
    UnknownTrampoline(TrampolineId),
}

/// What the dispatcher needs from a code-generation/execution backend.
///
/// Symbol lookup comes from the [`SymbolSource`] supertrait; invoking the
/// materialised entry is left to the crash barrier.
pub trait ExecutionBackend: SymbolSource {
    /// Get the backend name (for diagnostics)
    fn name(&self) -> &str;

    /// Get target architecture info
    fn target_info(&self) -> TargetInfo;

    /// Make `name` resolve to `address` from now on
    fn bind_symbol(&mut self, name: &str, address: usize);

    /// Generate code for a plan; not yet callable
    fn compile_trampoline(&mut self, plan: &TrampolinePlan) -> Result<TrampolineId, BackendError>;

    /// Make a compiled trampoline callable and return its entry
    fn materialize(&mut self, id: TrampolineId) -> Result<TrampolineFn, BackendError>;
}

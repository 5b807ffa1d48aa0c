//! Execution backends
//!
//! A backend turns a [`TrampolinePlan`](crate::TrampolinePlan) into directly
//! callable code and owns the process-wide symbol table it calls into.

pub mod traits;
#[cfg(feature = "jit")]
pub mod cranelift;

pub use traits::{BackendError, ExecutionBackend, TargetArch, TargetInfo, TrampolineFn, TrampolineId};
#[cfg(feature = "jit")]
pub use self::cranelift::CraneliftBackend;

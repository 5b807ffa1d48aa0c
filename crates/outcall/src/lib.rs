//! Outcall External Call Dispatcher
//!
//! Lets an interpreter call real native functions whose argument layout is
//! only known at the call site:
//! - **Symbols**: name → address resolution with the loader's own quirks (`symbols`)
//! - **Channel**: the single process-wide argument buffer slot (`channel`)
//! - **Builder**: per-call-site trampoline plans (`builder`)
//! - **Backend**: code generation for those plans, Cranelift by default (`backend`)
//! - **Cache**: one trampoline per call site (`cache`)
//! - **Barrier**: converts a segmentation fault in the callee into a failed call (`barrier`)
//! - **Dispatcher**: the facade composing all of the above (`dispatcher`)
//!
//! # Example
//!
//! ```rust,ignore
//! use outcall::{CallSite, CallSiteId, ExternalDispatcher, ExternalFunction, ValType};
//!
//! let mut dispatcher = ExternalDispatcher::new()?;
//! let abs = ExternalFunction::new("abs", vec![ValType::I32], Some(ValType::I32));
//! let site = CallSite::new(CallSiteId(1), vec![ValType::I32], Some(ValType::I32));
//!
//! let mut args = [0u64, (-5i32) as u32 as u64];
//! assert!(dispatcher.execute_call(&abs, &site, &mut args)?);
//! assert_eq!(args[0] as u32 as i32, 5);
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![allow(clippy::missing_safety_doc)]

pub mod backend;
pub mod barrier;
pub mod builder;
pub mod cache;
pub mod channel;
pub mod config;
pub mod dispatcher;
pub mod prebound;
pub mod symbols;
pub mod types;

#[cfg(test)]
pub(crate) mod test_support;

pub use backend::{BackendError, ExecutionBackend, TargetArch, TargetInfo, TrampolineFn, TrampolineId};
#[cfg(feature = "jit")]
pub use backend::CraneliftBackend;
pub use barrier::Faulted;
pub use builder::{build_trampoline, plan_trampoline, TrampolinePlan};
pub use cache::{CacheEntry, CacheStats, Trampoline, TrampolineCache};
pub use channel::{ArgumentChannel, ChannelBusy, ChannelGuard, WORD_BYTES};
pub use config::{DispatchConfig, OptLevel, UnbuildablePolicy};
pub use dispatcher::{DispatchError, ExternalDispatcher};
pub use prebound::PreboundSymbols;
pub use symbols::{resolve_symbol, HostSymbols, LoadError, SymbolSource, ASM_NAME_MARKER};
pub use types::{CallKind, CallSite, CallSiteId, ExternalFunction, ValType};

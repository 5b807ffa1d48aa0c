//! Trampoline planning
//!
//! A trampoline reads each call-site argument out of the channel buffer,
//! calls the target's absolute address, and writes the result to slot 0.
//! The plan fixes everything about that body; a backend only has to lower it.

use crate::backend::{BackendError, ExecutionBackend, TrampolineId};
use crate::channel::ArgumentChannel;
use crate::symbols::resolve_symbol;
use crate::types::{CallSite, ExternalFunction, ValType};

/// Everything needed to generate one call site's trampoline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrampolinePlan {
    /// Absolute address called by the trampoline
    pub target_address: usize,
    /// Address of the global slot holding the buffer pointer
    pub channel_slot: usize,
    /// Type each argument is read as; argument `i` lives in slot `i + 1`
    pub reads: Vec<ValType>,
    /// Type written to slot 0 (`None` = nothing written)
    pub result: Option<ValType>,
    /// Index of the first variadic argument, for variadic targets
    pub variadic_from: Option<usize>,
}

impl TrampolinePlan {
    /// Byte offset of argument `index` within the buffer
    pub fn arg_offset(index: usize) -> usize {
        (index + 1) * crate::channel::WORD_BYTES
    }
}

/// Lay out the trampoline for `site` calling `target` at `address`.
///
/// Argument `i` is read as the target's declared parameter type when the
/// declaration has a parameter `i`, and as the call site's own apparent type
/// otherwise (extra arguments through a cast pointer, or variadic tails).
pub fn plan_trampoline(
    target: &ExternalFunction,
    site: &CallSite,
    address: usize,
    channel_slot: usize,
) -> TrampolinePlan {
    let reads = site
        .args
        .iter()
        .enumerate()
        .map(|(i, apparent)| target.params.get(i).copied().unwrap_or(*apparent))
        .collect();

    TrampolinePlan {
        target_address: address,
        channel_slot,
        reads,
        result: site.result,
        variadic_from: target.variadic.then_some(target.params.len()),
    }
}

/// Resolve `target` and compile a trampoline for `site`.
///
/// `Ok(None)` means the symbol could not be resolved and nothing was compiled.
pub fn build_trampoline<B: ExecutionBackend + ?Sized>(
    backend: &mut B,
    target: &ExternalFunction,
    site: &CallSite,
) -> Result<Option<(TrampolineId, TrampolinePlan)>, BackendError> {
    let Some(address) = resolve_symbol(&*backend, &target.name) else {
        tracing::debug!(target: "outcall", symbol = %target.name.escape_debug(), site = %site.id, "unresolvable symbol");
        return Ok(None);
    };

    let plan = plan_trampoline(target, site, address, ArgumentChannel::slot_address());
    let id = backend.compile_trampoline(&plan)?;
    tracing::debug!(
        target: "outcall",
        symbol = %target.name.escape_debug(),
        site = %site.id,
        trampoline = %id,
        address = format_args!("{:#x}", address),
        args = plan.reads.len(),
        "trampoline built"
    );
    Ok(Some((id, plan)))
}

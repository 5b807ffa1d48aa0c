//! Cranelift execution backend
//!
//! Lowers each [`TrampolinePlan`] to a nullary native function inside one
//! `cranelift_jit::JITModule`:
//!
//! ```text
//! buf = load.ptr [channel_slot]
//! a_i = load.<read_i> [buf + 8 * (i + 1)]
//! r   = call_indirect <sig>, iconst(target_address), a_0 .. a_n
//! store.<result> r, [buf]
//! return
//! ```
//!
//! Arguments past a variadic target's declared parameters follow the host's
//! variadic convention (see [`VariadicAbi`]).

use cranelift_codegen::ir::{self, types, AbiParam, InstBuilder, MemFlags, Signature, UserFuncName};
use cranelift_codegen::settings::{self, Configurable};
use cranelift_codegen::Context;
use cranelift_frontend::{FunctionBuilder, FunctionBuilderContext};
use cranelift_jit::{JITBuilder, JITModule};
use cranelift_module::{FuncId, Module};
use target_lexicon::Architecture;

use super::traits::*;
use crate::builder::TrampolinePlan;
use crate::config::OptLevel;
use crate::symbols::{HostSymbols, SymbolSource};
use crate::types::ValType;

/// Cranelift-based trampoline backend
pub struct CraneliftBackend {
    /// `None` only while dropping
    module: Option<JITModule>,
    ctx: Context,
    func_ctx: FunctionBuilderContext,
    symbols: HostSymbols,
    /// Index = `TrampolineId`
    functions: Vec<FuncId>,
    /// Definitions added since the last finalization
    unfinalized: bool,
    target: TargetInfo,
}

impl CraneliftBackend {
    /// Create a backend targeting the host machine
    pub fn host() -> Result<Self, BackendError> {
        Self::with_opt_level(OptLevel::default())
    }

    /// Host backend with a specific optimisation level
    pub fn with_opt_level(opt_level: OptLevel) -> Result<Self, BackendError> {
        Self::with_symbols(HostSymbols::new(), opt_level)
    }

    /// Host backend resolving through `symbols`
    pub fn with_symbols(symbols: HostSymbols, opt_level: OptLevel) -> Result<Self, BackendError> {
        let mut flag_builder = settings::builder();
        flag_builder.set("opt_level", opt_level.as_setting()).map_err(|e|
            BackendError::Isa(format!("Failed to set opt_level: {}", e))
        )?;
        // Targets are absolute addresses, not relocations
        flag_builder.set("is_pic", "false").map_err(|e|
            BackendError::Isa(format!("Failed to set is_pic: {}", e))
        )?;
        flag_builder.set("use_colocated_libcalls", "false").map_err(|e|
            BackendError::Isa(format!("Failed to set use_colocated_libcalls: {}", e))
        )?;

        let flags = settings::Flags::new(flag_builder);

        let isa = cranelift_native::builder()
            .map_err(|e| BackendError::Isa(format!("Failed to create native ISA builder: {}", e)))?
            .finish(flags)
            .map_err(|e| BackendError::Isa(format!("Failed to finish ISA: {}", e)))?;

        let arch = match isa.triple().architecture {
            Architecture::X86_64 => TargetArch::X86_64,
            Architecture::Aarch64(_) => TargetArch::AArch64,
            _ => TargetArch::Other,
        };
        let target = TargetInfo {
            arch,
            pointer_size: isa.pointer_bytes() as usize,
        };

        let builder = JITBuilder::with_isa(isa, cranelift_module::default_libcall_names());
        let module = JITModule::new(builder);
        let ctx = module.make_context();

        Ok(CraneliftBackend {
            module: Some(module),
            ctx,
            func_ctx: FunctionBuilderContext::new(),
            symbols,
            functions: Vec::new(),
            unfinalized: false,
            target,
        })
    }

    /// Symbol table the backend resolves and binds through
    pub fn symbols(&self) -> &HostSymbols {
        &self.symbols
    }

    /// Mutable symbol table, e.g. to load a library permanently
    pub fn symbols_mut(&mut self) -> &mut HostSymbols {
        &mut self.symbols
    }

    /// Number of trampolines compiled so far
    pub fn trampoline_count(&self) -> usize {
        self.functions.len()
    }
}

/// Cranelift value type for a word slot read as `ty`
fn clif_type(ty: ValType, pointer_type: ir::Type) -> ir::Type {
    match ty {
        ValType::Bool | ValType::I8 => types::I8,
        ValType::I16 => types::I16,
        ValType::I32 => types::I32,
        ValType::I64 => types::I64,
        ValType::F32 => types::F32,
        ValType::F64 => types::F64,
        ValType::Ptr => pointer_type,
    }
}

/// ABI parameter with C's promotion rule for sub-word integers
fn abi_param(ty: ValType, pointer_type: ir::Type) -> AbiParam {
    let param = AbiParam::new(clif_type(ty, pointer_type));
    if ty == ValType::Bool {
        param.uext()
    } else if ty.is_signed_int() && ty.byte_width() < 8 {
        param.sext()
    } else {
        param
    }
}

// ============================================================================
// Argument lowering
// ============================================================================

/// How the host passes arguments after a variadic target's declared ones
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VariadicAbi {
    /// Same registers and stack slots as declared arguments (AAPCS64)
    Uniform,
    /// SysV x86-64: `%al` must bound the number of vector registers used
    VectorCount,
    /// Win64: floating-point values travel in integer registers
    IntegerFloats,
    /// Apple arm64: every variadic argument takes an 8-byte stack slot
    StackSlots,
    /// No known lowering
    Unknown,
}

impl VariadicAbi {
    fn host() -> Self {
        if cfg!(all(target_arch = "x86_64", windows)) {
            VariadicAbi::IntegerFloats
        } else if cfg!(target_arch = "x86_64") {
            VariadicAbi::VectorCount
        } else if cfg!(all(target_arch = "aarch64", target_vendor = "apple")) {
            VariadicAbi::StackSlots
        } else if cfg!(target_arch = "aarch64") {
            VariadicAbi::Uniform
        } else {
            VariadicAbi::Unknown
        }
    }
}

/// Argument registers per class on arm64
const ARM64_ARG_REGS: usize = 8;

/// One value handed to the callee
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operand {
    /// Word slot `index` loaded as `ty`
    Slot { index: usize, ty: ir::Type },
    /// Word slot `index` loaded as `from` and extended to 64 bits
    Widened { index: usize, from: ir::Type, signed: bool },
    /// Zero filling an argument register nobody reads
    Filler(ir::Type),
}

/// Callee operands and signature for one plan
#[derive(Debug, Clone, PartialEq, Eq)]
struct CallLowering {
    operands: Vec<(Operand, AbiParam)>,
    /// Call through [`vector_count_shim`] rather than the target
    via_shim: bool,
}

fn declared(index: usize, ty: ValType, pointer_type: ir::Type) -> (Operand, AbiParam) {
    let operand = Operand::Slot {
        index,
        ty: clif_type(ty, pointer_type),
    };
    (operand, abi_param(ty, pointer_type))
}

/// Whole-word operand: integers widened to 64 bits, floats as raw bits
fn word(index: usize, ty: ValType, pointer_type: ir::Type) -> (Operand, AbiParam) {
    let operand = match ty {
        ValType::F32 => Operand::Slot { index, ty: types::I32 },
        ValType::I64 | ValType::F64 | ValType::Ptr => Operand::Slot { index, ty: types::I64 },
        _ => Operand::Widened {
            index,
            from: clif_type(ty, pointer_type),
            signed: ty.is_signed_int(),
        },
    };
    let param = match operand {
        Operand::Slot { ty, .. } => AbiParam::new(ty),
        _ => AbiParam::new(types::I64),
    };
    (operand, param)
}

fn lower_call(
    plan: &TrampolinePlan,
    pointer_type: ir::Type,
    abi: VariadicAbi,
) -> Result<CallLowering, BackendError> {
    let fixed = plan
        .variadic_from
        .map_or(plan.reads.len(), |from| from.min(plan.reads.len()));
    let (head, tail) = plan.reads.split_at(fixed);

    let mut operands: Vec<(Operand, AbiParam)> = head
        .iter()
        .enumerate()
        .map(|(i, ty)| declared(i, *ty, pointer_type))
        .collect();
    let tail_len = tail.len();
    let tail = tail.iter().enumerate().map(|(i, ty)| (fixed + i, *ty));
    let mut via_shim = false;

    if plan.variadic_from.is_none() {
        return Ok(CallLowering { operands, via_shim });
    }

    match abi {
        VariadicAbi::Uniform => {
            operands.extend(tail.map(|(i, ty)| declared(i, ty, pointer_type)));
        }
        VariadicAbi::VectorCount => {
            operands.extend(tail.map(|(i, ty)| declared(i, ty, pointer_type)));
            via_shim = true;
        }
        VariadicAbi::IntegerFloats => {
            operands.extend(tail.map(|(i, ty)| {
                if ty.is_float() {
                    word(i, ty, pointer_type)
                } else {
                    declared(i, ty, pointer_type)
                }
            }));
        }
        VariadicAbi::StackSlots => {
            if tail_len > 0 {
                // Use up the argument registers so the tail lands on the stack
                let floats = head.iter().filter(|ty| ty.is_float()).count();
                let ints = head.len() - floats;
                let int_filler = (Operand::Filler(types::I64), AbiParam::new(types::I64));
                let float_filler = (Operand::Filler(types::F64), AbiParam::new(types::F64));
                operands.extend(std::iter::repeat_n(int_filler, ARM64_ARG_REGS.saturating_sub(ints)));
                operands.extend(std::iter::repeat_n(float_filler, ARM64_ARG_REGS.saturating_sub(floats)));
                operands.extend(tail.map(|(i, ty)| word(i, ty, pointer_type)));
            }
        }
        VariadicAbi::Unknown => {
            if tail_len > 0 {
                return Err(BackendError::Unsupported(format!(
                    "{} variadic argument(s) on this host",
                    tail_len
                )));
            }
        }
    }

    Ok(CallLowering { operands, via_shim })
}

/// Entry of the `%al` shim and the slot it reads its target from
#[cfg(all(target_arch = "x86_64", not(windows)))]
fn vector_count_shim() -> Option<(usize, usize)> {
    Some((sysv::enter as usize, sysv::TARGET.as_ptr() as usize))
}

#[cfg(not(all(target_arch = "x86_64", not(windows))))]
fn vector_count_shim() -> Option<(usize, usize)> {
    None
}

#[cfg(all(target_arch = "x86_64", not(windows)))]
mod sysv {
    use std::sync::atomic::AtomicUsize;

    /// Callee of the variadic call in flight; written by the trampoline
    pub(super) static TARGET: AtomicUsize = AtomicUsize::new(0);

    /// Sets `%al` to the largest vector register count and tail-jumps to
    /// [`TARGET`], leaving every argument register and stack slot intact.
    #[unsafe(naked)]
    pub(super) unsafe extern "C" fn enter() {
        core::arch::naked_asm!(
            "mov r11, qword ptr [rip + {target}]",
            "mov eax, 8",
            "jmp r11",
            target = sym TARGET,
        );
    }
}

impl SymbolSource for CraneliftBackend {
    fn search(&self, name: &str) -> Option<usize> {
        self.symbols.search(name)
    }
}

impl ExecutionBackend for CraneliftBackend {
    fn name(&self) -> &str {
        "cranelift"
    }

    fn target_info(&self) -> TargetInfo {
        self.target.clone()
    }

    fn bind_symbol(&mut self, name: &str, address: usize) {
        self.symbols.add_symbol(name, address);
    }

    fn compile_trampoline(&mut self, plan: &TrampolinePlan) -> Result<TrampolineId, BackendError> {
        let module = self
            .module
            .as_mut()
            .ok_or_else(|| BackendError::Compile("JIT module already released".to_string()))?;

        let pointer_type = module.target_config().pointer_type();
        let call_conv = module.target_config().default_call_conv;

        let lowering = lower_call(plan, pointer_type, VariadicAbi::host())?;
        let shim = if lowering.via_shim {
            Some(vector_count_shim().ok_or_else(|| {
                BackendError::Unsupported("variadic shim not available on this host".to_string())
            })?)
        } else {
            None
        };

        // The trampoline itself: no parameters, no results
        self.ctx.func.signature = module.make_signature();
        let func_id = module
            .declare_anonymous_function(&self.ctx.func.signature)
            .map_err(|e| BackendError::Compile(format!("Failed to declare trampoline: {}", e)))?;
        self.ctx.func.name = UserFuncName::user(0, func_id.as_u32());

        let mut callee_sig = Signature::new(call_conv);
        callee_sig
            .params
            .extend(lowering.operands.iter().map(|(_, param)| *param));
        if let Some(result) = plan.result {
            callee_sig.returns.push(abi_param(result, pointer_type));
        }

        {
            let mut builder = FunctionBuilder::new(&mut self.ctx.func, &mut self.func_ctx);
            let entry = builder.create_block();
            builder.switch_to_block(entry);
            builder.seal_block(entry);

            let flags = MemFlags::trusted();
            let slot = builder.ins().iconst(pointer_type, plan.channel_slot as i64);
            let buffer = builder.ins().load(pointer_type, flags, slot, 0);

            let args: Vec<ir::Value> = lowering
                .operands
                .iter()
                .map(|(operand, _)| match *operand {
                    Operand::Slot { index, ty } => {
                        let offset = TrampolinePlan::arg_offset(index) as i32;
                        builder.ins().load(ty, flags, buffer, offset)
                    }
                    Operand::Widened { index, from, signed } => {
                        let offset = TrampolinePlan::arg_offset(index) as i32;
                        let narrow = builder.ins().load(from, flags, buffer, offset);
                        if signed {
                            builder.ins().sextend(types::I64, narrow)
                        } else {
                            builder.ins().uextend(types::I64, narrow)
                        }
                    }
                    Operand::Filler(ty) if ty == types::F64 => builder.ins().f64const(0.0),
                    Operand::Filler(ty) => builder.ins().iconst(ty, 0),
                })
                .collect();

            let target = builder.ins().iconst(pointer_type, plan.target_address as i64);
            let callee = match shim {
                Some((shim_entry, target_slot)) => {
                    let target_slot = builder.ins().iconst(pointer_type, target_slot as i64);
                    builder.ins().store(flags, target, target_slot, 0);
                    builder.ins().iconst(pointer_type, shim_entry as i64)
                }
                None => target,
            };

            let sig_ref = builder.import_signature(callee_sig);
            let call = builder.ins().call_indirect(sig_ref, callee, &args);

            if plan.result.is_some() {
                let value = builder.inst_results(call)[0];
                builder.ins().store(flags, value, buffer, 0);
            }

            builder.ins().return_(&[]);
            builder.finalize();
        }

        let defined = module.define_function(func_id, &mut self.ctx);
        module.clear_context(&mut self.ctx);
        defined.map_err(|e| BackendError::Compile(format!("{:?}", e)))?;

        self.unfinalized = true;
        self.functions.push(func_id);
        Ok(TrampolineId(self.functions.len() as u32 - 1))
    }

    fn materialize(&mut self, id: TrampolineId) -> Result<TrampolineFn, BackendError> {
        let func_id = *self
            .functions
            .get(id.0 as usize)
            .ok_or(BackendError::UnknownTrampoline(id))?;
        let module = self
            .module
            .as_mut()
            .ok_or_else(|| BackendError::Finalize("JIT module already released".to_string()))?;

        if self.unfinalized {
            module
                .finalize_definitions()
                .map_err(|e| BackendError::Finalize(e.to_string()))?;
            self.unfinalized = false;
        }

        let code_ptr = module.get_finalized_function(func_id);
        Ok(unsafe { std::mem::transmute::<*const u8, TrampolineFn>(code_ptr) })
    }
}

impl Drop for CraneliftBackend {
    fn drop(&mut self) {
        if let Some(module) = self.module.take() {
            // Entries handed out by `materialize` die with the backend.
            unsafe { module.free_memory() };
        }
    }
}

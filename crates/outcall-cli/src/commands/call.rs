//! `outcall call` — Perform a typed external call.

use std::ffi::CString;
use std::path::PathBuf;

use anyhow::{anyhow, bail, Context};
use outcall::{
    CacheEntry, CallSite, CallSiteId, DispatchConfig, ExternalDispatcher, ExternalFunction, ValType,
};

/// Parsed `call` subcommand
pub struct CallOptions {
    pub name: String,
    pub args: Vec<String>,
    pub params: Option<String>,
    pub ret: Option<String>,
    pub repeat: u32,
    pub libs: Vec<PathBuf>,
}

/// What one dispatch produced
#[derive(Debug, Clone, PartialEq)]
pub enum CallOutcome {
    /// Returned normally; decoded result (None for void)
    Returned(Option<String>),
    /// The symbol could not be resolved
    Unresolved,
    /// The function raised an invalid memory access
    Faulted,
}

pub fn execute(options: CallOptions) -> anyhow::Result<()> {
    let outcomes = dispatch(&options)?;

    let mut failed = 0;
    for outcome in &outcomes {
        match outcome {
            CallOutcome::Returned(Some(value)) => println!("{}", value),
            CallOutcome::Returned(None) => println!("ok"),
            CallOutcome::Unresolved => {
                failed += 1;
                println!("unresolved");
            }
            CallOutcome::Faulted => {
                failed += 1;
                println!("faulted");
            }
        }
    }

    if failed > 0 {
        bail!("{} of {} calls to `{}` failed", failed, outcomes.len(), options.name);
    }
    Ok(())
}

/// Run the call `options.repeat` times through one dispatcher and call site
pub fn dispatch(options: &CallOptions) -> anyhow::Result<Vec<CallOutcome>> {
    let mut dispatcher = ExternalDispatcher::with_config(DispatchConfig::from_env())
        .context("failed to create the code generation backend")?;
    for lib in &options.libs {
        dispatcher
            .backend_mut()
            .symbols_mut()
            .load_library_permanently(lib)
            .with_context(|| format!("failed to load {}", lib.display()))?;
    }

    // Owns the bytes behind `str:` arguments until the calls are done
    let mut strings = Vec::new();
    let parsed = options
        .args
        .iter()
        .map(|spec| parse_argument(spec, &mut strings))
        .collect::<anyhow::Result<Vec<_>>>()?;

    let arg_types: Vec<ValType> = parsed.iter().map(|(ty, _)| *ty).collect();
    let params = parse_params(options.params.as_deref(), &arg_types)?;
    let result = parse_result_type(options.ret.as_deref())?;

    let target = if params.len() < arg_types.len() {
        ExternalFunction::variadic(options.name.clone(), params, result)
    } else {
        ExternalFunction::new(options.name.clone(), params, result)
    };
    let site = CallSite::new(CallSiteId(0), arg_types, result);

    let mut outcomes = Vec::with_capacity(options.repeat as usize);
    for _ in 0..options.repeat {
        let mut buffer = vec![0u64; site.buffer_words()];
        for (slot, (_, word)) in buffer[1..].iter_mut().zip(&parsed) {
            *slot = *word;
        }

        let outcome = if dispatcher.execute_call(&target, &site, &mut buffer)? {
            CallOutcome::Returned(result.map(|ty| decode_result(ty, buffer[0])))
        } else if matches!(dispatcher.cache().get(site.id), Some(CacheEntry::Unbuildable)) {
            CallOutcome::Unresolved
        } else {
            CallOutcome::Faulted
        };
        outcomes.push(outcome);
    }

    tracing::debug!(stats = ?dispatcher.cache().stats(), "call finished");
    Ok(outcomes)
}

/// Parse `TYPE:VALUE`; `str:TEXT` passes a pointer to a NUL-terminated copy
fn parse_argument(spec: &str, strings: &mut Vec<CString>) -> anyhow::Result<(ValType, u64)> {
    let (ty, value) = spec
        .split_once(':')
        .ok_or_else(|| anyhow!("argument `{}` is not TYPE:VALUE", spec))?;

    if ty == "str" {
        let text = CString::new(value).with_context(|| format!("argument `{}` contains a NUL byte", spec))?;
        let word = text.as_ptr() as usize as u64;
        strings.push(text);
        return Ok((ValType::Ptr, word));
    }

    let ty: ValType = ty.parse().map_err(anyhow::Error::msg)?;
    let word = encode_value(ty, value).with_context(|| format!("invalid value in `{}`", spec))?;
    Ok((ty, word))
}

fn parse_int(text: &str) -> anyhow::Result<i64> {
    let (negative, digits) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text),
    };
    let magnitude = match digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16)?,
        None => digits.parse::<u64>()?,
    };
    let value = magnitude as i64;
    Ok(if negative { value.wrapping_neg() } else { value })
}

/// Encode a textual value into the word layout the trampoline reads
fn encode_value(ty: ValType, text: &str) -> anyhow::Result<u64> {
    let word = match ty {
        ValType::Bool => match text {
            "true" | "1" => 1,
            "false" | "0" => 0,
            _ => bail!("expected true or false"),
        },
        ValType::I8 | ValType::I16 | ValType::I32 | ValType::I64 | ValType::Ptr => {
            parse_int(text)? as u64 & ty.word_mask()
        }
        ValType::F32 => text.parse::<f32>()?.to_bits() as u64,
        ValType::F64 => text.parse::<f64>()?.to_bits(),
    };
    Ok(word)
}

/// Decode slot 0 according to the result type
fn decode_result(ty: ValType, word: u64) -> String {
    match ty {
        ValType::Bool => ((word & 0xff) != 0).to_string(),
        ValType::I8 => (word as u8 as i8).to_string(),
        ValType::I16 => (word as u16 as i16).to_string(),
        ValType::I32 => (word as u32 as i32).to_string(),
        ValType::I64 => (word as i64).to_string(),
        ValType::F32 => f32::from_bits(word as u32).to_string(),
        ValType::F64 => f64::from_bits(word).to_string(),
        ValType::Ptr => format!("{:#x}", word & ValType::Ptr.word_mask()),
    }
}

fn parse_params(spec: Option<&str>, arg_types: &[ValType]) -> anyhow::Result<Vec<ValType>> {
    match spec {
        None => Ok(arg_types.to_vec()),
        Some(list) if list.trim().is_empty() => Ok(Vec::new()),
        Some(list) => list
            .split(',')
            .map(|ty| ty.trim().parse::<ValType>().map_err(anyhow::Error::msg))
            .collect(),
    }
}

fn parse_result_type(spec: Option<&str>) -> anyhow::Result<Option<ValType>> {
    match spec {
        None | Some("void") => Ok(None),
        Some(ty) => ty.parse().map(Some).map_err(anyhow::Error::msg),
    }
}

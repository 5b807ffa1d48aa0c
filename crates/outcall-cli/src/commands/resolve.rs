//! `outcall resolve` — Look up symbols the way the dispatcher would.

use std::path::PathBuf;

use anyhow::{bail, Context};
use outcall::{resolve_symbol, HostSymbols, ASM_NAME_MARKER};

pub fn execute(names: &[String], marker: bool, libs: &[PathBuf]) -> anyhow::Result<()> {
    let mut symbols = HostSymbols::new();
    for lib in libs {
        symbols
            .load_library_permanently(lib)
            .with_context(|| format!("failed to load {}", lib.display()))?;
    }

    let mut missing = 0;
    for (name, address) in resolve_all(&symbols, names, marker) {
        match address {
            Some(address) => println!("{:<24} {:#x}", name, address),
            None => {
                missing += 1;
                println!("{:<24} not found", name);
            }
        }
    }

    if missing > 0 {
        bail!("{} of {} symbols could not be resolved", missing, names.len());
    }
    Ok(())
}

fn resolve_all<'n>(
    symbols: &HostSymbols,
    names: &'n [String],
    marker: bool,
) -> Vec<(&'n str, Option<usize>)> {
    names
        .iter()
        .map(|name| {
            let address = if marker {
                resolve_symbol(symbols, &format!("{}{}", ASM_NAME_MARKER, name))
            } else {
                resolve_symbol(symbols, name)
            };
            (name.as_str(), address)
        })
        .collect()
}

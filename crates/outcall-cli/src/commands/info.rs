//! `outcall info` — Display environment and backend info.

use outcall::{CraneliftBackend, DispatchConfig, ExecutionBackend, TargetArch};

pub fn execute() -> anyhow::Result<()> {
    println!("outcall v{}", env!("CARGO_PKG_VERSION"));
    println!();

    println!("Platform:     {} ({})", std::env::consts::OS, std::env::consts::ARCH);

    match CraneliftBackend::host() {
        Ok(backend) => {
            let target = backend.target_info();
            let arch = match target.arch {
                TargetArch::X86_64 => "x86_64",
                TargetArch::AArch64 => "aarch64",
                TargetArch::Other => "other",
            };
            println!("Backend:      {} ({}, {}-byte pointers)", backend.name(), arch, target.pointer_size);
        }
        Err(e) => println!("Backend:      unavailable ({})", e),
    }

    let barrier = if cfg!(unix) { "SIGSEGV handler" } else { "unavailable" };
    println!("Barrier:      {}", barrier);

    let config = DispatchConfig::from_env();
    println!();
    println!("Configuration:");
    println!("  unbuildable  = {}", config.unbuildable);
    println!("  prebind_crt  = {}", config.prebind_crt);
    println!("  opt_level    = {}", config.opt_level);

    println!();
    println!("Environment:");
    print_env("  OUTCALL_UNBUILDABLE", "OUTCALL_UNBUILDABLE");
    print_env("  OUTCALL_PREBIND_CRT", "OUTCALL_PREBIND_CRT");
    print_env("  OUTCALL_OPT_LEVEL", "OUTCALL_OPT_LEVEL");
    print_env("  OUTCALL_LOG_LEVEL", "OUTCALL_LOG_LEVEL");
    print_env("  OUTCALL_LOG_FORMAT", "OUTCALL_LOG_FORMAT");

    Ok(())
}

fn print_env(label: &str, var: &str) {
    match std::env::var(var) {
        Ok(val) => println!("{} = {}", label, val),
        Err(_) => println!("{} = (default)", label),
    }
}

//! outcall command-line driver
//!
//! Resolves symbols and performs single typed external calls through the
//! dispatcher, the same way an embedding interpreter would.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;
mod logging;

use logging::{init_logging, LogOptions};

#[derive(Parser)]
#[command(name = "outcall")]
#[command(about = "Call native functions through per-call-site trampolines", long_about = None)]
#[command(version)]
struct Cli {
    /// Log level (error, warn, info, debug, trace)
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Log format (auto, text, json)
    #[arg(long, global = true)]
    log_format: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve symbol names with the dispatcher's lookup rules
    Resolve {
        /// Symbol names
        #[arg(required = true)]
        names: Vec<String>,
        /// Prefix each name with the assembly-name marker
        #[arg(long)]
        marker: bool,
        /// Shared library to load permanently before resolving
        #[arg(long = "lib")]
        libs: Vec<PathBuf>,
    },

    /// Call a native function with typed arguments (TYPE:VALUE)
    Call {
        /// Symbol name
        name: String,
        /// Arguments, e.g. i32:-5 f64:2.5 str:hello
        #[arg(allow_hyphen_values = true)]
        args: Vec<String>,
        /// Declared parameter types, comma separated (default: argument types)
        #[arg(long)]
        params: Option<String>,
        /// Result type (default: void)
        #[arg(long)]
        ret: Option<String>,
        /// Dispatch the same call site this many times
        #[arg(long, default_value_t = 1)]
        repeat: u32,
        /// Shared library to load permanently before calling
        #[arg(long = "lib")]
        libs: Vec<PathBuf>,
    },

    /// Display environment info
    Info,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_options = LogOptions::from_env().with_flags(cli.log_format.as_deref(), cli.log_level.as_deref());
    init_logging(&log_options);

    match cli.command {
        Commands::Resolve { names, marker, libs } => commands::resolve::execute(&names, marker, &libs),
        Commands::Call {
            name,
            args,
            params,
            ret,
            repeat,
            libs,
        } => commands::call::execute(commands::call::CallOptions {
            name,
            args,
            params,
            ret,
            repeat,
            libs,
        }),
        Commands::Info => commands::info::execute(),
    }
}

//! Subcommand implementations

pub mod call;
pub mod info;
pub mod resolve;

//! CLI module for AeroGuard
//!
//! Provides command-line interface for:
//! - serve: Load config and schema, serve the REST API
//! - validate: Load config and schema, report and exit

mod args;
mod commands;
mod errors;

pub use args::{Cli, Command};
pub use commands::{run, run_command, serve, validate};
pub use errors::{CliError, CliErrorCode, CliResult};

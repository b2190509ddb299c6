//! CLI argument definitions using clap
//!
//! Commands:
//! - aeroguard serve --config <path>
//! - aeroguard validate --config <path>

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// AeroGuard - row-level policy enforcement for nested CRUD
#[derive(Parser, Debug)]
#[command(name = "aeroguard")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Load the schema and serve the REST API
    Serve {
        /// Path to configuration file
        #[arg(long, default_value = "./aeroguard.json")]
        config: PathBuf,

        /// Override the configured port
        #[arg(long)]
        port: Option<u16>,
    },

    /// Check the configuration and schema, then exit
    Validate {
        /// Path to configuration file
        #[arg(long, default_value = "./aeroguard.json")]
        config: PathBuf,
    },
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Cli::parse()
    }
}

//! CLI command implementations
//!
//! `serve` boots the registry, the in-memory store and the HTTP server.
//! `validate` performs the same loading steps and reports the result
//! without binding a socket.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use serde_json::Value;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::GuardConfig;
use crate::handler::PolicyHandler;
use crate::rest_api::GuardServer;
use crate::schema::{Registry, SchemaLoader};
use crate::store::InMemoryStore;

use super::args::Command;
use super::errors::{CliError, CliResult};

/// Log filter when `RUST_LOG` is unset
const DEFAULT_FILTER: &str = "aeroguard=info,tower_http=info";

/// Main CLI entry point
///
/// Parses arguments and dispatches to the appropriate command.
/// This is the only function that main.rs should call.
pub fn run() -> CliResult<()> {
    let cli = super::args::Cli::parse_args();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| DEFAULT_FILTER.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    run_command(cli.command)
}

/// Run the appropriate command based on CLI args
pub fn run_command(cmd: Command) -> CliResult<()> {
    match cmd {
        Command::Serve { config, port } => serve(&config, port),
        Command::Validate { config } => validate(&config),
    }
}

/// Load config and schema, then serve until interrupted
pub fn serve(config_path: &Path, port: Option<u16>) -> CliResult<()> {
    let mut config = GuardConfig::load(config_path)?;
    if let Some(port) = port {
        config.port = port;
    }
    let registry = Arc::new(load_registry(&config)?);

    let rt = tokio::runtime::Runtime::new()
        .map_err(|e| CliError::boot_failed(format!("Failed to create tokio runtime: {}", e)))?;

    rt.block_on(async {
        let store = Arc::new(InMemoryStore::new(registry.clone()));
        if let Some(seed_path) = &config.seed_path {
            let seed = read_seed(seed_path)?;
            let inserted = store.seed(&seed).await?;
            info!(rows = inserted, path = %seed_path.display(), "seed data loaded");
        }

        let server = GuardServer::new(config, PolicyHandler::new(registry, store));
        server
            .start()
            .await
            .map_err(|e| CliError::boot_failed(format!("HTTP server failed: {}", e)))
    })
}

/// Check config, schema and seed document
pub fn validate(config_path: &Path) -> CliResult<()> {
    let config = GuardConfig::load(config_path)?;
    let registry = load_registry(&config)?;

    if let Some(seed_path) = &config.seed_path {
        read_seed(seed_path)?;
    }

    println!("Configuration OK: {}", config_path.display());
    println!("Models:");
    for model in registry.models() {
        println!("  - {} ({} fields)", model.name, model.fields.len());
    }
    Ok(())
}

fn load_registry(config: &GuardConfig) -> CliResult<Registry> {
    let registry = SchemaLoader::load_path(&config.schema_path)?;
    info!(
        models = registry.models().count(),
        path = %config.schema_path.display(),
        "schema loaded"
    );
    Ok(registry)
}

fn read_seed(path: &Path) -> CliResult<Value> {
    let content = fs::read_to_string(path)
        .map_err(|e| CliError::seed_error(format!("Failed to read {}: {}", path.display(), e)))?;
    serde_json::from_str(&content)
        .map_err(|e| CliError::seed_error(format!("Invalid seed JSON: {}", e)))
}

//! Service Configuration
//!
//! JSON configuration for the bundled server: bind address, schema and seed
//! documents, token validation and CORS settings.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::auth::JwtConfig;

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {reason}")]
    Io { path: String, reason: String },

    #[error("Invalid config JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardConfig {
    /// Host to bind to (default: "0.0.0.0")
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to bind to (default: 54321)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Schema document (required)
    #[serde(default)]
    pub schema_path: PathBuf,

    /// Optional JSON document of initial rows, keyed by model name
    #[serde(default)]
    pub seed_path: Option<PathBuf>,

    /// HS256 secret for bearer tokens
    #[serde(default = "default_jwt_secret")]
    pub jwt_secret: String,

    #[serde(default)]
    pub jwt_issuer: Option<String>,

    #[serde(default)]
    pub jwt_audience: Option<String>,

    /// CORS allowed origins (default: ["http://localhost:5173"])
    #[serde(default = "default_cors_origins")]
    pub cors_origins: Vec<String>,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    54321
}

fn default_jwt_secret() -> String {
    JwtConfig::default().secret
}

fn default_cors_origins() -> Vec<String> {
    vec![
        "http://localhost:5173".to_string(),
        "http://127.0.0.1:5173".to_string(),
    ]
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            schema_path: PathBuf::new(),
            seed_path: None,
            jwt_secret: default_jwt_secret(),
            jwt_issuer: None,
            jwt_audience: None,
            cors_origins: default_cors_origins(),
        }
    }
}

impl GuardConfig {
    /// Load and validate configuration from file.
    ///
    /// Relative schema and seed paths resolve against the config file's
    /// directory.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        let mut config: GuardConfig = serde_json::from_str(&content)?;
        if let Some(base) = path.parent() {
            config.schema_path = resolve(base, &config.schema_path);
            config.seed_path = config.seed_path.map(|p| resolve(base, &p));
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> ConfigResult<()> {
        if self.port == 0 {
            return Err(ConfigError::Invalid("port must be > 0".to_string()));
        }
        if self.schema_path.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("schema_path is required".to_string()));
        }
        if self.jwt_secret.is_empty() {
            return Err(ConfigError::Invalid("jwt_secret must not be empty".to_string()));
        }
        Ok(())
    }

    /// Get the socket address string
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn jwt(&self) -> JwtConfig {
        JwtConfig {
            secret: self.jwt_secret.clone(),
            issuer: self.jwt_issuer.clone(),
            audience: self.jwt_audience.clone(),
            ..JwtConfig::default()
        }
    }
}

fn resolve(base: &Path, path: &Path) -> PathBuf {
    if path.is_relative() && !path.as_os_str().is_empty() {
        base.join(path)
    } else {
        path.to_path_buf()
    }
}

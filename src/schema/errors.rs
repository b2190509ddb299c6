//! Schema error types

use thiserror::Error;

/// Result type for schema loading
pub type SchemaResult<T> = Result<T, SchemaError>;

/// Errors raised while loading a schema document
#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("Failed to read schema {path}: {reason}")]
    Io { path: String, reason: String },

    #[error("Malformed schema document: {0}")]
    Malformed(String),

    #[error("Duplicate model: {0}")]
    DuplicateModel(String),

    #[error("Duplicate field {field} on model {model}")]
    DuplicateField { model: String, field: String },

    #[error("Model {model} has no id field '{id_field}'")]
    MissingIdField { model: String, id_field: String },

    #[error("Invalid relation {model}.{field}: {reason}")]
    InvalidRelation {
        model: String,
        field: String,
        reason: String,
    },

    #[error("Invalid policy on model {model}: {reason}")]
    InvalidPolicy { model: String, reason: String },
}

impl SchemaError {
    pub fn relation(model: &str, field: &str, reason: impl Into<String>) -> Self {
        Self::InvalidRelation {
            model: model.to_string(),
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<serde_json::Error> for SchemaError {
    fn from(e: serde_json::Error) -> Self {
        Self::Malformed(e.to_string())
    }
}

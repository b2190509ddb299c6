//! Policy Operations
//!
//! The axis policies are defined over, and the mapping from HTTP verbs.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::error::CoreError;

/// Operation kinds a policy can be defined for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyOperation {
    Create,
    Read,
    Update,
    Delete,
}

impl PolicyOperation {
    /// All operation kinds
    pub const ALL: [PolicyOperation; 4] = [Self::Create, Self::Read, Self::Update, Self::Delete];

    /// Operation kinds verified after a nested write
    pub const WRITES: [PolicyOperation; 3] = [Self::Create, Self::Update, Self::Delete];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Read => "read",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for PolicyOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PolicyOperation {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(Self::Create),
            "read" => Ok(Self::Read),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            other => Err(CoreError::invalid_params(format!(
                "unknown policy operation: {}",
                other
            ))),
        }
    }
}

/// HTTP verbs accepted at the boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
}

impl HttpMethod {
    /// The policy operation this verb performs
    pub fn operation(&self) -> PolicyOperation {
        match self {
            Self::Get => PolicyOperation::Read,
            Self::Post => PolicyOperation::Create,
            Self::Put => PolicyOperation::Update,
            Self::Delete => PolicyOperation::Delete,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
        }
    }
}

impl FromStr for HttpMethod {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(Self::Get),
            "POST" => Ok(Self::Post),
            "PUT" => Ok(Self::Put),
            "DELETE" => Ok(Self::Delete),
            other => Err(CoreError::invalid_params(format!(
                "unsupported method: {}",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verb_mapping() {
        assert_eq!(HttpMethod::Get.operation(), PolicyOperation::Read);
        assert_eq!(HttpMethod::Post.operation(), PolicyOperation::Create);
        assert_eq!(HttpMethod::Put.operation(), PolicyOperation::Update);
        assert_eq!(HttpMethod::Delete.operation(), PolicyOperation::Delete);
    }

    #[test]
    fn test_operation_parsing() {
        assert_eq!("update".parse::<PolicyOperation>().unwrap(), PolicyOperation::Update);
        assert!("upsert".parse::<PolicyOperation>().is_err());
        assert_eq!("put".parse::<HttpMethod>().unwrap(), HttpMethod::Put);
        assert!("PATCH".parse::<HttpMethod>().is_err());
    }

    #[test]
    fn test_operation_serialization() {
        let json = serde_json::to_string(&PolicyOperation::Delete).unwrap();
        assert_eq!(json, "\"delete\"");
        assert!(!PolicyOperation::WRITES.contains(&PolicyOperation::Read));
    }
}

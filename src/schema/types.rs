//! Schema type definitions
//!
//! Static per-model field metadata. Produced by the schema loader and
//! consumed read-only by every enforcement stage.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Auxiliary column stamped with `<transactionId>:<operation>` during a write
pub const TRANSACTION_FIELD: &str = "__txTag";

/// Interned model handle, index into the registry's model table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModelId(pub(crate) usize);

/// Declarative attributes carried by a field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum FieldAttribute {
    /// Primary identifier
    Id,
    /// Unique across the model
    Unique,
    /// Hashed before it is written
    Password,
    /// Never returned to callers
    Omit,
    /// Generated as a v4 UUID when absent
    DefaultUuid,
    /// Generated as the current timestamp when absent
    DefaultNow,
}

impl FieldAttribute {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Id => "id",
            Self::Unique => "unique",
            Self::Password => "password",
            Self::Omit => "omit",
            Self::DefaultUuid => "default(uuid)",
            Self::DefaultNow => "default(now)",
        }
    }
}

impl TryFrom<String> for FieldAttribute {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.trim_start_matches('@') {
            "id" => Ok(Self::Id),
            "unique" => Ok(Self::Unique),
            "password" => Ok(Self::Password),
            "omit" => Ok(Self::Omit),
            "default(uuid)" | "default(uuid())" => Ok(Self::DefaultUuid),
            "default(now)" | "default(now())" => Ok(Self::DefaultNow),
            other => Err(format!("unknown field attribute: {}", other)),
        }
    }
}

impl From<FieldAttribute> for String {
    fn from(attr: FieldAttribute) -> Self {
        attr.as_str().to_string()
    }
}

/// How a relation field is joined to its target
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelationInfo {
    /// Column on this model holding the target's key (owning side)
    #[serde(default)]
    pub foreign_key: Option<String>,

    /// Column on the target referenced by `foreign_key`
    #[serde(default = "default_references")]
    pub references: String,

    /// Relation field on the target that owns the foreign key (inverse side)
    #[serde(default)]
    pub opposite: Option<String>,
}

fn default_references() -> String {
    "id".to_string()
}

/// Scalar types that are not JSON-native and travel as `{type, data}`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecialScalar {
    BigInt,
    DateTime,
    Decimal,
    Bytes,
}

impl SpecialScalar {
    pub fn from_type_name(name: &str) -> Option<Self> {
        match name {
            "BigInt" => Some(Self::BigInt),
            "DateTime" => Some(Self::DateTime),
            "Decimal" => Some(Self::Decimal),
            "Bytes" => Some(Self::Bytes),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BigInt => "BigInt",
            Self::DateTime => "DateTime",
            Self::Decimal => "Decimal",
            Self::Bytes => "Bytes",
        }
    }
}

impl fmt::Display for SpecialScalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Field metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldInfo {
    pub name: String,

    /// Scalar type name, or the target model name for relations
    #[serde(rename = "type")]
    pub type_name: String,

    /// Resolved by the loader: true when `type_name` names a model
    #[serde(default)]
    pub is_data_model: bool,

    #[serde(default, alias = "array")]
    pub is_array: bool,

    #[serde(default, alias = "optional")]
    pub is_optional: bool,

    #[serde(default)]
    pub attributes: Vec<FieldAttribute>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relation: Option<RelationInfo>,
}

impl FieldInfo {
    /// Create an optional scalar field
    pub fn scalar(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
            is_data_model: false,
            is_array: false,
            is_optional: true,
            attributes: Vec::new(),
            relation: None,
        }
    }

    pub fn has_attribute(&self, attr: FieldAttribute) -> bool {
        self.attributes.contains(&attr)
    }

    /// To-one relation
    pub fn is_to_one(&self) -> bool {
        self.is_data_model && !self.is_array
    }

    /// To-many relation
    pub fn is_to_many(&self) -> bool {
        self.is_data_model && self.is_array
    }

    /// Foreign key column when this is the owning side of a relation
    pub fn foreign_key(&self) -> Option<&str> {
        self.relation.as_ref()?.foreign_key.as_deref()
    }

    pub fn special_scalar(&self) -> Option<SpecialScalar> {
        if self.is_data_model {
            return None;
        }
        SpecialScalar::from_type_name(&self.type_name)
    }

    /// Whether the value must be kept out of responses
    pub fn is_hidden(&self) -> bool {
        self.name == TRANSACTION_FIELD || self.has_attribute(FieldAttribute::Omit)
    }
}

/// Model metadata
#[derive(Debug, Clone)]
pub struct ModelDescriptor {
    pub id: ModelId,
    pub name: String,
    pub id_field: String,
    pub fields: Vec<FieldInfo>,
}

impl ModelDescriptor {
    /// Look up a field by name
    pub fn field(&self, name: &str) -> Option<&FieldInfo> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn id_field_info(&self) -> Option<&FieldInfo> {
        self.field(&self.id_field)
    }

    /// Relation fields only
    pub fn relations(&self) -> impl Iterator<Item = &FieldInfo> {
        self.fields.iter().filter(|f| f.is_data_model)
    }

    /// Non-relation fields only
    pub fn scalars(&self) -> impl Iterator<Item = &FieldInfo> {
        self.fields.iter().filter(|f| !f.is_data_model)
    }
}

impl fmt::Display for ModelDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attribute_parsing() {
        let attrs: Vec<FieldAttribute> =
            serde_json::from_str(r#"["id", "@unique", "default(uuid())", "omit"]"#).unwrap();
        assert_eq!(
            attrs,
            vec![
                FieldAttribute::Id,
                FieldAttribute::Unique,
                FieldAttribute::DefaultUuid,
                FieldAttribute::Omit
            ]
        );

        let bad: Result<Vec<FieldAttribute>, _> = serde_json::from_str(r#"["index"]"#);
        assert!(bad.is_err());
    }

    #[test]
    fn test_field_info_aliases() {
        let field: FieldInfo = serde_json::from_str(
            r#"{"name": "posts", "type": "Post", "array": true, "relation": {"opposite": "author"}}"#,
        )
        .unwrap();

        assert!(field.is_array);
        assert_eq!(field.relation.as_ref().unwrap().references, "id");
        assert_eq!(field.foreign_key(), None);
    }

    #[test]
    fn test_special_scalars() {
        let field = FieldInfo::scalar("createdAt", "DateTime");
        assert_eq!(field.special_scalar(), Some(SpecialScalar::DateTime));
        assert_eq!(FieldInfo::scalar("name", "String").special_scalar(), None);
    }

    #[test]
    fn test_hidden_fields() {
        assert!(FieldInfo::scalar(TRANSACTION_FIELD, "String").is_hidden());

        let mut secret = FieldInfo::scalar("secret", "String");
        secret.attributes.push(FieldAttribute::Omit);
        assert!(secret.is_hidden());
    }
}

//! Schema loader
//!
//! Reads the JSON schema document (models, fields, relation wiring and
//! policy rules) and produces a validated `Registry` with a
//! `RuleGuardProvider` installed.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;

use crate::policy::guard::{PolicyRules, RuleGuardProvider};

use super::errors::{SchemaError, SchemaResult};
use super::registry::Registry;
use super::types::{FieldInfo, ModelDescriptor, ModelId, TRANSACTION_FIELD};

/// Top-level schema document
#[derive(Debug, Clone, Deserialize)]
pub struct SchemaDocument {
    pub models: Vec<ModelDocument>,
}

/// One model as declared in the schema document
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelDocument {
    pub name: String,

    #[serde(default = "default_id_field")]
    pub id_field: String,

    pub fields: Vec<FieldInfo>,

    #[serde(default)]
    pub policies: PolicyRules,
}

fn default_id_field() -> String {
    "id".to_string()
}

pub struct SchemaLoader;

impl SchemaLoader {
    /// Load a schema document from disk
    pub fn load_path(path: &Path) -> SchemaResult<Registry> {
        let content = fs::read_to_string(path).map_err(|e| SchemaError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::load_str(&content)
    }

    pub fn load_str(json: &str) -> SchemaResult<Registry> {
        let doc: SchemaDocument = serde_json::from_str(json)?;
        Self::load_document(doc)
    }

    pub fn load_document(doc: SchemaDocument) -> SchemaResult<Registry> {
        let mut names = HashSet::new();
        for model in &doc.models {
            if !names.insert(model.name.clone()) {
                return Err(SchemaError::DuplicateModel(model.name.clone()));
            }
        }

        let mut models = Vec::with_capacity(doc.models.len());
        let mut rules = HashMap::new();

        for (idx, model_doc) in doc.models.into_iter().enumerate() {
            let id = ModelId(idx);
            let fields = resolve_fields(&model_doc, &names)?;
            model_doc
                .policies
                .validate()
                .map_err(|reason| SchemaError::InvalidPolicy {
                    model: model_doc.name.clone(),
                    reason,
                })?;
            rules.insert(id, model_doc.policies);
            models.push(ModelDescriptor {
                id,
                name: model_doc.name,
                id_field: model_doc.id_field,
                fields,
            });
        }

        link_relations(&mut models)?;

        Ok(Registry::new(
            models,
            Arc::new(RuleGuardProvider::new(rules)),
        ))
    }
}

/// Mark relation fields, add implicit foreign-key columns and the
/// transaction column
fn resolve_fields(model: &ModelDocument, names: &HashSet<String>) -> SchemaResult<Vec<FieldInfo>> {
    let mut seen = HashSet::new();
    let mut fields = Vec::with_capacity(model.fields.len() + 1);

    for field in &model.fields {
        if field.name == TRANSACTION_FIELD {
            return Err(SchemaError::Malformed(format!(
                "field name {} is reserved",
                TRANSACTION_FIELD
            )));
        }
        if !seen.insert(field.name.clone()) {
            return Err(SchemaError::DuplicateField {
                model: model.name.clone(),
                field: field.name.clone(),
            });
        }
        let mut field = field.clone();
        field.is_data_model = names.contains(&field.type_name);
        fields.push(field);
    }

    let mut implicit = Vec::new();
    for field in fields.iter().filter(|f| f.is_data_model) {
        let relation = field.relation.as_ref().ok_or_else(|| {
            SchemaError::relation(&model.name, &field.name, "relation wiring is missing")
        })?;

        match (&relation.foreign_key, &relation.opposite) {
            (None, None) => {
                return Err(SchemaError::relation(
                    &model.name,
                    &field.name,
                    "needs either foreignKey or opposite",
                ))
            }
            (Some(_), _) if field.is_array => {
                return Err(SchemaError::relation(
                    &model.name,
                    &field.name,
                    "to-many relations cannot own a foreign key",
                ))
            }
            (Some(fk), _) if !seen.contains(fk) => {
                seen.insert(fk.clone());
                let mut column = FieldInfo::scalar(fk.clone(), "String");
                column.is_optional = field.is_optional;
                implicit.push(column);
            }
            _ => {}
        }
    }
    fields.extend(implicit);

    match fields.iter().find(|f| f.name == model.id_field) {
        Some(id) if !id.is_data_model => {}
        _ => {
            return Err(SchemaError::MissingIdField {
                model: model.name.clone(),
                id_field: model.id_field.clone(),
            })
        }
    }

    fields.push(FieldInfo::scalar(TRANSACTION_FIELD, "String"));
    Ok(fields)
}

/// Check inverse relations point at an owning field on the target
fn link_relations(models: &mut [ModelDescriptor]) -> SchemaResult<()> {
    let by_name: HashMap<String, usize> = models
        .iter()
        .enumerate()
        .map(|(idx, m)| (m.name.clone(), idx))
        .collect();

    let mut fk_types = Vec::new();

    for model in models.iter() {
        for field in model.relations() {
            let target = &models[by_name[&field.type_name]];
            let Some(relation) = field.relation.as_ref() else {
                continue;
            };

            if let Some(fk) = &relation.foreign_key {
                let referenced = target.field(&relation.references).ok_or_else(|| {
                    SchemaError::relation(
                        &model.name,
                        &field.name,
                        format!("{} has no field {}", target.name, relation.references),
                    )
                })?;
                fk_types.push((model.id, fk.clone(), referenced.type_name.clone()));
                continue;
            }

            let Some(opposite) = &relation.opposite else {
                continue;
            };
            let back = target.field(opposite).ok_or_else(|| {
                SchemaError::relation(
                    &model.name,
                    &field.name,
                    format!("{} has no field {}", target.name, opposite),
                )
            })?;
            if back.type_name != model.name || back.foreign_key().is_none() {
                return Err(SchemaError::relation(
                    &model.name,
                    &field.name,
                    format!("{}.{} is not an owning relation to {}", target.name, opposite, model.name),
                ));
            }
        }
    }

    // implicit foreign-key columns take the referenced column's type
    for (model_id, fk, type_name) in fk_types {
        if let Some(column) = models[model_id.0]
            .fields
            .iter_mut()
            .find(|f| f.name == fk && f.type_name == "String")
        {
            column.type_name = type_name;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{PolicyOperation, QueryContext};
    use serde_json::json;

    const BLOG: &str = r#"{
        "models": [
            { "name": "User",
              "fields": [
                { "name": "id", "type": "String", "attributes": ["id", "default(uuid)"] },
                { "name": "email", "type": "String", "attributes": ["unique"] },
                { "name": "posts", "type": "Post", "array": true, "relation": { "opposite": "author" } }
              ],
              "policies": { "allow": { "all": [ {} ] } } },
            { "name": "Post",
              "fields": [
                { "name": "id", "type": "String", "attributes": ["id"] },
                { "name": "author", "type": "User", "optional": true, "relation": { "foreignKey": "authorId" } }
              ] }
        ]
    }"#;

    #[test]
    fn test_load_resolves_relations() {
        let registry = SchemaLoader::load_str(BLOG).unwrap();

        let user = registry.model("User").unwrap();
        let posts = user.field("posts").unwrap();
        assert!(posts.is_to_many());
        assert_eq!(registry.target(posts).unwrap().name, "Post");

        let post = registry.model("Post").unwrap();
        let fk = post.field("authorId").unwrap();
        assert!(!fk.is_data_model);
        assert!(fk.is_optional);
        assert!(post.field(TRANSACTION_FIELD).is_some());
    }

    #[test]
    fn test_policies_compile_into_guards() {
        let registry = SchemaLoader::load_str(BLOG).unwrap();
        let ctx = QueryContext::anonymous();

        let user = registry.model("User").unwrap();
        let guard = registry.guard(user, PolicyOperation::Read, &ctx).unwrap();
        assert_eq!(guard, json!({}));

        // no rules: deny everything
        let post = registry.model("Post").unwrap();
        let guard = registry.guard(post, PolicyOperation::Read, &ctx).unwrap();
        assert_eq!(guard, json!({"OR": []}));
    }

    #[test]
    fn test_duplicate_model_rejected() {
        let doc = r#"{"models": [
            {"name": "A", "fields": [{"name": "id", "type": "String"}]},
            {"name": "A", "fields": [{"name": "id", "type": "String"}]}
        ]}"#;
        assert!(matches!(
            SchemaLoader::load_str(doc),
            Err(SchemaError::DuplicateModel(_))
        ));
    }

    #[test]
    fn test_missing_id_field_rejected() {
        let doc = r#"{"models": [{"name": "A", "fields": [{"name": "key", "type": "String"}]}]}"#;
        assert!(matches!(
            SchemaLoader::load_str(doc),
            Err(SchemaError::MissingIdField { .. })
        ));
    }

    #[test]
    fn test_inverse_relation_must_point_at_owner() {
        let doc = r#"{"models": [
            {"name": "A", "fields": [
                {"name": "id", "type": "String"},
                {"name": "bs", "type": "B", "array": true, "relation": {"opposite": "name"}}
            ]},
            {"name": "B", "fields": [
                {"name": "id", "type": "String"},
                {"name": "name", "type": "String"}
            ]}
        ]}"#;
        assert!(matches!(
            SchemaLoader::load_str(doc),
            Err(SchemaError::InvalidRelation { .. })
        ));
    }

    #[test]
    fn test_reserved_field_rejected() {
        let doc = format!(
            r#"{{"models": [{{"name": "A", "fields": [{{"name": "id", "type": "String"}}, {{"name": "{}", "type": "String"}}]}}]}}"#,
            TRANSACTION_FIELD
        );
        assert!(SchemaLoader::load_str(&doc).is_err());
    }

    #[test]
    fn test_unknown_policy_operation_rejected() {
        let doc = r#"{"models": [{"name": "A", "fields": [{"name": "id", "type": "String"}],
            "policies": {"allow": {"upsert": [{}]}}}]}"#;
        assert!(matches!(
            SchemaLoader::load_str(doc),
            Err(SchemaError::InvalidPolicy { .. })
        ));
    }
}

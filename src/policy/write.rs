//! # Write Preparation
//!
//! Passes over a nested write payload, each one a `WriteVisitor`:
//! - `FieldPreprocessor` normalizes caller input before anything else
//! - `TransactionTagger` stamps `<txId>:<operation>` on every entity the
//!   write touches, turns deletes into tag updates and records the models
//!   involved
//! - `PathCollector` finds the existing related entities an update reaches
//!   into, so the pre-write guard query can select them

use std::collections::BTreeSet;

use serde_json::{json, Map, Value};
use tracing::debug;

use crate::auth::crypto::{hash_password, is_password_hash};
use crate::core::{CoreError, CoreResult, PolicyOperation, QueryContext};
use crate::schema::{
    FieldAttribute, FieldInfo, ModelDescriptor, ModelId, Registry, SpecialScalar, TRANSACTION_FIELD,
};

use super::guard::{self, Guard};
use super::sanitize::is_tagged;
use super::visitor::{for_each_object, NestedWriteVisitor, WriteAction, WriteVisitor};

/// Tag value for one operation of one transaction
pub fn transaction_tag(tx_id: &str, operation: PolicyOperation) -> String {
    format!("{}:{}", tx_id, operation)
}

/// Strips caller-supplied internal columns, hashes `@password` fields and
/// unwraps `{type, data}` scalars
pub struct FieldPreprocessor;

impl WriteVisitor for FieldPreprocessor {
    type State = ();

    fn visit_entity(
        &mut self,
        model: &ModelDescriptor,
        _kind: PolicyOperation,
        data: &mut Map<String, Value>,
        _state: &(),
    ) -> CoreResult<()> {
        data.remove(TRANSACTION_FIELD);

        for field in model.scalars() {
            let Some(value) = data.get_mut(&field.name) else {
                continue;
            };

            if let Some(kind) = field.special_scalar() {
                if is_tagged(value) {
                    let inner = value.get_mut("data").map(Value::take).unwrap_or(Value::Null);
                    *value = inner;
                }
                if kind == SpecialScalar::BigInt {
                    if let Some(n) = value.as_str().and_then(|s| s.parse::<i64>().ok()) {
                        *value = Value::from(n);
                    }
                }
            }

            if field.has_attribute(FieldAttribute::Password) {
                if let Some(plain) = value.as_str().filter(|s| !is_password_hash(s)) {
                    let hashed = hash_password(plain).map_err(|e| CoreError::unknown(e.to_string()))?;
                    *value = Value::String(hashed);
                }
            }
        }
        Ok(())
    }

    fn visit_action(
        &mut self,
        _field: &FieldInfo,
        _action: WriteAction,
        _payload: &mut Value,
        _state: &(),
    ) -> CoreResult<Option<()>> {
        Ok(Some(()))
    }
}

/// Stamps transaction tags and defers deletes
pub struct TransactionTagger<'r> {
    registry: &'r Registry,
    ctx: &'r QueryContext,
    tx_id: String,
    included: BTreeSet<ModelId>,
}

impl<'r> TransactionTagger<'r> {
    pub fn new(registry: &'r Registry, ctx: &'r QueryContext, tx_id: impl Into<String>) -> Self {
        Self {
            registry,
            ctx,
            tx_id: tx_id.into(),
            included: BTreeSet::new(),
        }
    }

    pub fn into_included(self) -> BTreeSet<ModelId> {
        self.included
    }

    fn tag_data(&self, operation: PolicyOperation) -> Value {
        let mut data = Map::new();
        data.insert(
            TRANSACTION_FIELD.to_string(),
            Value::String(transaction_tag(&self.tx_id, operation)),
        );
        Value::Object(data)
    }

    /// Conjoin `guard` with the `where` of every item
    fn merge_guard(&self, payload: &mut Value, guard: &Guard) -> CoreResult<()> {
        for_each_object(payload, |item| {
            let filter = item.remove("where").unwrap_or_else(guard::guard_true);
            item.insert("where".to_string(), guard::and([guard.clone(), filter]));
            Ok(())
        })
    }

    /// Move to-many updates that write no nested relations into `updateMany`
    fn split_update_many(&self, target: &ModelDescriptor, ops: &mut Map<String, Value>) {
        let Some(updates) = ops.remove("update") else {
            return;
        };
        let mut kept = Vec::new();
        for item in into_items(updates) {
            let nested = item
                .get("data")
                .and_then(Value::as_object)
                .is_some_and(|data| data.keys().any(|k| target.field(k).is_some_and(|f| f.is_data_model)));
            if nested {
                kept.push(item);
            } else {
                push_entry(ops, "updateMany", item);
            }
        }
        if !kept.is_empty() {
            ops.insert("update".to_string(), Value::Array(kept));
        }
    }
}

impl WriteVisitor for TransactionTagger<'_> {
    type State = ();

    fn visit_entity(
        &mut self,
        model: &ModelDescriptor,
        kind: PolicyOperation,
        data: &mut Map<String, Value>,
        _state: &(),
    ) -> CoreResult<()> {
        data.insert(
            TRANSACTION_FIELD.to_string(),
            Value::String(transaction_tag(&self.tx_id, kind)),
        );
        self.included.insert(model.id);
        Ok(())
    }

    fn visit_action(
        &mut self,
        field: &FieldInfo,
        action: WriteAction,
        payload: &mut Value,
        _state: &(),
    ) -> CoreResult<Option<()>> {
        let target = self.registry.require_target(field)?;

        match action {
            WriteAction::Delete | WriteAction::DeleteMany => {
                self.included.insert(target.id);
                Ok(None)
            }
            WriteAction::Connect | WriteAction::Disconnect | WriteAction::Set => Ok(None),
            WriteAction::Update | WriteAction::UpdateMany | WriteAction::Upsert
                if field.is_to_many() =>
            {
                let guard = self.registry.guard(target, PolicyOperation::Update, self.ctx)?;
                self.merge_guard(payload, &guard)?;
                debug!(field = %field.name, %action, "update guard merged into nested where");
                Ok(Some(()))
            }
            WriteAction::UpdateMany => Err(CoreError::invalid_params(format!(
                "updateMany is not supported on to-one relation {}",
                field.name
            ))),
            _ => Ok(Some(())),
        }
    }

    fn finish_relation(
        &mut self,
        field: &FieldInfo,
        ops: &mut Map<String, Value>,
        _state: &(),
    ) -> CoreResult<()> {
        let target = self.registry.require_target(field)?;
        if field.is_to_many() {
            self.split_update_many(target, ops);
        }

        let tag = self.tag_data(PolicyOperation::Delete);

        if let Some(payload) = ops.remove("delete") {
            if field.is_to_one() {
                if ops.contains_key("update") {
                    return Err(CoreError::invalid_params(format!(
                        "{} cannot be updated and deleted in one request",
                        field.name
                    )));
                }
                let mut update = Map::new();
                match payload {
                    Value::Bool(false) => {}
                    Value::Bool(true) | Value::Null => {
                        update.insert("data".to_string(), tag.clone());
                        ops.insert("update".to_string(), Value::Object(update));
                    }
                    filter => {
                        update.insert("where".to_string(), filter);
                        update.insert("data".to_string(), tag.clone());
                        ops.insert("update".to_string(), Value::Object(update));
                    }
                }
            } else {
                for filter in into_items(payload) {
                    push_entry(ops, "update", json!({ "where": filter, "data": tag.clone() }));
                }
            }
        }

        if let Some(payload) = ops.remove("deleteMany") {
            for filter in into_items(payload) {
                push_entry(ops, "updateMany", json!({ "where": filter, "data": tag.clone() }));
            }
        }
        Ok(())
    }
}

fn into_items(value: Value) -> Vec<Value> {
    match value {
        Value::Array(items) => items,
        other => vec![other],
    }
}

/// Append to an operation that may already hold one entry or an array
fn push_entry(ops: &mut Map<String, Value>, key: &str, entry: Value) {
    let mut entries = match ops.remove(key) {
        Some(existing) => into_items(existing),
        None => Vec::new(),
    };
    entries.push(entry);
    ops.insert(key.to_string(), Value::Array(entries));
}

/// A write payload ready to run inside a transaction
#[derive(Debug, Clone)]
pub struct PreparedWrite {
    pub data: Value,
    /// Every model the write creates, updates or deletes rows of
    pub included: BTreeSet<ModelId>,
}

/// Preprocess and tag a top-level create or update payload
pub fn prepare_write(
    registry: &Registry,
    model: &ModelDescriptor,
    kind: PolicyOperation,
    data: Value,
    tx_id: &str,
    ctx: &QueryContext,
) -> CoreResult<PreparedWrite> {
    let mut data = match data {
        Value::Object(map) => Value::Object(map),
        Value::Null => return Err(CoreError::invalid_params("missing data")),
        other => {
            return Err(CoreError::invalid_params(format!(
                "data must be an object, found {}",
                other
            )))
        }
    };

    let visitor = NestedWriteVisitor::new(registry);
    visitor.visit(model, kind, &mut data, (), &mut FieldPreprocessor)?;

    let mut tagger = TransactionTagger::new(registry, ctx, tx_id);
    visitor.visit(model, kind, &mut data, (), &mut tagger)?;
    let included = tagger.into_included();

    debug!(model = %model.name, %kind, included = included.len(), "write prepared");
    Ok(PreparedWrite { data, included })
}

/// One step of a path from the written entity into its relations
#[derive(Debug, Clone)]
pub struct PathSegment {
    pub field: FieldInfo,
    /// Narrows a to-many step to the items the write targets
    pub filter: Option<Guard>,
}

pub type SelectionPath = Vec<PathSegment>;

/// Collects the paths to existing entities an update writes through
#[derive(Debug, Default)]
pub struct PathCollector {
    pub paths: Vec<SelectionPath>,
}

impl WriteVisitor for PathCollector {
    type State = SelectionPath;

    fn visit_action(
        &mut self,
        field: &FieldInfo,
        action: WriteAction,
        payload: &mut Value,
        path: &SelectionPath,
    ) -> CoreResult<Option<SelectionPath>> {
        use WriteAction::{Update, UpdateMany, Upsert};

        // deletes are held to the delete guard by the tag count instead
        let filter = match action {
            Update | Upsert if field.is_to_one() => None,
            Update | UpdateMany | Upsert if field.is_to_many() => {
                let mut wheres = Vec::new();
                for_each_object(payload, |item| {
                    wheres.push(item.get("where").cloned().unwrap_or_else(guard::guard_true));
                    Ok(())
                })?;
                Some(guard::or(wheres))
            }
            _ => return Ok(None),
        };

        let mut next = path.clone();
        next.push(PathSegment {
            field: field.clone(),
            filter,
        });
        self.paths.push(next.clone());
        Ok(Some(next))
    }
}

/// Read arguments proving the update target exists under `filter`, with the
/// id of every to-one the payload writes through force-selected
pub fn pre_write_guard_args(
    registry: &Registry,
    model: &ModelDescriptor,
    filter: Value,
    data: &Value,
) -> CoreResult<Value> {
    let mut data = data.clone();
    let mut collector = PathCollector::default();
    NestedWriteVisitor::new(registry).visit(
        model,
        PolicyOperation::Update,
        &mut data,
        Vec::new(),
        &mut collector,
    )?;

    let mut select = Map::new();
    select.insert(model.id_field.clone(), Value::Bool(true));
    for path in &collector.paths {
        widen(registry, &mut select, path)?;
    }

    Ok(json!({ "where": filter, "select": select }))
}

fn widen(registry: &Registry, select: &mut Map<String, Value>, path: &[PathSegment]) -> CoreResult<()> {
    let Some((head, rest)) = path.split_first() else {
        return Ok(());
    };
    let target = registry.require_target(&head.field)?;

    let entry = select.entry(head.field.name.clone()).or_insert(Value::Null);
    if !entry.is_object() {
        *entry = json!({});
    }
    let Some(entry) = entry.as_object_mut() else {
        return Ok(());
    };
    if let Some(filter) = &head.filter {
        entry.insert("where".to_string(), filter.clone());
    }

    let nested = entry.entry("select").or_insert(Value::Null);
    if !nested.is_object() {
        *nested = json!({});
    }
    let Some(nested) = nested.as_object_mut() else {
        return Ok(());
    };
    nested.insert(target.id_field.clone(), Value::Bool(true));
    widen(registry, nested, rest)
}

//! # In-Memory Store
//!
//! Relational tables held in memory, one row vector per model. Every
//! statement runs against a scratch copy that replaces the tables only on
//! success, so a failing statement has no partial effect.
//!
//! Transactions hold the table lock for their whole lifetime and work on a
//! private copy; `commit` publishes it, `rollback` (or drop) discards it.

use std::sync::{Arc, Mutex as StdMutex, MutexGuard as StdMutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;
use uuid::Uuid;

use crate::schema::{FieldAttribute, FieldInfo, ModelDescriptor, ModelId, Registry};

use super::filter::{sort_order, values_equal};
use super::{DataStore, Executor, StoreError, StoreResult, Transaction};

pub(super) type Row = Map<String, Value>;

/// Row storage for every model
#[derive(Debug, Clone, Default)]
pub(super) struct Tables {
    rows: Vec<Vec<Row>>,
    sequences: Vec<i64>,
}

impl Tables {
    fn new(registry: &Registry) -> Self {
        let count = registry.models().count();
        Self {
            rows: vec![Vec::new(); count],
            sequences: vec![0; count],
        }
    }
}

/// How a relation field is joined to its target
enum Link<'m> {
    /// This model holds `fk`, pointing at the target's `references` column
    Owning { fk: &'m str, references: &'m str },
    /// The target holds `fk`, pointing at this model's `references` column
    Inverse {
        fk: &'m str,
        references: &'m str,
        back: &'m FieldInfo,
    },
}

fn link<'m>(registry: &'m Registry, field: &'m FieldInfo) -> StoreResult<Link<'m>> {
    let relation = field
        .relation
        .as_ref()
        .ok_or_else(|| StoreError::invalid(format!("{} is not a relation", field.name)))?;

    if let Some(fk) = relation.foreign_key.as_deref() {
        return Ok(Link::Owning {
            fk,
            references: &relation.references,
        });
    }

    let back = relation
        .opposite
        .as_deref()
        .and_then(|opposite| registry.target(field)?.field(opposite))
        .ok_or_else(|| {
            StoreError::Internal(format!("relation {} has no owning side", field.name))
        })?;
    let back_relation = back
        .relation
        .as_ref()
        .ok_or_else(|| StoreError::Internal(format!("{} is not a relation", back.name)))?;
    let fk = back_relation
        .foreign_key
        .as_deref()
        .ok_or_else(|| StoreError::Internal(format!("{} owns no foreign key", back.name)))?;

    Ok(Link::Inverse {
        fk,
        references: &back_relation.references,
        back,
    })
}

fn args_map<'v>(args: &'v Value, empty: &'v Map<String, Value>) -> StoreResult<&'v Map<String, Value>> {
    match args {
        Value::Null => Ok(empty),
        Value::Object(map) => Ok(map),
        other => Err(StoreError::invalid(format!(
            "arguments must be an object, found {}",
            other
        ))),
    }
}

fn object<'v>(value: &'v Value, what: &str) -> StoreResult<&'v Map<String, Value>> {
    value
        .as_object()
        .ok_or_else(|| StoreError::invalid(format!("{} must be an object, found {}", what, value)))
}

/// A single payload or an array of them
fn items(value: &Value) -> Vec<&Value> {
    match value {
        Value::Array(items) => items.iter().collect(),
        other => vec![other],
    }
}

/// To-one `update` accepts the data itself or `{where?, data}`
fn unwrap_update(payload: &Value) -> StoreResult<(Option<&Value>, &Map<String, Value>)> {
    let obj = object(payload, "update")?;
    let wrapped = obj.get("data").is_some_and(Value::is_object)
        && obj.keys().all(|k| k == "data" || k == "where");
    if !wrapped {
        return Ok((None, obj));
    }
    let data = object(&obj["data"], "update data")?;
    Ok((obj.get("where"), data))
}

/// Read-only view of the tables
pub(super) struct Reader<'a> {
    registry: &'a Registry,
    tables: &'a Tables,
}

impl<'a> Reader<'a> {
    fn rows(&self, model: ModelId) -> &'a [Row] {
        self.tables
            .rows
            .get(model.0)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub(super) fn target(&self, field: &FieldInfo) -> StoreResult<&'a ModelDescriptor> {
        self.registry
            .target(field)
            .ok_or_else(|| StoreError::invalid(format!("{} is not a relation", field.name)))
    }

    fn row_by_id(&self, model: &ModelDescriptor, id: &Value) -> Option<&'a Row> {
        self.rows(model.id)
            .iter()
            .find(|row| row.get(&model.id_field).is_some_and(|v| values_equal(v, id)))
    }

    /// Rows of the relation's target linked to `row`
    pub(super) fn related(&self, row: &Row, field: &FieldInfo) -> StoreResult<Vec<&'a Row>> {
        let target = self.target(field)?;
        let (column, key) = match link(self.registry, field)? {
            Link::Owning { fk, references } => (references, row.get(fk)),
            Link::Inverse { fk, references, .. } => (fk, row.get(references)),
        };
        let Some(key) = key.filter(|k| !k.is_null()) else {
            return Ok(Vec::new());
        };
        Ok(self
            .rows(target.id)
            .iter()
            .filter(|candidate| candidate.get(column).is_some_and(|v| values_equal(v, key)))
            .collect())
    }

    /// Apply `where`, `orderBy`, `skip` and `take`
    fn refine(
        &self,
        model: &ModelDescriptor,
        rows: Vec<&'a Row>,
        args: &Map<String, Value>,
    ) -> StoreResult<Vec<&'a Row>> {
        let mut matched = Vec::with_capacity(rows.len());
        match args.get("where") {
            Some(filter) => {
                for row in rows {
                    if self.matches(model, row, filter)? {
                        matched.push(row);
                    }
                }
            }
            None => matched = rows,
        }

        if let Some(order) = args.get("orderBy") {
            let mut keys = Vec::new();
            for entry in items(order) {
                for (column, direction) in object(entry, "orderBy")? {
                    if model.field(column).map_or(true, |f| f.is_data_model) {
                        return Err(StoreError::invalid(format!(
                            "cannot order {} by {}",
                            model.name, column
                        )));
                    }
                    keys.push((column.as_str(), direction.as_str() == Some("desc")));
                }
            }
            matched.sort_by(|a, b| {
                keys.iter()
                    .map(|(column, desc)| {
                        let ord = sort_order(a.get(*column), b.get(*column));
                        if *desc {
                            ord.reverse()
                        } else {
                            ord
                        }
                    })
                    .find(|ord| ord.is_ne())
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
        }

        let skip = args.get("skip").and_then(Value::as_u64).unwrap_or(0) as usize;
        let take = args.get("take").and_then(Value::as_u64).map(|t| t as usize);
        Ok(matched
            .into_iter()
            .skip(skip)
            .take(take.unwrap_or(usize::MAX))
            .collect())
    }

    /// Shape a row according to `select` / `include`
    fn project(
        &self,
        model: &ModelDescriptor,
        row: &Row,
        args: &Map<String, Value>,
    ) -> StoreResult<Value> {
        let mut out = Map::new();

        if let Some(select) = args.get("select") {
            for (name, entry) in object(select, "select")? {
                if matches!(entry, Value::Bool(false) | Value::Null) {
                    continue;
                }
                let field = model.field(name).ok_or_else(|| {
                    StoreError::invalid(format!("unknown field {}.{} in select", model.name, name))
                })?;
                let value = if field.is_data_model {
                    self.project_relation(row, field, entry)?
                } else {
                    row.get(name).cloned().unwrap_or(Value::Null)
                };
                out.insert(name.clone(), value);
            }
            return Ok(Value::Object(out));
        }

        for field in model.scalars() {
            let value = row.get(&field.name).cloned().unwrap_or(Value::Null);
            out.insert(field.name.clone(), value);
        }
        if let Some(include) = args.get("include") {
            for (name, entry) in object(include, "include")? {
                if matches!(entry, Value::Bool(false) | Value::Null) {
                    continue;
                }
                let field = model
                    .field(name)
                    .filter(|f| f.is_data_model)
                    .ok_or_else(|| {
                        StoreError::invalid(format!("{}.{} is not a relation", model.name, name))
                    })?;
                let value = self.project_relation(row, field, entry)?;
                out.insert(name.clone(), value);
            }
        }
        Ok(Value::Object(out))
    }

    fn project_relation(
        &self,
        row: &Row,
        field: &FieldInfo,
        entry: &Value,
    ) -> StoreResult<Value> {
        let target = self.target(field)?;
        let empty = Map::new();
        let nested = match entry {
            Value::Object(map) => map,
            _ => &empty,
        };
        let related = self.refine(target, self.related(row, field)?, nested)?;

        if field.is_to_many() {
            let items = related
                .into_iter()
                .map(|item| self.project(target, item, nested))
                .collect::<StoreResult<Vec<_>>>()?;
            return Ok(Value::Array(items));
        }
        match related.first() {
            Some(item) => self.project(target, item, nested),
            None => Ok(Value::Null),
        }
    }

    pub(super) fn find_many(&self, model: ModelId, args: &Value) -> StoreResult<Vec<Value>> {
        let model = self.registry.get(model);
        let empty = Map::new();
        let args = args_map(args, &empty)?;
        let all = self.rows(model.id).iter().collect();
        self.refine(model, all, args)?
            .into_iter()
            .map(|row| self.project(model, row, args))
            .collect()
    }

    pub(super) fn find_first(&self, model: ModelId, args: &Value) -> StoreResult<Option<Value>> {
        let mut args = args.clone();
        if let Some(map) = args.as_object_mut() {
            map.insert("take".to_string(), Value::from(1));
        }
        Ok(self.find_many(model, &args)?.into_iter().next())
    }

    pub(super) fn count(&self, model: ModelId, args: &Value) -> StoreResult<u64> {
        let model = self.registry.get(model);
        let empty = Map::new();
        let filter = args_map(args, &empty)?.get("where").unwrap_or(&Value::Null);
        let mut count = 0;
        for row in self.rows(model.id) {
            if self.matches(model, row, filter)? {
                count += 1;
            }
        }
        Ok(count)
    }

    /// Ids of rows matching `filter`
    fn ids(&self, model: &ModelDescriptor, filter: &Value) -> StoreResult<Vec<Value>> {
        let mut ids = Vec::new();
        for row in self.rows(model.id) {
            if self.matches(model, row, filter)? {
                ids.push(row.get(&model.id_field).cloned().unwrap_or(Value::Null));
            }
        }
        Ok(ids)
    }

    /// Ids of target rows linked through an inverse relation
    fn linked_ids(
        &self,
        target: &ModelDescriptor,
        fk: &str,
        key: &Value,
        filter: Option<&Value>,
    ) -> StoreResult<Vec<Value>> {
        let mut ids = Vec::new();
        for row in self.rows(target.id) {
            if !row.get(fk).is_some_and(|v| values_equal(v, key)) {
                continue;
            }
            if let Some(filter) = filter {
                if !self.matches(target, row, filter)? {
                    continue;
                }
            }
            ids.push(row.get(&target.id_field).cloned().unwrap_or(Value::Null));
        }
        Ok(ids)
    }

    fn project_id(&self, model: &ModelDescriptor, id: &Value, args: &Value) -> StoreResult<Value> {
        let empty = Map::new();
        let args = args_map(args, &empty)?;
        let row = self
            .row_by_id(model, id)
            .ok_or_else(|| StoreError::RecordNotFound(format!("{} {}", model.name, id)))?;
        self.project(model, row, args)
    }
}

/// Mutating access to the tables
struct Engine<'r, 't> {
    registry: &'r Registry,
    tables: &'t mut Tables,
}

impl<'r, 't> Engine<'r, 't> {
    fn reader(&self) -> Reader<'_> {
        Reader {
            registry: self.registry,
            tables: &*self.tables,
        }
    }

    fn table(&mut self, model: ModelId) -> StoreResult<&mut Vec<Row>> {
        self.tables
            .rows
            .get_mut(model.0)
            .ok_or_else(|| StoreError::Internal(format!("no table for model {:?}", model)))
    }

    fn position(&self, model: &ModelDescriptor, id: &Value) -> StoreResult<usize> {
        self.reader()
            .rows(model.id)
            .iter()
            .position(|row| row.get(&model.id_field).is_some_and(|v| values_equal(v, id)))
            .ok_or_else(|| StoreError::RecordNotFound(format!("{} {}", model.name, id)))
    }

    fn column(&self, model: &ModelDescriptor, id: &Value, column: &str) -> StoreResult<Value> {
        let row = self
            .reader()
            .row_by_id(model, id)
            .ok_or_else(|| StoreError::RecordNotFound(format!("{} {}", model.name, id)))?;
        Ok(row.get(column).cloned().unwrap_or(Value::Null))
    }

    fn first_id(&self, model: &ModelDescriptor, filter: &Value) -> StoreResult<Option<Value>> {
        Ok(self.reader().ids(model, filter)?.into_iter().next())
    }

    fn require_id(&self, model: &ModelDescriptor, filter: &Value) -> StoreResult<Value> {
        self.first_id(model, filter)?.ok_or_else(|| {
            StoreError::RecordNotFound(format!("no {} matches {}", model.name, filter))
        })
    }

    /// Insert one row with its nested writes; returns the new id
    fn insert(&mut self, model: &'r ModelDescriptor, data: &Map<String, Value>) -> StoreResult<Value> {
        let registry = self.registry;
        let mut row = Row::new();
        let mut inverse = Vec::new();

        for (key, value) in data {
            let field = model.field(key).ok_or_else(|| {
                StoreError::invalid(format!("unknown field {}.{}", model.name, key))
            })?;
            if !field.is_data_model {
                row.insert(key.clone(), value.clone());
                continue;
            }
            let ops = object(value, "relation operations")?;
            match link(registry, field)? {
                Link::Owning { fk, .. } => {
                    let mut pending = Vec::new();
                    if let Some(key) = self.owning_ops(field, ops, None, false, &mut pending)? {
                        row.insert(fk.to_string(), key);
                    }
                }
                Link::Inverse { .. } => inverse.push((field, ops)),
            }
        }

        self.fill_defaults(model, &mut row)?;
        self.check_unique(model, &row, None)?;
        self.check_references(model, &row)?;

        let id = row.get(&model.id_field).cloned().unwrap_or(Value::Null);
        self.table(model.id)?.push(row);

        for (field, ops) in inverse {
            self.inverse_ops(model, &id, field, ops)?;
        }
        Ok(id)
    }

    /// Update one row with its nested writes; returns the (possibly new) id
    fn update_row(
        &mut self,
        model: &'r ModelDescriptor,
        id: &Value,
        data: &Map<String, Value>,
    ) -> StoreResult<Value> {
        let registry = self.registry;
        let pos = self.position(model, id)?;
        let mut row = self.table(model.id)?[pos].clone();
        let mut inverse = Vec::new();
        let mut pending = Vec::new();

        for (key, value) in data {
            let field = model.field(key).ok_or_else(|| {
                StoreError::invalid(format!("unknown field {}.{}", model.name, key))
            })?;
            if !field.is_data_model {
                let updated = apply_scalar_update(row.get(key), value)?;
                row.insert(key.clone(), updated);
                continue;
            }
            let ops = object(value, "relation operations")?;
            match link(registry, field)? {
                Link::Owning { fk, .. } => {
                    let current = row.get(fk).cloned().filter(|v| !v.is_null());
                    if let Some(key) = self.owning_ops(field, ops, current, true, &mut pending)? {
                        row.insert(fk.to_string(), key);
                    }
                }
                Link::Inverse { .. } => inverse.push((field, ops)),
            }
        }

        self.check_unique(model, &row, Some(pos))?;
        self.check_references(model, &row)?;

        let new_id = row.get(&model.id_field).cloned().unwrap_or(Value::Null);
        let pos = self.position(model, id)?;
        self.table(model.id)?[pos] = row;

        for (target, target_id) in pending {
            self.delete_row(registry.get(target), &target_id)?;
        }
        for (field, ops) in inverse {
            self.inverse_ops(model, &new_id, field, ops)?;
        }
        Ok(new_id)
    }

    /// Nested operations on the side that holds the foreign key. Returns the
    /// new foreign-key value when it changes. Deletions of the previously
    /// linked row are queued in `pending` until this row no longer
    /// references it.
    fn owning_ops(
        &mut self,
        field: &'r FieldInfo,
        ops: &Map<String, Value>,
        current: Option<Value>,
        updating: bool,
        pending: &mut Vec<(ModelId, Value)>,
    ) -> StoreResult<Option<Value>> {
        let registry = self.registry;
        let target = registry
            .target(field)
            .ok_or_else(|| StoreError::invalid(format!("{} is not a relation", field.name)))?;
        let references = field
            .relation
            .as_ref()
            .map(|r| r.references.as_str())
            .unwrap_or("id");
        let linked = match &current {
            Some(key) => self.first_id(target, &json_eq(references, key))?,
            None => None,
        };
        let mut key = None;

        for (op, payload) in ops {
            match op.as_str() {
                "create" => {
                    let id = self.insert(target, object(payload, "create")?)?;
                    key = Some(self.column(target, &id, references)?);
                }
                "connect" => {
                    let id = self.require_id(target, payload)?;
                    key = Some(self.column(target, &id, references)?);
                }
                "connectOrCreate" => {
                    let obj = object(payload, "connectOrCreate")?;
                    let filter = obj.get("where").unwrap_or(&Value::Null);
                    let id = match self.first_id(target, filter)? {
                        Some(id) => id,
                        None => {
                            let create = object(obj.get("create").unwrap_or(&Value::Null), "create")?;
                            self.insert(target, create)?
                        }
                    };
                    key = Some(self.column(target, &id, references)?);
                }
                "disconnect" if updating => {
                    require_optional(field)?;
                    key = Some(Value::Null);
                }
                "update" if updating => {
                    let (filter, data) = unwrap_update(payload)?;
                    let id = self.linked_matching(target, linked.as_ref(), filter)?;
                    let id = self.update_row(target, &id, data)?;
                    key = Some(self.column(target, &id, references)?);
                }
                "upsert" if updating => {
                    let obj = object(payload, "upsert")?;
                    let id = match &linked {
                        Some(id) => {
                            let update = object(obj.get("update").unwrap_or(&Value::Null), "update")?;
                            self.update_row(target, id, update)?
                        }
                        None => {
                            let create = object(obj.get("create").unwrap_or(&Value::Null), "create")?;
                            self.insert(target, create)?
                        }
                    };
                    key = Some(self.column(target, &id, references)?);
                }
                "delete" if updating => {
                    require_optional(field)?;
                    let id = self.linked_matching(target, linked.as_ref(), None)?;
                    pending.push((target.id, id));
                    key = Some(Value::Null);
                }
                other => {
                    return Err(StoreError::invalid(format!(
                        "'{}' is not supported on {} here",
                        other, field.name
                    )))
                }
            }
        }
        Ok(key)
    }

    fn linked_matching(
        &self,
        target: &ModelDescriptor,
        linked: Option<&Value>,
        filter: Option<&Value>,
    ) -> StoreResult<Value> {
        let id = linked.ok_or_else(|| {
            StoreError::RecordNotFound(format!("no linked {} to update", target.name))
        })?;
        if let Some(filter) = filter {
            let row = self.reader().row_by_id(target, id);
            let hit = match row {
                Some(row) => self.reader().matches(target, row, filter)?,
                None => false,
            };
            if !hit {
                return Err(StoreError::RecordNotFound(format!(
                    "no linked {} matches {}",
                    target.name, filter
                )));
            }
        }
        Ok(id.clone())
    }

    /// Nested operations on a relation whose foreign key lives on the target
    fn inverse_ops(
        &mut self,
        model: &'r ModelDescriptor,
        id: &Value,
        field: &'r FieldInfo,
        ops: &Map<String, Value>,
    ) -> StoreResult<()> {
        let registry = self.registry;
        let target = registry
            .target(field)
            .ok_or_else(|| StoreError::invalid(format!("{} is not a relation", field.name)))?;
        let Link::Inverse { fk, references, back } = link(registry, field)? else {
            return Err(StoreError::Internal(format!("{} owns its foreign key", field.name)));
        };
        let key = self.column(model, id, references)?;
        let to_one = field.is_to_one();

        for (op, payload) in ops {
            match op.as_str() {
                "create" => {
                    for item in items(payload) {
                        let mut data = object(item, "create")?.clone();
                        data.insert(fk.to_string(), key.clone());
                        self.insert(target, &data)?;
                    }
                }
                "createMany" if !to_one => {
                    let data = object(payload, "createMany")?
                        .get("data")
                        .ok_or_else(|| StoreError::invalid("createMany requires data"))?;
                    for item in items(data) {
                        let mut data = object(item, "createMany data")?.clone();
                        data.insert(fk.to_string(), key.clone());
                        self.insert(target, &data)?;
                    }
                }
                "connect" => {
                    for filter in items(payload) {
                        let target_id = self.require_id(target, filter)?;
                        self.set_column(target, &target_id, fk, key.clone())?;
                    }
                }
                "connectOrCreate" => {
                    for item in items(payload) {
                        let obj = object(item, "connectOrCreate")?;
                        let filter = obj.get("where").unwrap_or(&Value::Null);
                        match self.first_id(target, filter)? {
                            Some(target_id) => self.set_column(target, &target_id, fk, key.clone())?,
                            None => {
                                let mut data =
                                    object(obj.get("create").unwrap_or(&Value::Null), "create")?.clone();
                                data.insert(fk.to_string(), key.clone());
                                self.insert(target, &data)?;
                            }
                        }
                    }
                }
                "disconnect" => {
                    require_optional(back)?;
                    let filters = if to_one { vec![&Value::Null] } else { items(payload) };
                    for filter in filters {
                        let linked = self.reader().linked_ids(target, fk, &key, Some(filter))?;
                        for target_id in linked {
                            self.set_column(target, &target_id, fk, Value::Null)?;
                        }
                    }
                }
                "set" if !to_one => {
                    let linked = self.reader().linked_ids(target, fk, &key, None)?;
                    if !linked.is_empty() {
                        require_optional(back)?;
                    }
                    for target_id in linked {
                        self.set_column(target, &target_id, fk, Value::Null)?;
                    }
                    for filter in items(payload) {
                        let target_id = self.require_id(target, filter)?;
                        self.set_column(target, &target_id, fk, key.clone())?;
                    }
                }
                "update" => {
                    for item in items(payload) {
                        let (filter, data) = if to_one {
                            unwrap_update(item)?
                        } else {
                            let obj = object(item, "update")?;
                            (
                                obj.get("where"),
                                object(obj.get("data").unwrap_or(&Value::Null), "update data")?,
                            )
                        };
                        let target_id = self
                            .reader()
                            .linked_ids(target, fk, &key, filter)?
                            .into_iter()
                            .next()
                            .ok_or_else(|| {
                                StoreError::RecordNotFound(format!(
                                    "no related {} to update through {}",
                                    target.name, field.name
                                ))
                            })?;
                        self.update_row(target, &target_id, data)?;
                    }
                }
                "updateMany" if !to_one => {
                    for item in items(payload) {
                        let obj = object(item, "updateMany")?;
                        let data = object(obj.get("data").unwrap_or(&Value::Null), "updateMany data")?;
                        let linked = self.reader().linked_ids(target, fk, &key, obj.get("where"))?;
                        for target_id in linked {
                            self.update_row(target, &target_id, data)?;
                        }
                    }
                }
                "upsert" => {
                    for item in items(payload) {
                        let obj = object(item, "upsert")?;
                        let existing = self
                            .reader()
                            .linked_ids(target, fk, &key, obj.get("where"))?
                            .into_iter()
                            .next();
                        match existing {
                            Some(target_id) => {
                                let update = object(obj.get("update").unwrap_or(&Value::Null), "update")?;
                                self.update_row(target, &target_id, update)?;
                            }
                            None => {
                                let mut data =
                                    object(obj.get("create").unwrap_or(&Value::Null), "create")?.clone();
                                data.insert(fk.to_string(), key.clone());
                                self.insert(target, &data)?;
                            }
                        }
                    }
                }
                "delete" => {
                    let filters = if to_one { vec![&Value::Null] } else { items(payload) };
                    for filter in filters {
                        let target_id = self
                            .reader()
                            .linked_ids(target, fk, &key, Some(filter))?
                            .into_iter()
                            .next()
                            .ok_or_else(|| {
                                StoreError::RecordNotFound(format!(
                                    "no related {} to delete through {}",
                                    target.name, field.name
                                ))
                            })?;
                        self.delete_row(target, &target_id)?;
                    }
                }
                "deleteMany" if !to_one => {
                    for filter in items(payload) {
                        let linked = self.reader().linked_ids(target, fk, &key, Some(filter))?;
                        for target_id in linked {
                            self.delete_row(target, &target_id)?;
                        }
                    }
                }
                other => {
                    return Err(StoreError::invalid(format!(
                        "'{}' is not supported on {}.{}",
                        other, model.name, field.name
                    )))
                }
            }
        }
        Ok(())
    }

    fn set_column(
        &mut self,
        model: &ModelDescriptor,
        id: &Value,
        column: &str,
        value: Value,
    ) -> StoreResult<()> {
        let pos = self.position(model, id)?;
        let mut row = self.table(model.id)?[pos].clone();
        row.insert(column.to_string(), value);
        self.check_unique(model, &row, Some(pos))?;
        self.table(model.id)?[pos] = row;
        Ok(())
    }

    /// Remove one row. Rows referencing it through an optional foreign key
    /// are detached; a required reference fails the delete.
    fn delete_row(&mut self, model: &ModelDescriptor, id: &Value) -> StoreResult<Row> {
        let registry = self.registry;
        let pos = self.position(model, id)?;
        let row = self.table(model.id)?[pos].clone();

        for other in registry.models() {
            for field in other.relations().filter(|f| f.type_name == model.name) {
                let Link::Owning { fk, references } = link(registry, field)? else {
                    continue;
                };
                let Some(key) = row.get(references).filter(|v| !v.is_null()) else {
                    continue;
                };
                let table = self.table(other.id)?;
                let referencing: Vec<usize> = table
                    .iter()
                    .enumerate()
                    .filter(|(_, r)| r.get(fk).is_some_and(|v| values_equal(v, key)))
                    .map(|(idx, _)| idx)
                    .collect();
                if referencing.is_empty() {
                    continue;
                }
                if !field.is_optional {
                    return Err(StoreError::ForeignKeyViolation(format!(
                        "{}.{}",
                        other.name, fk
                    )));
                }
                for idx in referencing {
                    table[idx].insert(fk.to_string(), Value::Null);
                }
            }
        }

        let pos = self.position(model, id)?;
        Ok(self.table(model.id)?.remove(pos))
    }

    fn fill_defaults(&mut self, model: &ModelDescriptor, row: &mut Row) -> StoreResult<()> {
        for field in model.scalars() {
            if row.get(&field.name).is_some_and(|v| !v.is_null()) {
                if field.name == model.id_field {
                    if let Some(n) = row.get(&field.name).and_then(Value::as_i64) {
                        let seq = &mut self.tables.sequences[model.id.0];
                        *seq = (*seq).max(n);
                    }
                }
                continue;
            }
            let value = if field.has_attribute(FieldAttribute::DefaultUuid) {
                Value::String(Uuid::new_v4().to_string())
            } else if field.has_attribute(FieldAttribute::DefaultNow) {
                Value::String(Utc::now().to_rfc3339())
            } else if field.name == model.id_field && field.type_name == "Int" {
                let seq = &mut self.tables.sequences[model.id.0];
                *seq += 1;
                Value::from(*seq)
            } else if field.is_optional {
                Value::Null
            } else {
                return Err(StoreError::invalid(format!(
                    "missing required field {}.{}",
                    model.name, field.name
                )));
            };
            row.insert(field.name.clone(), value);
        }
        Ok(())
    }

    fn check_unique(&self, model: &ModelDescriptor, row: &Row, skip: Option<usize>) -> StoreResult<()> {
        let unique = model.scalars().filter(|f| {
            f.name == model.id_field
                || f.has_attribute(FieldAttribute::Id)
                || f.has_attribute(FieldAttribute::Unique)
        });
        let rows = self.reader().rows(model.id);

        for field in unique {
            let Some(value) = row.get(&field.name).filter(|v| !v.is_null()) else {
                continue;
            };
            let clash = rows.iter().enumerate().any(|(idx, other)| {
                Some(idx) != skip && other.get(&field.name).is_some_and(|v| values_equal(v, value))
            });
            if clash {
                return Err(StoreError::UniqueViolation(format!(
                    "{}.{}",
                    model.name, field.name
                )));
            }
        }
        Ok(())
    }

    fn check_references(&self, model: &ModelDescriptor, row: &Row) -> StoreResult<()> {
        for field in model.relations() {
            let Link::Owning { fk, references } = link(self.registry, field)? else {
                continue;
            };
            let Some(key) = row.get(fk).filter(|v| !v.is_null()) else {
                continue;
            };
            let target = self.reader().target(field)?;
            let exists = self
                .reader()
                .rows(target.id)
                .iter()
                .any(|r| r.get(references).is_some_and(|v| values_equal(v, key)));
            if !exists {
                return Err(StoreError::ForeignKeyViolation(format!("{}.{}", model.name, fk)));
            }
        }
        Ok(())
    }

    fn create(&mut self, model: ModelId, args: &Value) -> StoreResult<Value> {
        let model = self.registry.get(model);
        let data = object(args.get("data").unwrap_or(&Value::Null), "create data")?;
        let id = self.insert(model, data)?;
        self.reader().project_id(model, &id, &strip_data(args))
    }

    fn update(&mut self, model: ModelId, args: &Value) -> StoreResult<Value> {
        let model = self.registry.get(model);
        let filter = args.get("where").unwrap_or(&Value::Null);
        let data = object(args.get("data").unwrap_or(&Value::Null), "update data")?;
        let id = self.require_id(model, filter)?;
        let id = self.update_row(model, &id, data)?;
        self.reader().project_id(model, &id, &strip_data(args))
    }

    fn update_many(&mut self, model: ModelId, args: &Value) -> StoreResult<u64> {
        let model = self.registry.get(model);
        let filter = args.get("where").unwrap_or(&Value::Null);
        let data = object(args.get("data").unwrap_or(&Value::Null), "updateMany data")?;
        if let Some(field) = model.relations().find(|f| data.contains_key(&f.name)) {
            return Err(StoreError::invalid(format!(
                "updateMany cannot write relation {}.{}",
                model.name, field.name
            )));
        }
        let ids = self.reader().ids(model, filter)?;
        for id in &ids {
            self.update_row(model, id, data)?;
        }
        Ok(ids.len() as u64)
    }

    fn delete(&mut self, model: ModelId, args: &Value) -> StoreResult<Value> {
        let model = self.registry.get(model);
        let filter = args.get("where").unwrap_or(&Value::Null);
        let id = self.require_id(model, filter)?;
        let shaped = self.reader().project_id(model, &id, args)?;
        self.delete_row(model, &id)?;
        Ok(shaped)
    }

    fn delete_many(&mut self, model: ModelId, args: &Value) -> StoreResult<u64> {
        let model = self.registry.get(model);
        let filter = args.get("where").unwrap_or(&Value::Null);
        let ids = self.reader().ids(model, filter)?;
        for id in &ids {
            self.delete_row(model, id)?;
        }
        Ok(ids.len() as u64)
    }
}

fn json_eq(column: &str, value: &Value) -> Value {
    let mut filter = Map::new();
    filter.insert(column.to_string(), value.clone());
    Value::Object(filter)
}

/// Projection arguments of a write (`select` / `include` only)
fn strip_data(args: &Value) -> Value {
    let mut shaped = Map::new();
    for key in ["select", "include"] {
        if let Some(value) = args.get(key) {
            shaped.insert(key.to_string(), value.clone());
        }
    }
    Value::Object(shaped)
}

fn require_optional(field: &FieldInfo) -> StoreResult<()> {
    if field.is_optional {
        Ok(())
    } else {
        Err(StoreError::invalid(format!(
            "required relation {} cannot be detached",
            field.name
        )))
    }
}

/// Plain assignment or `set` / `increment` / `decrement` / `multiply` / `divide`
fn apply_scalar_update(current: Option<&Value>, update: &Value) -> StoreResult<Value> {
    let Some(ops) = update.as_object().filter(|o| {
        o.len() == 1
            && o.keys()
                .all(|k| matches!(k.as_str(), "set" | "increment" | "decrement" | "multiply" | "divide"))
    }) else {
        return Ok(update.clone());
    };

    let (op, operand) = ops
        .iter()
        .next()
        .ok_or_else(|| StoreError::Internal("empty update operator".into()))?;
    if op == "set" {
        return Ok(operand.clone());
    }

    let current = current.cloned().unwrap_or(Value::Null);
    let (Some(a), Some(b)) = (current.as_f64(), operand.as_f64()) else {
        return Err(StoreError::invalid(format!("{} requires numeric operands", op)));
    };
    if let (Some(a), Some(b)) = (current.as_i64(), operand.as_i64()) {
        let result = match op.as_str() {
            "increment" => a.checked_add(b),
            "decrement" => a.checked_sub(b),
            "multiply" => a.checked_mul(b),
            _ => a.checked_div(b),
        };
        return result
            .map(Value::from)
            .ok_or_else(|| StoreError::invalid(format!("{} overflowed", op)));
    }
    let result = match op.as_str() {
        "increment" => a + b,
        "decrement" => a - b,
        "multiply" => a * b,
        _ => a / b,
    };
    Ok(Value::from(result))
}

/// Run one statement on a scratch copy, publishing it only on success
fn statement<'r, T>(
    registry: &'r Registry,
    tables: &mut Tables,
    f: impl FnOnce(&mut Engine<'r, '_>) -> StoreResult<T>,
) -> StoreResult<T> {
    let mut scratch = tables.clone();
    let out = f(&mut Engine {
        registry,
        tables: &mut scratch,
    })?;
    *tables = scratch;
    Ok(out)
}

/// Shared in-memory store
#[derive(Clone)]
pub struct InMemoryStore {
    registry: Arc<Registry>,
    tables: Arc<Mutex<Tables>>,
}

impl InMemoryStore {
    pub fn new(registry: Arc<Registry>) -> Self {
        let tables = Tables::new(&registry);
        Self {
            registry,
            tables: Arc::new(Mutex::new(tables)),
        }
    }

    /// Load initial rows, `{ "<Model>": [ {..}, .. ] }`. Nested writes are
    /// allowed. No policy is applied. Returns the number of top-level rows.
    pub async fn seed(&self, data: &Value) -> StoreResult<usize> {
        let models = object(data, "seed data")?;
        let mut tables = self.tables.lock().await;
        let registry: &Registry = &self.registry;

        statement(registry, &mut tables, |engine| {
            let mut inserted = 0;
            for (name, rows) in models {
                let model = registry
                    .model(name)
                    .ok_or_else(|| StoreError::invalid(format!("unknown model: {}", name)))?;
                for row in items(rows) {
                    engine.insert(model, object(row, "seed row")?)?;
                    inserted += 1;
                }
            }
            Ok(inserted)
        })
    }

    fn reader<'a>(&'a self, tables: &'a Tables) -> Reader<'a> {
        Reader {
            registry: &self.registry,
            tables,
        }
    }

    async fn write<T, F>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&mut Engine<'_, '_>) -> StoreResult<T> + Send,
        T: Send,
    {
        let mut tables = self.tables.lock().await;
        statement(&self.registry, &mut tables, f)
    }
}

impl std::fmt::Debug for InMemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryStore").finish_non_exhaustive()
    }
}

#[async_trait]
impl Executor for InMemoryStore {
    async fn find_many(&self, model: ModelId, args: Value) -> StoreResult<Vec<Value>> {
        let tables = self.tables.lock().await;
        self.reader(&tables).find_many(model, &args)
    }

    async fn find_first(&self, model: ModelId, args: Value) -> StoreResult<Option<Value>> {
        let tables = self.tables.lock().await;
        self.reader(&tables).find_first(model, &args)
    }

    async fn find_unique(&self, model: ModelId, args: Value) -> StoreResult<Option<Value>> {
        require_where(&args)?;
        self.find_first(model, args).await
    }

    async fn create(&self, model: ModelId, args: Value) -> StoreResult<Value> {
        self.write(|engine| engine.create(model, &args)).await
    }

    async fn update(&self, model: ModelId, args: Value) -> StoreResult<Value> {
        self.write(|engine| engine.update(model, &args)).await
    }

    async fn update_many(&self, model: ModelId, args: Value) -> StoreResult<u64> {
        self.write(|engine| engine.update_many(model, &args)).await
    }

    async fn delete(&self, model: ModelId, args: Value) -> StoreResult<Value> {
        self.write(|engine| engine.delete(model, &args)).await
    }

    async fn delete_many(&self, model: ModelId, args: Value) -> StoreResult<u64> {
        self.write(|engine| engine.delete_many(model, &args)).await
    }

    async fn count(&self, model: ModelId, args: Value) -> StoreResult<u64> {
        let tables = self.tables.lock().await;
        self.reader(&tables).count(model, &args)
    }
}

#[async_trait]
impl DataStore for InMemoryStore {
    async fn begin(&self) -> StoreResult<Box<dyn Transaction>> {
        let guard = self.tables.clone().lock_owned().await;
        let working = Tables::clone(&guard);
        debug!("transaction started");
        Ok(Box::new(MemoryTransaction {
            registry: self.registry.clone(),
            guard,
            working: StdMutex::new(working),
        }))
    }
}

fn require_where(args: &Value) -> StoreResult<()> {
    match args.get("where") {
        Some(Value::Object(filter)) if !filter.is_empty() => Ok(()),
        _ => Err(StoreError::invalid("findUnique requires a where clause")),
    }
}

/// Transaction over a private copy of the tables. Holds the store lock
/// until it is committed, rolled back or dropped.
pub struct MemoryTransaction {
    registry: Arc<Registry>,
    guard: OwnedMutexGuard<Tables>,
    working: StdMutex<Tables>,
}

impl MemoryTransaction {
    fn working(&self) -> StoreResult<StdMutexGuard<'_, Tables>> {
        self.working
            .lock()
            .map_err(|_| StoreError::Internal("transaction state poisoned".into()))
    }

    fn read<T>(&self, f: impl FnOnce(Reader<'_>) -> StoreResult<T>) -> StoreResult<T> {
        let tables = self.working()?;
        f(Reader {
            registry: &self.registry,
            tables: &tables,
        })
    }

    fn write<T>(&self, f: impl FnOnce(&mut Engine<'_, '_>) -> StoreResult<T>) -> StoreResult<T> {
        let mut tables = self.working()?;
        statement(&self.registry, &mut tables, f)
    }
}

#[async_trait]
impl Executor for MemoryTransaction {
    async fn find_many(&self, model: ModelId, args: Value) -> StoreResult<Vec<Value>> {
        self.read(|reader| reader.find_many(model, &args))
    }

    async fn find_first(&self, model: ModelId, args: Value) -> StoreResult<Option<Value>> {
        self.read(|reader| reader.find_first(model, &args))
    }

    async fn find_unique(&self, model: ModelId, args: Value) -> StoreResult<Option<Value>> {
        require_where(&args)?;
        self.read(|reader| reader.find_first(model, &args))
    }

    async fn create(&self, model: ModelId, args: Value) -> StoreResult<Value> {
        self.write(|engine| engine.create(model, &args))
    }

    async fn update(&self, model: ModelId, args: Value) -> StoreResult<Value> {
        self.write(|engine| engine.update(model, &args))
    }

    async fn update_many(&self, model: ModelId, args: Value) -> StoreResult<u64> {
        self.write(|engine| engine.update_many(model, &args))
    }

    async fn delete(&self, model: ModelId, args: Value) -> StoreResult<Value> {
        self.write(|engine| engine.delete(model, &args))
    }

    async fn delete_many(&self, model: ModelId, args: Value) -> StoreResult<u64> {
        self.write(|engine| engine.delete_many(model, &args))
    }

    async fn count(&self, model: ModelId, args: Value) -> StoreResult<u64> {
        self.read(|reader| reader.count(model, &args))
    }
}

#[async_trait]
impl Transaction for MemoryTransaction {
    async fn commit(self: Box<Self>) -> StoreResult<()> {
        let MemoryTransaction {
            mut guard, working, ..
        } = *self;
        *guard = working
            .into_inner()
            .map_err(|_| StoreError::Internal("transaction state poisoned".into()))?;
        debug!("transaction committed");
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> StoreResult<()> {
        debug!("transaction rolled back");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SchemaLoader;
    use serde_json::json;

    fn store() -> (Arc<Registry>, InMemoryStore) {
        let registry = Arc::new(
            SchemaLoader::load_str(
                r#"{"models": [
                    {"name": "User", "fields": [
                        {"name": "id", "type": "Int", "attributes": ["id"]},
                        {"name": "email", "type": "String", "attributes": ["unique"]},
                        {"name": "profile", "type": "Profile", "optional": true, "relation": {"opposite": "user"}},
                        {"name": "posts", "type": "Post", "array": true, "relation": {"opposite": "author"}}
                    ]},
                    {"name": "Profile", "fields": [
                        {"name": "id", "type": "String", "attributes": ["id", "default(uuid)"]},
                        {"name": "bio", "type": "String", "optional": true},
                        {"name": "user", "type": "User", "relation": {"foreignKey": "userId"}}
                    ]},
                    {"name": "Post", "fields": [
                        {"name": "id", "type": "String", "attributes": ["id", "default(uuid)"]},
                        {"name": "title", "type": "String"},
                        {"name": "views", "type": "Int", "optional": true},
                        {"name": "author", "type": "User", "optional": true, "relation": {"foreignKey": "authorId"}}
                    ]}
                ]}"#,
            )
            .unwrap(),
        );
        let store = InMemoryStore::new(registry.clone());
        (registry, store)
    }

    fn id(registry: &Registry, name: &str) -> ModelId {
        registry.model(name).unwrap().id
    }

    #[tokio::test]
    async fn test_nested_create_and_include() {
        let (registry, store) = store();
        let user = store
            .create(
                id(&registry, "User"),
                json!({
                    "data": {
                        "email": "a@x.io",
                        "profile": {"create": {"bio": "hi"}},
                        "posts": {"create": [{"title": "one"}, {"title": "two", "views": 3}]}
                    },
                    "include": {"profile": true, "posts": {"orderBy": {"title": "desc"}}}
                }),
            )
            .await
            .unwrap();

        assert_eq!(user["id"], json!(1));
        assert_eq!(user["profile"]["bio"], json!("hi"));
        assert_eq!(user["profile"]["userId"], json!(1));
        assert_eq!(user["posts"][0]["title"], json!("two"));
        assert_eq!(user["posts"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_relation_filters() {
        let (registry, store) = store();
        let user = id(&registry, "User");
        store
            .seed(&json!({"User": [
                {"email": "a@x.io", "posts": {"create": [{"title": "a", "views": 10}]}},
                {"email": "b@x.io"}
            ]}))
            .await
            .unwrap();

        let with_popular = store
            .count(user, json!({"where": {"posts": {"some": {"views": {"gt": 5}}}}}))
            .await
            .unwrap();
        assert_eq!(with_popular, 1);

        let without_posts = store
            .count(user, json!({"where": {"posts": {"none": {}}}}))
            .await
            .unwrap();
        assert_eq!(without_posts, 1);

        let authored = store
            .count(id(&registry, "Post"), json!({"where": {"author": {"is": {"email": "a@x.io"}}}}))
            .await
            .unwrap();
        assert_eq!(authored, 1);
    }

    #[tokio::test]
    async fn test_unique_violation() {
        let (registry, store) = store();
        let user = id(&registry, "User");
        store.create(user, json!({"data": {"email": "a@x.io"}})).await.unwrap();

        let err = store
            .create(user, json!({"data": {"email": "a@x.io"}}))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::UniqueViolation(_)));
    }

    #[tokio::test]
    async fn test_failed_statement_has_no_partial_effect() {
        let (registry, store) = store();
        let user = id(&registry, "User");
        store.create(user, json!({"data": {"email": "a@x.io"}})).await.unwrap();

        // the second post lacks its required title
        let result = store
            .create(
                user,
                json!({"data": {"email": "b@x.io", "posts": {"create": [{"title": "t"}, {}]}}}),
            )
            .await;
        assert!(result.is_err());
        assert_eq!(store.count(user, Value::Null).await.unwrap(), 1);
        assert_eq!(store.count(id(&registry, "Post"), Value::Null).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_delete_restricts_required_and_nulls_optional() {
        let (registry, store) = store();
        let user = id(&registry, "User");
        let post = id(&registry, "Post");
        store
            .seed(&json!({"User": [
                {"id": 1, "email": "a@x.io", "profile": {"create": {}}},
                {"id": 2, "email": "b@x.io", "posts": {"create": {"title": "t"}}}
            ]}))
            .await
            .unwrap();

        let err = store
            .delete(user, json!({"where": {"id": 1}}))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ForeignKeyViolation(_)));

        store.delete(user, json!({"where": {"id": 2}})).await.unwrap();
        let orphan = store.find_first(post, Value::Null).await.unwrap().unwrap();
        assert_eq!(orphan["authorId"], Value::Null);
    }

    #[tokio::test]
    async fn test_update_operators_and_nested_delete() {
        let (registry, store) = store();
        let user = id(&registry, "User");
        let post = id(&registry, "Post");
        store
            .seed(&json!({"User": [{"id": 1, "email": "a@x.io", "posts": {"create": [
                {"id": "p1", "title": "a", "views": 1},
                {"id": "p2", "title": "b"}
            ]}}]}))
            .await
            .unwrap();

        store
            .update(
                user,
                json!({"where": {"id": 1}, "data": {"posts": {
                    "update": {"where": {"id": "p1"}, "data": {"views": {"increment": 4}}},
                    "delete": {"id": "p2"}
                }}}),
            )
            .await
            .unwrap();

        let remaining = store.find_many(post, Value::Null).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0]["views"], json!(5));

        let missing = store
            .update(
                user,
                json!({"where": {"id": 1}, "data": {"posts": {"delete": {"id": "p2"}}}}),
            )
            .await
            .unwrap_err();
        assert!(matches!(missing, StoreError::RecordNotFound(_)));
    }

    #[tokio::test]
    async fn test_transaction_commit_and_rollback() {
        let (registry, store) = store();
        let user = id(&registry, "User");

        let tx = store.begin().await.unwrap();
        tx.create(user, json!({"data": {"email": "a@x.io"}})).await.unwrap();
        assert_eq!(tx.count(user, Value::Null).await.unwrap(), 1);
        tx.rollback().await.unwrap();
        assert_eq!(store.count(user, Value::Null).await.unwrap(), 0);

        let tx = store.begin().await.unwrap();
        tx.create(user, json!({"data": {"email": "b@x.io"}})).await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(store.count(user, Value::Null).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_dropped_transaction_discards_writes() {
        let (registry, store) = store();
        let user = id(&registry, "User");
        {
            let tx = store.begin().await.unwrap();
            tx.create(user, json!({"data": {"email": "a@x.io"}})).await.unwrap();
        }
        assert_eq!(store.count(user, Value::Null).await.unwrap(), 0);
    }

    #[test]
    fn test_scalar_update_operators() {
        assert_eq!(apply_scalar_update(Some(&json!(2)), &json!({"increment": 3})).unwrap(), json!(5));
        assert_eq!(apply_scalar_update(Some(&json!(2)), &json!({"multiply": 4})).unwrap(), json!(8));
        assert_eq!(apply_scalar_update(Some(&json!(2)), &json!({"set": null})).unwrap(), Value::Null);
        assert_eq!(apply_scalar_update(None, &json!("x")).unwrap(), json!("x"));
        assert!(apply_scalar_update(None, &json!({"increment": 1})).is_err());
    }
}

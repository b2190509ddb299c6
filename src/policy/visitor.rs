//! # Nested-Write Visitor
//!
//! Depth-first walk of a write payload. Each entity payload is offered to
//! the visitor before its relation fields; each relation field is then
//! walked operation by operation. Recursion into an operation's nested
//! entities happens only when the visitor returns a new state for it.

use std::fmt;

use serde_json::{Map, Value};

use crate::core::{CoreError, CoreResult, PolicyOperation};
use crate::schema::{FieldInfo, ModelDescriptor, Registry};

/// Relation operations recognised inside a write payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriteAction {
    Create,
    CreateMany,
    ConnectOrCreate,
    Connect,
    Disconnect,
    Set,
    Update,
    UpdateMany,
    Upsert,
    Delete,
    DeleteMany,
}

impl WriteAction {
    pub fn parse(key: &str) -> Option<Self> {
        Some(match key {
            "create" => Self::Create,
            "createMany" => Self::CreateMany,
            "connectOrCreate" => Self::ConnectOrCreate,
            "connect" => Self::Connect,
            "disconnect" => Self::Disconnect,
            "set" => Self::Set,
            "update" => Self::Update,
            "updateMany" => Self::UpdateMany,
            "upsert" => Self::Upsert,
            "delete" => Self::Delete,
            "deleteMany" => Self::DeleteMany,
            _ => return None,
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::CreateMany => "createMany",
            Self::ConnectOrCreate => "connectOrCreate",
            Self::Connect => "connect",
            Self::Disconnect => "disconnect",
            Self::Set => "set",
            Self::Update => "update",
            Self::UpdateMany => "updateMany",
            Self::Upsert => "upsert",
            Self::Delete => "delete",
            Self::DeleteMany => "deleteMany",
        }
    }
}

impl fmt::Display for WriteAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One key of an entity payload, classified against the model
#[derive(Debug)]
pub enum WriteNode<'m> {
    /// Plain column assignment
    Scalar { name: String },
    /// Relation field with its operations
    Relation {
        field: &'m FieldInfo,
        actions: Vec<WriteAction>,
    },
}

/// Classify every key of an entity payload. Unknown relation operations are
/// rejected.
pub fn classify<'m>(
    model: &'m ModelDescriptor,
    data: &Map<String, Value>,
) -> CoreResult<Vec<WriteNode<'m>>> {
    let mut nodes = Vec::with_capacity(data.len());
    for (key, value) in data {
        let node = match model.field(key) {
            Some(field) if field.is_data_model => {
                let ops = value.as_object().ok_or_else(|| {
                    CoreError::invalid_params(format!(
                        "relation field {}.{} expects an object of operations",
                        model.name, key
                    ))
                })?;
                let actions = ops
                    .keys()
                    .map(|op| {
                        WriteAction::parse(op).ok_or_else(|| {
                            CoreError::invalid_params(format!(
                                "unsupported nested write '{}' on {}.{}",
                                op, model.name, key
                            ))
                        })
                    })
                    .collect::<CoreResult<Vec<_>>>()?;
                WriteNode::Relation { field, actions }
            }
            _ => WriteNode::Scalar { name: key.clone() },
        };
        nodes.push(node);
    }
    Ok(nodes)
}

/// Callbacks for one walk; each call site carries its own state type
pub trait WriteVisitor {
    type State: Clone;

    /// An entity payload about to be written with `kind`. Called before its
    /// relation fields are walked, so sibling columns may be rewritten here.
    fn visit_entity(
        &mut self,
        _model: &ModelDescriptor,
        _kind: PolicyOperation,
        _data: &mut Map<String, Value>,
        _state: &Self::State,
    ) -> CoreResult<()> {
        Ok(())
    }

    /// One relation operation. Returning `None` prunes the branch.
    fn visit_action(
        &mut self,
        field: &FieldInfo,
        action: WriteAction,
        payload: &mut Value,
        state: &Self::State,
    ) -> CoreResult<Option<Self::State>>;

    /// Called after every operation of a relation field has been walked
    fn finish_relation(
        &mut self,
        _field: &FieldInfo,
        _ops: &mut Map<String, Value>,
        _state: &Self::State,
    ) -> CoreResult<()> {
        Ok(())
    }
}

/// Walks write payloads against the registry's model metadata
pub struct NestedWriteVisitor<'r> {
    registry: &'r Registry,
}

impl<'r> NestedWriteVisitor<'r> {
    pub fn new(registry: &'r Registry) -> Self {
        Self { registry }
    }

    /// Walk `data` (one entity payload, or an array of them) of `model`
    pub fn visit<V: WriteVisitor>(
        &self,
        model: &ModelDescriptor,
        kind: PolicyOperation,
        data: &mut Value,
        state: V::State,
        visitor: &mut V,
    ) -> CoreResult<()> {
        for_each_object(data, |entity| self.visit_entity(model, kind, entity, &state, visitor))
    }

    fn visit_entity<V: WriteVisitor>(
        &self,
        model: &ModelDescriptor,
        kind: PolicyOperation,
        data: &mut Map<String, Value>,
        state: &V::State,
        visitor: &mut V,
    ) -> CoreResult<()> {
        visitor.visit_entity(model, kind, data, state)?;

        let relations: Vec<(&FieldInfo, Vec<WriteAction>)> = classify(model, data)?
            .into_iter()
            .filter_map(|node| match node {
                WriteNode::Relation { field, actions } => Some((field, actions)),
                WriteNode::Scalar { .. } => None,
            })
            .collect();

        for (field, actions) in relations {
            let target = self.registry.require_target(field)?;
            let Some(ops) = data.get_mut(&field.name).and_then(Value::as_object_mut) else {
                continue;
            };

            for action in actions {
                let Some(payload) = ops.get_mut(action.as_str()) else {
                    continue;
                };
                let Some(next) = visitor.visit_action(field, action, payload, state)? else {
                    continue;
                };
                self.descend(target, field, action, payload, &next, visitor)?;
            }

            visitor.finish_relation(field, ops, state)?;
        }
        Ok(())
    }

    /// Recurse into the entity payloads nested under one operation
    fn descend<V: WriteVisitor>(
        &self,
        target: &ModelDescriptor,
        field: &FieldInfo,
        action: WriteAction,
        payload: &mut Value,
        state: &V::State,
        visitor: &mut V,
    ) -> CoreResult<()> {
        use PolicyOperation::{Create, Update};

        match action {
            WriteAction::Create => for_each_object(payload, |entity| {
                self.visit_entity(target, Create, entity, state, visitor)
            }),
            WriteAction::CreateMany => {
                let Some(data) = payload.get_mut("data") else {
                    return Err(CoreError::invalid_params(format!(
                        "createMany on {} requires data",
                        field.name
                    )));
                };
                for_each_object(data, |entity| {
                    self.visit_entity(target, Create, entity, state, visitor)
                })
            }
            WriteAction::ConnectOrCreate => for_each_object(payload, |item| {
                match item.get_mut("create") {
                    Some(create) => self.visit(target, Create, create, state.clone(), visitor),
                    None => Ok(()),
                }
            }),
            WriteAction::Update if field.is_to_one() && !is_wrapped_update(payload) => {
                for_each_object(payload, |entity| {
                    self.visit_entity(target, Update, entity, state, visitor)
                })
            }
            WriteAction::Update | WriteAction::UpdateMany => for_each_object(payload, |item| {
                match item.get_mut("data") {
                    Some(data) => self.visit(target, Update, data, state.clone(), visitor),
                    None => Ok(()),
                }
            }),
            WriteAction::Upsert => for_each_object(payload, |item| {
                if let Some(create) = item.get_mut("create") {
                    self.visit(target, Create, create, state.clone(), visitor)?;
                }
                if let Some(update) = item.get_mut("update") {
                    self.visit(target, Update, update, state.clone(), visitor)?;
                }
                Ok(())
            }),
            WriteAction::Connect
            | WriteAction::Disconnect
            | WriteAction::Set
            | WriteAction::Delete
            | WriteAction::DeleteMany => Ok(()),
        }
    }
}

/// A to-one `update` payload is either the data itself or `{where?, data}`
pub fn is_wrapped_update(payload: &Value) -> bool {
    match payload.as_object() {
        Some(obj) => {
            obj.get("data").is_some_and(Value::is_object)
                && obj.keys().all(|k| k == "data" || k == "where")
        }
        None => false,
    }
}

/// Apply `f` to an object, or to every object of an array
pub fn for_each_object<F>(value: &mut Value, mut f: F) -> CoreResult<()>
where
    F: FnMut(&mut Map<String, Value>) -> CoreResult<()>,
{
    match value {
        Value::Object(obj) => f(obj),
        Value::Array(items) => {
            for item in items {
                match item {
                    Value::Object(obj) => f(obj)?,
                    other => {
                        return Err(CoreError::invalid_params(format!(
                            "expected an object, found {}",
                            other
                        )))
                    }
                }
            }
            Ok(())
        }
        other => Err(CoreError::invalid_params(format!(
            "expected an object, found {}",
            other
        ))),
    }
}

//! # Where-Clause Evaluation
//!
//! Evaluates `where` objects against in-memory rows: field equality,
//! operator objects, `AND`/`OR`/`NOT`, to-many `some`/`every`/`none` and
//! to-one `is`/`isNot` (or a bare nested filter).

use std::cmp::Ordering;

use serde_json::{Map, Value};

use crate::schema::{FieldInfo, ModelDescriptor};

use super::memory::{Reader, Row};
use super::{StoreError, StoreResult};

/// Scalar operator keys
const OPERATORS: &[&str] = &[
    "equals",
    "not",
    "in",
    "notIn",
    "lt",
    "lte",
    "gt",
    "gte",
    "contains",
    "startsWith",
    "endsWith",
    "mode",
];

impl Reader<'_> {
    /// Check whether `row` of `model` satisfies `filter`
    pub(super) fn matches(
        &self,
        model: &ModelDescriptor,
        row: &Row,
        filter: &Value,
    ) -> StoreResult<bool> {
        let conditions = match filter {
            Value::Null => return Ok(true),
            Value::Object(map) => map,
            other => {
                return Err(StoreError::invalid(format!(
                    "where on {} must be an object, found {}",
                    model.name, other
                )))
            }
        };

        for (key, condition) in conditions {
            let ok = match key.as_str() {
                "AND" => {
                    let mut all = true;
                    for branch in branches(condition) {
                        if !self.matches(model, row, branch)? {
                            all = false;
                            break;
                        }
                    }
                    all
                }
                "OR" => self.any(model, row, condition)?,
                "NOT" => !self.any(model, row, condition)?,
                name => self.matches_field(model, row, name, condition)?,
            };
            if !ok {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn any(&self, model: &ModelDescriptor, row: &Row, condition: &Value) -> StoreResult<bool> {
        for branch in branches(condition) {
            if self.matches(model, row, branch)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn matches_field(
        &self,
        model: &ModelDescriptor,
        row: &Row,
        name: &str,
        condition: &Value,
    ) -> StoreResult<bool> {
        let field = model.field(name).ok_or_else(|| {
            StoreError::invalid(format!("unknown field {}.{} in where", model.name, name))
        })?;

        if field.is_to_many() {
            return self.matches_to_many(model, row, field, condition);
        }
        if field.is_to_one() {
            return self.matches_to_one(model, row, field, condition);
        }
        matches_scalar(row.get(name).unwrap_or(&Value::Null), condition)
    }

    fn matches_to_many(
        &self,
        model: &ModelDescriptor,
        row: &Row,
        field: &FieldInfo,
        condition: &Value,
    ) -> StoreResult<bool> {
        let target = self.target(field)?;
        let related = self.related(row, field)?;
        let ops = condition.as_object().ok_or_else(|| {
            StoreError::invalid(format!(
                "filter on {}.{} expects some, every or none",
                model.name, field.name
            ))
        })?;

        for (op, nested) in ops {
            let mut hits = 0;
            for item in &related {
                if self.matches(target, item, nested)? {
                    hits += 1;
                }
            }
            let ok = match op.as_str() {
                "some" => hits > 0,
                "every" => hits == related.len(),
                "none" => hits == 0,
                other => {
                    return Err(StoreError::invalid(format!(
                        "unsupported relation filter '{}' on {}.{}",
                        other, model.name, field.name
                    )))
                }
            };
            if !ok {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn matches_to_one(
        &self,
        model: &ModelDescriptor,
        row: &Row,
        field: &FieldInfo,
        condition: &Value,
    ) -> StoreResult<bool> {
        let target = self.target(field)?;
        let related = self.related(row, field)?.into_iter().next();

        let ops = match condition {
            Value::Null => return Ok(related.is_none()),
            Value::Object(ops) if ops.contains_key("is") || ops.contains_key("isNot") => ops,
            nested => {
                return match related {
                    Some(item) => self.matches(target, item, nested),
                    None => Ok(false),
                }
            }
        };

        for (op, nested) in ops {
            let hit = match (related, nested) {
                (None, Value::Null) => true,
                (None, _) => false,
                (Some(_), Value::Null) => false,
                (Some(item), nested) => self.matches(target, item, nested)?,
            };
            let ok = match op.as_str() {
                "is" => hit,
                "isNot" => !hit,
                other => {
                    return Err(StoreError::invalid(format!(
                        "unsupported relation filter '{}' on {}.{}",
                        other, model.name, field.name
                    )))
                }
            };
            if !ok {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

/// `AND`/`OR`/`NOT` accept a single filter or an array of them
fn branches(condition: &Value) -> Vec<&Value> {
    match condition {
        Value::Array(items) => items.iter().collect(),
        other => vec![other],
    }
}

fn is_operator_object(ops: &Map<String, Value>) -> bool {
    !ops.is_empty() && ops.keys().all(|k| OPERATORS.contains(&k.as_str()))
}

/// Strip a `{type, data}` wrapper from a filter operand
fn plain(value: &Value) -> &Value {
    match value.as_object() {
        Some(obj) if obj.len() == 2 && obj.contains_key("type") => {
            obj.get("data").unwrap_or(value)
        }
        _ => value,
    }
}

/// Match a scalar column value against an equality value or operator object
pub(super) fn matches_scalar(value: &Value, condition: &Value) -> StoreResult<bool> {
    let ops = match condition {
        Value::Object(ops) if is_operator_object(ops) => ops,
        other => return Ok(values_equal(value, plain(other))),
    };
    let insensitive = ops.get("mode").and_then(Value::as_str) == Some("insensitive");

    for (op, operand) in ops {
        let operand = plain(operand);
        let ok = match op.as_str() {
            "mode" => true,
            "equals" if insensitive => text_match(value, operand, true, |a, b| a == b),
            "equals" => values_equal(value, operand),
            "not" => !matches_scalar(value, operand)?,
            "in" | "notIn" => {
                let items = operand.as_array().ok_or_else(|| {
                    StoreError::invalid(format!("{} expects an array", op))
                })?;
                let found = items.iter().any(|item| values_equal(value, plain(item)));
                found == (op == "in")
            }
            "lt" => compare_values(value, operand) == Some(Ordering::Less),
            "lte" => matches!(
                compare_values(value, operand),
                Some(Ordering::Less | Ordering::Equal)
            ),
            "gt" => compare_values(value, operand) == Some(Ordering::Greater),
            "gte" => matches!(
                compare_values(value, operand),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            "contains" => text_match(value, operand, insensitive, |a, b| a.contains(b)),
            "startsWith" => text_match(value, operand, insensitive, |a, b| a.starts_with(b)),
            "endsWith" => text_match(value, operand, insensitive, |a, b| a.ends_with(b)),
            other => return Err(StoreError::invalid(format!("unknown filter operator: {}", other))),
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

fn text_match(value: &Value, operand: &Value, insensitive: bool, f: fn(&str, &str) -> bool) -> bool {
    match (value.as_str(), operand.as_str()) {
        (Some(a), Some(b)) if insensitive => f(&a.to_lowercase(), &b.to_lowercase()),
        (Some(a), Some(b)) => f(a, b),
        _ => false,
    }
}

/// Equality with numeric normalization (`1 == 1.0`)
pub(super) fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => x == y,
            _ => x.as_f64() == y.as_f64(),
        },
        _ => a == b,
    }
}

/// Ordering between comparable scalars; `None` for nulls and mixed types
pub(super) fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => Some(x.cmp(&y)),
            _ => x.as_f64()?.partial_cmp(&y.as_f64()?),
        },
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// Sort order for `orderBy`; nulls first
pub(super) fn sort_order(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    let a = a.filter(|v| !v.is_null());
    let b = b.filter(|v| !v.is_null());
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => compare_values(a, b).unwrap_or(Ordering::Equal),
    }
}

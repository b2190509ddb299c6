//! # Query Guards
//!
//! A guard is a where-clause value expressing "entities of model M that
//! operation O may touch under context C". Guards are opaque to the rest of
//! the pipeline; they are only ever combined with `and`, `or` and `not`.
//!
//! `{}` is the always-true guard and `{"OR": []}` the always-false one.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::core::{CoreResult, PolicyOperation, QueryContext};
use crate::schema::{ModelDescriptor, ModelId};

/// Where-clause predicate
pub type Guard = Value;

pub fn guard_true() -> Guard {
    json!({})
}

pub fn guard_false() -> Guard {
    json!({ "OR": [] })
}

pub fn is_true(guard: &Guard) -> bool {
    guard.as_object().is_some_and(|o| o.is_empty())
}

pub fn is_false(guard: &Guard) -> bool {
    match guard.as_object() {
        Some(o) if o.len() == 1 => o
            .get("OR")
            .and_then(Value::as_array)
            .is_some_and(|a| a.is_empty()),
        _ => false,
    }
}

/// Conjunction, folding constant operands
pub fn and(items: impl IntoIterator<Item = Guard>) -> Guard {
    let mut parts = Vec::new();
    for item in items {
        if is_false(&item) {
            return guard_false();
        }
        if !is_true(&item) {
            parts.push(item);
        }
    }
    match parts.len() {
        0 => guard_true(),
        1 => parts.remove(0),
        _ => json!({ "AND": parts }),
    }
}

/// Disjunction, folding constant operands
pub fn or(items: impl IntoIterator<Item = Guard>) -> Guard {
    let mut parts = Vec::new();
    for item in items {
        if is_true(&item) {
            return guard_true();
        }
        if !is_false(&item) {
            parts.push(item);
        }
    }
    match parts.len() {
        0 => guard_false(),
        1 => parts.remove(0),
        _ => json!({ "OR": parts }),
    }
}

pub fn not(guard: Guard) -> Guard {
    if is_true(&guard) {
        guard_false()
    } else if is_false(&guard) {
        guard_true()
    } else {
        json!({ "NOT": guard })
    }
}

/// Builds guards for `(model, operation, context)`.
///
/// Implementations must be pure functions of their inputs.
pub trait GuardProvider: Send + Sync {
    fn build_guard(
        &self,
        model: &ModelDescriptor,
        operation: PolicyOperation,
        ctx: &QueryContext,
    ) -> CoreResult<Guard>;
}

/// Provider that allows everything
pub struct AllowAll;

impl GuardProvider for AllowAll {
    fn build_guard(
        &self,
        _model: &ModelDescriptor,
        _operation: PolicyOperation,
        _ctx: &QueryContext,
    ) -> CoreResult<Guard> {
        Ok(guard_true())
    }
}

/// Declarative allow/deny rules for one model.
///
/// Keys are operation names or `all`. Each rule is a where-clause template;
/// `{"$auth": "<claim>"}` is replaced by the principal's claim.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyRules {
    #[serde(default)]
    pub allow: BTreeMap<String, Vec<Value>>,

    #[serde(default)]
    pub deny: BTreeMap<String, Vec<Value>>,
}

impl PolicyRules {
    /// Check rule keys and shapes
    pub fn validate(&self) -> Result<(), String> {
        for (key, rules) in self.allow.iter().chain(self.deny.iter()) {
            if key != "all" && key.parse::<PolicyOperation>().is_err() {
                return Err(format!("unknown operation '{}'", key));
            }
            if let Some(bad) = rules.iter().find(|r| !r.is_object()) {
                return Err(format!("rule for '{}' is not an object: {}", key, bad));
            }
        }
        Ok(())
    }

    fn rules<'a>(
        table: &'a BTreeMap<String, Vec<Value>>,
        operation: PolicyOperation,
    ) -> impl Iterator<Item = &'a Value> {
        table
            .get(operation.as_str())
            .into_iter()
            .chain(table.get("all"))
            .flatten()
    }

    /// `AND[ OR(allow...), NOT OR(deny...) ]`; no allow rule means deny-all
    pub fn compile(&self, operation: PolicyOperation, ctx: &QueryContext) -> Guard {
        let allow = or(Self::rules(&self.allow, operation).filter_map(|r| instantiate(r, ctx)));
        let deny = or(Self::rules(&self.deny, operation).filter_map(|r| instantiate(r, ctx)));
        and([allow, not(deny)])
    }
}

/// Substitute principal claims into a rule template.
///
/// Returns None when the rule references a claim the context lacks; such a
/// rule can never hold.
fn instantiate(template: &Value, ctx: &QueryContext) -> Option<Value> {
    match template {
        Value::Object(map) => {
            if map.len() == 1 {
                if let Some(Value::String(claim)) = map.get("$auth") {
                    return ctx.claim(claim);
                }
            }
            let mut out = Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), instantiate(v, ctx)?);
            }
            Some(Value::Object(out))
        }
        Value::Array(items) => items
            .iter()
            .map(|v| instantiate(v, ctx))
            .collect::<Option<Vec<_>>>()
            .map(Value::Array),
        other => Some(other.clone()),
    }
}

/// Guard provider compiled from per-model `PolicyRules`
pub struct RuleGuardProvider {
    rules: HashMap<ModelId, PolicyRules>,
}

impl RuleGuardProvider {
    pub fn new(rules: HashMap<ModelId, PolicyRules>) -> Self {
        Self { rules }
    }
}

impl GuardProvider for RuleGuardProvider {
    fn build_guard(
        &self,
        model: &ModelDescriptor,
        operation: PolicyOperation,
        ctx: &QueryContext,
    ) -> CoreResult<Guard> {
        let guard = match self.rules.get(&model.id) {
            Some(rules) => rules.compile(operation, ctx),
            None => guard_false(),
        };
        debug!(model = %model.name, %operation, guard = %guard, "built query guard");
        Ok(guard)
    }
}

//! Variable resolution for step inputs.
//!
//! Two reference forms are understood:
//! - `variables.<name>[.<path>]`: a run-scoped variable.
//! - `steps.<nodeId>.output[.<path>]`: the recorded output of a prior step.
//!
//! Input bindings are minijinja templates over those two roots, e.g.
//! `{{ steps.fetch.output.balance }}` or `{{ variables.network | upper }}`.
//! A string that is exactly one `{{ ... }}` evaluates to a value with its JSON
//! type; any other templated string renders to a string.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde_json::{Map, Value};
use thiserror::Error;

use crate::template;

/// Recorded outputs of completed steps, keyed by node id.
pub type StepOutputs = HashMap<String, Value>;

/// A reference could not be resolved. Fatal for the step that needs it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unresolved reference '{reference}': {reason}")]
pub struct UnresolvedReference {
    pub reference: String,
    pub reason: String,
}

impl UnresolvedReference {
    pub(crate) fn new(reference: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            reference: reference.into(),
            reason: reason.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Reference
// ---------------------------------------------------------------------------

/// A parsed dotted reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Reference {
    Variable { name: String, path: Vec<String> },
    StepOutput { node_id: String, path: Vec<String> },
}

impl Reference {
    /// Parse `variables.x.y` or `steps.id.output.y`.
    pub fn parse(text: &str) -> Result<Self, String> {
        let text = text.trim();
        let segments: Vec<&str> = text.split('.').collect();
        if let Some(bad) = segments.iter().find(|s| !is_segment(s)) {
            return Err(format!("invalid path segment '{bad}' in '{text}'"));
        }

        match segments.as_slice() {
            ["variables", name, path @ ..] => Ok(Self::Variable {
                name: (*name).to_owned(),
                path: path.iter().map(|s| (*s).to_owned()).collect(),
            }),
            ["steps", node_id, "output", path @ ..] => Ok(Self::StepOutput {
                node_id: (*node_id).to_owned(),
                path: path.iter().map(|s| (*s).to_owned()).collect(),
            }),
            ["steps", ..] => Err(format!("step reference '{text}' must have the form steps.<id>.output[.<path>]")),
            _ => Err(format!("reference '{text}' must start with 'variables.' or 'steps.'")),
        }
    }

    /// The node this reference reads from, if it is a step reference.
    pub fn step_id(&self) -> Option<&str> {
        match self {
            Self::StepOutput { node_id, .. } => Some(node_id),
            Self::Variable { .. } => None,
        }
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (head, path) = match self {
            Self::Variable { name, path } => (format!("variables.{name}"), path),
            Self::StepOutput { node_id, path } => (format!("steps.{node_id}.output"), path),
        };
        f.write_str(&head)?;
        for segment in path {
            write!(f, ".{segment}")?;
        }
        Ok(())
    }
}

pub(crate) fn is_segment(s: &str) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

/// Resolve a single reference expression against run variables and step outputs.
pub fn resolve(
    expression: &str,
    variables: &Map<String, Value>,
    steps: &StepOutputs,
) -> Result<Value, UnresolvedReference> {
    let reference =
        Reference::parse(expression).map_err(|reason| UnresolvedReference::new(expression.trim(), reason))?;
    lookup(&reference, variables, steps).cloned()
}

fn lookup<'a>(
    reference: &Reference,
    variables: &'a Map<String, Value>,
    steps: &'a StepOutputs,
) -> Result<&'a Value, UnresolvedReference> {
    let (root, path) = match reference {
        Reference::Variable { name, path } => {
            let root = variables
                .get(name)
                .ok_or_else(|| UnresolvedReference::new(reference.to_string(), format!("variable '{name}' is not defined")))?;
            (root, path)
        }
        Reference::StepOutput { node_id, path } => {
            let root = steps.get(node_id).ok_or_else(|| {
                UnresolvedReference::new(reference.to_string(), format!("step '{node_id}' has no recorded output"))
            })?;
            (root, path)
        }
    };

    let mut current = root;
    for segment in path {
        let next = match current {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        };
        current = next.ok_or_else(|| {
            UnresolvedReference::new(reference.to_string(), format!("path segment '{segment}' not found"))
        })?;
    }
    Ok(current)
}

// ---------------------------------------------------------------------------
// Templates
// ---------------------------------------------------------------------------

fn is_templated(text: &str) -> bool {
    text.contains("{{") || text.contains("{%")
}

/// The inner expression of a string that is exactly one `{{ ... }}`.
fn sole_expression(text: &str) -> Option<&str> {
    let inner = text.strip_prefix("{{")?.strip_suffix("}}")?;
    (!inner.contains("{{") && !inner.contains("}}")).then_some(inner)
}

/// References read by one templated string.
fn template_references(text: &str) -> Result<Vec<Reference>, String> {
    let env = template::environment();
    let names = match sole_expression(text) {
        Some(inner) => env
            .compile_expression(inner)
            .map_err(|e| e.to_string())?
            .undeclared_variables(true),
        None => env
            .template_from_str(text)
            .map_err(|e| e.to_string())?
            .undeclared_variables(true),
    };
    template::references(names)
}

/// Check every template inside `value` for well-formedness.
pub fn check_bindings(value: &Value) -> Result<(), String> {
    match value {
        Value::String(s) if is_templated(s) => template_references(s).map(|_| ()),
        Value::Array(items) => items.iter().try_for_each(check_bindings),
        Value::Object(map) => map.values().try_for_each(check_bindings),
        _ => Ok(()),
    }
}

/// All well-formed references found inside `value`.
pub fn references_in(value: &Value) -> Vec<Reference> {
    let mut found = Vec::new();
    collect_references(value, &mut found);
    found
}

fn collect_references(value: &Value, found: &mut Vec<Reference>) {
    match value {
        Value::String(s) if is_templated(s) => {
            if let Ok(refs) = template_references(s) {
                found.extend(refs);
            }
        }
        Value::Array(items) => items.iter().for_each(|v| collect_references(v, found)),
        Value::Object(map) => map.values().for_each(|v| collect_references(v, found)),
        _ => {}
    }
}

// ---------------------------------------------------------------------------
// Scope
// ---------------------------------------------------------------------------

/// A consistent snapshot of the run's variable store.
///
/// Cloning is cheap; the scheduler records new outputs copy-on-write, so a
/// snapshot handed to a step never changes underneath it.
#[derive(Debug, Clone, Default)]
pub struct Scope {
    variables: Arc<Map<String, Value>>,
    steps: Arc<StepOutputs>,
}

impl Scope {
    pub fn new(variables: Map<String, Value>) -> Self {
        Self {
            variables: Arc::new(variables),
            steps: Arc::new(StepOutputs::new()),
        }
    }

    pub fn variables(&self) -> &Map<String, Value> {
        &self.variables
    }

    pub fn steps(&self) -> &StepOutputs {
        &self.steps
    }

    pub fn lookup(&self, reference: &Reference) -> Result<&Value, UnresolvedReference> {
        lookup(reference, &self.variables, &self.steps)
    }

    pub fn resolve(&self, expression: &str) -> Result<Value, UnresolvedReference> {
        resolve(expression, &self.variables, &self.steps)
    }

    /// Resolve every template inside an input binding.
    pub fn resolve_value(&self, value: &Value) -> Result<Value, UnresolvedReference> {
        match value {
            Value::String(s) => self.resolve_string(s),
            Value::Array(items) => items
                .iter()
                .map(|v| self.resolve_value(v))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Value::Object(map) => self.resolve_map(map).map(Value::Object),
            other => Ok(other.clone()),
        }
    }

    /// Resolve a node's input bindings into its input object.
    pub fn resolve_map(&self, bindings: &Map<String, Value>) -> Result<Map<String, Value>, UnresolvedReference> {
        bindings
            .iter()
            .map(|(k, v)| Ok((k.clone(), self.resolve_value(v)?)))
            .collect()
    }

    fn resolve_string(&self, text: &str) -> Result<Value, UnresolvedReference> {
        if !is_templated(text) {
            return Ok(Value::String(text.to_owned()));
        }
        let refs = template_references(text).map_err(|reason| UnresolvedReference::new(text, reason))?;
        template::ensure_resolvable(self, &refs)?;

        let env = template::environment();
        let fail = |e: minijinja::Error| UnresolvedReference::new(text, e.to_string());
        match sole_expression(text) {
            Some(inner) => {
                let value = env
                    .compile_expression(inner)
                    .map_err(fail)?
                    .eval(template::context(self))
                    .map_err(fail)?;
                template::to_json(text, value)
            }
            None => env.render_str(text, template::context(self)).map(Value::String).map_err(fail),
        }
    }

    /// Record a completed step's output. Only the scheduler calls this.
    pub(crate) fn record_output(&mut self, node_id: &str, output: Value) {
        Arc::make_mut(&mut self.steps).insert(node_id.to_owned(), output);
    }
}

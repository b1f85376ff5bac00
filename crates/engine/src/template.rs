//! minijinja plumbing shared by input templates and guard expressions.
//!
//! Both render against the same context:
//! ```json
//! { "variables": { ... }, "steps": { "<nodeId>": { "output": ... } } }
//! ```
//! Undefined values are strict: reading a name that is not in the context
//! is an error rather than an empty string.

use std::collections::{BTreeMap, HashSet};

use minijinja::{Environment, UndefinedBehavior};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::resolver::{Reference, Scope, UnresolvedReference};

pub(crate) fn environment() -> Environment<'static> {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    env
}

#[derive(Serialize)]
struct StepSlot<'a> {
    output: &'a Value,
}

#[derive(Serialize)]
struct Context<'a> {
    variables: &'a Map<String, Value>,
    steps: BTreeMap<&'a str, StepSlot<'a>>,
}

pub(crate) fn context(scope: &Scope) -> minijinja::Value {
    minijinja::Value::from_serialize(&Context {
        variables: scope.variables(),
        steps: scope
            .steps()
            .iter()
            .map(|(id, output)| (id.as_str(), StepSlot { output }))
            .collect(),
    })
}

/// Parse the dotted names minijinja reports as undeclared.
///
/// Every name must be a `variables.` or `steps.<id>.output` reference; the
/// result is sorted so dependency extraction is deterministic.
pub(crate) fn references(names: HashSet<String>) -> Result<Vec<Reference>, String> {
    let mut names: Vec<String> = names.into_iter().collect();
    names.sort();
    names.iter().map(|name| Reference::parse(name)).collect()
}

/// Check that every reference resolves before handing the scope to minijinja,
/// so a missing value reports the reference rather than a render error.
pub(crate) fn ensure_resolvable(scope: &Scope, references: &[Reference]) -> Result<(), UnresolvedReference> {
    references.iter().try_for_each(|r| scope.lookup(r).map(|_| ()))
}

/// Convert an evaluated minijinja value back into JSON.
pub(crate) fn to_json(source: &str, value: minijinja::Value) -> Result<Value, UnresolvedReference> {
    if value.is_undefined() {
        return Err(UnresolvedReference::new(source, "expression evaluated to an undefined value"));
    }
    serde_json::to_value(&value).map_err(|e| UnresolvedReference::new(source, e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn context_nests_outputs_under_steps() {
        let mut vars = Map::new();
        vars.insert("network".into(), json!("sepolia"));
        let mut scope = Scope::new(vars);
        scope.record_output("fetch", json!({ "balance": 3 }));

        let env = environment();
        let expr = env.compile_expression("steps.fetch.output.balance + 1").unwrap();
        let value = expr.eval(context(&scope)).unwrap();
        assert_eq!(to_json("", value).unwrap(), json!(4));

        let rendered = env.render_str("on {{ variables.network }}", context(&scope)).unwrap();
        assert_eq!(rendered, "on sepolia");
    }

    #[test]
    fn undeclared_names_must_be_references() {
        let names: HashSet<String> = ["variables.x".to_owned(), "steps.a.output.v".to_owned()].into();
        let refs = references(names).unwrap();
        assert_eq!(refs[0].step_id(), Some("a"));

        let names: HashSet<String> = ["network".to_owned()].into();
        assert!(references(names).is_err());
    }
}

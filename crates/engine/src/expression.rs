//! Boolean expressions for edge guards and condition nodes.
//!
//! Expressions are minijinja expressions over the same `variables` and
//! `steps` roots as input templates, e.g.
//! `steps.check.output.balance > 0 and variables.network == 'sepolia'`.
//! The result is read with Jinja truthiness: `false`, `none`, `0`, `""` and
//! empty sequences or maps are false.

use thiserror::Error;

use crate::resolver::{Reference, Scope, UnresolvedReference};
use crate::template;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ParseError {
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EvalError {
    #[error(transparent)]
    Unresolved(#[from] UnresolvedReference),

    #[error("cannot evaluate '{source_text}': {message}")]
    Runtime { source_text: String, message: String },
}

/// A guard or condition expression that compiled and reads only known roots.
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    source: String,
    references: Vec<Reference>,
}

impl Expression {
    pub fn parse(source: &str) -> Result<Self, ParseError> {
        let env = template::environment();
        let compiled = env.compile_expression(source).map_err(|e| ParseError {
            message: e.to_string(),
        })?;
        let references = template::references(compiled.undeclared_variables(true))
            .map_err(|message| ParseError { message })?;
        Ok(Self {
            source: source.to_owned(),
            references,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Every reference the expression reads.
    pub fn references(&self) -> &[Reference] {
        &self.references
    }

    pub fn evaluate(&self, scope: &Scope) -> Result<bool, EvalError> {
        template::ensure_resolvable(scope, &self.references)?;

        let runtime = |e: minijinja::Error| EvalError::Runtime {
            source_text: self.source.clone(),
            message: e.to_string(),
        };
        let env = template::environment();
        let value = env
            .compile_expression(&self.source)
            .map_err(runtime)?
            .eval(template::context(scope))
            .map_err(runtime)?;
        if value.is_undefined() {
            let reason = "expression evaluated to an undefined value";
            return Err(UnresolvedReference::new(self.source.clone(), reason).into());
        }
        Ok(value.is_true())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Map};

    fn scope() -> Scope {
        let mut vars = Map::new();
        vars.insert("network".into(), json!("sepolia"));
        vars.insert("dry_run".into(), json!(false));
        vars.insert("owner".into(), json!("l'été"));
        let mut scope = Scope::new(vars);
        scope.record_output("check", json!({ "balance": 12.5, "ok": true, "tags": [] }));
        scope
    }

    fn eval_str(src: &str) -> bool {
        Expression::parse(src).unwrap().evaluate(&scope()).unwrap()
    }

    #[test]
    fn comparisons_and_logic() {
        assert!(eval_str("steps.check.output.balance > 10"));
        assert!(eval_str("steps.check.output.balance >= 12.5 and variables.network == 'sepolia'"));
        assert!(!eval_str("variables.network != \"sepolia\""));
        assert!(eval_str("not variables.dry_run"));
        assert!(eval_str("variables.dry_run or steps.check.output.ok"));
        assert!(eval_str("(1 < 2) == true"));
        assert!(eval_str("-1 < 0"));
        assert!(eval_str("variables.network in ['sepolia', 'mainnet']"));
        assert!(!eval_str("steps.check.output.tags"));
        assert!(!eval_str("none"));
    }

    #[test]
    fn escapes_before_multibyte_characters() {
        assert!(eval_str(r"variables.owner == 'l\'été'"));
        // Either outcome is fine; parsing must return.
        let _ = Expression::parse(r"variables.x == '\é'");
        let _ = Expression::parse("variables.name == 'caf\\é'");
    }

    #[test]
    fn malformed_expressions_are_rejected() {
        for src in ["", "a ==", "variables.x and", "(true", "true)", "1 = 2", "'open", "network == 1", "steps.x.value"] {
            assert!(Expression::parse(src).is_err(), "expected parse error for {src:?}");
        }
    }

    #[test]
    fn references_are_reported() {
        let expr = Expression::parse("steps.a.output.x == variables.y or steps.b.output").unwrap();
        let steps: Vec<&str> = expr.references().iter().filter_map(|r| r.step_id()).collect();
        assert_eq!(steps, vec!["a", "b"]);
    }

    #[test]
    fn unresolved_reference_is_an_eval_error() {
        let expr = Expression::parse("steps.missing.output.ok").unwrap();
        assert!(matches!(expr.evaluate(&scope()), Err(EvalError::Unresolved(_))));
    }

    #[test]
    fn invalid_operation_is_a_runtime_error() {
        let expr = Expression::parse("variables.network + 3").unwrap();
        assert!(matches!(expr.evaluate(&scope()), Err(EvalError::Runtime { .. })));
    }
}

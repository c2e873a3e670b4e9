//! JQ-compatible expression evaluation, plus the SW-style `${...}`
//! interpolation layer on top of it.
//!
//! Every evaluation takes two things: a `data` value, which becomes the
//! jq root (`.`), and a [`Scope`], whose entries are bound as `$name` jq
//! variables (`$context`, `$secrets`, `$workflow`, `$runtime`, `$task`,
//! `$input`, `$output`, and any locally-bound names such as `$each`).
//! This mirrors how `input.from`/`output.as`/`set` reach into the data
//! being transformed while still having named access to the rest of the
//! scope.

use std::sync::Arc;

use jaq_core::load::{Arena, File, Loader};
use jaq_core::{Ctx, Native, RcIter};
use jaq_json::Val;
use serde_json::{Map, Value};

use crate::error::EvalError;
use crate::scope::Scope;

/// A compiled JQ program, cached per distinct program text so a hot task
/// executed many times across instances doesn't reparse its expressions.
pub struct Program {
    filter: jaq_core::Filter<Native<Val>>,
}

fn compile(text: &str) -> Result<Program, EvalError> {
    let arena = Arena::default();
    let loader = Loader::new(jaq_std::defs().chain(jaq_json::defs()));
    let file = File { path: (), code: text };
    let modules = loader
        .load(&arena, file)
        .map_err(|errs| EvalError::Parse(format!("{errs:?}")))?;
    let filter = jaq_core::Compiler::default()
        .with_funs(jaq_std::funs().chain(jaq_json::funs()))
        .compile(modules)
        .map_err(|errs| EvalError::Parse(format!("{errs:?}")))?;
    Ok(Program { filter })
}

/// Run a bare JQ program against `input` with `$name` variable bindings,
/// returning every output the program produces (jq programs may yield
/// zero, one, or many outputs). `cache` avoids recompiling the same
/// program text across steps and instances.
pub fn run(cache: &ProgramCache, text: &str, input: &Value, vars: &[(String, Value)]) -> Result<Vec<Value>, EvalError> {
    let program = cache.get_or_compile(text)?;
    let named_vars: Vec<String> = vars.iter().map(|(k, _)| k.clone()).collect();
    let var_vals: Vec<Val> = vars.iter().map(|(_, v)| Val::from(v.clone())).collect();
    let inputs = RcIter::new(core::iter::empty());
    let ctx = Ctx::new(var_vals, &inputs).with_vars(named_vars);

    let results: Result<Vec<Val>, _> = program
        .filter
        .run((ctx, Val::from(input.clone())))
        .collect();
    let results = results.map_err(|e| EvalError::Eval(format!("{e:?}")))?;
    Ok(results.into_iter().map(Value::from).collect())
}

fn scope_vars(scope: &Scope) -> Vec<(String, Value)> {
    scope
        .as_object()
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Evaluate one of the three input shapes the SW DSL allows wherever an
/// expression is expected: a bare JQ program, a `${...}`-wrapped
/// interpolation string, or a JSON template whose string leaves are each
/// treated the same way.
///
/// A plain string that is neither a valid jq program nor `${...}`-marked
/// is returned unchanged (the round-trip-safety invariant from the
/// design notes).
pub fn eval_template(cache: &ProgramCache, template: &Value, data: &Value, scope: &Scope) -> Result<Value, EvalError> {
    match template {
        Value::String(s) => {
            if is_plain_string(s) {
                Ok(try_bare_jq(cache, s, data, scope).unwrap_or_else(|| Value::String(s.clone())))
            } else {
                eval_string_template(cache, s, data, scope).map(Value::String)
            }
        }
        Value::Object(obj) => {
            let mut out = Map::new();
            for (k, v) in obj {
                out.insert(k.clone(), eval_template(cache, v, data, scope)?);
            }
            Ok(Value::Object(out))
        }
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(eval_template(cache, item, data, scope)?);
            }
            Ok(Value::Array(out))
        }
        other => Ok(other.clone()),
    }
}

fn is_plain_string(s: &str) -> bool {
    !s.contains("${")
}

/// Try evaluating `s` as a bare jq program against `data`. Returns `None`
/// (not `Err`) on any parse or evaluation failure, since the caller's
/// fallback in that case is to treat `s` as a literal, not to propagate
/// an error.
fn try_bare_jq(cache: &ProgramCache, s: &str, data: &Value, scope: &Scope) -> Option<Value> {
    let results = run(cache, s, data, &scope_vars(scope)).ok()?;
    results.into_iter().next()
}

/// Evaluate every `${...}` fragment in `s` against `data`/`scope` and
/// concatenate the results with the literal surrounding text. A string
/// with no `${...}` at all is returned as-is.
fn eval_string_template(cache: &ProgramCache, s: &str, data: &Value, scope: &Scope) -> Result<String, EvalError> {
    if is_plain_string(s) {
        return Ok(s.to_string());
    }

    let mut out = String::new();
    let mut rest = s;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = find_matching_brace(after)
            .ok_or_else(|| EvalError::Parse("unterminated ${...} expression".into()))?;
        let expr = &after[..end];
        let result = eval_jq_scalar(cache, expr, data, scope)?;
        out.push_str(&scalar_to_string(&result));
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

fn find_matching_brace(s: &str) -> Option<usize> {
    let mut depth = 1i32;
    for (i, c) in s.char_indices() {
        match c {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

fn scalar_to_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn eval_jq_scalar(cache: &ProgramCache, expr: &str, data: &Value, scope: &Scope) -> Result<Value, EvalError> {
    let results = run(cache, expr, data, &scope_vars(scope))?;
    results
        .into_iter()
        .next()
        .ok_or_else(|| EvalError::Eval(format!("expression '{expr}' produced no output")))
}

/// Evaluate `expr` (bare JQ, or `${...}`-wrapped/embedded) against
/// `data`/`scope` and expect exactly one string result.
pub fn eval_string(cache: &ProgramCache, expr: &Value, data: &Value, scope: &Scope) -> Result<String, EvalError> {
    match eval_template(cache, expr, data, scope)? {
        Value::String(s) => Ok(s),
        other => Err(EvalError::TypeMismatch {
            expected: "string",
            actual: type_name(&other),
        }),
    }
}

pub fn eval_boolean(cache: &ProgramCache, expr: &Value, data: &Value, scope: &Scope) -> Result<bool, EvalError> {
    // Booleans are only meaningful from a bare JQ program, never a
    // template string (there is no such thing as "interpolating" a bool).
    let text = expr.as_str().ok_or_else(|| EvalError::TypeMismatch {
        expected: "jq program string",
        actual: type_name(expr),
    })?;
    let text = strip_sw_wrapper(text);
    let result = eval_jq_scalar(cache, text, data, scope)?;
    result.as_bool().ok_or_else(|| EvalError::TypeMismatch {
        expected: "boolean",
        actual: type_name(&result),
    })
}

pub fn eval_list(cache: &ProgramCache, expr: &Value, data: &Value, scope: &Scope) -> Result<Vec<Value>, EvalError> {
    let text = expr.as_str().ok_or_else(|| EvalError::TypeMismatch {
        expected: "jq program string",
        actual: type_name(expr),
    })?;
    let text = strip_sw_wrapper(text);
    let result = eval_jq_scalar(cache, text, data, scope)?;
    result.as_array().cloned().ok_or_else(|| EvalError::TypeMismatch {
        expected: "array",
        actual: type_name(&result),
    })
}

pub fn eval_object(cache: &ProgramCache, expr: &Value, data: &Value, scope: &Scope) -> Result<Map<String, Value>, EvalError> {
    let evaluated = eval_template(cache, expr, data, scope)?;
    evaluated.as_object().cloned().ok_or_else(|| EvalError::TypeMismatch {
        expected: "object",
        actual: type_name(&evaluated),
    })
}

/// `${...}` detected as the *entire* string (outermost) strips to the
/// bare JQ program inside; otherwise the string is returned unchanged.
fn strip_sw_wrapper(s: &str) -> &str {
    if let Some(inner) = s.strip_prefix("${").and_then(|s| s.strip_suffix('}')) {
        inner
    } else {
        s
    }
}

fn type_name(v: &Value) -> String {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
    .to_string()
}

/// Thread-safe cache of compiled programs, keyed by program text, so the
/// driver can reuse a filter across steps and instances.
#[derive(Default)]
pub struct ProgramCache {
    inner: dashmap::DashMap<String, Arc<Program>>,
}

impl ProgramCache {
    pub fn get_or_compile(&self, text: &str) -> Result<Arc<Program>, EvalError> {
        if let Some(p) = self.inner.get(text) {
            return Ok(p.clone());
        }
        let program = Arc::new(compile(text)?);
        self.inner.insert(text.to_string(), program.clone());
        Ok(program)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scope_with(value: Value) -> Scope {
        Scope::layer(&Map::new(), &Map::new(), &Scope::empty(), value.as_object().unwrap())
    }

    #[test]
    fn plain_string_round_trips_unchanged() {
        let cache = ProgramCache::default();
        let scope = scope_with(json!({}));
        let result = eval_template(&cache, &json!("hello world"), &json!(null), &scope).unwrap();
        assert_eq!(result, json!("hello world"));
    }

    #[test]
    fn interpolation_concatenates_literal_and_expression() {
        let cache = ProgramCache::default();
        let scope = scope_with(json!({}));
        let data = json!({"user": {"name": "ada"}});
        let result = eval_template(&cache, &json!("hello ${.user.name}"), &data, &scope).unwrap();
        assert_eq!(result, json!("hello ada"));
    }

    #[test]
    fn template_object_walks_recursively() {
        let cache = ProgramCache::default();
        let scope = scope_with(json!({}));
        let data = json!({"value": "x"});
        let result = eval_template(&cache, &json!({"a": "${.value}", "b": 1}), &data, &scope).unwrap();
        assert_eq!(result, json!({"a": "x", "b": 1}));
    }

    #[test]
    fn bare_jq_program_evaluates_against_data_not_scope() {
        let cache = ProgramCache::default();
        let scope = scope_with(json!({}));
        let data = json!({"value": "1"});
        let result = eval_template(&cache, &json!(".value + \"2\""), &data, &scope).unwrap();
        assert_eq!(result, json!("12"));
    }

    #[test]
    fn scope_entries_are_available_as_dollar_variables() {
        let cache = ProgramCache::default();
        let mut workflow = Map::new();
        workflow.insert("secrets".into(), json!({"token": "abc"}));
        let scope = Scope::layer(&Map::new(), &Map::new(), &Scope::empty(), &workflow);
        let result = eval_template(&cache, &json!("$secrets.token"), &json!(null), &scope).unwrap();
        assert_eq!(result, json!("abc"));
    }

    #[test]
    fn eval_boolean_rejects_non_boolean_result() {
        let cache = ProgramCache::default();
        let scope = scope_with(json!({}));
        let err = eval_boolean(&cache, &json!("1 + 1"), &json!(null), &scope).unwrap_err();
        assert!(matches!(err, EvalError::TypeMismatch { .. }));
    }

    #[test]
    fn program_cache_reuses_compiled_filter_across_calls() {
        let cache = ProgramCache::default();
        let first = cache.get_or_compile(".value").unwrap();
        let second = cache.get_or_compile(".value").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }
}

//! Minimal structural schema validation.
//!
//! A full JSON Schema validator is out of this crate's scope; this
//! checks the handful of keywords the DSL actually exercises (`type`,
//! `required`, `enum`) so `input.schema`/`output.schema`/`export.schema`
//! violations still surface as [`WorkflowError`]s with the right kind.

use serde_json::Value;

use crate::error::{ErrorKind, WorkflowError};
use crate::position::Position;

pub fn validate(schema: &Value, data: &Value, position: &Position) -> Result<(), WorkflowError> {
    let Some(schema_obj) = schema.as_object() else {
        return Ok(());
    };

    if let Some(ty) = schema_obj.get("type").and_then(Value::as_str) {
        if !matches_type(ty, data) {
            return Err(fail(position, format!("expected type '{ty}', got {}", type_name(data))));
        }
    }

    if let Some(allowed) = schema_obj.get("enum").and_then(Value::as_array) {
        if !allowed.contains(data) {
            return Err(fail(position, "value is not one of the schema's `enum` options"));
        }
    }

    if let Some(required) = schema_obj.get("required").and_then(Value::as_array) {
        let obj = data.as_object().ok_or_else(|| {
            fail(position, "schema `required` applies only to object data")
        })?;
        for key in required {
            if let Some(key) = key.as_str() {
                if !obj.contains_key(key) {
                    return Err(fail(position, format!("missing required property '{key}'")));
                }
            }
        }
    }

    if let Some(props) = schema_obj.get("properties").and_then(Value::as_object) {
        if let Some(obj) = data.as_object() {
            for (key, sub_schema) in props {
                if let Some(value) = obj.get(key) {
                    validate(sub_schema, value, position)?;
                }
            }
        }
    }

    Ok(())
}

fn matches_type(ty: &str, data: &Value) -> bool {
    match ty {
        "object" => data.is_object(),
        "array" => data.is_array(),
        "string" => data.is_string(),
        "number" => data.is_number(),
        "integer" => data.as_i64().is_some() || data.as_u64().is_some(),
        "boolean" => data.is_boolean(),
        "null" => data.is_null(),
        _ => true,
    }
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn fail(position: &Position, msg: impl Into<String>) -> WorkflowError {
    WorkflowError::new(ErrorKind::Validation, msg, position.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn rejects_wrong_type() {
        let err = validate(&json!({"type": "object"}), &json!("nope"), &Position::root()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);
    }

    #[test]
    fn rejects_missing_required_property() {
        let schema = json!({"type": "object", "required": ["id"]});
        assert!(validate(&schema, &json!({}), &Position::root()).is_err());
        assert!(validate(&schema, &json!({"id": 1}), &Position::root()).is_ok());
    }

    #[test]
    fn schema_without_type_keyword_passes_anything() {
        assert!(validate(&json!({}), &json!(42), &Position::root()).is_ok());
    }
}

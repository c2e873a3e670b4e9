//! Per-instance, per-position mutable execution state.

use serde::{Deserialize, Serialize};
use serde_json::Value;

fn default_index() -> i64 {
    -1
}

fn is_default_index(v: &i64) -> bool {
    *v == -1
}

fn is_zero(v: &u32) -> bool {
    *v == 0
}

fn is_empty_object(v: &serde_json::Map<String, Value>) -> bool {
    v.is_empty()
}

/// Mutable, per-position execution record carried inside a [`crate::message::Message`].
///
/// Wire keys (`id, at, in, out, child, retry, for, var, ctx`) are part of the
/// external contract and MUST NOT change: other processes decode the same
/// envelope.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeState {
    #[serde(rename = "id", skip_serializing_if = "Option::is_none", default)]
    pub workflow_id: Option<String>,

    #[serde(rename = "at", skip_serializing_if = "Option::is_none", default)]
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,

    #[serde(rename = "in", skip_serializing_if = "Option::is_none", default)]
    pub raw_input: Option<Value>,

    #[serde(rename = "out", skip_serializing_if = "Option::is_none", default)]
    pub raw_output: Option<Value>,

    #[serde(
        rename = "child",
        skip_serializing_if = "is_default_index",
        default = "default_index"
    )]
    pub child_index: i64,

    #[serde(rename = "retry", skip_serializing_if = "is_zero", default)]
    pub attempt_index: u32,

    #[serde(
        rename = "for",
        skip_serializing_if = "is_default_index",
        default = "default_index"
    )]
    pub for_index: i64,

    #[serde(rename = "var", skip_serializing_if = "is_empty_object", default)]
    pub variables: serde_json::Map<String, Value>,

    #[serde(rename = "ctx", skip_serializing_if = "is_empty_object", default)]
    pub context: serde_json::Map<String, Value>,
}

impl NodeState {
    pub fn new() -> Self {
        Self {
            child_index: -1,
            for_index: -1,
            ..Default::default()
        }
    }

    /// Reset this node's local progress while keeping it addressable.
    ///
    /// Used when re-entering a flow node (e.g. a `For` iteration) and when
    /// a `Try` resets the subtree between the raising node and itself.
    pub fn reset(&mut self) {
        *self = NodeState::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_omitted_from_wire_form() {
        let mut state = NodeState::new();
        state.raw_input = Some(Value::String(String::new()));
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json, serde_json::json!({"in": ""}));
    }

    #[test]
    fn round_trips_with_all_fields_set() {
        let mut state = NodeState::new();
        state.workflow_id = Some("wf-1".into());
        state.raw_input = Some(serde_json::json!({"a": 1}));
        state.raw_output = Some(serde_json::json!("done"));
        state.child_index = 2;
        state.attempt_index = 3;
        state.for_index = 1;
        state.variables.insert("each".into(), serde_json::json!(42));
        state.context.insert("k".into(), serde_json::json!("v"));

        let json = serde_json::to_string(&state).unwrap();
        let back: NodeState = serde_json::from_str(&json).unwrap();
        assert_eq!(state, back);
    }

    #[test]
    fn short_keys_are_stable() {
        let mut state = NodeState::new();
        state.raw_input = Some(Value::String(String::new()));
        state.child_index = 1;
        state.attempt_index = 1;
        state.for_index = 0;
        state
            .variables
            .insert("x".into(), serde_json::json!(1));
        let v = serde_json::to_value(&state).unwrap();
        let obj = v.as_object().unwrap();
        for key in obj.keys() {
            assert!(["id", "at", "in", "out", "child", "retry", "for", "var", "ctx"]
                .contains(&key.as_str()));
        }
    }
}

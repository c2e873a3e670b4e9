//! The Message envelope: the entire externalized state of a workflow
//! instance between steps.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::position::Position;
use crate::state::NodeState;

/// Compact, stable-key wire envelope.
///
/// This is the only state carried across processes: the runtime
/// reconstructs everything else from `(name, version)` and the cached
/// parsed definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "n")]
    pub name: String,

    #[serde(rename = "v")]
    pub version: String,

    #[serde(rename = "s")]
    pub states: HashMap<String, NodeState>,

    #[serde(rename = "p")]
    pub position: Position,
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("failed to decode message envelope: {0}")]
    Decode(#[from] serde_json::Error),
}

impl Message {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            states: HashMap::new(),
            position: Position::root(),
        }
    }

    pub fn state_at(&self, position: &Position) -> NodeState {
        self.states
            .get(&position.to_string())
            .cloned()
            .unwrap_or_default()
    }

    pub fn set_state_at(&mut self, position: &Position, state: NodeState) {
        self.states.insert(position.to_string(), state);
    }

    pub fn encode(&self) -> Result<String, CodecError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(raw: &str) -> Result<Self, CodecError> {
        Ok(serde_json::from_str(raw)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_short_key_stability() {
        let mut message = Message::new("w", "1");
        let mut state = NodeState::new();
        state.raw_input = Some(serde_json::Value::String(String::new()));
        message.set_state_at(&Position::root(), state);

        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json, serde_json::json!({"n":"w","v":"1","s":{"":{"in":""}},"p":""}));
    }

    #[test]
    fn decode_encode_round_trips() {
        let mut message = Message::new("w", "1");
        message
            .states
            .insert("/do/0".to_string(), NodeState::new());
        message.position = Position::parse("/do/0");

        let raw = message.encode().unwrap();
        let back = Message::decode(&raw).unwrap();
        assert_eq!(message, back);
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(Message::decode("not json").is_err());
    }
}

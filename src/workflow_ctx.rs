//! Static, per-instance workflow-level scope data: the `workflow`,
//! `secrets`, and `runtime` layers of the evaluation scope, plus access to
//! the mutable `context` layer, which lives in the root position's
//! [`crate::state::NodeState`] and is replaced wholesale by `export.as`.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::message::Message;
use crate::position::Position;

/// Everything about an instance that does not change step to step, built
/// once by the consumer from the definition record and the instance's
/// start request.
#[derive(Debug, Clone)]
pub struct WorkflowContext {
    pub workflow: Map<String, Value>,
    pub secrets: Map<String, Value>,
    pub runtime: Map<String, Value>,
    pub now: DateTime<Utc>,
}

impl WorkflowContext {
    pub fn new(name: &str, version: &str, document: &Value) -> Self {
        let mut workflow = Map::new();
        workflow.insert("name".into(), Value::String(name.to_string()));
        workflow.insert("version".into(), Value::String(version.to_string()));
        workflow.insert("definition".into(), document.clone());
        Self {
            workflow,
            secrets: Map::new(),
            runtime: Map::new(),
            now: Utc::now(),
        }
    }

    pub fn with_secrets(mut self, secrets: Map<String, Value>) -> Self {
        self.secrets = secrets;
        self
    }

    pub fn with_runtime(mut self, runtime: Map<String, Value>) -> Self {
        self.runtime = runtime;
        self
    }

    pub fn with_now(mut self, now: DateTime<Utc>) -> Self {
        self.now = now;
        self
    }

    /// The merged `{context, secrets, workflow, runtime}` object that
    /// forms the outermost (workflow) scope layer for `message`.
    pub fn scope_layer(&self, message: &Message) -> Map<String, Value> {
        let mut layer = Map::new();
        layer.insert("secrets".into(), Value::Object(self.secrets.clone()));
        layer.insert("workflow".into(), Value::Object(self.workflow.clone()));
        layer.insert("runtime".into(), Value::Object(self.runtime.clone()));
        let context = message.state_at(&Position::root()).context;
        layer.insert("context".into(), Value::Object(context));
        layer
    }

    /// Replace the instance's `context` in place, per `export.as`.
    pub fn replace_context(&self, message: &mut Message, exported: Map<String, Value>) {
        let mut root_state = message.state_at(&Position::root());
        root_state.context = exported;
        message.set_state_at(&Position::root(), root_state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn scope_layer_reflects_replaced_context() {
        let ctx = WorkflowContext::new("w", "1", &json!({"do": []}));
        let mut message = Message::new("w", "1");
        let mut exported = Map::new();
        exported.insert("seen".into(), json!(true));
        ctx.replace_context(&mut message, exported);

        let layer = ctx.scope_layer(&message);
        assert_eq!(layer.get("context"), Some(&json!({"seen": true})));
    }
}

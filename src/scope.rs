//! Lexically-scoped evaluation context, assembled by layering JSON
//! objects with the innermost layer winning.

use serde_json::{Map, Value};

/// A flattened evaluation scope. Construction never mutates an input
/// layer; each layer is merged (shallow, key-wise) into a fresh object.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Scope(Map<String, Value>);

impl Scope {
    pub fn empty() -> Self {
        Scope(Map::new())
    }

    /// Build a scope by layering, innermost first: locally-bound
    /// variables, the current task snapshot, the (already-merged) parent
    /// scope, and the workflow-level scope. Inner layers shadow outer
    /// ones key-for-key; nothing here mutates its inputs.
    pub fn layer(
        locals: &Map<String, Value>,
        task_snapshot: &Map<String, Value>,
        parent: &Scope,
        workflow: &Map<String, Value>,
    ) -> Self {
        let mut merged = workflow.clone();
        for (k, v) in &parent.0 {
            merged.insert(k.clone(), v.clone());
        }
        for (k, v) in task_snapshot {
            merged.insert(k.clone(), v.clone());
        }
        for (k, v) in locals {
            merged.insert(k.clone(), v.clone());
        }
        Scope(merged)
    }

    pub fn as_object(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn as_value(&self) -> Value {
        Value::Object(self.0.clone())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(v: Value) -> Map<String, Value> {
        v.as_object().unwrap().clone()
    }

    #[test]
    fn inner_bindings_shadow_outer_ones() {
        let workflow = obj(json!({"context": "workflow", "shared": "workflow"}));
        let parent = Scope::layer(&Map::new(), &Map::new(), &Scope::empty(), &workflow);
        let task = obj(json!({"shared": "task"}));
        let locals = obj(json!({"shared": "local", "each": 1}));

        let scope = Scope::layer(&locals, &task, &parent, &Map::new());

        assert_eq!(scope.get("shared"), Some(&json!("local")));
        assert_eq!(scope.get("context"), Some(&json!("workflow")));
        assert_eq!(scope.get("each"), Some(&json!(1)));
    }

    #[test]
    fn layering_does_not_mutate_inputs() {
        let workflow = obj(json!({"a": 1}));
        let locals = obj(json!({"a": 2}));
        let workflow_before = workflow.clone();
        let locals_before = locals.clone();

        let _ = Scope::layer(&locals, &Map::new(), &Scope::empty(), &workflow);

        assert_eq!(workflow, workflow_before);
        assert_eq!(locals, locals_before);
    }
}

//! Assembles the evaluation [`Scope`] for a position: locally-bound
//! variables, the position's own task snapshot, the recursively-built
//! parent scope, and (at the root) the workflow scope.

use serde_json::{Map, Value};

use crate::message::Message;
use crate::node::NodeTree;
use crate::position::Position;
use crate::scope::Scope;
use crate::workflow_ctx::WorkflowContext;

use super::task;

/// Build the scope visible *inside* `position`, i.e. the scope used to
/// evaluate that node's own `if`/`input.from`/etc. Locals come from that
/// position's own [`crate::state::NodeState::variables`] (a `For` node
/// seeds these on its `do` child before descending).
pub fn build(tree: &NodeTree, message: &Message, position: &Position, ctx: &WorkflowContext) -> Scope {
    let state = message.state_at(position);
    let locals = state.variables.clone();

    let task_snapshot = match tree.get(position) {
        Some(node) => {
            let mut snapshot = Map::new();
            let mut task_obj = Map::new();
            task_obj.insert(
                "name".into(),
                task::name_snapshot(node).map(Value::from).unwrap_or(Value::Null),
            );
            task_obj.insert("reference".into(), Value::String(task::reference(position)));
            task_obj.insert("definition".into(), node.raw_task.clone());
            task_obj.insert(
                "startedAt".into(),
                state
                    .started_at
                    .map(|t| Value::String(t.to_rfc3339()))
                    .unwrap_or(Value::Null),
            );
            let input = state.raw_input.clone().unwrap_or(Value::Null);
            let output = state.raw_output.clone().unwrap_or(Value::Null);
            task_obj.insert("input".into(), input.clone());
            task_obj.insert("output".into(), output.clone());
            snapshot.insert("task".into(), Value::Object(task_obj));
            snapshot.insert("input".into(), input);
            snapshot.insert("output".into(), output);
            snapshot
        }
        None => Map::new(),
    };

    match position.parent() {
        None => {
            // Root: parent layer is empty, workflow layer supplies
            // context/secrets/workflow/runtime.
            Scope::layer(&locals, &task_snapshot, &Scope::empty(), &ctx.scope_layer(message))
        }
        Some(parent_pos) => {
            let parent_scope = build(tree, message, &parent_pos, ctx);
            Scope::layer(&locals, &task_snapshot, &parent_scope, &Map::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::parse_document;
    use serde_json::json;

    fn doc(yaml: &str) -> Value {
        let v: serde_yaml::Value = serde_yaml::from_str(yaml).unwrap();
        serde_json::to_value(v).unwrap()
    }

    #[test]
    fn child_scope_sees_workflow_layer() {
        let tree = parse_document(&doc(
            r#"
            do:
              - first:
                  set: { value: "1" }
            "#,
        ))
        .unwrap();
        let message = Message::new("w", "1");
        let ctx = WorkflowContext::new("w", "1", &json!({})).with_secrets(
            json!({"token": "abc"}).as_object().unwrap().clone(),
        );

        let first_pos = Position::parse("/do/0");
        let scope = build(&tree, &message, &first_pos, &ctx);
        assert_eq!(
            scope.get("secrets"),
            Some(&json!({"token": "abc"}))
        );
    }
}

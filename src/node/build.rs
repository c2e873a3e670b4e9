//! Deterministic construction of a [`NodeTree`] from a parsed DSL document.

use serde_json::{Map, Value};

use crate::error::{ErrorKind, WorkflowError};
use crate::position::Position;

use super::{Node, NodeKind, NodeTree};

fn config_err(position: &Position, msg: impl Into<String>) -> WorkflowError {
    WorkflowError::new(ErrorKind::Configuration, msg, position.clone())
}

fn detect_kind(position: &Position, body: &Value) -> Result<NodeKind, WorkflowError> {
    let obj = body
        .as_object()
        .ok_or_else(|| config_err(position, "task body must be an object"))?;

    if obj.contains_key("do") {
        return Ok(NodeKind::Do);
    }
    if obj.contains_key("switch") {
        return Ok(NodeKind::Switch);
    }
    if obj.contains_key("for") {
        return Ok(NodeKind::For);
    }
    if obj.contains_key("try") {
        return Ok(NodeKind::Try);
    }
    if obj.contains_key("fork") {
        return Ok(NodeKind::Fork);
    }
    if obj.contains_key("listen") {
        return Ok(NodeKind::Listen);
    }
    if obj.contains_key("emit") {
        return Ok(NodeKind::Emit);
    }
    if obj.contains_key("raise") {
        return Ok(NodeKind::Raise);
    }
    if obj.contains_key("run") {
        return Ok(NodeKind::Run);
    }
    if obj.contains_key("set") {
        return Ok(NodeKind::Set);
    }
    if obj.contains_key("wait") {
        return Ok(NodeKind::Wait);
    }
    if let Some(call) = obj.get("call") {
        return Ok(match call.as_str() {
            Some("http") => NodeKind::CallHttp,
            Some("asyncapi") => NodeKind::CallAsync,
            Some("grpc") => NodeKind::CallGrpc,
            Some("openapi") => NodeKind::CallOpenApi,
            _ => NodeKind::CallFunction,
        });
    }

    Err(config_err(
        position,
        "task body does not match any known task kind",
    ))
}

/// Pull the single `{name: body}` entry out of a `do`/`fork.branches` array
/// item.
fn single_entry(position: &Position, item: &Value) -> Result<(String, Value), WorkflowError> {
    let obj = item
        .as_object()
        .ok_or_else(|| config_err(position, "list item must be a single-key object"))?;
    if obj.len() != 1 {
        return Err(config_err(
            position,
            "list item must have exactly one name key",
        ));
    }
    let (name, body) = obj.iter().next().unwrap();
    Ok((name.clone(), body.clone()))
}

fn as_array<'a>(position: &Position, obj: &'a Map<String, Value>, key: &str) -> Result<&'a Vec<Value>, WorkflowError> {
    obj.get(key)
        .and_then(Value::as_array)
        .ok_or_else(|| config_err(position, format!("expected `{key}` to be a list")))
}

struct Builder {
    tree: NodeTree,
}

impl Builder {
    /// Build a named array's items (used both for a `do` list and for
    /// `fork.branches`): indexes items, and if an item's own kind is `Do`,
    /// appends the trailing `do` token to its position instead of stopping
    /// at the bare index, so a nested `do` block always addresses its own
    /// children rather than the wrapping item.
    fn build_named_array(
        &mut self,
        list_position: &Position,
        parent: &Position,
        items: &[Value],
    ) -> Result<Vec<Position>, WorkflowError> {
        let mut children = Vec::with_capacity(items.len());
        for (i, item) in items.iter().enumerate() {
            let (name, body) = single_entry(list_position, item)?;
            let natural = list_position.child_index(i);
            let kind = detect_kind(&natural, &body)?;
            let final_pos = if kind == NodeKind::Do {
                natural.child_token("do")
            } else {
                natural
            };
            self.build_node(final_pos.clone(), parent.clone(), Some(name), kind, &body)?;
            children.push(final_pos);
        }
        Ok(children)
    }

    fn build_node(
        &mut self,
        position: Position,
        parent: Position,
        name: Option<String>,
        kind: NodeKind,
        body: &Value,
    ) -> Result<(), WorkflowError> {
        let children = match kind {
            NodeKind::Do => {
                let obj = body.as_object().unwrap();
                let items = as_array(&position, obj, "do")?;
                self.build_named_array(&position, &position, items)?
            }
            NodeKind::For => {
                let do_pos = position.child_token("do");
                let obj = body.as_object().unwrap();
                let items = as_array(&position, obj, "do")?;
                self.build_named_array(&do_pos, &position, items)?;
                vec![do_pos]
            }
            NodeKind::Try => {
                let obj = body.as_object().unwrap();
                let try_obj = obj
                    .get("try")
                    .and_then(Value::as_object)
                    .ok_or_else(|| config_err(&position, "`try` must be an object"))?;
                let try_do_pos = position.child_token("try").child_token("do");
                let items = as_array(&position, try_obj, "do")?;
                self.build_named_array(&try_do_pos, &position, items)?;
                let mut children = vec![try_do_pos];

                if let Some(catch_obj) = try_obj.get("catch").and_then(Value::as_object) {
                    let catch_do_pos = position
                        .child_token("try")
                        .child_token("catch")
                        .child_token("do");
                    let items = as_array(&position, catch_obj, "do")?;
                    self.build_named_array(&catch_do_pos, &position, items)?;
                    children.push(catch_do_pos);
                }
                children
            }
            NodeKind::Fork => {
                let obj = body.as_object().unwrap();
                let fork_obj = obj
                    .get("fork")
                    .and_then(Value::as_object)
                    .ok_or_else(|| config_err(&position, "`fork` must be an object"))?;
                let branches_pos = position.child_token("fork").child_token("branches");
                let items = as_array(&position, fork_obj, "branches")?;
                self.build_named_array(&branches_pos, &position, items)?
            }
            NodeKind::Listen => {
                let obj = body.as_object().unwrap();
                if let Some(foreach) = obj.get("listen").and_then(Value::as_object).and_then(|l| l.get("foreach")).and_then(Value::as_object) {
                    let do_pos = position.child_token("foreach").child_token("do");
                    let items = as_array(&position, foreach, "do")?;
                    self.build_named_array(&do_pos, &position, items)?;
                    vec![do_pos]
                } else {
                    vec![]
                }
            }
            NodeKind::CallAsync => {
                let obj = body.as_object().unwrap();
                let nested = obj
                    .get("with")
                    .and_then(Value::as_object)
                    .and_then(|w| w.get("subscription"))
                    .and_then(Value::as_object)
                    .and_then(|s| s.get("foreach"))
                    .and_then(Value::as_object);
                if let Some(foreach) = nested {
                    let do_pos = position
                        .child_token("with")
                        .child_token("subscription")
                        .child_token("foreach")
                        .child_token("do");
                    let items = as_array(&position, foreach, "do")?;
                    self.build_named_array(&do_pos, &position, items)?;
                    vec![do_pos]
                } else {
                    vec![]
                }
            }
            NodeKind::Root
            | NodeKind::CallHttp
            | NodeKind::CallGrpc
            | NodeKind::CallOpenApi
            | NodeKind::CallFunction
            | NodeKind::Emit
            | NodeKind::Raise
            | NodeKind::Run
            | NodeKind::Set
            | NodeKind::Switch
            | NodeKind::Wait => vec![],
        };

        self.tree.insert(Node {
            position,
            kind,
            raw_task: body.clone(),
            name,
            parent: Some(parent),
            children,
        });
        Ok(())
    }
}

/// Parse a whole workflow document (already converted to [`serde_json::Value`],
/// regardless of whether the source was YAML or JSON) into a [`NodeTree`].
pub fn parse_document(doc: &Value) -> Result<NodeTree, WorkflowError> {
    let root_pos = Position::root();
    let obj = doc
        .as_object()
        .ok_or_else(|| config_err(&root_pos, "document must be an object"))?;
    let items = as_array(&root_pos, obj, "do")?;

    let mut builder = Builder {
        tree: NodeTree {
            nodes: Default::default(),
            root: root_pos.clone(),
        },
    };

    let do_pos = root_pos.child_token("do");
    let do_children = builder.build_named_array(&do_pos, &do_pos, items)?;
    builder.tree.insert(Node {
        position: do_pos.clone(),
        kind: NodeKind::Do,
        raw_task: doc.clone(),
        name: None,
        parent: Some(root_pos.clone()),
        children: do_children,
    });
    builder.tree.insert(Node {
        position: root_pos.clone(),
        kind: NodeKind::Root,
        raw_task: doc.clone(),
        name: None,
        parent: None,
        children: vec![do_pos],
    });

    Ok(builder.tree)
}

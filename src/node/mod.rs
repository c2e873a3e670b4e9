//! Immutable static view of a parsed workflow: typed nodes addressed by
//! [`Position`], with deterministic parent/child derivation.
//!
//! The tree is a flat arena keyed by the string form of each node's
//! position rather than a pointer graph: children reference their parent
//! only through a [`Position`] value, so there is no ownership cycle to
//! reason about and nothing to follow during destruction.

mod build;

use std::collections::HashMap;

use serde_json::Value;

use crate::error::{ErrorKind, WorkflowError};
use crate::position::Position;

pub use build::parse_document;

/// The kind of task a [`Node`] represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Root,
    Do,
    For,
    Try,
    Fork,
    Listen,
    CallHttp,
    CallAsync,
    CallGrpc,
    CallOpenApi,
    CallFunction,
    Emit,
    Raise,
    Run,
    Set,
    Switch,
    Wait,
}

impl NodeKind {
    /// True iff this node kind performs an external side effect or
    /// suspends the instance (i.e. it is not a pure control-flow node).
    pub fn is_activity(self) -> bool {
        matches!(
            self,
            NodeKind::CallHttp
                | NodeKind::CallAsync
                | NodeKind::CallGrpc
                | NodeKind::CallOpenApi
                | NodeKind::CallFunction
                | NodeKind::Emit
                | NodeKind::Listen
                | NodeKind::Run
                | NodeKind::Wait
        )
    }
}

/// A single, immutable node in the static workflow tree.
#[derive(Debug, Clone)]
pub struct Node {
    pub position: Position,
    pub kind: NodeKind,
    pub raw_task: Value,
    pub name: Option<String>,
    pub parent: Option<Position>,
    pub children: Vec<Position>,
}

/// The process-wide, read-only, memoized tree for one `(name, version)`.
#[derive(Debug, Clone)]
pub struct NodeTree {
    nodes: HashMap<String, Node>,
    root: Position,
}

impl NodeTree {
    pub fn root(&self) -> &Node {
        self.get(&self.root).expect("root always present")
    }

    pub fn get(&self, position: &Position) -> Option<&Node> {
        self.nodes.get(&position.to_string())
    }

    pub fn child_named<'a>(&'a self, node: &Node, name: &str) -> Option<&'a Node> {
        node.children
            .iter()
            .filter_map(|p| self.get(p))
            .find(|child| child.name.as_deref() == Some(name))
    }

    pub fn children(&self, node: &Node) -> Vec<&Node> {
        node.children.iter().filter_map(|p| self.get(p)).collect()
    }

    fn insert(&mut self, node: Node) {
        self.nodes.insert(node.position.to_string(), node);
    }

    /// Resolve the sibling (or ancestor-sibling for `EXIT`-style bubbling)
    /// named `target` by walking up from `from`'s parent. Used by `.then`
    /// string targets.
    pub fn resolve_then_target(
        &self,
        from: &Position,
        target: &str,
    ) -> Result<Position, WorkflowError> {
        let parent_pos = from
            .parent()
            .ok_or_else(|| not_found(from, target))?;
        let parent = self.get(&parent_pos).ok_or_else(|| not_found(from, target))?;
        self.child_named(parent, target)
            .map(|n| n.position.clone())
            .ok_or_else(|| not_found(from, target))
    }
}

fn not_found(from: &Position, target: &str) -> WorkflowError {
    WorkflowError::new(
        ErrorKind::Configuration,
        format!("`.then` target '{target}' could not be resolved"),
        from.clone(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(yaml: &str) -> Value {
        let v: serde_yaml::Value = serde_yaml::from_str(yaml).unwrap();
        serde_json::to_value(v).unwrap()
    }

    #[test]
    fn builds_do_chain_with_positions() {
        let tree = parse_document(&doc(
            r#"
            do:
              - first:
                  set: { value: "1" }
              - second:
                  set: { value: "2" }
            "#,
        ))
        .unwrap();

        let root = tree.root();
        assert_eq!(root.kind, NodeKind::Root);
        assert_eq!(root.children.len(), 1);

        let top_do = tree.get(&root.children[0]).unwrap();
        assert_eq!(top_do.kind, NodeKind::Do);
        assert_eq!(top_do.position.to_string(), "/do");
        assert_eq!(top_do.children.len(), 2);

        let first = tree.get(&top_do.children[0]).unwrap();
        assert_eq!(first.name.as_deref(), Some("first"));
        assert_eq!(first.kind, NodeKind::Set);
        assert_eq!(first.position.to_string(), "/do/0");
    }

    #[test]
    fn try_has_try_do_and_catch_do_children() {
        let tree = parse_document(&doc(
            r#"
            do:
              - guarded:
                  try:
                    do:
                      - inner:
                          set: { value: "1" }
                    catch:
                      do:
                        - handler:
                            set: { value: "err" }
            "#,
        ))
        .unwrap();

        let root = tree.root();
        let top_do = tree.get(&root.children[0]).unwrap();
        let try_node = tree.get(&top_do.children[0]).unwrap();
        assert_eq!(try_node.kind, NodeKind::Try);
        assert_eq!(try_node.children.len(), 2);
        assert_eq!(try_node.children[0].to_string(), "/do/0/try/do");
        assert_eq!(try_node.children[1].to_string(), "/do/0/try/catch/do");
    }

    #[test]
    fn unrecognized_kind_fails_configuration() {
        let err = parse_document(&doc(
            r#"
            do:
              - weird:
                  nonsense: true
            "#,
        ))
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Configuration);
    }
}

//! Accessors into a [`Node`]'s raw task body: `input.from`/`schema`,
//! `output.as`/`schema`, `export.as`/`schema`, `if`, `then`, `timeout`.

use serde_json::Value;

use crate::node::Node;
use crate::position::Position;

/// The flow directive a completed node hands its parent, via `then`.
#[derive(Debug, Clone, PartialEq)]
pub enum Flow {
    Continue,
    Exit,
    End,
    Named(String),
}

impl Flow {
    pub fn parse(value: Option<&Value>) -> Flow {
        match value.and_then(Value::as_str) {
            None => Flow::Continue,
            Some(s) if s.eq_ignore_ascii_case("continue") => Flow::Continue,
            Some(s) if s.eq_ignore_ascii_case("exit") => Flow::Exit,
            Some(s) if s.eq_ignore_ascii_case("end") => Flow::End,
            Some(s) => Flow::Named(s.to_string()),
        }
    }
}

fn obj(node: &Node) -> Option<&serde_json::Map<String, Value>> {
    node.raw_task.as_object()
}

pub fn then_flow(node: &Node) -> Flow {
    Flow::parse(obj(node).and_then(|o| o.get("then")))
}

pub fn if_expr(node: &Node) -> Option<&Value> {
    obj(node).and_then(|o| o.get("if"))
}

pub fn input_from(node: &Node) -> Option<&Value> {
    obj(node)
        .and_then(|o| o.get("input"))
        .and_then(Value::as_object)
        .and_then(|i| i.get("from"))
}

pub fn input_schema(node: &Node) -> Option<&Value> {
    obj(node)
        .and_then(|o| o.get("input"))
        .and_then(Value::as_object)
        .and_then(|i| i.get("schema"))
}

pub fn output_as(node: &Node) -> Option<&Value> {
    obj(node)
        .and_then(|o| o.get("output"))
        .and_then(Value::as_object)
        .and_then(|i| i.get("as"))
}

pub fn output_schema(node: &Node) -> Option<&Value> {
    obj(node)
        .and_then(|o| o.get("output"))
        .and_then(Value::as_object)
        .and_then(|i| i.get("schema"))
}

pub fn export_as(node: &Node) -> Option<&Value> {
    obj(node)
        .and_then(|o| o.get("export"))
        .and_then(Value::as_object)
        .and_then(|i| i.get("as"))
}

pub fn export_schema(node: &Node) -> Option<&Value> {
    obj(node)
        .and_then(|o| o.get("export"))
        .and_then(Value::as_object)
        .and_then(|i| i.get("schema"))
}

pub fn name_snapshot(node: &Node) -> Option<&str> {
    node.name.as_deref()
}

pub fn reference(position: &Position) -> String {
    position.to_string()
}

fn for_obj(node: &Node) -> Option<&serde_json::Map<String, Value>> {
    obj(node).and_then(|o| o.get("for")).and_then(Value::as_object)
}

pub fn for_in_expr(node: &Node) -> Value {
    for_obj(node)
        .and_then(|f| f.get("in"))
        .cloned()
        .unwrap_or(Value::String(".".into()))
}

pub fn for_each_name(node: &Node) -> String {
    for_obj(node)
        .and_then(|f| f.get("each"))
        .and_then(Value::as_str)
        .unwrap_or("item")
        .to_string()
}

pub fn for_at_name(node: &Node) -> Option<String> {
    for_obj(node)
        .and_then(|f| f.get("at"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

pub fn for_while_expr(node: &Node) -> Option<&Value> {
    for_obj(node).and_then(|f| f.get("while"))
}

pub fn set_template(node: &Node) -> Option<&Value> {
    obj(node).and_then(|o| o.get("set"))
}

pub fn raise_error_def(node: &Node) -> Option<&Value> {
    obj(node).and_then(|o| o.get("raise")).and_then(Value::as_object).and_then(|r| r.get("error"))
}

pub fn switch_cases(node: &Node) -> Option<&Vec<Value>> {
    obj(node).and_then(|o| o.get("switch")).and_then(Value::as_array)
}

pub fn wait_duration(node: &Node) -> Option<&Value> {
    obj(node).and_then(|o| o.get("wait"))
}

pub fn try_retry_config(node: &Node) -> Option<&Value> {
    obj(node)
        .and_then(|o| o.get("try"))
        .and_then(Value::as_object)
        .and_then(|t| t.get("retry"))
}

/// The `with` argument object of a `call`/`run` task, before template
/// evaluation.
pub fn with_params(node: &Node) -> Value {
    obj(node).and_then(|o| o.get("with")).cloned().unwrap_or(Value::Null)
}

/// The `run` task's target (`run.script`/`run.shell`/`run.container`).
pub fn run_target(node: &Node) -> Option<&Value> {
    obj(node).and_then(|o| o.get("run"))
}

pub fn emit_event(node: &Node) -> Option<&Value> {
    obj(node)
        .and_then(|o| o.get("emit"))
        .and_then(Value::as_object)
        .and_then(|e| e.get("event"))
}

//! The synchronous control-flow driver: walks a [`NodeTree`] against a
//! [`Message`]'s mutable state one node at a time, stopping at the next
//! activity boundary (an I/O-performing task, a `wait`, or instance
//! completion/failure) rather than performing I/O itself.
//!
//! Actual side effects (HTTP calls, script execution, event emission) are
//! the consumer's job: it reads a [`StepOutcome::Suspend`], dispatches the
//! call, and feeds the result back through [`resume`].

pub mod scope;
pub mod task;

use std::time::Duration;

use chrono::Utc;
use serde_json::{Map, Value};

use crate::error::{DriverError, ErrorKind, WorkflowError};
use crate::expr::{self, ProgramCache};
use crate::message::Message;
use crate::node::{Node, NodeKind, NodeTree};
use crate::position::Position;
use crate::retry::TryRetryPolicy;
use crate::schema;
use crate::state::NodeState;
use crate::workflow_ctx::WorkflowContext;

use self::task::Flow;

/// What the consumer needs to do next to keep an instance moving.
#[derive(Debug, Clone)]
pub enum StepOutcome {
    /// `position` is an activity-kind node with its input already
    /// transformed; dispatch it and report the result through [`resume`].
    Suspend { position: Position, input: Value },
    /// `position` is a `wait` task; the consumer schedules a wake-up after
    /// `duration` (typically by inserting a row into the `waits` outbox)
    /// and resumes with `Ok(input)` once it fires.
    Wait {
        position: Position,
        input: Value,
        duration: Duration,
    },
    /// `position`'s enclosing `try` wants another attempt after `delay`;
    /// the consumer schedules it (typically via the `retries` outbox) and
    /// resumes the *raising* node with its original input once it fires.
    Retry { position: Position, delay: Duration },
    /// The whole instance finished; `output` is the root `do`'s result.
    Completed { output: Value },
    /// An error escaped every enclosing `try` and ended the instance.
    Faulted(WorkflowError),
}

/// Begin a new instance: seed the root's input and drive to the first
/// boundary.
pub fn start(
    tree: &NodeTree,
    ctx: &WorkflowContext,
    cache: &ProgramCache,
    input: Value,
) -> Result<(Message, StepOutcome), DriverError> {
    let name = ctx
        .workflow
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let version = ctx
        .workflow
        .get("version")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let mut message = Message::new(name, version);

    let root = tree.root();
    let do_node = tree
        .get(&root.children[0])
        .expect("parse_document always inserts a top-level `do` node");

    let mut root_state = NodeState::new();
    root_state.raw_input = Some(input.clone());
    root_state.started_at = Some(ctx.now);
    message.set_state_at(&Position::root(), root_state);

    let outcome = enter_node(tree, &mut message, ctx, cache, do_node, input, Map::new())?;
    park_at(&mut message, &outcome);
    Ok((message, outcome))
}

/// Feed the result of an activity, wait, or retry back into the instance
/// at its current position, then drive to the next boundary.
pub fn resume(
    tree: &NodeTree,
    message: &mut Message,
    ctx: &WorkflowContext,
    cache: &ProgramCache,
    result: Result<Value, WorkflowError>,
) -> Result<StepOutcome, DriverError> {
    let position = message.position.clone();
    let node = tree
        .get(&position)
        .ok_or_else(|| DriverError::UnknownKind(position.clone()))?;
    let outcome = match result {
        Ok(output) => complete(tree, message, ctx, cache, node, output),
        Err(err) => raise(tree, message, ctx, cache, &position, err),
    }?;
    park_at(message, &outcome);
    Ok(outcome)
}

/// A `try`'s retry counter expired or no `retry`/`catch` matched this
/// attempt; resume the `try` node itself for another pass, seeded with the
/// same input it originally received.
pub fn resume_retry(
    tree: &NodeTree,
    message: &mut Message,
    ctx: &WorkflowContext,
    cache: &ProgramCache,
    try_position: &Position,
) -> Result<StepOutcome, DriverError> {
    let try_node = tree
        .get(try_position)
        .ok_or_else(|| DriverError::UnknownKind(try_position.clone()))?;
    let input = message
        .state_at(try_position)
        .raw_input
        .clone()
        .unwrap_or(Value::Null);
    let try_do_pos = try_position.child_token("try").child_token("do");
    let outcome = match tree.get(&try_do_pos.child_index(0)) {
        Some(first) => enter_node(tree, message, ctx, cache, first, input, Map::new()),
        None => complete(tree, message, ctx, cache, try_node, input),
    }?;
    park_at(message, &outcome);
    Ok(outcome)
}

/// Record where the instance is now parked so the envelope that gets
/// wired onto the bus/outbox always carries its current position: the
/// node an activity/wait/retry is suspended at, or the root once the
/// instance has reached a terminal outcome.
fn park_at(message: &mut Message, outcome: &StepOutcome) {
    match outcome {
        StepOutcome::Suspend { position, .. }
        | StepOutcome::Wait { position, .. }
        | StepOutcome::Retry { position, .. } => {
            message.position = position.clone();
        }
        StepOutcome::Completed { .. } | StepOutcome::Faulted(_) => {
            message.position = Position::root();
        }
    }
}

fn to_workflow_err(position: &Position, err: expr::EvalError) -> WorkflowError {
    WorkflowError::new(ErrorKind::Expression, err.to_string(), position.clone())
}

/// First visit to `node`: records its input, evaluates `if`/`input.from`,
/// and dispatches by kind. Re-entrant for `for` iterations and `catch`
/// handling, which call this with fresh locals at the same position.
fn enter_node(
    tree: &NodeTree,
    message: &mut Message,
    ctx: &WorkflowContext,
    cache: &ProgramCache,
    node: &Node,
    incoming: Value,
    locals: Map<String, Value>,
) -> Result<StepOutcome, DriverError> {
    let mut state = NodeState::new();
    state.raw_input = Some(incoming.clone());
    state.started_at = Some(ctx.now);
    state.variables = locals;
    message.set_state_at(&node.position, state);

    let scope = scope::build(tree, message, &node.position, ctx);

    if let Some(if_expr) = task::if_expr(node) {
        match expr::eval_boolean(cache, if_expr, &incoming, &scope) {
            Ok(false) => return complete(tree, message, ctx, cache, node, incoming),
            Ok(true) => {}
            Err(e) => return raise(tree, message, ctx, cache, &node.position, to_workflow_err(&node.position, e)),
        }
    }

    let input = match task::input_from(node) {
        Some(expr) => match expr::eval_template(cache, expr, &incoming, &scope) {
            Ok(v) => v,
            Err(e) => return raise(tree, message, ctx, cache, &node.position, to_workflow_err(&node.position, e)),
        },
        None => incoming,
    };

    if let Some(sch) = task::input_schema(node) {
        if let Err(e) = schema::validate(sch, &input, &node.position) {
            return raise(tree, message, ctx, cache, &node.position, e);
        }
    }

    let mut state = message.state_at(&node.position);
    state.raw_input = Some(input.clone());
    message.set_state_at(&node.position, state);

    dispatch(tree, message, ctx, cache, node, input)
}

fn dispatch(
    tree: &NodeTree,
    message: &mut Message,
    ctx: &WorkflowContext,
    cache: &ProgramCache,
    node: &Node,
    input: Value,
) -> Result<StepOutcome, DriverError> {
    match node.kind {
        NodeKind::Root => unreachable!("the driver never enters the root node directly"),

        NodeKind::Do => match node.children.first() {
            Some(first_pos) => {
                let first = tree.get(first_pos).expect("do children are always inserted");
                enter_node(tree, message, ctx, cache, first, input, Map::new())
            }
            None => complete(tree, message, ctx, cache, node, input),
        },

        NodeKind::For => {
            let scope = scope::build(tree, message, &node.position, ctx);
            let items = match expr::eval_list(cache, &task::for_in_expr(node), &input, &scope) {
                Ok(v) => v,
                Err(e) => return raise(tree, message, ctx, cache, &node.position, to_workflow_err(&node.position, e)),
            };
            if items.is_empty() {
                return complete(tree, message, ctx, cache, node, input);
            }
            let do_pos = node.position.child_token("do");
            let first_item = match tree.get(&do_pos.child_index(0)) {
                Some(n) => n,
                None => return complete(tree, message, ctx, cache, node, input),
            };
            let mut state = message.state_at(&node.position);
            state.for_index = 0;
            message.set_state_at(&node.position, state);

            let mut locals = Map::new();
            locals.insert(task::for_each_name(node), items[0].clone());
            if let Some(at) = task::for_at_name(node) {
                locals.insert(at, Value::from(0i64));
            }
            enter_node(tree, message, ctx, cache, first_item, input, locals)
        }

        NodeKind::Switch => {
            let scope = scope::build(tree, message, &node.position, ctx);
            let cases = task::switch_cases(node).cloned().unwrap_or_default();
            let mut matched_flow = Flow::Continue;
            for case in &cases {
                let Some((_, body)) = case.as_object().and_then(|o| o.iter().next()) else {
                    continue;
                };
                let when = body.as_object().and_then(|o| o.get("when"));
                let matches = match when {
                    None => true,
                    Some(expr) => match expr::eval_boolean(cache, expr, &input, &scope) {
                        Ok(v) => v,
                        Err(e) => {
                            return raise(tree, message, ctx, cache, &node.position, to_workflow_err(&node.position, e))
                        }
                    },
                };
                if matches {
                    matched_flow = Flow::parse(body.as_object().and_then(|o| o.get("then")));
                    break;
                }
            }
            advance_parent(tree, message, ctx, cache, node, matched_flow, input)
        }

        NodeKind::Set => {
            let scope = scope::build(tree, message, &node.position, ctx);
            let template = task::set_template(node).cloned().unwrap_or(Value::Object(Map::new()));
            match expr::eval_template(cache, &template, &input, &scope) {
                Ok(value) => complete(tree, message, ctx, cache, node, value),
                Err(e) => raise(tree, message, ctx, cache, &node.position, to_workflow_err(&node.position, e)),
            }
        }

        NodeKind::Raise => {
            let scope = scope::build(tree, message, &node.position, ctx);
            let err = match build_raised_error(cache, node, &input, &scope) {
                Ok(e) => e,
                Err(e) => return raise(tree, message, ctx, cache, &node.position, to_workflow_err(&node.position, e)),
            };
            raise(tree, message, ctx, cache, &node.position, err)
        }

        NodeKind::Try => {
            let try_do_pos = node.position.child_token("try").child_token("do");
            match tree.get(&try_do_pos.child_index(0)) {
                Some(first) => enter_node(tree, message, ctx, cache, first, input, Map::new()),
                None => complete(tree, message, ctx, cache, node, input),
            }
        }

        NodeKind::Fork => {
            let branches_pos = node.position.child_token("fork").child_token("branches");
            match tree.get(&branches_pos.child_index(0)) {
                Some(first) => {
                    let mut state = message.state_at(&node.position);
                    state.child_index = 0;
                    state.variables.insert("results".into(), Value::Array(vec![]));
                    message.set_state_at(&node.position, state);
                    enter_node(tree, message, ctx, cache, first, input, Map::new())
                }
                None => complete(tree, message, ctx, cache, node, Value::Array(vec![])),
            }
        }

        NodeKind::Wait => {
            let scope = scope::build(tree, message, &node.position, ctx);
            let duration_value = task::wait_duration(node).cloned().unwrap_or(Value::Null);
            match parse_duration(cache, &duration_value, &input, &scope) {
                Ok(duration) => Ok(StepOutcome::Wait {
                    position: node.position.clone(),
                    input,
                    duration,
                }),
                Err(e) => raise(tree, message, ctx, cache, &node.position, to_workflow_err(&node.position, e)),
            }
        }

        _ => Ok(StepOutcome::Suspend {
            position: node.position.clone(),
            input,
        }),
    }
}

/// Apply `output.as`/`schema` and `export.as`/`schema`, record the node's
/// final output, and bubble the result to its parent per `.then`.
fn complete(
    tree: &NodeTree,
    message: &mut Message,
    ctx: &WorkflowContext,
    cache: &ProgramCache,
    node: &Node,
    raw_output: Value,
) -> Result<StepOutcome, DriverError> {
    let scope = scope::build(tree, message, &node.position, ctx);

    let transformed = match task::output_as(node) {
        Some(expr) => match expr::eval_template(cache, expr, &raw_output, &scope) {
            Ok(v) => v,
            Err(e) => return raise(tree, message, ctx, cache, &node.position, to_workflow_err(&node.position, e)),
        },
        None => raw_output,
    };
    if let Some(sch) = task::output_schema(node) {
        if let Err(e) = schema::validate(sch, &transformed, &node.position) {
            return raise(tree, message, ctx, cache, &node.position, e);
        }
    }

    if let Some(expr) = task::export_as(node) {
        let exported = match expr::eval_object(cache, expr, &transformed, &scope) {
            Ok(v) => v,
            Err(e) => return raise(tree, message, ctx, cache, &node.position, to_workflow_err(&node.position, e)),
        };
        if let Some(sch) = task::export_schema(node) {
            if let Err(e) = schema::validate(sch, &Value::Object(exported.clone()), &node.position) {
                return raise(tree, message, ctx, cache, &node.position, e);
            }
        }
        ctx.replace_context(message, exported);
    }

    let mut state = message.state_at(&node.position);
    state.raw_output = Some(transformed.clone());
    message.set_state_at(&node.position, state);

    let flow = task::then_flow(node);
    advance_parent(tree, message, ctx, cache, node, flow, transformed)
}

/// Bubble a just-completed node's `output` up to its structural parent,
/// per `flow`.
fn advance_parent(
    tree: &NodeTree,
    message: &mut Message,
    ctx: &WorkflowContext,
    cache: &ProgramCache,
    node: &Node,
    flow: Flow,
    output: Value,
) -> Result<StepOutcome, DriverError> {
    if matches!(flow, Flow::End) {
        return Ok(StepOutcome::Completed { output });
    }
    if let Flow::Named(target) = &flow {
        let target_pos = tree.resolve_then_target(&node.position, target)?;
        let target_node = tree.get(&target_pos).ok_or_else(|| DriverError::UnknownKind(target_pos.clone()))?;
        return enter_node(tree, message, ctx, cache, target_node, output, Map::new());
    }

    let Some(parent_pos) = node.parent.clone() else {
        return Ok(StepOutcome::Completed { output });
    };
    let parent = tree
        .get(&parent_pos)
        .ok_or_else(|| DriverError::UnknownKind(parent_pos.clone()))?;

    match parent.kind {
        NodeKind::Root => Ok(StepOutcome::Completed { output }),
        NodeKind::Do => do_continue(tree, message, ctx, cache, parent, flow, output),
        NodeKind::For => for_continue(tree, message, ctx, cache, parent, flow, output),
        NodeKind::Try => try_continue(tree, message, ctx, cache, parent, &node.position, flow, output),
        NodeKind::Fork => fork_continue(tree, message, ctx, cache, parent, flow, output),
        _ => complete(tree, message, ctx, cache, parent, output),
    }
}

fn do_continue(
    tree: &NodeTree,
    message: &mut Message,
    ctx: &WorkflowContext,
    cache: &ProgramCache,
    do_node: &Node,
    flow: Flow,
    output: Value,
) -> Result<StepOutcome, DriverError> {
    if matches!(flow, Flow::Exit) {
        return complete(tree, message, ctx, cache, do_node, output);
    }
    let mut state = message.state_at(&do_node.position);
    let next_index = state.child_index + 1;
    if next_index < 0 || next_index as usize >= do_node.children.len() {
        return complete(tree, message, ctx, cache, do_node, output);
    }
    state.child_index = next_index;
    message.set_state_at(&do_node.position, state);
    let next_child = tree
        .get(&do_node.children[next_index as usize])
        .expect("do children are always inserted nodes");
    enter_node(tree, message, ctx, cache, next_child, output, Map::new())
}

fn for_continue(
    tree: &NodeTree,
    message: &mut Message,
    ctx: &WorkflowContext,
    cache: &ProgramCache,
    for_node: &Node,
    flow: Flow,
    output: Value,
) -> Result<StepOutcome, DriverError> {
    if matches!(flow, Flow::Exit) {
        return complete(tree, message, ctx, cache, for_node, output);
    }

    if let Some(while_expr) = task::for_while_expr(for_node) {
        let scope = scope::build(tree, message, &for_node.position, ctx);
        match expr::eval_boolean(cache, while_expr, &output, &scope) {
            Ok(false) => return complete(tree, message, ctx, cache, for_node, output),
            Ok(true) => {}
            Err(e) => return raise(tree, message, ctx, cache, &for_node.position, to_workflow_err(&for_node.position, e)),
        }
    }

    let scope = scope::build(tree, message, &for_node.position, ctx);
    let for_input = message.state_at(&for_node.position).raw_input.clone().unwrap_or(Value::Null);
    let items = match expr::eval_list(cache, &task::for_in_expr(for_node), &for_input, &scope) {
        Ok(v) => v,
        Err(e) => return raise(tree, message, ctx, cache, &for_node.position, to_workflow_err(&for_node.position, e)),
    };

    let mut state = message.state_at(&for_node.position);
    let next_index = state.for_index + 1;
    if next_index < 0 || next_index as usize >= items.len() {
        return complete(tree, message, ctx, cache, for_node, output);
    }
    state.for_index = next_index;
    message.set_state_at(&for_node.position, state);

    let mut locals = Map::new();
    locals.insert(task::for_each_name(for_node), items[next_index as usize].clone());
    if let Some(at) = task::for_at_name(for_node) {
        locals.insert(at, Value::from(next_index));
    }

    let do_pos = for_node.position.child_token("do");
    let first_item = tree
        .get(&do_pos.child_index(0))
        .ok_or_else(|| DriverError::UnknownKind(do_pos.clone()))?;
    enter_node(tree, message, ctx, cache, first_item, output, locals)
}

fn try_continue(
    tree: &NodeTree,
    message: &mut Message,
    ctx: &WorkflowContext,
    cache: &ProgramCache,
    try_node: &Node,
    completed_position: &Position,
    flow: Flow,
    output: Value,
) -> Result<StepOutcome, DriverError> {
    if matches!(flow, Flow::Exit) {
        return complete(tree, message, ctx, cache, try_node, output);
    }

    let try_do_pos = try_node.position.child_token("try").child_token("do");
    let list_pos = if is_descendant_of(completed_position, &try_do_pos) {
        try_do_pos
    } else {
        try_node.position.child_token("try").child_token("catch").child_token("do")
    };

    let mut state = message.state_at(&try_node.position);
    let next_index = state.child_index + 1;
    let next_item = tree.get(&list_pos.child_index(next_index as usize));
    match next_item {
        Some(item) => {
            state.child_index = next_index;
            message.set_state_at(&try_node.position, state);
            enter_node(tree, message, ctx, cache, item, output, Map::new())
        }
        None => complete(tree, message, ctx, cache, try_node, output),
    }
}

fn fork_continue(
    tree: &NodeTree,
    message: &mut Message,
    ctx: &WorkflowContext,
    cache: &ProgramCache,
    fork_node: &Node,
    flow: Flow,
    output: Value,
) -> Result<StepOutcome, DriverError> {
    let mut state = message.state_at(&fork_node.position);
    let mut results = state
        .variables
        .get("results")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    results.push(output);
    state.variables.insert("results".into(), Value::Array(results.clone()));

    let branches_pos = fork_node.position.child_token("fork").child_token("branches");
    let next_index = state.child_index + 1;
    if matches!(flow, Flow::Exit) || tree.get(&branches_pos.child_index(next_index as usize)).is_none() {
        message.set_state_at(&fork_node.position, state);
        return complete(tree, message, ctx, cache, fork_node, Value::Array(results));
    }

    let original_input = state.raw_input.clone().unwrap_or(Value::Null);
    state.child_index = next_index;
    message.set_state_at(&fork_node.position, state);
    let next_branch = tree
        .get(&branches_pos.child_index(next_index as usize))
        .expect("just checked it exists");
    enter_node(tree, message, ctx, cache, next_branch, original_input, Map::new())
}

/// Walk ancestors outward from `position` looking for the nearest `try`
/// whose `try.do` subtree (not its `catch.do`) contains the raising node,
/// consuming the error there if its `retry`/`catch` configuration matches.
fn raise(
    tree: &NodeTree,
    message: &mut Message,
    ctx: &WorkflowContext,
    cache: &ProgramCache,
    position: &Position,
    err: WorkflowError,
) -> Result<StepOutcome, DriverError> {
    let mut current = position.clone();
    loop {
        let Some(parent_pos) = current.parent() else {
            return Ok(StepOutcome::Faulted(err));
        };
        let parent = tree
            .get(&parent_pos)
            .ok_or_else(|| DriverError::UnknownKind(parent_pos.clone()))?;

        if parent.kind == NodeKind::Try {
            let try_do_pos = parent.position.child_token("try").child_token("do");
            if is_descendant_of(position, &try_do_pos) {
                if let Some(outcome) = try_handle(tree, message, ctx, cache, parent, &err)? {
                    return Ok(outcome);
                }
            }
        }
        current = parent_pos;
    }
}

/// Returns `Some(outcome)` if this `try` consumed the error (either by
/// scheduling a retry or entering its `catch.do`); `None` means the error
/// should keep propagating to an outer `try`.
fn try_handle(
    tree: &NodeTree,
    message: &mut Message,
    ctx: &WorkflowContext,
    cache: &ProgramCache,
    try_node: &Node,
    err: &WorkflowError,
) -> Result<Option<StepOutcome>, DriverError> {
    let error_value = serde_json::to_value(err).unwrap_or(Value::Null);

    if let Some(retry_cfg) = task::try_retry_config(try_node) {
        if let Ok(policy) = serde_json::from_value::<TryRetryPolicy>(retry_cfg.clone()) {
            let scope = scope::build(tree, message, &try_node.position, ctx);
            let matches = retry_predicate_matches(cache, &policy, &error_value, &scope);
            let state = message.state_at(&try_node.position);
            let elapsed = state
                .started_at
                .map(|t| (ctx.now - t).to_std().unwrap_or(Duration::ZERO))
                .unwrap_or(Duration::ZERO);
            if matches && policy.within_budget(state.attempt_index, elapsed) {
                let mut state = state;
                let delay = policy.delay_for_attempt(state.attempt_index);
                state.attempt_index += 1;
                message.set_state_at(&try_node.position, state);
                return Ok(Some(StepOutcome::Retry {
                    position: try_node.position.clone(),
                    delay,
                }));
            }
        }
    }

    if try_node
        .raw_task
        .as_object()
        .and_then(|o| o.get("try"))
        .and_then(Value::as_object)
        .map(|t| t.contains_key("catch"))
        .unwrap_or(false)
    {
        let mut state = message.state_at(&try_node.position);
        state.reset();
        message.set_state_at(&try_node.position, state);

        let catch_do_pos = try_node.position.child_token("try").child_token("catch").child_token("do");
        let mut locals = Map::new();
        locals.insert("error".into(), error_value.clone());
        return Ok(Some(match tree.get(&catch_do_pos.child_index(0)) {
            Some(first) => enter_node(tree, message, ctx, cache, first, error_value, locals)?,
            None => complete(tree, message, ctx, cache, try_node, error_value)?,
        }));
    }

    Ok(None)
}

fn retry_predicate_matches(cache: &ProgramCache, policy: &TryRetryPolicy, error_value: &Value, scope: &crate::scope::Scope) -> bool {
    if let Some(when) = &policy.when {
        let truthy = expr::eval_boolean(cache, &Value::String(when.clone()), error_value, scope).unwrap_or(false);
        if !truthy {
            return false;
        }
    }
    if let Some(except_when) = &policy.except_when {
        let truthy = expr::eval_boolean(cache, &Value::String(except_when.clone()), error_value, scope).unwrap_or(false);
        if truthy {
            return false;
        }
    }
    true
}

fn is_descendant_of(position: &Position, ancestor: &Position) -> bool {
    let pos_segs = position.segments();
    let anc_segs = ancestor.segments();
    pos_segs.len() >= anc_segs.len() && pos_segs[..anc_segs.len()] == anc_segs[..]
}

fn build_raised_error(cache: &ProgramCache, node: &Node, input: &Value, scope: &crate::scope::Scope) -> Result<WorkflowError, expr::EvalError> {
    let def = task::raise_error_def(node).cloned().unwrap_or(Value::Null);
    let obj = def.as_object();

    let kind = obj
        .and_then(|o| o.get("type"))
        .and_then(Value::as_str)
        .and_then(parse_error_kind)
        .unwrap_or(ErrorKind::Runtime);

    let title = match obj.and_then(|o| o.get("title")) {
        Some(t) => expr::eval_string(cache, t, input, scope)?,
        None => "workflow raised an error".to_string(),
    };

    let mut error = WorkflowError::new(kind, title, node.position.clone());
    if let Some(status) = obj.and_then(|o| o.get("status")).and_then(Value::as_u64) {
        error = error.with_status(status as u16);
    }
    if let Some(detail) = obj.and_then(|o| o.get("detail")) {
        error = error.with_details(expr::eval_template(cache, detail, input, scope)?);
    }
    Ok(error)
}

fn parse_error_kind(s: &str) -> Option<ErrorKind> {
    let tail = s.rsplit('/').next().unwrap_or(s);
    Some(match tail.to_ascii_lowercase().as_str() {
        "configuration" => ErrorKind::Configuration,
        "validation" => ErrorKind::Validation,
        "expression" => ErrorKind::Expression,
        "authentication" => ErrorKind::Authentication,
        "authorization" => ErrorKind::Authorization,
        "timeout" => ErrorKind::Timeout,
        "communication" => ErrorKind::Communication,
        "runtime" => ErrorKind::Runtime,
        _ => return None,
    })
}

/// Parse a `wait` duration, either the ISO-8601 form (`"PT5S"`) or the
/// structured `{days, hours, minutes, seconds, milliseconds}` form. Either
/// form may itself be (or contain) a jq/`${...}` expression.
fn parse_duration(cache: &ProgramCache, value: &Value, input: &Value, scope: &crate::scope::Scope) -> Result<Duration, expr::EvalError> {
    let evaluated = expr::eval_template(cache, value, input, scope)?;
    match &evaluated {
        Value::String(s) => parse_iso8601_duration(s).ok_or_else(|| expr::EvalError::Eval(format!("invalid ISO-8601 duration: {s}"))),
        Value::Object(o) => {
            let get = |k: &str| o.get(k).and_then(Value::as_f64).unwrap_or(0.0);
            let secs = get("days") * 86400.0 + get("hours") * 3600.0 + get("minutes") * 60.0 + get("seconds")
                + get("milliseconds") / 1000.0;
            Ok(Duration::from_secs_f64(secs.max(0.0)))
        }
        other => Err(expr::EvalError::TypeMismatch {
            expected: "ISO-8601 duration string or duration object",
            actual: format!("{other:?}"),
        }),
    }
}

fn parse_iso8601_duration(s: &str) -> Option<Duration> {
    let s = s.strip_prefix('P')?;
    let (date_part, time_part) = match s.split_once('T') {
        Some((d, t)) => (d, Some(t)),
        None => (s, None),
    };

    let mut seconds = 0.0;
    let mut num = String::new();
    for c in date_part.chars() {
        if c.is_ascii_digit() || c == '.' {
            num.push(c);
        } else if c == 'D' {
            seconds += num.parse::<f64>().ok()? * 86400.0;
            num.clear();
        } else {
            return None;
        }
    }

    if let Some(time_part) = time_part {
        num.clear();
        for c in time_part.chars() {
            if c.is_ascii_digit() || c == '.' {
                num.push(c);
            } else {
                let value: f64 = num.parse().ok()?;
                num.clear();
                match c {
                    'H' => seconds += value * 3600.0,
                    'M' => seconds += value * 60.0,
                    'S' => seconds += value,
                    _ => return None,
                }
            }
        }
    }

    Some(Duration::from_secs_f64(seconds.max(0.0)))
}

/// Wall-clock "now" used for `task.startedAt`/retry-budget accounting;
/// consumers construct [`WorkflowContext`] with this so tests can pin it.
pub fn now() -> chrono::DateTime<Utc> {
    Utc::now()
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

    fn context() -> WorkflowContext {
        WorkflowContext::new("w", "1", &json!({})).with_now(Utc::now())
    }

    #[test]
    fn set_chain_accumulates_through_do_sequence() {
        let tree = parse_document(&doc(
            r#"
            do:
              - first:
                  set: { value: "\"1\"" }
              - second:
                  set: { value: ".value + \"2\"" }
              - third:
                  set: { value: ".value + \"3\"" }
            "#,
        ))
        .unwrap();
        let cache = ProgramCache::default();
        let ctx = context();
        let (_message, outcome) = start(&tree, &ctx, &cache, Value::String(String::new())).unwrap();
        match outcome {
            StepOutcome::Completed { output } => {
                assert_eq!(output, json!({"value": "123"}));
            }
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[test]
    fn if_false_skips_task_and_passes_data_through() {
        let tree = parse_document(&doc(
            r#"
            do:
              - maybe:
                  if: "false"
                  set: { value: "skipped" }
              - after:
                  set: { seen: ".value" }
            "#,
        ))
        .unwrap();
        let cache = ProgramCache::default();
        let ctx = context();
        let (_message, outcome) = start(&tree, &ctx, &cache, json!({"value": "original"})).unwrap();
        match outcome {
            StepOutcome::Completed { output } => {
                assert_eq!(output, json!({"seen": "original"}));
            }
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[test]
    fn activity_suspends_with_transformed_input() {
        let tree = parse_document(&doc(
            r#"
            do:
              - fetch:
                  call: http
                  with:
                    method: GET
                    endpoint: "https://example.com"
            "#,
        ))
        .unwrap();
        let cache = ProgramCache::default();
        let ctx = context();
        let (_message, outcome) = start(&tree, &ctx, &cache, json!(null)).unwrap();
        assert!(matches!(outcome, StepOutcome::Suspend { .. }));
    }

    #[test]
    fn for_loop_binds_each_and_threads_output() {
        let tree = parse_document(&doc(
            r#"
            do:
              - loop:
                  for:
                    each: item
                    in: "[1, 2, 3]"
                  do:
                    - accumulate:
                        set: ". + $item"
            "#,
        ))
        .unwrap();
        let cache = ProgramCache::default();
        let ctx = context();
        let (_message, outcome) = start(&tree, &ctx, &cache, Value::from(0)).unwrap();
        match outcome {
            StepOutcome::Completed { output } => {
                assert_eq!(output, json!(6));
            }
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[test]
    fn raise_without_matching_try_faults_the_instance() {
        let tree = parse_document(&doc(
            r#"
            do:
              - boom:
                  raise:
                    error:
                      type: "https://serverlessworkflow.io/spec/1.0.0/errors/runtime"
                      status: 500
                      title: "kaboom"
            "#,
        ))
        .unwrap();
        let cache = ProgramCache::default();
        let ctx = context();
        let (_message, outcome) = start(&tree, &ctx, &cache, json!(null)).unwrap();
        assert!(matches!(outcome, StepOutcome::Faulted(_)));
    }

    #[test]
    fn try_catch_recovers_from_a_raised_error() {
        let tree = parse_document(&doc(
            r#"
            do:
              - guarded:
                  try:
                    do:
                      - boom:
                          raise:
                            error:
                              type: "https://serverlessworkflow.io/spec/1.0.0/errors/runtime"
                              status: 500
                              title: "kaboom"
                    catch:
                      do:
                        - handled:
                            set: { recovered: "true" }
            "#,
        ))
        .unwrap();
        let cache = ProgramCache::default();
        let ctx = context();
        let (_message, outcome) = start(&tree, &ctx, &cache, json!(null)).unwrap();
        match outcome {
            StepOutcome::Completed { output } => {
                assert_eq!(output, json!({"recovered": true}));
            }
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[test]
    fn try_retry_schedules_backoff_delays_then_succeeds_on_third_attempt() {
        let tree = parse_document(&doc(
            r#"
            do:
              - guarded:
                  try:
                    do:
                      - flaky:
                          call: http
                          with:
                            method: GET
                            endpoint: "https://example.com"
                    retry:
                      limit_attempt_count: 5
                      backoff:
                        initial: 1000
                        multiplier: 2.0
                        jitter: 0.0
            "#,
        ))
        .unwrap();
        let cache = ProgramCache::default();
        let ctx = context();
        let (mut message, outcome) = start(&tree, &ctx, &cache, json!(null)).unwrap();
        let position = match outcome {
            StepOutcome::Suspend { position, .. } => position,
            other => panic!("expected suspend, got {other:?}"),
        };
        let err = WorkflowError::new(ErrorKind::Communication, "boom", position);

        // First failure: the policy's initial backoff delay, ~1s.
        let outcome = resume(&tree, &mut message, &ctx, &cache, Err(err.clone())).unwrap();
        let delay = match outcome {
            StepOutcome::Retry { delay, .. } => delay,
            other => panic!("expected retry, got {other:?}"),
        };
        assert_eq!(delay, Duration::from_secs(1));

        let try_position = message.position.clone();
        let outcome = resume_retry(&tree, &mut message, &ctx, &cache, &try_position).unwrap();
        assert!(matches!(outcome, StepOutcome::Suspend { .. }));

        // Second failure: the delay doubles, ~2s.
        let outcome = resume(&tree, &mut message, &ctx, &cache, Err(err.clone())).unwrap();
        let delay = match outcome {
            StepOutcome::Retry { delay, .. } => delay,
            other => panic!("expected retry, got {other:?}"),
        };
        assert_eq!(delay, Duration::from_secs(2));

        let try_position = message.position.clone();
        let outcome = resume_retry(&tree, &mut message, &ctx, &cache, &try_position).unwrap();
        assert!(matches!(outcome, StepOutcome::Suspend { .. }));

        // Third attempt succeeds, ending the instance.
        let outcome = resume(&tree, &mut message, &ctx, &cache, Ok(json!({"ok": true}))).unwrap();
        match outcome {
            StepOutcome::Completed { output } => assert_eq!(output, json!({"ok": true})),
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[test]
    fn wait_task_suspends_with_parsed_duration() {
        let tree = parse_document(&doc(
            r#"
            do:
              - pause:
                  wait: "PT5S"
            "#,
        ))
        .unwrap();
        let cache = ProgramCache::default();
        let ctx = context();
        let (_message, outcome) = start(&tree, &ctx, &cache, json!(null)).unwrap();
        match outcome {
            StepOutcome::Wait { duration, .. } => assert_eq!(duration, Duration::from_secs(5)),
            other => panic!("expected wait, got {other:?}"),
        }
    }

    #[test]
    fn fork_runs_branches_serially_and_collects_results() {
        let tree = parse_document(&doc(
            r#"
            do:
              - split:
                  fork:
                    branches:
                      - left:
                          set: { value: "\"left\"" }
                      - right:
                          set: { value: "\"right\"" }
            "#,
        ))
        .unwrap();
        let cache = ProgramCache::default();
        let ctx = context();
        let (_message, outcome) = start(&tree, &ctx, &cache, json!(null)).unwrap();
        match outcome {
            StepOutcome::Completed { output } => {
                assert_eq!(output, json!([{"value": "left"}, {"value": "right"}]));
            }
            other => panic!("expected completion, got {other:?}"),
        }
    }
}

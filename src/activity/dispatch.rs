//! Dispatch of activity-kind tasks: the I/O the driver suspends for.
//!
//! The driver ([`crate::interp`]) never performs I/O itself; it stops at
//! [`crate::interp::StepOutcome::Suspend`] and hands the node and its
//! already-resolved `with` arguments to an [`ActivityDispatcher`]. The
//! split between "driver decides what to run" and "dispatcher actually
//! runs it" keeps a typed `Activity` registry out of the driver entirely,
//! in favor of dispatch keyed by [`NodeKind`].

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{instrument, warn};

use crate::error::{ErrorKind, WorkflowError};
use crate::node::{Node, NodeKind};
use crate::position::Position;

#[async_trait]
pub trait ActivityDispatcher: Send + Sync {
    /// Perform the I/O for `node`. `with` is the task's `with` block after
    /// expression evaluation; `input` is the task's transformed input.
    async fn dispatch(&self, node: &Node, with: Value, input: Value) -> Result<Value, WorkflowError>;
}

fn comm_err(position: &Position, msg: impl Into<String>) -> WorkflowError {
    WorkflowError::new(ErrorKind::Communication, msg, position.clone())
}

/// Dispatches `call: http` over a shared [`reqwest::Client`], `run.script`
/// / `run.shell` as a child process, and fails every other activity kind
/// with a `COMMUNICATION` error carrying the kind's name, since a real
/// gRPC/OpenAPI/AsyncAPI/event-bus integration is out of this crate's
/// scope — those are contract points a deployment wires in.
pub struct StandardDispatcher {
    http: reqwest::Client,
    run_timeout: Duration,
}

impl StandardDispatcher {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
            run_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_run_timeout(mut self, timeout: Duration) -> Self {
        self.run_timeout = timeout;
        self
    }
}

impl Default for StandardDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ActivityDispatcher for StandardDispatcher {
    #[instrument(skip(self, with, input))]
    async fn dispatch(&self, node: &Node, with: Value, input: Value) -> Result<Value, WorkflowError> {
        match node.kind {
            NodeKind::CallHttp => call_http(&self.http, &node.position, with).await,
            NodeKind::Run => run_process(&node.position, with, input, self.run_timeout).await,
            other => {
                warn!(position = %node.position, kind = ?other, "no dispatcher configured for activity kind");
                Err(comm_err(
                    &node.position,
                    format!("no dispatcher configured for `{other:?}` activities"),
                ))
            }
        }
    }
}

/// Methods a `call: http` task may use. Anything outside this list is a
/// document authoring mistake, not a runtime failure, so it is rejected
/// as `CONFIGURATION` before a request is ever attempted.
const ALLOWED_METHODS: [&str; 6] = ["GET", "POST", "PUT", "DELETE", "HEAD", "OPTIONS"];

fn config_err(position: &Position, msg: impl Into<String>) -> WorkflowError {
    WorkflowError::new(ErrorKind::Configuration, msg, position.clone())
}

async fn call_http(client: &reqwest::Client, position: &Position, with: Value) -> Result<Value, WorkflowError> {
    let with = with.as_object().cloned().unwrap_or_default();
    let method = with
        .get("method")
        .and_then(Value::as_str)
        .unwrap_or("GET")
        .to_ascii_uppercase();
    let endpoint = with
        .get("endpoint")
        .and_then(Value::as_str)
        .ok_or_else(|| comm_err(position, "`with.endpoint` is required for a `call: http` task"))?;

    if !ALLOWED_METHODS.contains(&method.as_str()) {
        return Err(config_err(
            position,
            format!("unsupported HTTP method '{method}', expected one of {ALLOWED_METHODS:?}"),
        ));
    }
    let method = reqwest::Method::from_bytes(method.as_bytes())
        .map_err(|e| comm_err(position, format!("invalid HTTP method '{method}': {e}")))?;
    let mut request = client.request(method, endpoint);

    if let Some(headers) = with.get("headers").and_then(Value::as_object) {
        for (k, v) in headers {
            if let Some(v) = v.as_str() {
                request = request.header(k, v);
            }
        }
    }
    if let Some(query) = with.get("query").and_then(Value::as_object) {
        let pairs: Vec<(String, String)> = query
            .iter()
            .map(|(k, v)| (k.clone(), value_to_query_string(v)))
            .collect();
        request = request.query(&pairs);
    }
    if let Some(body) = with.get("body") {
        request = request.json(body);
    }

    let response = request
        .send()
        .await
        .map_err(|e| comm_err(position, format!("HTTP request failed: {e}")))?;

    let status = response.status();
    let body: Value = response.json().await.unwrap_or(Value::Null);

    if !status.is_success() {
        return Err(comm_err(position, format!("HTTP call returned status {status}"))
            .with_status(status.as_u16())
            .with_details(body));
    }

    Ok(body)
}

fn value_to_query_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

async fn run_process(position: &Position, with: Value, input: Value, timeout: Duration) -> Result<Value, WorkflowError> {
    let with = with.as_object().cloned().unwrap_or_default();

    let (program, args): (String, Vec<String>) = if let Some(shell) = with.get("shell").and_then(Value::as_str) {
        ("/bin/sh".to_string(), vec!["-c".to_string(), shell.to_string()])
    } else if let Some(script) = with.get("script").and_then(Value::as_object) {
        let command = script
            .get("command")
            .and_then(Value::as_str)
            .ok_or_else(|| comm_err(position, "`run.script` requires a `command`"))?;
        let args = script
            .get("arguments")
            .and_then(Value::as_array)
            .map(|a| a.iter().filter_map(Value::as_str).map(str::to_string).collect())
            .unwrap_or_default();
        (command.to_string(), args)
    } else {
        return Err(comm_err(position, "`run` requires `script` or `shell`"));
    };

    let mut command = Command::new(&program);
    command
        .args(&args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = command
        .spawn()
        .map_err(|e| comm_err(position, format!("failed to spawn '{program}': {e}")))?;

    if let Some(mut stdin) = child.stdin.take() {
        let payload = serde_json::to_vec(&input).unwrap_or_default();
        let _ = stdin.write_all(&payload).await;
    }

    let output = tokio::time::timeout(timeout, child.wait_with_output())
        .await
        .map_err(|_| WorkflowError::new(ErrorKind::Timeout, format!("'{program}' timed out after {timeout:?}"), position.clone()))?
        .map_err(|e| comm_err(position, format!("failed to run '{program}': {e}")))?;

    if !output.status.success() {
        return Err(comm_err(position, format!("'{program}' exited with {}", output.status))
            .with_details(Value::String(String::from_utf8_lossy(&output.stderr).to_string())));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(serde_json::from_str(&stdout).unwrap_or_else(|_| Value::String(stdout.trim().to_string())))
}

/// Used by tests and in-process wiring that don't need real network/process
/// access: records the node/with/input it was asked to dispatch and
/// returns a preconfigured result.
#[derive(Default)]
pub struct RecordingDispatcher {
    pub response: std::sync::Mutex<Option<Result<Value, WorkflowError>>>,
}

impl RecordingDispatcher {
    pub fn respond_with(response: Result<Value, WorkflowError>) -> Self {
        Self {
            response: std::sync::Mutex::new(Some(response)),
        }
    }
}

#[async_trait]
impl ActivityDispatcher for RecordingDispatcher {
    async fn dispatch(&self, node: &Node, _with: Value, _input: Value) -> Result<Value, WorkflowError> {
        self.response
            .lock()
            .unwrap()
            .take()
            .unwrap_or_else(|| Err(comm_err(&node.position, "no canned response configured")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{NodeKind, Node};
    use serde_json::json;

    fn node(kind: NodeKind) -> Node {
        Node {
            position: Position::parse("/do/0"),
            kind,
            raw_task: json!({}),
            name: None,
            parent: None,
            children: vec![],
        }
    }

    #[tokio::test]
    async fn recording_dispatcher_returns_canned_response() {
        let dispatcher = RecordingDispatcher::respond_with(Ok(json!({"ok": true})));
        let result = dispatcher.dispatch(&node(NodeKind::CallHttp), Value::Null, Value::Null).await;
        assert_eq!(result.unwrap(), json!({"ok": true}));
    }

    #[tokio::test]
    async fn unconfigured_kind_fails_with_communication_error() {
        let dispatcher = StandardDispatcher::new();
        let err = dispatcher
            .dispatch(&node(NodeKind::CallGrpc), Value::Null, Value::Null)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Communication);
    }

    #[tokio::test]
    async fn http_call_requires_an_endpoint() {
        let err = call_http(&reqwest::Client::new(), &Position::parse("/do/0"), json!({"method": "GET"}))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Communication);
    }

    #[tokio::test]
    async fn http_call_rejects_methods_outside_the_allowlist() {
        let err = call_http(
            &reqwest::Client::new(),
            &Position::parse("/do/0"),
            json!({"method": "PATCH", "endpoint": "https://example.invalid"}),
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Configuration);
    }
}

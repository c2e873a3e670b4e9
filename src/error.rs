//! Typed workflow errors and the internal error enums they compose with.

use serde::{Deserialize, Serialize};

use crate::position::Position;

/// The SW DSL error taxonomy, with the default HTTP-like status each kind
/// carries when the document doesn't override it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    Configuration,
    Validation,
    Expression,
    Authentication,
    Authorization,
    Timeout,
    Communication,
    Runtime,
}

impl ErrorKind {
    pub fn default_status(self) -> u16 {
        match self {
            ErrorKind::Configuration => 400,
            ErrorKind::Validation => 400,
            ErrorKind::Expression => 400,
            ErrorKind::Authentication => 401,
            ErrorKind::Authorization => 403,
            ErrorKind::Timeout => 408,
            ErrorKind::Communication => 500,
            ErrorKind::Runtime => 500,
        }
    }
}

/// An error raised during workflow execution, carrying the position of the
/// node that raised it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind:?} at {position}: {title}")]
pub struct WorkflowError {
    #[serde(rename = "type")]
    pub kind: ErrorKind,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub details: Option<serde_json::Value>,
    pub status: u16,
    pub position: Position,
}

impl WorkflowError {
    pub fn new(kind: ErrorKind, title: impl Into<String>, position: Position) -> Self {
        Self {
            status: kind.default_status(),
            kind,
            title: title.into(),
            details: None,
            position,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }
}

/// Failures in expression evaluation, kept separate from [`WorkflowError`]
/// so callers can decide where in the driver to attach a position.
#[derive(Debug, thiserror::Error)]
pub enum EvalError {
    #[error("jq program failed to parse: {0}")]
    Parse(String),
    #[error("jq evaluation failed: {0}")]
    Eval(String),
    #[error("expected {expected}, got {actual}")]
    TypeMismatch { expected: &'static str, actual: String },
    #[error("unbound variable: {0}")]
    UnboundVariable(String),
}

/// Failures reconstructing or advancing a workflow instance.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("unknown task kind at {0}")]
    UnknownKind(Position),
    #[error("invalid `.then` target '{target}' at {position}")]
    InvalidThenTarget { target: String, position: Position },
    #[error("{0}")]
    Workflow(#[from] WorkflowError),
    #[error("definition error: {0}")]
    Definition(#[from] crate::definitions::DefinitionError),
    #[error("codec error: {0}")]
    Codec(#[from] crate::message::CodecError),
}

/// Failures talking to the outbox/definition store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("row not found: {0}")]
    NotFound(uuid::Uuid),
    #[error("concurrency conflict: expected version {expected}, got {actual}")]
    ConcurrencyConflict { expected: i64, actual: i64 },
    #[error("database error: {0}")]
    Database(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Database(err.to_string())
    }
}

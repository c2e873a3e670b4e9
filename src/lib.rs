//! # Workflow Runtime
//!
//! Executes Serverless Workflow DSL 1.0.0 documents as durable, resumable
//! instances. A document is parsed once into an addressable [`node`] tree;
//! an instance advances through that tree one step at a time via
//! [`interp`], encoding its entire state into a compact [`message`]
//! envelope between steps rather than holding anything in process memory.
//! Delayed continuations — a `wait` task, or a `try` block backing off
//! before its next retry — are not driven by in-process timers, they are
//! rows in one of two durable [`outbox`] tables, claimed and redelivered
//! at-least-once by whatever [`consumer::Consumer`] picks them up next,
//! possibly on a different process entirely.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        node::NodeTree                       │
//! │     (parsed once per definition, addressed by Position)     │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          interp                              │
//! │   (pure step function: NodeTree + Message -> StepOutcome)   │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     consumer::Consumer                      │
//! │  (dispatches activities, routes Suspend/Wait/Retry/Faulted)  │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  outbox (waits, retries tables)              │
//! │   (FOR UPDATE SKIP LOCKED batch claiming, retry backoff)    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use workflow_runtime::prelude::*;
//!
//! let tree = node::parse_document(&document)?;
//! let mut message = Message::new("greet", "1", Position::root());
//! let outcome = interp::start(&tree, &mut message, &ctx, input)?;
//! ```

pub mod activity;
pub mod bus;
pub mod config;
pub mod consumer;
pub mod dead_letter;
pub mod definitions;
pub mod error;
pub mod expr;
pub mod interp;
pub mod message;
pub mod node;
pub mod outbox;
pub mod position;
pub mod registry;
pub mod retry;
pub mod schema;
pub mod scope;
pub mod state;
pub mod workflow_ctx;

/// Prelude for common imports.
pub mod prelude {
    pub use crate::activity::{ActivityDispatcher, RecordingDispatcher, StandardDispatcher};
    pub use crate::bus::{Bus, InMemoryBus, WORKFLOWS_IN, WORKFLOWS_OUT};
    pub use crate::config::{OutboxConfig, RuntimeConfig};
    pub use crate::consumer::{Consumer, ConsumerError};
    pub use crate::dead_letter::{DeadLetterFilter, DeadLetterRecord, DeadLetterStore, InMemoryDeadLetterStore, PostgresDeadLetterStore};
    pub use crate::definitions::{DefinitionRecord, DefinitionRepository, DefinitionStore, InMemoryDefinitionRepository, PostgresDefinitionRepository};
    pub use crate::error::{DriverError, ErrorKind, EvalError, StoreError, WorkflowError};
    pub use crate::interp::{resume, resume_retry, start, StepOutcome};
    pub use crate::message::{CodecError, Message};
    pub use crate::node::{Node, NodeKind, NodeTree};
    pub use crate::outbox::{scheduler::Scheduler, OutboxRow, OutboxStatus, OutboxStore, ProcessorConfig};
    pub use crate::position::Position;
    pub use crate::registry::{InMemoryWorkerRegistry, PostgresWorkerRegistry, WorkerFilter, WorkerInfo, WorkerRegistry};
    pub use crate::retry::{Backoff, TryRetryPolicy};
    pub use crate::scope::Scope;
    pub use crate::state::NodeState;
    pub use crate::workflow_ctx::WorkflowContext;
}

//! The consumer: the component that actually moves an instance
//! forward. It decodes an envelope off [`crate::bus::Bus`], drives it
//! through [`crate::interp`] one boundary at a time, and routes whatever
//! the driver settles on to its next home: `workflows-out` for an
//! activity dispatch, an outbox row for `wait`/`retry`, nothing for a
//! clean completion, or the dead-letter sink for a fault or a malformed
//! payload.
//!
//! Flow control (`workflows-in`) and activity dispatch (`workflows-out`)
//! are driven by two separate loops ([`Consumer::run`] and
//! [`Consumer::run_activities`]) over the same [`Consumer`], so that an
//! activity suspension is its own durable checkpoint: `drive` publishes
//! the envelope and returns the moment a node needs an external effect,
//! rather than performing it in the same call that produced the
//! suspension. A crash between the two loops just means the envelope is
//! reprocessed from whichever side last wrote it.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tracing::{error, info, instrument, warn};

use crate::activity::ActivityDispatcher;
use crate::bus::{Bus, BusError, WORKFLOWS_IN, WORKFLOWS_OUT};
use crate::dead_letter::DeadLetterStore;
use crate::definitions::{DefinitionRepository, DefinitionStore};
use crate::error::{ErrorKind, WorkflowError};
use crate::expr::{self, ProgramCache};
use crate::interp::{self, scope, task, StepOutcome};
use crate::message::Message;
use crate::node::{Node, NodeKind, NodeTree};
use crate::outbox::{OutboxRow, OutboxStore};
use crate::position::Position;
use crate::workflow_ctx::WorkflowContext;

#[derive(Debug, thiserror::Error)]
pub enum ConsumerError {
    #[error("envelope decode failed: {0}")]
    Decode(#[from] crate::message::CodecError),
    #[error("definition error: {0}")]
    Definition(#[from] crate::definitions::DefinitionError),
    #[error("driver error: {0}")]
    Driver(#[from] crate::error::DriverError),
    #[error("store error: {0}")]
    Store(#[from] crate::error::StoreError),
    #[error("bus error: {0}")]
    Bus(#[from] BusError),
    #[error("message at {0} does not point at a wait, a retrying try, or a pending activity")]
    UnexpectedResumption(Position),
}

/// Ties the bus, the definition cache, activity dispatch, and the two
/// outbox tables together into one processing loop.
pub struct Consumer<R: DefinitionRepository> {
    bus: Arc<dyn Bus>,
    definitions: Arc<DefinitionStore<R>>,
    dispatcher: Arc<dyn ActivityDispatcher>,
    waits: Arc<dyn OutboxStore>,
    retries: Arc<dyn OutboxStore>,
    dead_letters: Arc<dyn DeadLetterStore>,
    cache: ProgramCache,
    secrets: serde_json::Map<String, Value>,
    runtime: serde_json::Map<String, Value>,
}

impl<R: DefinitionRepository> Consumer<R> {
    pub fn new(
        bus: Arc<dyn Bus>,
        definitions: Arc<DefinitionStore<R>>,
        dispatcher: Arc<dyn ActivityDispatcher>,
        waits: Arc<dyn OutboxStore>,
        retries: Arc<dyn OutboxStore>,
        dead_letters: Arc<dyn DeadLetterStore>,
    ) -> Self {
        Self {
            bus,
            definitions,
            dispatcher,
            waits,
            retries,
            dead_letters,
            cache: ProgramCache::default(),
            secrets: serde_json::Map::new(),
            runtime: serde_json::Map::new(),
        }
    }

    pub fn with_secrets(mut self, secrets: serde_json::Map<String, Value>) -> Self {
        self.secrets = secrets;
        self
    }

    pub fn with_runtime(mut self, runtime: serde_json::Map<String, Value>) -> Self {
        self.runtime = runtime;
        self
    }

    /// Start a brand-new instance of `(name, version)` with `input` and
    /// drive it to its first boundary. This is the one entry point that
    /// does not arrive via the bus: a fresh start carries no prior
    /// position to resume from, so it is seeded directly rather than
    /// decoded off `workflows-in`.
    #[instrument(skip(self, input))]
    pub async fn start_instance(&self, name: &str, version: &str, input: Value) -> Result<(), ConsumerError> {
        let tree = self.definitions.get(name, version).await?;
        let document = self.definitions.document(name, version).await?;
        let ctx = self.build_context(name, version, &document);

        let (message, outcome) = interp::start(&tree, &ctx, &self.cache, input)?;
        self.drive(&ctx, message, outcome).await
    }

    /// Pull and fully process exactly one envelope from `workflows-in`.
    /// Returns `false` once the bus has closed.
    pub async fn run_once(&self) -> bool {
        let Some(raw) = self.bus.receive(WORKFLOWS_IN).await else {
            return false;
        };
        self.process_raw(raw).await;
        true
    }

    /// Pull and process envelopes from `workflows-in` until the bus
    /// closes.
    pub async fn run(&self) {
        while self.run_once().await {}
    }

    /// Pull and fully perform exactly one activity dispatch from
    /// `workflows-out`. Returns `false` once the bus has closed.
    pub async fn run_once_activity(&self) -> bool {
        let Some(raw) = self.bus.receive(WORKFLOWS_OUT).await else {
            return false;
        };
        self.process_activity_raw(raw).await;
        true
    }

    /// Pull and perform activity dispatches from `workflows-out` until the
    /// bus closes. Run alongside [`Consumer::run`] so flow control and
    /// activity execution proceed independently.
    pub async fn run_activities(&self) {
        while self.run_once_activity().await {}
    }

    #[instrument(skip(self, raw))]
    async fn process_raw(&self, raw: String) {
        let message = match Message::decode(&raw) {
            Ok(m) => m,
            Err(err) => {
                warn!(error = %err, "dropping unparsable envelope");
                self.dead_letter("decode failure", err.to_string(), raw).await;
                return;
            }
        };

        if let Err(err) = self.process_message(message).await {
            error!(error = %err, "failed to process envelope");
            self.dead_letter("processing failure", err.to_string(), raw).await;
        }
    }

    async fn process_message(&self, mut message: Message) -> Result<(), ConsumerError> {
        let tree = self.definitions.get(&message.name, &message.version).await?;
        let document = self.definitions.document(&message.name, &message.version).await?;
        let ctx = self.build_context(&message.name, &message.version, &document);

        let node = tree
            .get(&message.position)
            .ok_or_else(|| ConsumerError::UnexpectedResumption(message.position.clone()))?;

        let outcome = match node.kind {
            NodeKind::Wait => {
                let input = message.state_at(&message.position).raw_input.clone().unwrap_or(Value::Null);
                interp::resume(&tree, &mut message, &ctx, &self.cache, Ok(input))?
            }
            NodeKind::Try => interp::resume_retry(&tree, &mut message, &ctx, &self.cache, &message.position.clone())?,
            _ => return Err(ConsumerError::UnexpectedResumption(message.position.clone())),
        };

        self.drive(&ctx, message, outcome).await
    }

    #[instrument(skip(self, raw))]
    async fn process_activity_raw(&self, raw: String) {
        let message = match Message::decode(&raw) {
            Ok(m) => m,
            Err(err) => {
                warn!(error = %err, "dropping unparsable activity envelope");
                self.dead_letter("decode failure", err.to_string(), raw).await;
                return;
            }
        };

        if let Err(err) = self.process_activity_message(message).await {
            error!(error = %err, "failed to perform activity dispatch");
            self.dead_letter("activity dispatch failure", err.to_string(), raw).await;
        }
    }

    /// Perform the activity `message` is parked at, feed the result back
    /// through [`interp::resume`], and drive the instance to its next
    /// boundary.
    async fn process_activity_message(&self, mut message: Message) -> Result<(), ConsumerError> {
        let tree = self.definitions.get(&message.name, &message.version).await?;
        let document = self.definitions.document(&message.name, &message.version).await?;
        let ctx = self.build_context(&message.name, &message.version, &document);

        let position = message.position.clone();
        let node = tree
            .get(&position)
            .ok_or_else(|| ConsumerError::UnexpectedResumption(position.clone()))?;
        if !node.kind.is_activity() || node.kind == NodeKind::Wait {
            return Err(ConsumerError::UnexpectedResumption(position));
        }

        let input = message.state_at(&position).raw_input.clone().unwrap_or(Value::Null);
        let result = self.perform(&tree, &mut message, &ctx, node, &position, input).await;
        let outcome = interp::resume(&tree, &mut message, &ctx, &self.cache, result)?;
        self.drive(&ctx, message, outcome).await
    }

    fn build_context(&self, name: &str, version: &str, document: &Value) -> WorkflowContext {
        WorkflowContext::new(name, version, document)
            .with_secrets(self.secrets.clone())
            .with_runtime(self.runtime.clone())
            .with_now(Utc::now())
    }

    /// Route `message` to wherever `outcome` says it needs to go next: an
    /// activity dispatch published to `workflows-out`, a scheduled
    /// wake-up, a drop, or a dead-letter. Each call handles exactly one
    /// boundary and returns — `interp` has already walked every
    /// non-suspending node on the way here, so there is never more than
    /// one outcome to route per call.
    async fn drive(&self, ctx: &WorkflowContext, mut message: Message, outcome: StepOutcome) -> Result<(), ConsumerError> {
        match outcome {
            StepOutcome::Suspend { position, input } => {
                let mut state = message.state_at(&position);
                state.raw_input = Some(input);
                message.set_state_at(&position, state);
                let raw = message.encode()?;
                self.bus.publish(WORKFLOWS_OUT, raw).await?;
                Ok(())
            }
            StepOutcome::Wait { position, input, duration } => {
                let mut state = message.state_at(&position);
                state.raw_input = Some(input);
                message.set_state_at(&position, state);
                self.schedule(&self.waits, &message, ctx.now + chrono::Duration::from_std(duration).unwrap_or_default())
                    .await
            }
            StepOutcome::Retry { position, delay } => {
                let _ = position;
                self.schedule(&self.retries, &message, ctx.now + chrono::Duration::from_std(delay).unwrap_or_default())
                    .await
            }
            StepOutcome::Completed { output } => {
                info!(name = %message.name, version = %message.version, output = %output, "instance completed");
                Ok(())
            }
            StepOutcome::Faulted(err) => {
                warn!(name = %message.name, version = %message.version, error = %err, "instance faulted");
                let raw = message.encode()?;
                self.audit_failed(&self.retries, raw.clone(), err.to_string()).await?;
                self.dead_letter("instance faulted", err.to_string(), raw).await;
                Ok(())
            }
        }
    }

    /// Resolve `with` against the scope at `position` and hand the node
    /// off to the dispatcher. Resolution failures are folded into a
    /// [`WorkflowError`] rather than aborting the consumer, so `try`/
    /// `catch` gets the same chance to handle a bad `with` expression as
    /// it does an activity failure.
    async fn perform(
        &self,
        tree: &NodeTree,
        message: &mut Message,
        ctx: &WorkflowContext,
        node: &Node,
        position: &Position,
        input: Value,
    ) -> Result<Value, WorkflowError> {
        let scope = scope::build(tree, message, position, ctx);
        let with = expr::eval_template(&self.cache, &task::with_params(node), &input, &scope)
            .map_err(|e| WorkflowError::new(ErrorKind::Expression, e.to_string(), position.clone()))?;
        self.dispatcher.dispatch(node, with, input).await
    }

    async fn schedule(&self, store: &Arc<dyn OutboxStore>, message: &Message, delayed_until: chrono::DateTime<Utc>) -> Result<(), ConsumerError> {
        let row = OutboxRow::new(message.encode()?, delayed_until);
        store.enqueue(row).await?;
        Ok(())
    }

    async fn audit_failed(&self, store: &Arc<dyn OutboxStore>, raw: String, error_detail: String) -> Result<(), ConsumerError> {
        let row = OutboxRow::new(raw, Utc::now());
        let id = row.id;
        store.enqueue(row).await?;
        store.mark_failed(id, 0, error_detail).await?;
        Ok(())
    }

    async fn dead_letter(&self, reason: &str, detail: String, raw: String) {
        let _ = self.dead_letters.record(&format!("{reason}: {detail}"), raw.clone()).await;
        self.bus.dead_letter(reason, raw).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::RecordingDispatcher;
    use crate::bus::InMemoryBus;
    use crate::dead_letter::InMemoryDeadLetterStore;
    use crate::definitions::{DefinitionRecord, InMemoryDefinitionRepository};
    use crate::outbox::memory::InMemoryOutboxStore;
    use serde_json::json;

    fn consumer(dispatcher: RecordingDispatcher) -> (Consumer<InMemoryDefinitionRepository>, Arc<InMemoryOutboxStore>, Arc<InMemoryOutboxStore>) {
        let repo = InMemoryDefinitionRepository::new();
        let definitions = Arc::new(DefinitionStore::new(repo));
        let waits = Arc::new(InMemoryOutboxStore::default());
        let retries = Arc::new(InMemoryOutboxStore::default());
        let consumer = Consumer::new(
            Arc::new(InMemoryBus::default()),
            definitions,
            Arc::new(dispatcher),
            waits.clone(),
            retries.clone(),
            Arc::new(InMemoryDeadLetterStore::default()),
        );
        (consumer, waits, retries)
    }

    fn consumer_with_dispatcher(
        dispatcher: Arc<RecordingDispatcher>,
    ) -> (Consumer<InMemoryDefinitionRepository>, Arc<InMemoryOutboxStore>, Arc<InMemoryOutboxStore>) {
        let repo = InMemoryDefinitionRepository::new();
        let definitions = Arc::new(DefinitionStore::new(repo));
        let waits = Arc::new(InMemoryOutboxStore::default());
        let retries = Arc::new(InMemoryOutboxStore::default());
        let consumer = Consumer::new(
            Arc::new(InMemoryBus::default()),
            definitions,
            dispatcher,
            waits.clone(),
            retries.clone(),
            Arc::new(InMemoryDeadLetterStore::default()),
        );
        (consumer, waits, retries)
    }

    #[tokio::test]
    async fn start_instance_runs_set_only_workflow_to_completion() {
        let (consumer, waits, retries) = consumer(RecordingDispatcher::default());
        consumer
            .definitions
            .put(DefinitionRecord {
                name: "greet".into(),
                version: "1.0.0".into(),
                document: json!({"do": [{"greeting": {"set": {"message": "hi"}}}]}),
            })
            .await
            .unwrap();

        consumer.start_instance("greet", "1.0.0", json!({})).await.unwrap();
        assert_eq!(waits.claim_batch(10, 5, Utc::now()).await.unwrap().len(), 0);
        assert_eq!(retries.claim_batch(10, 5, Utc::now()).await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn activity_suspension_is_checkpointed_on_workflows_out_not_run_inline() {
        let dispatcher = Arc::new(RecordingDispatcher::respond_with(Ok(json!({"pong": true}))));
        let (consumer, ..) = consumer_with_dispatcher(dispatcher.clone());
        consumer
            .definitions
            .put(DefinitionRecord {
                name: "ping".into(),
                version: "1.0.0".into(),
                document: json!({"do": [{"call-it": {"call": "http", "with": {"method": "GET", "endpoint": "https://example.invalid"}}}]}),
            })
            .await
            .unwrap();

        consumer.start_instance("ping", "1.0.0", json!({})).await.unwrap();

        // The activity is parked on `workflows-out` as its own durable
        // checkpoint; nothing has dispatched it yet.
        assert!(dispatcher.response.lock().unwrap().is_some());

        // A separate invocation performs it and drives the instance home.
        assert!(consumer.run_once_activity().await);
        assert!(dispatcher.response.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn wait_task_enqueues_a_waits_row_instead_of_completing() {
        let (consumer, waits, _retries) = consumer(RecordingDispatcher::default());
        consumer
            .definitions
            .put(DefinitionRecord {
                name: "delayed".into(),
                version: "1.0.0".into(),
                document: json!({"do": [{"pause": {"wait": {"seconds": 30}}}]}),
            })
            .await
            .unwrap();

        consumer.start_instance("delayed", "1.0.0", json!({})).await.unwrap();
        let claimed = waits.claim_batch(10, 5, Utc::now() + chrono::Duration::seconds(31)).await.unwrap();
        assert_eq!(claimed.len(), 1);
    }

    #[tokio::test]
    async fn unrecoverable_raise_writes_an_audit_row_and_dead_letters() {
        let (consumer, _waits, retries) = consumer(RecordingDispatcher::default());
        consumer
            .definitions
            .put(DefinitionRecord {
                name: "doomed".into(),
                version: "1.0.0".into(),
                document: json!({"do": [{"boom": {"raise": {"error": {"type": "RUNTIME", "title": "nope"}}}}]}),
            })
            .await
            .unwrap();

        consumer.start_instance("doomed", "1.0.0", json!({})).await.unwrap();
        let claimed = retries.claim_batch(10, 5, Utc::now()).await.unwrap();
        assert!(claimed.is_empty(), "audited rows are marked FAILED immediately, not left claimable");
    }

    #[tokio::test]
    async fn malformed_envelope_is_dead_lettered_not_panicked_on() {
        let (consumer, ..) = consumer(RecordingDispatcher::default());
        consumer.process_raw("not json".to_string()).await;
    }
}

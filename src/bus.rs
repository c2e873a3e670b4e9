//! The message bus boundary: logical `workflows-in`/`workflows-out`
//! topics the consumer reads from and writes to, plus a dead-letter sink.
//!
//! Topics carry the encoded envelope (`String`), not a [`Message`] value
//! directly: a real broker moves bytes, and the consumer's very first
//! step is decoding them, which means a malformed payload must be
//! representable on the wire at all. Only the trait and an
//! in-memory, `tokio::mpsc`-backed implementation are provided here; a
//! production Kafka/RabbitMQ binding is an external collaborator that
//! implements the same trait.

use async_trait::async_trait;
use tokio::sync::mpsc;

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("channel closed")]
    Closed,
}

#[async_trait]
pub trait Bus: Send + Sync {
    async fn publish(&self, topic: &str, raw: String) -> Result<(), BusError>;
    /// Blocks until a message is available or the topic's channel closes.
    async fn receive(&self, topic: &str) -> Option<String>;
    async fn dead_letter(&self, reason: &str, raw: String);
}

/// Logical topic names used throughout this crate; an external bus binding
/// is free to map these to whatever its own namespacing scheme requires.
pub const WORKFLOWS_IN: &str = "workflows-in";
pub const WORKFLOWS_OUT: &str = "workflows-out";

struct DeadLetter {
    reason: String,
    raw: String,
}

/// Single-process bus: one bounded mpsc channel per topic, created lazily
/// on first use. Good enough for tests and single-process deployments;
/// the dead-letter sink is just an in-memory log a caller can drain via
/// [`InMemoryBus::drain_dead_letters`].
pub struct InMemoryBus {
    topics: dashmap::DashMap<String, (mpsc::Sender<String>, tokio::sync::Mutex<mpsc::Receiver<String>>)>,
    dead_letters: tokio::sync::Mutex<Vec<DeadLetter>>,
    capacity: usize,
}

impl InMemoryBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            topics: dashmap::DashMap::new(),
            dead_letters: tokio::sync::Mutex::new(Vec::new()),
            capacity,
        }
    }

    fn ensure_topic(&self, topic: &str) {
        self.topics.entry(topic.to_string()).or_insert_with(|| {
            let (tx, rx) = mpsc::channel(self.capacity);
            (tx, tokio::sync::Mutex::new(rx))
        });
    }

    pub async fn drain_dead_letters(&self) -> Vec<(String, String)> {
        let mut guard = self.dead_letters.lock().await;
        guard.drain(..).map(|d| (d.reason, d.raw)).collect()
    }
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl Bus for InMemoryBus {
    async fn publish(&self, topic: &str, raw: String) -> Result<(), BusError> {
        self.ensure_topic(topic);
        let entry = self.topics.get(topic).expect("just ensured");
        entry.0.send(raw).await.map_err(|_| BusError::Closed)
    }

    async fn receive(&self, topic: &str) -> Option<String> {
        self.ensure_topic(topic);
        let entry = self.topics.get(topic).expect("just ensured");
        let mut rx = entry.1.lock().await;
        rx.recv().await
    }

    async fn dead_letter(&self, reason: &str, raw: String) {
        self.dead_letters.lock().await.push(DeadLetter {
            reason: reason.to_string(),
            raw,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;

    #[tokio::test]
    async fn publish_then_receive_round_trips_an_envelope() {
        let bus = InMemoryBus::default();
        let raw = Message::new("w", "1").encode().unwrap();
        bus.publish(WORKFLOWS_IN, raw).await.unwrap();
        let received = bus.receive(WORKFLOWS_IN).await.unwrap();
        let message = Message::decode(&received).unwrap();
        assert_eq!(message.name, "w");
    }

    #[tokio::test]
    async fn dead_letters_accumulate_and_drain() {
        let bus = InMemoryBus::default();
        bus.dead_letter("parse failure", "not json".into()).await;
        let drained = bus.drain_dead_letters().await;
        assert_eq!(drained, vec![("parse failure".to_string(), "not json".to_string())]);
        assert!(bus.drain_dead_letters().await.is_empty());
    }
}

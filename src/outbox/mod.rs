//! Durable outbox for delayed continuations: `wait` and `try`-retry both
//! resolve to a row in one of two identically-shaped tables (`waits`,
//! `retries`), claimed in batches with skip-locked semantics, retried with
//! exponential backoff, and eventually cleaned up by retention.
//!
//! The claiming pattern generalizes a single durable task queue into the
//! two outbox kinds this runtime needs, one table each for `waits` and
//! `retries`.

pub mod memory;
pub mod postgres;
pub mod scheduler;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StoreError;
use crate::retry::outbox_backoff;

use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OutboxStatus {
    Pending,
    /// Claimed by a `claim_batch` call and not yet settled. A row in this
    /// state is invisible to every other `claim_batch` call, including one
    /// racing it on a different connection.
    Claimed,
    Sent,
    Failed,
}

/// A single delayed continuation. `message` is the encoded [`crate::message::Message`]
/// envelope (for `waits`) or the JSON-encoded resume context (for `retries`);
/// the outbox itself is agnostic to the payload's shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxRow {
    pub id: Uuid,
    pub message: String,
    pub status: OutboxStatus,
    pub delayed_until: DateTime<Utc>,
    pub attempt_count: u32,
    pub last_error: Option<String>,
    pub version: i64,
}

impl OutboxRow {
    pub fn new(message: String, delayed_until: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::now_v7(),
            message,
            status: OutboxStatus::Pending,
            delayed_until,
            attempt_count: 0,
            last_error: None,
            version: 0,
        }
    }
}

/// Batch claiming, per-row settlement, and retention cleanup over one
/// outbox table. Implementations must make `claim_batch` skip-locked and
/// parallel-safe: no row may be returned to two concurrent callers.
#[async_trait::async_trait]
pub trait OutboxStore: Send + Sync {
    async fn enqueue(&self, row: OutboxRow) -> Result<(), StoreError>;

    /// Claim up to `batch_size` `PENDING` rows with `delayed_until <= now`
    /// and `attempt_count < max_attempts`, ordered by `delayed_until`,
    /// atomically transitioning each to `CLAIMED` as part of the same
    /// claim. Claimed rows are not visible to another `claim_batch` call
    /// until settled (or the claim is abandoned, e.g. on crash, and later
    /// recovered out of band).
    async fn claim_batch(&self, batch_size: usize, max_attempts: u32, now: DateTime<Utc>) -> Result<Vec<OutboxRow>, StoreError>;

    async fn mark_sent(&self, id: Uuid, expected_version: i64) -> Result<(), StoreError>;

    async fn mark_retry(&self, id: Uuid, expected_version: i64, delayed_until: DateTime<Utc>, attempt_count: u32, last_error: String) -> Result<(), StoreError>;

    async fn mark_failed(&self, id: Uuid, expected_version: i64, last_error: String) -> Result<(), StoreError>;

    /// Delete up to `batch_size` `SENT` rows older than `older_than`.
    /// Returns the number of rows deleted.
    async fn cleanup(&self, older_than: DateTime<Utc>, batch_size: usize) -> Result<u64, StoreError>;
}

/// Tuning knobs for one outbox table's processor: `wait.outbox.*` and
/// `retry.outbox.*` each get their own instance.
#[derive(Debug, Clone, Copy)]
pub struct ProcessorConfig {
    pub batch_size: usize,
    pub max_attempts: u32,
    pub initial_delay: Duration,
    /// Consecutive empty batches before `run_once` stops, guarding against
    /// livelock when another worker keeps repopulating the table.
    pub empty_batch_limit: u32,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            empty_batch_limit: 3,
        }
    }
}

/// What happened to one claimed row, for callers that want to observe a
/// `run_once` pass (tests, metrics).
#[derive(Debug, Clone, PartialEq)]
pub enum Settlement {
    Sent,
    Retried { next_delay: Duration },
    Failed,
}

/// Drain an outbox table: repeatedly claim a batch, run `send` over each
/// row, settle it, and stop after `empty_batch_limit` consecutive empty
/// batches. `send` is NOT retried internally by this function; a non-`Ok`
/// result schedules the row's own backoff/failure instead.
pub async fn run_once<S, F, Fut>(store: &S, config: &ProcessorConfig, now: DateTime<Utc>, send: F) -> Result<Vec<(Uuid, Settlement)>, StoreError>
where
    S: OutboxStore,
    F: Fn(String) -> Fut,
    Fut: std::future::Future<Output = Result<(), String>>,
{
    let backoff = outbox_backoff(config.initial_delay);
    let mut settlements = Vec::new();
    let mut empty_batches = 0u32;

    loop {
        let batch = store.claim_batch(config.batch_size, config.max_attempts, now).await?;
        if batch.is_empty() {
            empty_batches += 1;
            if empty_batches >= config.empty_batch_limit {
                break;
            }
            continue;
        }
        empty_batches = 0;

        for row in batch {
            let attempt_count = row.attempt_count + 1;
            match send(row.message.clone()).await {
                Ok(()) => {
                    store.mark_sent(row.id, row.version).await?;
                    settlements.push((row.id, Settlement::Sent));
                }
                Err(err) => {
                    if attempt_count >= config.max_attempts {
                        store.mark_failed(row.id, row.version, err).await?;
                        settlements.push((row.id, Settlement::Failed));
                    } else {
                        let delay = backoff.delay_for_attempt(attempt_count + 1);
                        store
                            .mark_retry(row.id, row.version, now + chrono::Duration::from_std(delay).unwrap_or_default(), attempt_count, err)
                            .await?;
                        settlements.push((row.id, Settlement::Retried { next_delay: delay }));
                    }
                }
            }
        }
    }

    Ok(settlements)
}

/// Run the retention cleanup pass: delete `SENT` rows older than
/// `retention`, in batches, until a batch comes back short of
/// `batch_size` (signaling nothing further is eligible right now).
pub async fn cleanup_once<S: OutboxStore>(store: &S, retention: Duration, now: DateTime<Utc>, batch_size: usize) -> Result<u64, StoreError> {
    let cutoff = now - chrono::Duration::from_std(retention).unwrap_or_default();
    let mut total = 0u64;
    loop {
        let deleted = store.cleanup(cutoff, batch_size).await?;
        total += deleted;
        if (deleted as usize) < batch_size {
            break;
        }
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::memory::InMemoryOutboxStore;
    use super::*;

    #[tokio::test]
    async fn run_once_sends_pending_rows_and_marks_them_sent() {
        let store = InMemoryOutboxStore::default();
        let now = Utc::now();
        store.enqueue(OutboxRow::new("hello".into(), now)).await.unwrap();

        let settlements = run_once(&store, &ProcessorConfig::default(), now, |_msg| async { Ok(()) }).await.unwrap();
        assert_eq!(settlements.len(), 1);
        assert_eq!(settlements[0].1, Settlement::Sent);
    }

    #[tokio::test]
    async fn run_once_retries_on_failure_until_max_attempts_then_fails() {
        let store = InMemoryOutboxStore::default();
        let now = Utc::now();
        store.enqueue(OutboxRow::new("hello".into(), now)).await.unwrap();

        let config = ProcessorConfig {
            max_attempts: 2,
            ..Default::default()
        };

        let first = run_once(&store, &config, now, |_| async { Err("boom".to_string()) }).await.unwrap();
        assert!(matches!(first[0].1, Settlement::Retried { .. }));

        let later = now + chrono::Duration::hours(1);
        let second = run_once(&store, &config, later, |_| async { Err("boom again".to_string()) }).await.unwrap();
        assert_eq!(second[0].1, Settlement::Failed);
    }

    #[tokio::test]
    async fn cleanup_deletes_only_sent_rows_past_retention() {
        let store = InMemoryOutboxStore::default();
        let now = Utc::now();
        store.enqueue(OutboxRow::new("a".into(), now - chrono::Duration::days(10))).await.unwrap();
        run_once(&store, &ProcessorConfig::default(), now, |_| async { Ok(()) }).await.unwrap();

        store.enqueue(OutboxRow::new("b".into(), now)).await.unwrap();

        let deleted = cleanup_once(&store, Duration::from_secs(7 * 86400), now, 100).await.unwrap();
        assert_eq!(deleted, 1);
    }
}

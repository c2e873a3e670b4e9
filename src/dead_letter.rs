//! Dead-letter visibility: a durable record of every envelope the
//! consumer could not advance at all — a malformed payload, an
//! unresolvable definition, or an instance that faulted with no
//! enclosing `try` — so an operator can inspect and, once the underlying
//! cause is fixed, requeue it instead of it being lost the moment
//! [`crate::bus::Bus::dead_letter`] drops it off the wire.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::bus::{Bus, WORKFLOWS_IN};
use crate::error::StoreError;

#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetterRecord {
    pub id: Uuid,
    pub reason: String,
    pub payload: String,
    pub recorded_at: DateTime<Utc>,
    pub requeued: bool,
}

#[derive(Debug, Clone, Default)]
pub struct DeadLetterFilter {
    pub requeued: Option<bool>,
    pub limit: Option<i64>,
}

#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    async fn record(&self, reason: &str, payload: String) -> Result<Uuid, StoreError>;
    async fn list(&self, filter: DeadLetterFilter) -> Result<Vec<DeadLetterRecord>, StoreError>;
    async fn mark_requeued(&self, id: Uuid) -> Result<(), StoreError>;
}

/// Republish a dead-lettered payload onto `workflows-in` and mark it
/// requeued. "Requeue" means "hand back to the bus", since this runtime
/// has no separate claimable task row to reset.
pub async fn requeue(store: &dyn DeadLetterStore, bus: &dyn Bus, id: Uuid) -> Result<(), StoreError> {
    let records = store
        .list(DeadLetterFilter {
            requeued: None,
            limit: None,
        })
        .await?;
    let record = records.into_iter().find(|r| r.id == id).ok_or(StoreError::NotFound(id))?;
    bus.publish(WORKFLOWS_IN, record.payload)
        .await
        .map_err(|_| StoreError::Database("bus closed while requeueing dead letter".into()))?;
    store.mark_requeued(id).await
}

/// In-memory [`DeadLetterStore`], used by tests and single-process wiring.
#[derive(Default)]
pub struct InMemoryDeadLetterStore {
    records: std::sync::Mutex<Vec<DeadLetterRecord>>,
}

#[async_trait]
impl DeadLetterStore for InMemoryDeadLetterStore {
    async fn record(&self, reason: &str, payload: String) -> Result<Uuid, StoreError> {
        let id = Uuid::now_v7();
        self.records.lock().unwrap().push(DeadLetterRecord {
            id,
            reason: reason.to_string(),
            payload,
            recorded_at: Utc::now(),
            requeued: false,
        });
        Ok(id)
    }

    async fn list(&self, filter: DeadLetterFilter) -> Result<Vec<DeadLetterRecord>, StoreError> {
        let records = self.records.lock().unwrap();
        let mut out: Vec<DeadLetterRecord> = records
            .iter()
            .filter(|r| filter.requeued.map(|want| want == r.requeued).unwrap_or(true))
            .cloned()
            .collect();
        if let Some(limit) = filter.limit {
            out.truncate(limit.max(0) as usize);
        }
        Ok(out)
    }

    async fn mark_requeued(&self, id: Uuid) -> Result<(), StoreError> {
        let mut records = self.records.lock().unwrap();
        let record = records.iter_mut().find(|r| r.id == id).ok_or(StoreError::NotFound(id))?;
        record.requeued = true;
        Ok(())
    }
}

/// Postgres-backed [`DeadLetterStore`] against the `dead_letters` table.
pub struct PostgresDeadLetterStore {
    pool: PgPool,
}

impl PostgresDeadLetterStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DeadLetterStore for PostgresDeadLetterStore {
    async fn record(&self, reason: &str, payload: String) -> Result<Uuid, StoreError> {
        let id = Uuid::now_v7();
        sqlx::query(
            r#"
            INSERT INTO dead_letters (id, reason, payload, recorded_at, requeued)
            VALUES ($1, $2, $3, $4, FALSE)
            "#,
        )
        .bind(id)
        .bind(reason)
        .bind(&payload)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    async fn list(&self, filter: DeadLetterFilter) -> Result<Vec<DeadLetterRecord>, StoreError> {
        let limit = filter.limit.unwrap_or(100);
        let rows = match filter.requeued {
            Some(requeued) => {
                sqlx::query(
                    r#"
                    SELECT id, reason, payload, recorded_at, requeued
                    FROM dead_letters
                    WHERE requeued = $1
                    ORDER BY recorded_at DESC
                    LIMIT $2
                    "#,
                )
                .bind(requeued)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    r#"
                    SELECT id, reason, payload, recorded_at, requeued
                    FROM dead_letters
                    ORDER BY recorded_at DESC
                    LIMIT $1
                    "#,
                )
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
        };

        Ok(rows
            .into_iter()
            .map(|row| DeadLetterRecord {
                id: row.get("id"),
                reason: row.get("reason"),
                payload: row.get("payload"),
                recorded_at: row.get("recorded_at"),
                requeued: row.get("requeued"),
            })
            .collect())
    }

    async fn mark_requeued(&self, id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE dead_letters SET requeued = TRUE WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }
}

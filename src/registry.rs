//! Worker registry: observability over which processes are currently
//! running a [`crate::consumer::Consumer`], how loaded each one is, and
//! whether it is still accepting work — so an operator can tell a stalled
//! deployment from a busy one without reading logs.
//!
//! `WorkerInfo`/`WorkerFilter` and the
//! `register`/`heartbeat`/`list`/`deregister` quartet deliberately skip a
//! `hostname`/`metadata` pair of columns, since nothing here reads them
//! back.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};

use crate::error::StoreError;

#[derive(Debug, Clone, PartialEq)]
pub struct WorkerInfo {
    pub id: String,
    pub worker_group: String,
    pub max_concurrency: u32,
    pub current_load: u32,
    pub accepting_tasks: bool,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct WorkerFilter {
    pub worker_group: Option<String>,
    /// Only workers whose last heartbeat is at or after this instant.
    pub heartbeat_since: Option<DateTime<Utc>>,
}

/// Durable registry of live workers. `register` is also the re-registration
/// path (a restarted worker reusing its id just upserts); `heartbeat` is the
/// cheap, frequent call a running worker makes between polls.
#[async_trait]
pub trait WorkerRegistry: Send + Sync {
    async fn register(&self, worker: WorkerInfo) -> Result<(), StoreError>;

    async fn heartbeat(&self, worker_id: &str, current_load: u32, accepting_tasks: bool) -> Result<(), StoreError>;

    async fn list(&self, filter: WorkerFilter) -> Result<Vec<WorkerInfo>, StoreError>;

    async fn deregister(&self, worker_id: &str) -> Result<(), StoreError>;
}

/// In-memory [`WorkerRegistry`], used by tests and single-process wiring.
#[derive(Default)]
pub struct InMemoryWorkerRegistry {
    workers: std::sync::Mutex<Vec<WorkerInfo>>,
}

#[async_trait]
impl WorkerRegistry for InMemoryWorkerRegistry {
    async fn register(&self, worker: WorkerInfo) -> Result<(), StoreError> {
        let mut workers = self.workers.lock().unwrap();
        match workers.iter_mut().find(|w| w.id == worker.id) {
            Some(existing) => *existing = worker,
            None => workers.push(worker),
        }
        Ok(())
    }

    async fn heartbeat(&self, worker_id: &str, current_load: u32, accepting_tasks: bool) -> Result<(), StoreError> {
        let mut workers = self.workers.lock().unwrap();
        let worker = workers
            .iter_mut()
            .find(|w| w.id == worker_id)
            .ok_or_else(|| StoreError::Database(format!("unknown worker: {worker_id}")))?;
        worker.current_load = current_load;
        worker.accepting_tasks = accepting_tasks;
        worker.last_heartbeat_at = Utc::now();
        Ok(())
    }

    async fn list(&self, filter: WorkerFilter) -> Result<Vec<WorkerInfo>, StoreError> {
        let workers = self.workers.lock().unwrap();
        Ok(workers
            .iter()
            .filter(|w| filter.worker_group.as_deref().map(|g| g == w.worker_group).unwrap_or(true))
            .filter(|w| filter.heartbeat_since.map(|since| w.last_heartbeat_at >= since).unwrap_or(true))
            .cloned()
            .collect())
    }

    async fn deregister(&self, worker_id: &str) -> Result<(), StoreError> {
        let mut workers = self.workers.lock().unwrap();
        workers.retain(|w| w.id != worker_id);
        Ok(())
    }
}

/// Postgres-backed [`WorkerRegistry`] against the `workers` table.
pub struct PostgresWorkerRegistry {
    pool: PgPool,
}

impl PostgresWorkerRegistry {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WorkerRegistry for PostgresWorkerRegistry {
    async fn register(&self, worker: WorkerInfo) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO workers (
                id, worker_group, max_concurrency, current_load,
                accepting_tasks, started_at, last_heartbeat_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (id) DO UPDATE SET
                worker_group = EXCLUDED.worker_group,
                max_concurrency = EXCLUDED.max_concurrency,
                current_load = EXCLUDED.current_load,
                accepting_tasks = EXCLUDED.accepting_tasks,
                last_heartbeat_at = EXCLUDED.last_heartbeat_at
            "#,
        )
        .bind(&worker.id)
        .bind(&worker.worker_group)
        .bind(worker.max_concurrency as i32)
        .bind(worker.current_load as i32)
        .bind(worker.accepting_tasks)
        .bind(worker.started_at)
        .bind(worker.last_heartbeat_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn heartbeat(&self, worker_id: &str, current_load: u32, accepting_tasks: bool) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE workers
            SET current_load = $2, accepting_tasks = $3, last_heartbeat_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(worker_id)
        .bind(current_load as i32)
        .bind(accepting_tasks)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::Database(format!("unknown worker: {worker_id}")));
        }
        Ok(())
    }

    async fn list(&self, filter: WorkerFilter) -> Result<Vec<WorkerInfo>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, worker_group, max_concurrency, current_load,
                   accepting_tasks, started_at, last_heartbeat_at
            FROM workers
            WHERE ($1::TEXT IS NULL OR worker_group = $1)
              AND ($2::TIMESTAMPTZ IS NULL OR last_heartbeat_at >= $2)
            ORDER BY worker_group, id
            "#,
        )
        .bind(&filter.worker_group)
        .bind(filter.heartbeat_since)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| WorkerInfo {
                id: row.get("id"),
                worker_group: row.get("worker_group"),
                max_concurrency: row.get::<i32, _>("max_concurrency") as u32,
                current_load: row.get::<i32, _>("current_load") as u32,
                accepting_tasks: row.get("accepting_tasks"),
                started_at: row.get("started_at"),
                last_heartbeat_at: row.get("last_heartbeat_at"),
            })
            .collect())
    }

    async fn deregister(&self, worker_id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM workers WHERE id = $1").bind(worker_id).execute(&self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn worker(id: &str, group: &str) -> WorkerInfo {
        let now = Utc::now();
        WorkerInfo {
            id: id.to_string(),
            worker_group: group.to_string(),
            max_concurrency: 10,
            current_load: 0,
            accepting_tasks: true,
            started_at: now,
            last_heartbeat_at: now,
        }
    }

    #[tokio::test]
    async fn register_then_list_round_trips() {
        let registry = InMemoryWorkerRegistry::default();
        registry.register(worker("w1", "default")).await.unwrap();

        let listed = registry.list(WorkerFilter::default()).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, "w1");
    }

    #[tokio::test]
    async fn re_registering_same_id_upserts_rather_than_duplicates() {
        let registry = InMemoryWorkerRegistry::default();
        registry.register(worker("w1", "default")).await.unwrap();
        registry.register(worker("w1", "default")).await.unwrap();

        assert_eq!(registry.list(WorkerFilter::default()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn heartbeat_updates_load_and_acceptance() {
        let registry = InMemoryWorkerRegistry::default();
        registry.register(worker("w1", "default")).await.unwrap();

        registry.heartbeat("w1", 7, false).await.unwrap();

        let listed = registry.list(WorkerFilter::default()).await.unwrap();
        assert_eq!(listed[0].current_load, 7);
        assert!(!listed[0].accepting_tasks);
    }

    #[tokio::test]
    async fn heartbeat_for_unknown_worker_errs() {
        let registry = InMemoryWorkerRegistry::default();
        let err = registry.heartbeat("ghost", 1, true).await.unwrap_err();
        assert!(matches!(err, StoreError::Database(_)));
    }

    #[tokio::test]
    async fn list_filters_by_worker_group() {
        let registry = InMemoryWorkerRegistry::default();
        registry.register(worker("w1", "alpha")).await.unwrap();
        registry.register(worker("w2", "beta")).await.unwrap();

        let alpha = registry
            .list(WorkerFilter {
                worker_group: Some("alpha".to_string()),
                heartbeat_since: None,
            })
            .await
            .unwrap();
        assert_eq!(alpha.len(), 1);
        assert_eq!(alpha[0].id, "w1");
    }

    #[tokio::test]
    async fn deregister_removes_worker() {
        let registry = InMemoryWorkerRegistry::default();
        registry.register(worker("w1", "default")).await.unwrap();
        registry.deregister("w1").await.unwrap();

        assert!(registry.list(WorkerFilter::default()).await.unwrap().is_empty());
    }
}

//! Storage and caching of parsed workflow definitions, keyed by
//! `(name, version)`.
//!
//! A definition is parsed into a [`NodeTree`] exactly once per process per
//! `(name, version)` and then shared behind an [`Arc`] from the cache:
//! every instance of the same workflow reuses the same tree.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use sqlx::{PgPool, Row};
use tracing::{debug, instrument};

use crate::error::WorkflowError;
use crate::node::{parse_document, NodeTree};

#[derive(Debug, thiserror::Error)]
pub enum DefinitionError {
    #[error("definition not found: {name}@{version}")]
    NotFound { name: String, version: String },
    #[error("definition {name}@{version} failed to parse: {0}", name = .name, version = .version)]
    Invalid {
        name: String,
        version: String,
        #[source]
        source: WorkflowError,
    },
    #[error("database error: {0}")]
    Database(String),
}

impl From<sqlx::Error> for DefinitionError {
    fn from(err: sqlx::Error) -> Self {
        DefinitionError::Database(err.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct DefinitionRecord {
    pub name: String,
    pub version: String,
    pub document: Value,
}

/// Durable storage for raw workflow documents. The parsed, addressable
/// form lives only in [`DefinitionStore`]'s in-memory cache.
#[async_trait]
pub trait DefinitionRepository: Send + Sync {
    async fn get(&self, name: &str, version: &str) -> Result<DefinitionRecord, DefinitionError>;
    async fn put(&self, record: DefinitionRecord) -> Result<(), DefinitionError>;
    async fn delete(&self, name: &str, version: &str) -> Result<(), DefinitionError>;
}

/// Caching wrapper around a [`DefinitionRepository`]: parses each document
/// into a [`NodeTree`] once and shares it across every caller.
pub struct DefinitionStore<R> {
    repo: R,
    cache: DashMap<(String, String), Arc<NodeTree>>,
}

impl<R: DefinitionRepository> DefinitionStore<R> {
    pub fn new(repo: R) -> Self {
        Self {
            repo,
            cache: DashMap::new(),
        }
    }

    #[instrument(skip(self))]
    pub async fn get(&self, name: &str, version: &str) -> Result<Arc<NodeTree>, DefinitionError> {
        let key = (name.to_string(), version.to_string());
        if let Some(tree) = self.cache.get(&key) {
            return Ok(tree.clone());
        }

        let record = self.repo.get(name, version).await?;
        let tree = parse_document(&record.document).map_err(|source| DefinitionError::Invalid {
            name: name.to_string(),
            version: version.to_string(),
            source,
        })?;
        let tree = Arc::new(tree);
        self.cache.insert(key, tree.clone());
        debug!(name, version, "parsed and cached definition");
        Ok(tree)
    }

    pub async fn put(&self, record: DefinitionRecord) -> Result<(), DefinitionError> {
        let key = (record.name.clone(), record.version.clone());
        self.repo.put(record).await?;
        self.cache.remove(&key);
        Ok(())
    }

    pub async fn delete(&self, name: &str, version: &str) -> Result<(), DefinitionError> {
        self.repo.delete(name, version).await?;
        self.cache.remove(&(name.to_string(), version.to_string()));
        Ok(())
    }

    /// The raw document backing `(name, version)`, for building a
    /// [`crate::workflow_ctx::WorkflowContext`]. Always hits the
    /// repository: the tree cache only remembers the parsed form.
    pub async fn document(&self, name: &str, version: &str) -> Result<Value, DefinitionError> {
        Ok(self.repo.get(name, version).await?.document)
    }
}

/// In-memory [`DefinitionRepository`], used by tests and by the in-process
/// bus/consumer wiring.
#[derive(Default)]
pub struct InMemoryDefinitionRepository {
    records: DashMap<(String, String), DefinitionRecord>,
}

impl InMemoryDefinitionRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DefinitionRepository for InMemoryDefinitionRepository {
    async fn get(&self, name: &str, version: &str) -> Result<DefinitionRecord, DefinitionError> {
        self.records
            .get(&(name.to_string(), version.to_string()))
            .map(|r| r.clone())
            .ok_or_else(|| DefinitionError::NotFound {
                name: name.to_string(),
                version: version.to_string(),
            })
    }

    async fn put(&self, record: DefinitionRecord) -> Result<(), DefinitionError> {
        self.records
            .insert((record.name.clone(), record.version.clone()), record);
        Ok(())
    }

    async fn delete(&self, name: &str, version: &str) -> Result<(), DefinitionError> {
        self.records.remove(&(name.to_string(), version.to_string()));
        Ok(())
    }
}

/// Postgres-backed [`DefinitionRepository`] against the `definitions` table
/// (unique on `(name, version)`).
pub struct PostgresDefinitionRepository {
    pool: PgPool,
}

impl PostgresDefinitionRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DefinitionRepository for PostgresDefinitionRepository {
    #[instrument(skip(self))]
    async fn get(&self, name: &str, version: &str) -> Result<DefinitionRecord, DefinitionError> {
        let row = sqlx::query(
            r#"
            SELECT name, version, document
            FROM definitions
            WHERE name = $1 AND version = $2
            "#,
        )
        .bind(name)
        .bind(version)
        .fetch_optional(&self.pool)
        .await?;

        let row = row.ok_or_else(|| DefinitionError::NotFound {
            name: name.to_string(),
            version: version.to_string(),
        })?;

        Ok(DefinitionRecord {
            name: row.get("name"),
            version: row.get("version"),
            document: row.get("document"),
        })
    }

    #[instrument(skip(self, record))]
    async fn put(&self, record: DefinitionRecord) -> Result<(), DefinitionError> {
        sqlx::query(
            r#"
            INSERT INTO definitions (name, version, document)
            VALUES ($1, $2, $3)
            ON CONFLICT (name, version) DO UPDATE SET document = EXCLUDED.document
            "#,
        )
        .bind(&record.name)
        .bind(&record.version)
        .bind(&record.document)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, name: &str, version: &str) -> Result<(), DefinitionError> {
        sqlx::query("DELETE FROM definitions WHERE name = $1 AND version = $2")
            .bind(name)
            .bind(version)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc() -> Value {
        json!({"do": [{"first": {"set": {"value": "1"}}}]})
    }

    #[tokio::test]
    async fn caches_parsed_tree_across_calls() {
        let repo = InMemoryDefinitionRepository::new();
        repo.put(DefinitionRecord {
            name: "greet".into(),
            version: "1.0.0".into(),
            document: doc(),
        })
        .await
        .unwrap();

        let store = DefinitionStore::new(repo);
        let first = store.get("greet", "1.0.0").await.unwrap();
        let second = store.get("greet", "1.0.0").await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn missing_definition_is_not_found() {
        let store = DefinitionStore::new(InMemoryDefinitionRepository::new());
        let err = store.get("missing", "1.0.0").await.unwrap_err();
        assert!(matches!(err, DefinitionError::NotFound { .. }));
    }

    #[tokio::test]
    async fn put_invalidates_the_cache() {
        let repo = InMemoryDefinitionRepository::new();
        repo.put(DefinitionRecord {
            name: "greet".into(),
            version: "1.0.0".into(),
            document: doc(),
        })
        .await
        .unwrap();
        let store = DefinitionStore::new(repo);
        let first = store.get("greet", "1.0.0").await.unwrap();

        store
            .put(DefinitionRecord {
                name: "greet".into(),
                version: "1.0.0".into(),
                document: json!({"do": [{"first": {"set": {"value": "2"}}}, {"second": {"set": {"value": "3"}}}]}),
            })
            .await
            .unwrap();

        let second = store.get("greet", "1.0.0").await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
    }
}

//! Worker process entry point: wires the Postgres-backed stores, the
//! in-process bus, and the two outbox schedulers into one running
//! [`Consumer`].
//!
//! Configuration is entirely environment-driven (`RuntimeConfig::from_env`);
//! there is no CLI surface here — env vars in, `Result<()>` out.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

use workflow_runtime::activity::StandardDispatcher;
use workflow_runtime::bus::{Bus, InMemoryBus, WORKFLOWS_IN};
use workflow_runtime::config::RuntimeConfig;
use workflow_runtime::consumer::Consumer;
use workflow_runtime::dead_letter::PostgresDeadLetterStore;
use workflow_runtime::definitions::{DefinitionStore, PostgresDefinitionRepository};
use workflow_runtime::outbox::postgres::{OutboxTable, PostgresOutboxStore};
use workflow_runtime::outbox::scheduler::Scheduler;
use workflow_runtime::registry::{PostgresWorkerRegistry, WorkerInfo, WorkerRegistry};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("workflow_runtime=info,worker=info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = RuntimeConfig::from_env();
    let worker_id = std::env::var("WORKER_ID").unwrap_or_else(|_| format!("worker-{}", Uuid::now_v7()));
    let worker_group = std::env::var("WORKER_GROUP").unwrap_or_else(|_| "default".to_string());
    let max_concurrency: u32 = std::env::var("MAX_CONCURRENCY").ok().and_then(|v| v.parse().ok()).unwrap_or(10);

    info!(worker_id = %worker_id, worker_group = %worker_group, "starting workflow-runtime worker");

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .context("failed to connect to Postgres")?;
    sqlx::migrate!("./migrations").run(&pool).await.context("failed to run migrations")?;

    let definitions = Arc::new(DefinitionStore::new(PostgresDefinitionRepository::new(pool.clone())));
    let waits = Arc::new(PostgresOutboxStore::new(pool.clone(), OutboxTable::Waits));
    let retries = Arc::new(PostgresOutboxStore::new(pool.clone(), OutboxTable::Retries));
    let dead_letters = Arc::new(PostgresDeadLetterStore::new(pool.clone()));
    let registry = Arc::new(PostgresWorkerRegistry::new(pool.clone()));
    let bus: Arc<dyn Bus> = Arc::new(InMemoryBus::default());
    let dispatcher = Arc::new(StandardDispatcher::new());

    let consumer = Arc::new(Consumer::new(
        bus.clone(),
        definitions,
        dispatcher,
        waits.clone(),
        retries.clone(),
        dead_letters,
    ));

    registry
        .register(WorkerInfo {
            id: worker_id.clone(),
            worker_group,
            max_concurrency,
            current_load: 0,
            accepting_tasks: true,
            started_at: chrono::Utc::now(),
            last_heartbeat_at: chrono::Utc::now(),
        })
        .await
        .context("failed to register worker")?;

    let scheduler = Scheduler::new();
    let bus_for_waits = bus.clone();
    let waits_handle = scheduler.spawn_processor(waits.clone(), config.wait_outbox, move |message| {
        let bus = bus_for_waits.clone();
        async move { bus.publish(WORKFLOWS_IN, message).await.map_err(|e| e.to_string()) }
    });
    let bus_for_retries = bus.clone();
    let retries_handle = scheduler.spawn_processor(retries.clone(), config.retry_outbox, move |message| {
        let bus = bus_for_retries.clone();
        async move { bus.publish(WORKFLOWS_IN, message).await.map_err(|e| e.to_string()) }
    });
    let waits_cleanup_handle = scheduler.spawn_cleanup(waits, config.wait_outbox);
    let retries_cleanup_handle = scheduler.spawn_cleanup(retries, config.retry_outbox);

    let heartbeat_registry = registry.clone();
    let heartbeat_worker_id = worker_id.clone();
    let heartbeat_handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(5));
        loop {
            ticker.tick().await;
            if let Err(err) = heartbeat_registry.heartbeat(&heartbeat_worker_id, 0, true).await {
                warn!(error = %err, "worker heartbeat failed");
            }
        }
    });

    let flow_consumer = consumer.clone();
    let activity_consumer = consumer.clone();
    tokio::select! {
        _ = flow_consumer.run() => {
            info!("flow consumer loop exited (bus closed)");
        }
        _ = activity_consumer.run_activities() => {
            info!("activity consumer loop exited (bus closed)");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("received shutdown signal");
        }
    }

    waits_handle.abort();
    retries_handle.abort();
    waits_cleanup_handle.abort();
    retries_cleanup_handle.abort();
    heartbeat_handle.abort();
    registry.deregister(&worker_id).await.context("failed to deregister worker")?;

    info!("worker shutdown complete");
    Ok(())
}

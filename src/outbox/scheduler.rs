//! Interval-driven scheduling for one outbox table's processor and
//! cleanup passes: an external scheduler with skip-concurrent-execution
//! semantics, rather than a self-paced poll loop that free-runs on its own
//! thread.
//!
//! One logical poller per table, tunable cadence, a fixed
//! `poll_every`/`cleanup_every` period instead of adaptive backoff, and an
//! explicit "already running, skip this tick" guard in place of
//! claim-based concurrency control.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, warn};

use crate::config::OutboxConfig;
use crate::error::StoreError;
use crate::outbox::{cleanup_once, run_once, OutboxStore, Settlement};

use std::future::Future;
use uuid::Uuid;

/// Runs `run_once`/`cleanup_once` for a single outbox table on their own
/// tokio intervals for as long as the returned handle is held, skipping a
/// tick entirely if the previous one is still in flight instead of
/// queuing up concurrent passes over the same table.
pub struct Scheduler {
    processing: Arc<AtomicBool>,
    cleaning: Arc<AtomicBool>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            processing: Arc::new(AtomicBool::new(false)),
            cleaning: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Spawn the processing loop: every `config.poll_every`, claim and
    /// settle a batch via `send`, unless the prior tick is still running.
    pub fn spawn_processor<S, F, Fut>(&self, store: Arc<S>, config: OutboxConfig, send: F) -> tokio::task::JoinHandle<()>
    where
        S: OutboxStore + 'static,
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), String>> + Send,
    {
        let guard = self.processing.clone();
        let send = Arc::new(send);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(config.poll_every);
            loop {
                ticker.tick().await;
                if guard.swap(true, Ordering::SeqCst) {
                    debug!("outbox processing tick skipped: previous pass still running");
                    continue;
                }
                let store = store.clone();
                let config = config.processor;
                let send = send.clone();
                let result = run_pass(store, config, send).await;
                guard.store(false, Ordering::SeqCst);
                if let Err(err) = result {
                    warn!(error = %err, "outbox processing pass failed");
                }
            }
        })
    }

    /// Spawn the retention cleanup loop: every `config.cleanup_every`,
    /// delete `SENT` rows older than `config.retention`, unless the prior
    /// cleanup pass is still running.
    pub fn spawn_cleanup<S>(&self, store: Arc<S>, config: OutboxConfig) -> tokio::task::JoinHandle<()>
    where
        S: OutboxStore + 'static,
    {
        let guard = self.cleaning.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(config.cleanup_every);
            loop {
                ticker.tick().await;
                if guard.swap(true, Ordering::SeqCst) {
                    debug!("outbox cleanup tick skipped: previous pass still running");
                    continue;
                }
                let deleted = cleanup_once(store.as_ref(), config.retention, Utc::now(), config.cleanup_batch_size).await;
                guard.store(false, Ordering::SeqCst);
                match deleted {
                    Ok(n) if n > 0 => debug!(deleted = n, "outbox cleanup pass removed rows"),
                    Ok(_) => {}
                    Err(err) => warn!(error = %err, "outbox cleanup pass failed"),
                }
            }
        })
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

async fn run_pass<S, F, Fut>(store: Arc<S>, config: crate::outbox::ProcessorConfig, send: Arc<F>) -> Result<Vec<(Uuid, Settlement)>, StoreError>
where
    S: OutboxStore,
    F: Fn(String) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), String>> + Send,
{
    run_once(store.as_ref(), &config, Utc::now(), |msg| send(msg)).await
}

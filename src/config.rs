//! Environment-driven configuration for the outbox processors: the
//! `wait.outbox.*` / `retry.outbox.*` / `*.cleanup.*` knobs.
//!
//! A plain struct with a sensible `Default` plus a `from_env` constructor:
//! required settings `.expect(...)`, everything else defaulted.

use std::env;
use std::time::Duration;

use crate::outbox::ProcessorConfig;

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

/// One outbox table's processor + cleanup cadence.
#[derive(Debug, Clone, Copy)]
pub struct OutboxConfig {
    pub processor: ProcessorConfig,
    pub poll_every: Duration,
    pub cleanup_every: Duration,
    pub retention: Duration,
    pub cleanup_batch_size: usize,
}

impl OutboxConfig {
    fn from_env(prefix: &str) -> Self {
        Self {
            processor: ProcessorConfig {
                batch_size: env_usize(&format!("{prefix}_OUTBOX_BATCH_SIZE"), 100),
                max_attempts: env_u32(&format!("{prefix}_OUTBOX_MAX_ATTEMPTS"), 5),
                initial_delay: Duration::from_secs(env_u64(&format!("{prefix}_OUTBOX_INITIAL_DELAY_SECS"), 1)),
                empty_batch_limit: 3,
            },
            poll_every: Duration::from_secs(env_u64(&format!("{prefix}_OUTBOX_EVERY_SECS"), 5)),
            cleanup_every: Duration::from_secs(env_u64(&format!("{prefix}_CLEANUP_EVERY_SECS"), 3600)),
            retention: Duration::from_secs(env_u64(&format!("{prefix}_CLEANUP_AFTER_SECS"), 7 * 86_400)),
            cleanup_batch_size: env_usize(&format!("{prefix}_CLEANUP_BATCH_SIZE"), 500),
        }
    }
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            processor: ProcessorConfig::default(),
            poll_every: Duration::from_secs(5),
            cleanup_every: Duration::from_secs(3600),
            retention: Duration::from_secs(7 * 86_400),
            cleanup_batch_size: 500,
        }
    }
}

/// Top-level runtime configuration: database URL plus the two outbox
/// tables' tuning, collapsed into one struct since this crate has a
/// single worker surface.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub database_url: String,
    pub wait_outbox: OutboxConfig,
    pub retry_outbox: OutboxConfig,
}

impl RuntimeConfig {
    /// Load from the process environment, applying `.env` via `dotenvy`
    /// first and ignoring a missing file.
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        Self {
            database_url: env::var("DATABASE_URL").expect("DATABASE_URL must be set"),
            wait_outbox: OutboxConfig::from_env("WAIT"),
            retry_outbox: OutboxConfig::from_env("RETRY"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outbox_config_defaults_match_documented_table() {
        let config = OutboxConfig::default();
        assert_eq!(config.processor.batch_size, 100);
        assert_eq!(config.retention, Duration::from_secs(7 * 86_400));
    }

    #[test]
    fn outbox_config_reads_prefixed_env_vars() {
        // SAFETY: tests in this module run single-threaded within this
        // process's env namespace by convention; no other test touches
        // these keys.
        unsafe {
            env::set_var("WAIT_OUTBOX_BATCH_SIZE", "250");
        }
        let config = OutboxConfig::from_env("WAIT");
        assert_eq!(config.processor.batch_size, 250);
        unsafe {
            env::remove_var("WAIT_OUTBOX_BATCH_SIZE");
        }
    }
}

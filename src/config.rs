//! Engine configuration and environment-based component factory
//!
//! Every component takes a plain config struct with sensible defaults; the
//! factory builds the durable store from environment variables so tests,
//! development and production wire up the same way.

use crate::Result;
use object_store::{local::LocalFileSystem, memory::InMemory, ObjectStore};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Consistent-hash ring configuration
#[derive(Debug, Clone)]
pub struct RingConfig {
    /// Virtual nodes per shard; more vnodes means smoother balance at the
    /// cost of a larger ring
    pub vnodes_per_shard: u32,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            vnodes_per_shard: 128,
        }
    }
}

/// Router retry and fan-out configuration
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Attempts per operation against the owning shard
    pub max_retries: u32,
    /// Delay before the first retry
    pub retry_base_delay: Duration,
    /// Multiplier applied to the delay after each attempt
    pub retry_backoff_factor: f64,
    /// Ceiling on the per-attempt delay
    pub retry_max_delay: Duration,
    /// Per-attempt timeout for a single backend call
    pub op_timeout: Duration,
    /// Maximum shards dispatched to concurrently during fan-out
    pub max_fanout: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_base_delay: Duration::from_millis(50),
            retry_backoff_factor: 2.0,
            retry_max_delay: Duration::from_secs(1),
            op_timeout: Duration::from_secs(2),
            max_fanout: 32,
        }
    }
}

/// Migration coordinator configuration
#[derive(Debug, Clone)]
pub struct MigrationConfig {
    /// Keys copied per backfill batch
    pub batch_size: usize,
    /// Rate limit on backfill copying
    pub copy_rate_keys_per_sec: u64,
    /// How long after cutover before source copies are deleted
    pub quiescence_period: Duration,
    /// Pause after entering dual-write before backfill starts, letting
    /// in-flight single-destination writes land
    pub dual_write_settle: Duration,
    /// Per-call timeout against a shard backend during backfill and
    /// cleanup; a shard unresponsive past this fails the job
    pub backend_timeout: Duration,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            copy_rate_keys_per_sec: 50_000,
            quiescence_period: Duration::from_secs(30),
            dual_write_settle: Duration::from_millis(500),
            backend_timeout: Duration::from_secs(10),
        }
    }
}

/// Two-phase commit configuration
#[derive(Debug, Clone)]
pub struct TxnConfig {
    /// How long to wait for every participant's prepare vote
    pub prepare_timeout: Duration,
    /// Attempts to deliver commit/abort before recovery takes over
    pub delivery_retries: u32,
}

impl Default for TxnConfig {
    fn default() -> Self {
        Self {
            prepare_timeout: Duration::from_secs(5),
            delivery_retries: 3,
        }
    }
}

/// Registry health-check configuration
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Consecutive operation failures before a shard is marked degraded
    pub failure_threshold: u32,
    /// Consecutive missed health probes before a shard is marked dead
    pub dead_threshold: u32,
    /// Interval between health probe sweeps
    pub health_interval: Duration,
    /// Timeout for a single health probe
    pub probe_timeout: Duration,
    /// Window for rolling load averages
    pub load_window: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            dead_threshold: 3,
            health_interval: Duration::from_secs(5),
            probe_timeout: Duration::from_secs(2),
            load_window: Duration::from_secs(60),
        }
    }
}

/// Top-level configuration for the whole engine
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub ring: RingConfig,
    pub router: RouterConfig,
    pub migration: MigrationConfig,
    pub txn: TxnConfig,
    pub registry: RegistryConfig,
}

impl EngineConfig {
    /// Defaults with environment overrides applied.
    ///
    /// Environment variables:
    /// - RINGMASTER_VNODES_PER_SHARD: virtual nodes per shard (default: 128)
    /// - RINGMASTER_MIGRATION_BATCH_SIZE: keys per backfill batch (default: 1000)
    /// - RINGMASTER_COPY_RATE_KEYS_PER_SEC: backfill rate limit (default: 50000)
    /// - RINGMASTER_QUIESCENCE_SECS: post-cutover grace period (default: 30)
    /// - RINGMASTER_FAILURE_THRESHOLD: failures before degraded (default: 5)
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Some(vnodes) = env_parse::<u32>("RINGMASTER_VNODES_PER_SHARD")? {
            config.ring.vnodes_per_shard = vnodes;
        }
        if let Some(batch) = env_parse::<usize>("RINGMASTER_MIGRATION_BATCH_SIZE")? {
            config.migration.batch_size = batch;
        }
        if let Some(rate) = env_parse::<u64>("RINGMASTER_COPY_RATE_KEYS_PER_SEC")? {
            config.migration.copy_rate_keys_per_sec = rate;
        }
        if let Some(secs) = env_parse::<u64>("RINGMASTER_QUIESCENCE_SECS")? {
            config.migration.quiescence_period = Duration::from_secs(secs);
        }
        if let Some(threshold) = env_parse::<u32>("RINGMASTER_FAILURE_THRESHOLD")? {
            config.registry.failure_threshold = threshold;
        }
        Ok(config)
    }
}

fn env_parse<T: FromStr>(name: &str) -> Result<Option<T>> {
    match std::env::var(name) {
        Ok(raw) => raw.trim().parse::<T>().map(Some).map_err(|_| {
            crate::Error::Config(format!("Invalid value for {}: {}", name, raw))
        }),
        Err(_) => Ok(None),
    }
}

pub struct ComponentFactory;

impl ComponentFactory {
    /// Create the durable state store from environment
    ///
    /// Environment variables:
    /// - RINGMASTER_STORE: "memory" (default) or "file:/path/to/dir"
    pub fn create_state_store() -> Result<Arc<dyn ObjectStore>> {
        let backend = std::env::var("RINGMASTER_STORE").unwrap_or_else(|_| "memory".to_string());

        if backend == "memory" {
            info!("Using in-memory state store (development mode)");
            return Ok(Arc::new(InMemory::new()));
        }

        if let Some(path) = backend.strip_prefix("file:") {
            info!("Using filesystem state store at {}", path);
            let store = LocalFileSystem::new_with_prefix(path)
                .map_err(|e| crate::Error::Config(format!("Bad RINGMASTER_STORE path: {}", e)))?;
            return Ok(Arc::new(store));
        }

        Err(crate::Error::Config(format!(
            "Unknown RINGMASTER_STORE: {}. Use 'memory' or 'file:<path>'",
            backend
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.ring.vnodes_per_shard, 128);
        assert_eq!(config.router.max_retries, 3);
        assert_eq!(config.migration.batch_size, 1000);
        assert_eq!(config.migration.quiescence_period, Duration::from_secs(30));
        assert_eq!(config.txn.prepare_timeout, Duration::from_secs(5));
        assert_eq!(config.registry.failure_threshold, 5);
    }

    #[test]
    fn test_env_override_rejects_garbage() {
        std::env::set_var("RINGMASTER_VNODES_PER_SHARD", "not-a-number");
        let result = EngineConfig::from_env();
        std::env::remove_var("RINGMASTER_VNODES_PER_SHARD");
        assert!(result.is_err());
    }

    #[test]
    fn test_state_store_from_env() {
        std::env::remove_var("RINGMASTER_STORE");
        assert!(ComponentFactory::create_state_store().is_ok());

        let dir = tempfile::tempdir().unwrap();
        std::env::set_var("RINGMASTER_STORE", format!("file:{}", dir.path().display()));
        let on_disk = ComponentFactory::create_state_store();

        std::env::set_var("RINGMASTER_STORE", "carrier-pigeon");
        let rejected = ComponentFactory::create_state_store();
        std::env::remove_var("RINGMASTER_STORE");

        assert!(on_disk.is_ok());
        assert!(rejected.is_err());
    }
}

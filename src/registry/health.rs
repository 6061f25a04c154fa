//! Health probing and load tracking for registered shards
//!
//! A background loop probes every registered backend on an interval. A shard
//! that misses enough consecutive probes is marked dead; a later successful
//! probe brings it back.

use super::{ShardRegistry, ShardStatus};
use crate::backend::BackendPool;
use crate::{Error, Result, ShardId};
use metrics::gauge;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::{timeout, MissedTickBehavior};
use tracing::{error, info, warn};

/// Rolling average calculator
#[derive(Debug, Clone)]
pub struct RollingAverage {
    samples: VecDeque<(Instant, f64)>,
    window: Duration,
}

impl RollingAverage {
    pub fn new(window: Duration) -> Self {
        Self {
            samples: VecDeque::new(),
            window,
        }
    }

    pub fn add_sample(&mut self, value: f64) {
        let now = Instant::now();
        self.samples.push_back((now, value));

        // Remove old samples
        while let Some((time, _)) = self.samples.front() {
            if now.duration_since(*time) > self.window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn avg(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let sum: f64 = self.samples.iter().map(|(_, v)| v).sum();
        sum / self.samples.len() as f64
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Per-shard runtime health state
pub(super) struct ShardHealth {
    /// Consecutive failed operations, reset on any success
    pub(super) consecutive_failures: AtomicU32,
    /// Consecutive missed health probes, reset on any successful probe
    pub(super) probe_misses: AtomicU32,
    /// Rolling load samples
    pub(super) load: Mutex<RollingAverage>,
}

impl ShardHealth {
    pub(super) fn new(load_window: Duration) -> Self {
        Self {
            consecutive_failures: AtomicU32::new(0),
            probe_misses: AtomicU32::new(0),
            load: Mutex::new(RollingAverage::new(load_window)),
        }
    }
}

impl ShardRegistry {
    /// Probe a single shard's backend, bounded by the probe timeout.
    pub async fn probe_shard(&self, pool: &BackendPool, shard_id: &str) -> Result<()> {
        let backend = pool.get(shard_id)?;
        match timeout(self.config().probe_timeout, backend.health_check()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(Error::Timeout),
        }
    }

    /// Run periodic health probes until the registry shuts down.
    pub async fn run_health_checks(&self, pool: Arc<BackendPool>) {
        let mut interval = tokio::time::interval(self.config().health_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let shutdown = self.shutdown_token();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Health checker shutting down");
                    return;
                }
                _ = interval.tick() => {}
            }
            self.probe_all(&pool).await;
        }
    }

    pub(super) async fn probe_all(&self, pool: &BackendPool) {
        let shard_ids: Vec<ShardId> = self.shards.iter().map(|e| e.key().clone()).collect();

        for shard_id in shard_ids {
            match self.probe_shard(pool, &shard_id).await {
                Ok(()) => self.record_probe_success(&shard_id),
                Err(e) => self.record_probe_miss(&shard_id, &e),
            }
        }

        let stats = self.stats();
        gauge!(
            "ringmaster_shards_active",
            "service" => crate::telemetry::service(),
            "run_id" => crate::telemetry::run_id()
        )
        .set(stats.active_shards as f64);
        gauge!(
            "ringmaster_shards_degraded",
            "service" => crate::telemetry::service(),
            "run_id" => crate::telemetry::run_id()
        )
        .set(stats.degraded_shards as f64);
        gauge!(
            "ringmaster_shards_dead",
            "service" => crate::telemetry::service(),
            "run_id" => crate::telemetry::run_id()
        )
        .set(stats.dead_shards as f64);
    }

    fn record_probe_success(&self, shard_id: &str) {
        if let Some(health) = self.health.get(shard_id) {
            health.probe_misses.store(0, Ordering::Relaxed);
        }
        let was_dead = self
            .shards
            .get(shard_id)
            .map(|entry| entry.status == ShardStatus::Dead)
            .unwrap_or(false);
        if was_dead && self.update_status(shard_id, ShardStatus::Active).is_ok() {
            info!(shard_id, "Shard answering probes again, back in service");
        }
        self.record_success(shard_id);
    }

    fn record_probe_miss(&self, shard_id: &str, err: &Error) {
        let misses = match self.health.get(shard_id) {
            Some(health) => health.probe_misses.fetch_add(1, Ordering::Relaxed) + 1,
            None => return,
        };
        warn!(shard_id, misses, error = %err, "Health probe failed");

        if misses < self.config().dead_threshold {
            return;
        }
        let is_dead = self
            .shards
            .get(shard_id)
            .map(|entry| entry.status == ShardStatus::Dead)
            .unwrap_or(true);
        if !is_dead && self.update_status(shard_id, ShardStatus::Dead).is_ok() {
            error!(shard_id, misses, "Shard marked dead after missed probes");
            metrics::counter!(
                "ringmaster_shard_deaths_total",
                "service" => crate::telemetry::service(),
                "run_id" => crate::telemetry::run_id(),
                "shard_id" => shard_id.to_string()
            )
            .increment(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MemoryBackend, ShardBackend, TxnOp};
    use crate::config::RegistryConfig;
    use crate::registry::ShardDescriptor;
    use async_trait::async_trait;
    use bytes::Bytes;

    /// Backend whose health checks always fail.
    struct DownBackend;

    #[async_trait]
    impl ShardBackend for DownBackend {
        async fn get(&self, _key: &str) -> crate::Result<Option<Bytes>> {
            Ok(None)
        }
        async fn put(&self, _key: &str, _value: Bytes) -> crate::Result<()> {
            Ok(())
        }
        async fn delete(&self, _key: &str) -> crate::Result<()> {
            Ok(())
        }
        async fn scan_range(&self, _start: &str, _end: &str) -> crate::Result<Vec<(String, Bytes)>> {
            Ok(Vec::new())
        }
        async fn prepare(&self, _tx_id: &str, _ops: &[TxnOp]) -> crate::Result<()> {
            Ok(())
        }
        async fn commit(&self, _tx_id: &str) -> crate::Result<()> {
            Ok(())
        }
        async fn abort(&self, _tx_id: &str) -> crate::Result<()> {
            Ok(())
        }
        async fn health_check(&self) -> crate::Result<()> {
            Err(Error::ShardUnreachable {
                shard_id: "down".to_string(),
                detail: "connection refused".to_string(),
            })
        }
    }

    #[test]
    fn test_rolling_average() {
        let mut avg = RollingAverage::new(Duration::from_secs(60));

        avg.add_sample(10.0);
        avg.add_sample(20.0);
        avg.add_sample(30.0);

        assert_eq!(avg.avg(), 20.0);
        assert!(!avg.is_empty());
    }

    #[tokio::test]
    async fn test_missed_probes_mark_shard_dead() {
        let config = RegistryConfig {
            dead_threshold: 2,
            ..Default::default()
        };
        let registry = ShardRegistry::new(config);
        registry
            .register(ShardDescriptor::new("shard-a", "addr"))
            .unwrap();
        registry
            .update_status("shard-a", ShardStatus::Active)
            .unwrap();

        let pool = BackendPool::new();
        pool.register("shard-a", Arc::new(DownBackend));

        registry.probe_all(&pool).await;
        assert_eq!(registry.get("shard-a").unwrap().status, ShardStatus::Active);

        registry.probe_all(&pool).await;
        assert_eq!(registry.get("shard-a").unwrap().status, ShardStatus::Dead);
    }

    #[tokio::test]
    async fn test_probe_success_revives_dead_shard() {
        let registry = ShardRegistry::new(RegistryConfig::default());
        registry
            .register(ShardDescriptor::new("shard-a", "addr"))
            .unwrap();
        registry.update_status("shard-a", ShardStatus::Dead).unwrap();

        let pool = BackendPool::new();
        pool.register("shard-a", Arc::new(MemoryBackend::new()));

        registry.probe_all(&pool).await;
        assert_eq!(registry.get("shard-a").unwrap().status, ShardStatus::Active);
    }

    #[tokio::test]
    async fn test_health_loop_runs_until_shutdown() {
        let config = RegistryConfig {
            dead_threshold: 2,
            health_interval: Duration::from_millis(10),
            ..Default::default()
        };
        let registry = Arc::new(ShardRegistry::new(config));
        registry
            .register(ShardDescriptor::new("shard-a", "addr"))
            .unwrap();
        registry
            .update_status("shard-a", ShardStatus::Active)
            .unwrap();

        let pool = Arc::new(BackendPool::new());
        pool.register("shard-a", Arc::new(DownBackend));

        let loop_registry = registry.clone();
        let loop_pool = pool.clone();
        let handle =
            tokio::spawn(async move { loop_registry.run_health_checks(loop_pool).await });

        let mut dead = false;
        for _ in 0..200 {
            if registry.get("shard-a").unwrap().status == ShardStatus::Dead {
                dead = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(dead, "health loop never marked the shard dead");

        registry.shutdown_token().cancel();
        handle.await.unwrap();
    }
}

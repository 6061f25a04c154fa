//! Key-addressed request routing
//!
//! Resolves every key against the current ring snapshot, calls the owning
//! shard's backend with bounded retries, and reports shard health back to
//! the registry so the circuit breaker there can open and close. Writes
//! covered by a live migration are mirrored to both ends of the move.

use crate::backend::{BackendPool, ShardBackend};
use crate::config::RouterConfig;
use crate::migration::{MigrationJob, MigrationTable};
use crate::registry::{ShardRegistry, ShardStatus};
use crate::ring::HashRing;
use crate::{Error, Result, ShardId};
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use metrics::counter;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// One failed leg of a fan-out call.
#[derive(Debug, Clone)]
pub struct ShardFailure {
    pub shard_id: ShardId,
    pub error: String,
}

/// Merged result of a multi-key read. Keys absent from every shard are
/// simply missing from `values`; keys whose shard could not be reached
/// are covered by an entry in `failures`.
#[derive(Debug, Default)]
pub struct MultiGetResult {
    pub values: BTreeMap<String, Bytes>,
    pub failures: Vec<ShardFailure>,
}

impl MultiGetResult {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Merged result of a cross-shard scan, ordered by key.
#[derive(Debug, Default)]
pub struct ScanResult {
    pub entries: Vec<(String, Bytes)>,
    pub failures: Vec<ShardFailure>,
}

impl ScanResult {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

pub struct Router {
    ring: Arc<HashRing>,
    registry: Arc<ShardRegistry>,
    pool: Arc<BackendPool>,
    table: Arc<MigrationTable>,
    config: RouterConfig,
}

impl Router {
    pub fn new(
        ring: Arc<HashRing>,
        registry: Arc<ShardRegistry>,
        pool: Arc<BackendPool>,
        table: Arc<MigrationTable>,
        config: RouterConfig,
    ) -> Self {
        Self {
            ring,
            registry,
            pool,
            table,
            config,
        }
    }

    /// Shard currently authoritative for a key per the published ring.
    pub fn authority_of(&self, key: &str) -> Result<ShardId> {
        let snapshot = self.ring.snapshot();
        Ok(snapshot.owner_of(key)?.to_string())
    }

    pub async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let shard_id = self.authority_of(key)?;
        let owned = key.to_string();
        self.with_retries(&shard_id, "get", move |backend| {
            let key = owned.clone();
            async move { backend.get(&key).await }
        })
        .await
    }

    pub async fn put(&self, key: &str, value: Bytes) -> Result<()> {
        match self.table.dual_write_job_for(key) {
            Some(job) => self.dual_write(key, Some(value), &job).await,
            None => {
                let shard_id = self.authority_of(key)?;
                self.write_one(&shard_id, key, Some(value)).await
            }
        }
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        match self.table.dual_write_job_for(key) {
            Some(job) => self.dual_write(key, None, &job).await,
            None => {
                let shard_id = self.authority_of(key)?;
                self.write_one(&shard_id, key, None).await
            }
        }
    }

    /// Cancellation-aware put. If the token fires while the write is in
    /// flight, whether it applied on the shard is unknowable from here
    /// and is reported as such instead of guessed.
    pub async fn put_with_cancel(
        &self,
        key: &str,
        value: Bytes,
        cancel: &CancellationToken,
    ) -> Result<()> {
        tokio::select! {
            result = self.put(key, value) => result,
            _ = cancel.cancelled() => Err(Error::UnknownOutcome {
                operation: format!("put {}", key),
            }),
        }
    }

    /// Cancellation-aware delete, same outcome semantics as
    /// [`Router::put_with_cancel`].
    pub async fn delete_with_cancel(
        &self,
        key: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        tokio::select! {
            result = self.delete(key) => result,
            _ = cancel.cancelled() => Err(Error::UnknownOutcome {
                operation: format!("delete {}", key),
            }),
        }
    }

    /// Fetch a batch of keys, one concurrent leg per involved shard.
    /// Shards that cannot be reached appear in `failures`; the rest of
    /// the batch still comes back.
    pub async fn multi_get(&self, keys: &[String]) -> Result<MultiGetResult> {
        let mut by_shard: BTreeMap<ShardId, Vec<String>> = BTreeMap::new();
        for key in keys {
            by_shard
                .entry(self.authority_of(key)?)
                .or_default()
                .push(key.clone());
        }

        let outcomes = stream::iter(by_shard.into_iter().map(|(shard_id, shard_keys)| {
            async move {
                let result = self.shard_multi_get(&shard_id, &shard_keys).await;
                (shard_id, result)
            }
        }))
        .buffer_unordered(self.config.max_fanout.max(1))
        .collect::<Vec<_>>()
        .await;

        let mut result = MultiGetResult::default();
        for (shard_id, outcome) in outcomes {
            match outcome {
                Ok(found) => result.values.extend(found),
                Err(e) => {
                    warn!(shard_id = %shard_id, error = %e, "Multi-get leg failed");
                    result.failures.push(ShardFailure {
                        shard_id,
                        error: e.to_string(),
                    });
                }
            }
        }
        if !result.failures.is_empty() {
            counter!(
                "ringmaster_router_partial_results_total",
                "service" => crate::telemetry::service(),
                "run_id" => crate::telemetry::run_id(),
                "operation" => "multi_get"
            )
            .increment(1);
        }
        Ok(result)
    }

    /// Scan a key range across every shard the ring maps it to, merging
    /// per-shard results into key order. Shards touched by a migration
    /// can still hold copies of moved keys, so each returned key is kept
    /// only if the shard that produced it is its current owner.
    pub async fn scan(&self, start_key: &str, end_key: &str) -> Result<ScanResult> {
        let snapshot = self.ring.snapshot();
        let owners = snapshot.owners_for_range(start_key, end_key)?;

        let outcomes = stream::iter(owners.into_iter().map(|shard_id| {
            async move {
                let result = self.shard_scan(&shard_id, start_key, end_key).await;
                (shard_id, result)
            }
        }))
        .buffer_unordered(self.config.max_fanout.max(1))
        .collect::<Vec<_>>()
        .await;

        let mut entries = Vec::new();
        let mut failures = Vec::new();
        for (shard_id, outcome) in outcomes {
            match outcome {
                Ok(kvs) => {
                    for (key, value) in kvs {
                        if snapshot.owner_of(&key)? == shard_id {
                            entries.push((key, value));
                        }
                    }
                }
                Err(e) => {
                    warn!(shard_id = %shard_id, error = %e, "Scan leg failed");
                    failures.push(ShardFailure {
                        shard_id,
                        error: e.to_string(),
                    });
                }
            }
        }
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        if !failures.is_empty() {
            counter!(
                "ringmaster_router_partial_results_total",
                "service" => crate::telemetry::service(),
                "run_id" => crate::telemetry::run_id(),
                "operation" => "scan"
            )
            .increment(1);
        }
        Ok(ScanResult { entries, failures })
    }

    // ── Write paths ──────────────────────────────────────────────────

    /// While a migration covers the key both ends receive the write,
    /// source first. A failed mirror write is logged and reconciled by
    /// the backfill sweep; a failed source write fails the call.
    async fn dual_write(&self, key: &str, value: Option<Bytes>, job: &MigrationJob) -> Result<()> {
        self.write_one(&job.source_shard, key, value.clone()).await?;
        self.mirror_write(key, value, job).await;
        Ok(())
    }

    /// Mirror a write that already reached its owning shard onto the
    /// target of the migration dual-writing the key, if there is one.
    /// Transaction commits apply through participant stages rather than
    /// [`Router::put`], so the commit driver pushes the target copies
    /// through here after delivery.
    pub(crate) async fn mirror_applied_write(&self, key: &str, value: Option<Bytes>) {
        if let Some(job) = self.table.dual_write_job_for(key) {
            self.mirror_write(key, value, &job).await;
        }
    }

    async fn mirror_write(&self, key: &str, value: Option<Bytes>, job: &MigrationJob) {
        if let Err(e) = self.write_one(&job.target_shard, key, value).await {
            warn!(
                job_id = %job.job_id,
                key,
                shard_id = %job.target_shard,
                error = %e,
                "Dual-write mirror failed; backfill will reconcile"
            );
            counter!(
                "ringmaster_dual_write_misses_total",
                "service" => crate::telemetry::service(),
                "run_id" => crate::telemetry::run_id(),
                "shard_id" => job.target_shard.clone()
            )
            .increment(1);
        }
    }

    async fn write_one(&self, shard_id: &str, key: &str, value: Option<Bytes>) -> Result<()> {
        let operation = if value.is_some() { "put" } else { "delete" };
        let owned = key.to_string();
        self.with_retries(shard_id, operation, move |backend| {
            let key = owned.clone();
            let value = value.clone();
            async move {
                match value {
                    Some(value) => backend.put(&key, value).await,
                    None => backend.delete(&key).await,
                }
            }
        })
        .await
    }

    async fn shard_multi_get(
        &self,
        shard_id: &ShardId,
        keys: &[String],
    ) -> Result<Vec<(String, Bytes)>> {
        let mut found = Vec::with_capacity(keys.len());
        for key in keys {
            let owned = key.clone();
            let value = self
                .with_retries(shard_id, "get", move |backend| {
                    let key = owned.clone();
                    async move { backend.get(&key).await }
                })
                .await?;
            if let Some(value) = value {
                found.push((key.clone(), value));
            }
        }
        Ok(found)
    }

    async fn shard_scan(
        &self,
        shard_id: &ShardId,
        start_key: &str,
        end_key: &str,
    ) -> Result<Vec<(String, Bytes)>> {
        let start = start_key.to_string();
        let end = end_key.to_string();
        self.with_retries(shard_id, "scan", move |backend| {
            let start = start.clone();
            let end = end.clone();
            async move { backend.scan_range(&start, &end).await }
        })
        .await
    }

    // ── Retry core ───────────────────────────────────────────────────

    /// Run one backend call with the configured retry budget. Degraded
    /// and dead shards fast-fail without touching the backend; transient
    /// errors and timeouts are retried with exponential backoff and
    /// reported to the registry, everything else surfaces immediately.
    async fn with_retries<T, F, Fut>(&self, shard_id: &str, operation: &'static str, call: F) -> Result<T>
    where
        F: Fn(Arc<dyn ShardBackend>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let descriptor = self.registry.get(shard_id)?;
        match descriptor.status {
            ShardStatus::Degraded => {
                counter!(
                    "ringmaster_router_fast_fails_total",
                    "service" => crate::telemetry::service(),
                    "run_id" => crate::telemetry::run_id(),
                    "reason" => "degraded"
                )
                .increment(1);
                return Err(Error::ShardDegraded {
                    shard_id: shard_id.to_string(),
                });
            }
            ShardStatus::Dead => {
                counter!(
                    "ringmaster_router_fast_fails_total",
                    "service" => crate::telemetry::service(),
                    "run_id" => crate::telemetry::run_id(),
                    "reason" => "dead"
                )
                .increment(1);
                return Err(Error::ShardUnreachable {
                    shard_id: shard_id.to_string(),
                    detail: "shard marked dead".to_string(),
                });
            }
            _ => {}
        }

        let backend = self.pool.get(shard_id)?;
        self.registry.record_load(shard_id, 1.0);

        let mut delay = self.config.retry_base_delay;
        let mut last_err = None;
        for attempt in 0..self.config.max_retries {
            if attempt > 0 {
                tokio::time::sleep(delay).await;
                delay = delay
                    .mul_f64(self.config.retry_backoff_factor)
                    .min(self.config.retry_max_delay);
                counter!(
                    "ringmaster_router_retries_total",
                    "service" => crate::telemetry::service(),
                    "run_id" => crate::telemetry::run_id(),
                    "operation" => operation
                )
                .increment(1);
            }
            match timeout(self.config.op_timeout, call(backend.clone())).await {
                Ok(Ok(value)) => {
                    self.registry.record_success(shard_id);
                    return Ok(value);
                }
                Ok(Err(e)) if e.is_transient() => {
                    debug!(shard_id, operation, attempt, error = %e, "Transient shard error");
                    self.registry.record_failure(shard_id);
                    last_err = Some(e);
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    self.registry.record_failure(shard_id);
                    last_err = Some(Error::Timeout);
                }
            }
        }
        Err(last_err.unwrap_or(Error::TooManyRetries))
    }
}

//! Migration phase execution engine
//!
//! Drives jobs through the phase machine, persisting every transition
//! before acting on it. One task owns a job at a time; concurrent jobs for
//! disjoint ranges run in parallel. A coordinator restart picks up where
//! the records left off via `resume_all`.

use super::{JobStore, MigrationJob, MigrationPhase, MigrationTable};
use crate::backend::{BackendPool, ShardBackend};
use crate::clock::MonotonicStamper;
use crate::config::MigrationConfig;
use crate::persist;
use crate::rate_limit::TokenBucket;
use crate::registry::{ShardRegistry, ShardStatus};
use crate::ring::{HashRange, HashRing};
use crate::{Error, Result};
use bytes::Bytes;
use dashmap::DashSet;
use metrics::counter;
use object_store::ObjectStore;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{info, warn};

pub struct MigrationCoordinator {
    ring: Arc<HashRing>,
    registry: Arc<ShardRegistry>,
    pool: Arc<BackendPool>,
    table: Arc<MigrationTable>,
    jobs: JobStore,
    limiter: TokenBucket,
    stamper: MonotonicStamper,
    /// Job ids currently owned by a driving task
    driving: DashSet<String>,
    config: MigrationConfig,
}

impl MigrationCoordinator {
    pub fn new(
        ring: Arc<HashRing>,
        registry: Arc<ShardRegistry>,
        pool: Arc<BackendPool>,
        table: Arc<MigrationTable>,
        store: Arc<dyn ObjectStore>,
        config: MigrationConfig,
    ) -> Self {
        Self {
            ring,
            registry,
            pool,
            table,
            jobs: JobStore::new(store),
            limiter: TokenBucket::new(config.copy_rate_keys_per_sec),
            stamper: MonotonicStamper::new(),
            driving: DashSet::new(),
            config,
        }
    }

    /// Create and durably record a new job. Rejected with
    /// `MigrationConflict` if a live job already covers any of the ranges.
    pub async fn create_job(
        &self,
        source_shard: &str,
        target_shard: &str,
        ranges: Vec<HashRange>,
        vnodes: Vec<u32>,
        drain: bool,
    ) -> Result<MigrationJob> {
        if let Some(existing_job) = self.table.conflicting(&ranges) {
            return Err(Error::MigrationConflict { existing_job });
        }
        self.registry.get(source_shard)?;
        self.registry.get(target_shard)?;

        let job = MigrationJob::new(source_shard, target_shard, ranges, vnodes, drain);
        self.jobs.persist(&job).await?;
        self.table.update(job.clone());

        info!(
            job_id = %job.job_id,
            source = %job.source_shard,
            target = %job.target_shard,
            ranges = job.ranges.len(),
            drain,
            "Created migration job"
        );
        counter!(
            "ringmaster_migrations_started_total",
            "service" => crate::telemetry::service(),
            "run_id" => crate::telemetry::run_id()
        )
        .increment(1);
        Ok(job)
    }

    /// Drive a job to a terminal phase. Phase errors mark the job FAILED
    /// and return it; only persistence trouble while recording the failure
    /// surfaces as `Err`.
    pub async fn drive(&self, job_id: &str) -> Result<MigrationJob> {
        if !self.driving.insert(job_id.to_string()) {
            return Err(Error::Internal(format!(
                "migration {} is already being driven",
                job_id
            )));
        }
        let result = self.drive_inner(job_id).await;
        self.driving.remove(job_id);
        result
    }

    /// Drive a job on a background task.
    pub fn spawn_drive(self: &Arc<Self>, job_id: &str) -> JoinHandle<Result<MigrationJob>> {
        let coordinator = Arc::clone(self);
        let job_id = job_id.to_string();
        tokio::spawn(async move { coordinator.drive(&job_id).await })
    }

    /// Execute exactly one phase of a job. Mostly useful for operators
    /// stepping a stuck migration by hand.
    pub async fn run_phase(&self, job_id: &str) -> Result<MigrationJob> {
        if !self.driving.insert(job_id.to_string()) {
            return Err(Error::Internal(format!(
                "migration {} is already being driven",
                job_id
            )));
        }
        let result = self.run_phase_inner(job_id).await;
        self.driving.remove(job_id);
        result
    }

    async fn run_phase_inner(&self, job_id: &str) -> Result<MigrationJob> {
        let job = self.load_job(job_id).await?;
        if job.is_terminal() {
            return Ok(job);
        }
        let phase = job.phase;
        match self.step(job.clone()).await {
            Ok(next) => Ok(next),
            Err(e) => {
                warn!(job_id, phase = ?phase, error = %e, "Migration step failed");
                self.fail(job, e.to_string()).await
            }
        }
    }

    async fn drive_inner(&self, job_id: &str) -> Result<MigrationJob> {
        let mut job = self.load_job(job_id).await?;
        while !job.is_terminal() {
            let phase = job.phase;
            match self.step(job.clone()).await {
                Ok(next) => job = next,
                Err(e) => {
                    warn!(job_id, phase = ?phase, error = %e, "Migration step failed");
                    return self.fail(job, e.to_string()).await;
                }
            }
        }
        Ok(job)
    }

    /// Resume every job found on disk: terminal jobs are surfaced for
    /// acknowledgment, live ones are taken over under a fresh fence token
    /// and driven in the background.
    pub async fn resume_all(self: &Arc<Self>) -> Result<Vec<MigrationJob>> {
        let mut resumed = Vec::new();
        for mut job in self.jobs.list().await? {
            if job.is_terminal() {
                self.table.update(job.clone());
                resumed.push(job);
                continue;
            }
            job.fence_token = uuid::Uuid::new_v4().to_string();
            job.updated_at = self.stamper.now();
            self.jobs.persist(&job).await?;
            self.table.update(job.clone());
            info!(
                job_id = %job.job_id,
                phase = ?job.phase,
                fence = %job.fence_token,
                "Resuming migration"
            );
            self.spawn_drive(&job.job_id);
            resumed.push(job);
        }
        Ok(resumed)
    }

    pub async fn status(&self, job_id: &str) -> Result<MigrationJob> {
        self.load_job(job_id).await
    }

    pub fn list(&self) -> Vec<MigrationJob> {
        self.table.list()
    }

    /// Dispose of a terminal job's record. Jobs stay visible until an
    /// operator acknowledges them.
    pub async fn acknowledge(&self, job_id: &str) -> Result<()> {
        let job = self.load_job(job_id).await?;
        if !job.is_terminal() {
            return Err(Error::Internal(format!(
                "migration {} still in phase {:?}",
                job_id, job.phase
            )));
        }
        self.jobs.remove(job_id).await?;
        self.table.remove(job_id);
        info!(job_id, "Migration record acknowledged and removed");
        Ok(())
    }

    async fn load_job(&self, job_id: &str) -> Result<MigrationJob> {
        if let Some(job) = self.table.get(job_id) {
            return Ok(job);
        }
        match self.jobs.load(job_id).await? {
            Some(job) => {
                self.table.update(job.clone());
                Ok(job)
            }
            None => Err(Error::JobNotFound(job_id.to_string())),
        }
    }

    // ── Phase execution ──────────────────────────────────────────────

    async fn step(&self, job: MigrationJob) -> Result<MigrationJob> {
        match job.phase {
            MigrationPhase::Pending => self.run_pending(job).await,
            MigrationPhase::DualWrite => self.run_dual_write(job).await,
            MigrationPhase::Backfilling => self.run_backfill(job).await,
            MigrationPhase::Cutover => self.run_cutover(job).await,
            MigrationPhase::Cleanup => self.run_cleanup(job).await,
            MigrationPhase::Done | MigrationPhase::Failed => Ok(job),
        }
    }

    /// Persist the next phase, then let the caller act on it.
    async fn advance(&self, mut job: MigrationJob, next: MigrationPhase) -> Result<MigrationJob> {
        info!(job_id = %job.job_id, from = ?job.phase, to = ?next, "Migration phase transition");
        job.phase = next;
        job.updated_at = self.stamper.now();
        self.jobs.persist(&job).await?;
        self.table.update(job.clone());
        counter!(
            "ringmaster_migration_transitions_total",
            "service" => crate::telemetry::service(),
            "run_id" => crate::telemetry::run_id(),
            "to" => format!("{:?}", next)
        )
        .increment(1);
        Ok(job)
    }

    async fn fail(&self, mut job: MigrationJob, reason: String) -> Result<MigrationJob> {
        warn!(job_id = %job.job_id, phase = ?job.phase, reason = %reason, "Migration failed");
        // Record which phase broke; the phase field itself becomes FAILED.
        job.failure = Some(format!("{:?}: {}", job.phase, reason));
        job.phase = MigrationPhase::Failed;
        job.updated_at = self.stamper.now();
        self.jobs.persist(&job).await?;
        self.table.update(job.clone());
        counter!(
            "ringmaster_migrations_failed_total",
            "service" => crate::telemetry::service(),
            "run_id" => crate::telemetry::run_id()
        )
        .increment(1);
        Ok(job)
    }

    async fn run_pending(&self, job: MigrationJob) -> Result<MigrationJob> {
        // Both ends must exist before anything moves.
        self.registry.get(&job.source_shard)?;
        self.registry.get(&job.target_shard)?;
        info!(
            job_id = %job.job_id,
            source = %job.source_shard,
            target = %job.target_shard,
            "Phase 1/4: entering dual-write"
        );
        self.advance(job, MigrationPhase::DualWrite).await
    }

    async fn run_dual_write(&self, job: MigrationJob) -> Result<MigrationJob> {
        // The router started mirroring writes the moment the DUAL_WRITE
        // record hit the table; the settle pause lets writes that resolved
        // their destination before that drain out.
        info!(job_id = %job.job_id, "Dual-write active, letting in-flight writes settle");
        tokio::time::sleep(self.config.dual_write_settle).await;
        self.advance(job, MigrationPhase::Backfilling).await
    }

    async fn run_backfill(&self, mut job: MigrationJob) -> Result<MigrationJob> {
        info!(
            job_id = %job.job_id,
            source = %job.source_shard,
            target = %job.target_shard,
            resume_from = job.high_water_mark.as_deref().unwrap_or("<start>"),
            "Phase 2/4: backfilling"
        );
        let source = self.pool.get(&job.source_shard)?;
        let target = self.pool.get(&job.target_shard)?;

        let start = job.high_water_mark.clone().unwrap_or_default();
        let page = self.scan_all(&source, &start).await?;
        let pending: Vec<(String, Bytes)> = page
            .into_iter()
            .filter(|(key, _)| {
                job.high_water_mark
                    .as_deref()
                    .map_or(true, |mark| key.as_str() > mark)
            })
            .filter(|(key, _)| job.covers_key(key))
            .collect();

        let total = pending.len();
        if total == 0 {
            info!(job_id = %job.job_id, "No keys left to backfill");
        }

        let mut copied = 0usize;
        for chunk in pending.chunks(self.config.batch_size.max(1)) {
            self.limiter.throttle(chunk.len() as u64).await;
            for (key, value) in chunk {
                self.copy_with_retry(&target, key, value.clone()).await?;
            }
            copied += chunk.len();
            job.copied_keys += chunk.len() as u64;
            job.high_water_mark = chunk.last().map(|(key, _)| key.clone());
            job.updated_at = self.stamper.now();
            self.jobs.persist(&job).await?;
            self.table.update(job.clone());

            info!(
                job_id = %job.job_id,
                "Backfill progress: {:.1}% ({}/{})",
                copied as f64 / total as f64 * 100.0,
                copied,
                total
            );
        }
        counter!(
            "ringmaster_backfill_keys_total",
            "service" => crate::telemetry::service(),
            "run_id" => crate::telemetry::run_id()
        )
        .increment(copied as u64);

        // Catch-up sweep: re-read the moving ranges in both directions and
        // heal anything the copy missed or wrote back, so the target is
        // current to within one in-flight dual-write before ownership
        // flips.
        let healed = self.verify_and_heal(&job, &source, &target).await?;
        if healed > 0 {
            info!(job_id = %job.job_id, healed, "Verification sweep healed keys");
        }

        self.advance(job, MigrationPhase::Cutover).await
    }

    async fn run_cutover(&self, mut job: MigrationJob) -> Result<MigrationJob> {
        let entries = job.flip_entries();
        let snapshot = self.ring.snapshot();
        let already_flipped = if job.drain {
            entries
                .iter()
                .all(|e| !snapshot.contains_entry(&e.shard_id, e.vnode))
        } else {
            entries
                .iter()
                .all(|e| snapshot.contains_entry(&e.shard_id, e.vnode))
        };

        if already_flipped {
            info!(job_id = %job.job_id, "Phase 3/4: ring already flipped, resuming past cutover");
        } else {
            info!(
                job_id = %job.job_id,
                vnodes = job.vnodes.len(),
                drain = job.drain,
                "Phase 3/4: flipping ring ownership"
            );
            let drain = job.drain;
            let source = job.source_shard.clone();
            let vnodes = job.vnodes.clone();
            self.ring
                .update(move |current| {
                    if drain {
                        current.with_entries_removed(&source, &vnodes)
                    } else {
                        current.with_entries_added(entries)
                    }
                })
                .await?;
        }

        if job.cutover_at.is_none() {
            job.cutover_at = Some(self.stamper.now());
        }
        counter!(
            "ringmaster_migration_cutovers_total",
            "service" => crate::telemetry::service(),
            "run_id" => crate::telemetry::run_id()
        )
        .increment(1);
        self.advance(job, MigrationPhase::Cleanup).await
    }

    async fn run_cleanup(&self, job: MigrationJob) -> Result<MigrationJob> {
        // Let requests routed against the pre-cutover snapshot drain
        // before their data disappears from the source.
        if let Some(cutover_at) = job.cutover_at {
            let elapsed = (self.stamper.now() - cutover_at)
                .to_std()
                .unwrap_or(Duration::ZERO);
            if elapsed < self.config.quiescence_period {
                let remaining = self.config.quiescence_period - elapsed;
                info!(job_id = %job.job_id, ?remaining, "Phase 4/4: waiting out quiescence period");
                tokio::time::sleep(remaining).await;
            }
        }

        let source = self.pool.get(&job.source_shard)?;
        let page = self.scan_all(&source, "").await?;
        let mut deleted = 0u64;
        for (key, _) in page {
            if !job.covers_key(&key) {
                continue;
            }
            match timeout(self.config.backend_timeout, source.delete(&key)).await {
                Ok(Ok(())) => deleted += 1,
                Ok(Err(e)) => {
                    warn!(job_id = %job.job_id, key, error = %e, "Failed to delete migrated key from source")
                }
                Err(_) => {
                    warn!(job_id = %job.job_id, key, "Timed out deleting migrated key from source")
                }
            }
        }
        info!(job_id = %job.job_id, deleted, "Deleted migrated source copies");

        if !job.drain {
            self.registry
                .update_status(&job.target_shard, ShardStatus::Active)?;
        }

        let job = self.advance(job, MigrationPhase::Done).await?;
        info!(job_id = %job.job_id, copied = job.copied_keys, "Migration complete");
        counter!(
            "ringmaster_migrations_completed_total",
            "service" => crate::telemetry::service(),
            "run_id" => crate::telemetry::run_id()
        )
        .increment(1);
        Ok(job)
    }

    // ── Backend plumbing ─────────────────────────────────────────────

    async fn scan_all(
        &self,
        backend: &Arc<dyn ShardBackend>,
        start: &str,
    ) -> Result<Vec<(String, Bytes)>> {
        timeout(self.config.backend_timeout, backend.scan_range(start, ""))
            .await
            .map_err(|_| Error::Timeout)?
    }

    async fn copy_with_retry(
        &self,
        target: &Arc<dyn ShardBackend>,
        key: &str,
        value: Bytes,
    ) -> Result<()> {
        let mut last_err = None;
        for attempt in 0..3 {
            if attempt > 0 {
                tokio::time::sleep(persist::backoff_delay(attempt - 1)).await;
            }
            match timeout(self.config.backend_timeout, target.put(key, value.clone())).await {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(e)) if e.is_transient() => last_err = Some(e),
                Ok(Err(e)) => return Err(e),
                Err(_) => last_err = Some(Error::Timeout),
            }
        }
        Err(last_err.unwrap_or(Error::TooManyRetries))
    }

    async fn verify_and_heal(
        &self,
        job: &MigrationJob,
        source: &Arc<dyn ShardBackend>,
        target: &Arc<dyn ShardBackend>,
    ) -> Result<u64> {
        let page = self.scan_all(source, "").await?;
        let mut healed = 0u64;
        let mut source_keys = HashSet::new();
        for (key, value) in page {
            if !job.covers_key(&key) {
                continue;
            }
            let current = timeout(self.config.backend_timeout, target.get(&key))
                .await
                .map_err(|_| Error::Timeout)??;
            if current.as_ref() != Some(&value) {
                self.copy_with_retry(target, &key, value).await?;
                healed += 1;
            }
            source_keys.insert(key);
        }

        // The reverse direction: a covered key on the target that the
        // source no longer holds was deleted mid-backfill, and the stale
        // page copy may have written it back. The source is re-read right
        // before each removal so a write that landed after the page scan
        // survives.
        let target_page = self.scan_all(target, "").await?;
        for (key, _) in target_page {
            if !job.covers_key(&key) || source_keys.contains(&key) {
                continue;
            }
            let current = timeout(self.config.backend_timeout, source.get(&key))
                .await
                .map_err(|_| Error::Timeout)??;
            if current.is_none() {
                self.delete_with_retry(target, &key).await?;
                healed += 1;
            }
        }
        Ok(healed)
    }

    async fn delete_with_retry(&self, target: &Arc<dyn ShardBackend>, key: &str) -> Result<()> {
        let mut last_err = None;
        for attempt in 0..3 {
            if attempt > 0 {
                tokio::time::sleep(persist::backoff_delay(attempt - 1)).await;
            }
            match timeout(self.config.backend_timeout, target.delete(key)).await {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(e)) if e.is_transient() => last_err = Some(e),
                Ok(Err(e)) => return Err(e),
                Err(_) => last_err = Some(Error::Timeout),
            }
        }
        Err(last_err.unwrap_or(Error::TooManyRetries))
    }
}

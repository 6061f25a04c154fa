//! Operator control plane
//!
//! The only entry points that mutate topology. Adding a shard turns the
//! ring's takeover plan into migration jobs, one per current owner;
//! removing one does the same with a drain plan. Everything else is
//! driven by the migration coordinator from there.

use crate::backend::{BackendPool, ShardBackend};
use crate::migration::{MigrationCoordinator, MigrationJob};
use crate::registry::{RegistryStats, ShardDescriptor, ShardRegistry, ShardStatus};
use crate::ring::{HashRing, VnodeHandoff};
use crate::{Error, Result, ShardId};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

pub struct ControlPlane {
    registry: Arc<ShardRegistry>,
    ring: Arc<HashRing>,
    pool: Arc<BackendPool>,
    migrations: Arc<MigrationCoordinator>,
    /// Serializes topology mutations; the data path never takes it.
    topology_lock: Mutex<()>,
}

impl ControlPlane {
    pub fn new(
        registry: Arc<ShardRegistry>,
        ring: Arc<HashRing>,
        pool: Arc<BackendPool>,
        migrations: Arc<MigrationCoordinator>,
    ) -> Self {
        Self {
            registry,
            ring,
            pool,
            migrations,
            topology_lock: Mutex::new(()),
        }
    }

    /// Admit a shard. The first shard bootstraps the ring directly and
    /// is immediately ACTIVE; later ones join in JOINING and receive
    /// their vnode ranges through the returned migration jobs, which are
    /// already being driven in the background.
    pub async fn add_shard(
        &self,
        descriptor: ShardDescriptor,
        backend: Arc<dyn ShardBackend>,
    ) -> Result<Vec<MigrationJob>> {
        let _guard = self.topology_lock.lock().await;
        let shard_id = descriptor.shard_id.clone();
        self.registry.register(descriptor)?;
        self.pool.register(&shard_id, backend);
        info!(shard_id = %shard_id, "Admitting shard");

        let snapshot = self.ring.snapshot();
        if snapshot.is_empty() {
            let added = shard_id.clone();
            self.ring
                .update(move |current| current.with_shard_added(&added))
                .await?;
            self.registry.update_status(&shard_id, ShardStatus::Active)?;
            info!(shard_id = %shard_id, "Bootstrapped ring with first shard");
            return Ok(Vec::new());
        }

        let handoffs = snapshot.takeover_plan(&shard_id)?;
        let jobs = self
            .plan_jobs(handoffs, |peer| (peer.clone(), shard_id.clone()), false)
            .await?;
        info!(shard_id = %shard_id, jobs = jobs.len(), "Planned takeover migrations");
        Ok(jobs)
    }

    /// Drain a shard and hand its ranges to the survivors. Refused when
    /// the shard cannot be probed right now: removing an unreachable
    /// shard would silently drop whatever data only it holds.
    pub async fn remove_shard(&self, shard_id: &str) -> Result<Vec<MigrationJob>> {
        let _guard = self.topology_lock.lock().await;
        self.registry.get(shard_id)?;

        let snapshot = self.ring.snapshot();
        if snapshot.contains_shard(shard_id) && snapshot.shard_ids().len() == 1 {
            return Err(Error::MigrationFailed {
                reason: format!("{} is the last shard in the ring", shard_id),
            });
        }
        if let Err(e) = self.registry.probe_shard(&self.pool, shard_id).await {
            warn!(shard_id, error = %e, "Refusing to drain unreachable shard");
            return Err(Error::MigrationFailed {
                reason: format!("{} is unreachable: {}", shard_id, e),
            });
        }

        self.registry
            .update_status(shard_id, ShardStatus::Draining)?;
        let handoffs = snapshot.drain_plan(shard_id)?;
        let jobs = self
            .plan_jobs(handoffs, |peer| (shard_id.to_string(), peer.clone()), true)
            .await?;
        info!(shard_id, jobs = jobs.len(), "Planned drain migrations");
        Ok(jobs)
    }

    /// Complete a drain once every job moving data off the shard is
    /// done: the shard leaves the registry and the pool. Refused while
    /// the ring still maps ranges to it or a job still references it.
    pub async fn finish_drain(&self, shard_id: &str) -> Result<ShardDescriptor> {
        let _guard = self.topology_lock.lock().await;
        let descriptor = self.registry.get(shard_id)?;
        if descriptor.status != ShardStatus::Draining {
            return Err(Error::MigrationFailed {
                reason: format!("{} is not draining", shard_id),
            });
        }
        if self.ring.snapshot().contains_shard(shard_id) {
            return Err(Error::MigrationFailed {
                reason: format!("{} still owns ring ranges", shard_id),
            });
        }
        for job in self.migrations.list() {
            if !job.is_terminal()
                && (job.source_shard == shard_id || job.target_shard == shard_id)
            {
                return Err(Error::MigrationFailed {
                    reason: format!("{} still referenced by job {}", shard_id, job.job_id),
                });
            }
        }

        let descriptor = self.registry.deregister(shard_id)?;
        self.pool.deregister(shard_id);
        info!(shard_id, "Shard drained and removed");
        Ok(descriptor)
    }

    pub async fn migration_status(&self, job_id: &str) -> Result<MigrationJob> {
        self.migrations.status(job_id).await
    }

    pub fn list_migrations(&self) -> Vec<MigrationJob> {
        self.migrations.list()
    }

    pub async fn acknowledge_migration(&self, job_id: &str) -> Result<()> {
        self.migrations.acknowledge(job_id).await
    }

    pub fn list_shards(&self) -> Vec<ShardDescriptor> {
        self.registry.list()
    }

    pub fn stats(&self) -> RegistryStats {
        self.registry.stats()
    }

    /// Group handoffs by peer and create one driving job per (source,
    /// target) pair. `direction` maps a peer to that pair.
    async fn plan_jobs<F>(
        &self,
        handoffs: Vec<VnodeHandoff>,
        direction: F,
        drain: bool,
    ) -> Result<Vec<MigrationJob>>
    where
        F: Fn(&ShardId) -> (ShardId, ShardId),
    {
        let mut by_peer: BTreeMap<ShardId, Vec<VnodeHandoff>> = BTreeMap::new();
        for handoff in handoffs {
            by_peer
                .entry(handoff.peer.clone())
                .or_default()
                .push(handoff);
        }

        let mut jobs = Vec::with_capacity(by_peer.len());
        for (peer, handoffs) in by_peer {
            let (source, target) = direction(&peer);
            let ranges = handoffs.iter().map(|h| h.range).collect();
            let vnodes = handoffs.iter().map(|h| h.entry.vnode).collect();
            let job = self
                .migrations
                .create_job(&source, &target, ranges, vnodes, drain)
                .await?;
            self.migrations.spawn_drive(&job.job_id);
            jobs.push(job);
        }
        Ok(jobs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::config::{MigrationConfig, RegistryConfig, RingConfig};
    use crate::migration::{MigrationPhase, MigrationTable};
    use async_trait::async_trait;
    use bytes::Bytes;
    use crate::backend::TxnOp;
    use object_store::memory::InMemory;
    use object_store::ObjectStore;
    use std::time::Duration;

    struct DeadBackend;

    #[async_trait]
    impl ShardBackend for DeadBackend {
        async fn get(&self, _key: &str) -> Result<Option<Bytes>> {
            Err(unreachable_err())
        }

        async fn put(&self, _key: &str, _value: Bytes) -> Result<()> {
            Err(unreachable_err())
        }

        async fn delete(&self, _key: &str) -> Result<()> {
            Err(unreachable_err())
        }

        async fn scan_range(&self, _start: &str, _end: &str) -> Result<Vec<(String, Bytes)>> {
            Err(unreachable_err())
        }

        async fn prepare(&self, _tx_id: &str, _ops: &[TxnOp]) -> Result<()> {
            Err(unreachable_err())
        }

        async fn commit(&self, _tx_id: &str) -> Result<()> {
            Err(unreachable_err())
        }

        async fn abort(&self, _tx_id: &str) -> Result<()> {
            Err(unreachable_err())
        }

        async fn health_check(&self) -> Result<()> {
            Err(unreachable_err())
        }
    }

    fn unreachable_err() -> Error {
        Error::ShardUnreachable {
            shard_id: "down".to_string(),
            detail: "connection refused".to_string(),
        }
    }

    struct Fixture {
        control: ControlPlane,
        coordinator: Arc<MigrationCoordinator>,
        registry: Arc<ShardRegistry>,
        ring: Arc<HashRing>,
        pool: Arc<BackendPool>,
    }

    async fn fixture() -> Fixture {
        let registry = Arc::new(ShardRegistry::new(RegistryConfig::default()));
        let pool = Arc::new(BackendPool::new());
        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let ring = Arc::new(
            HashRing::open(registry.clone(), store.clone(), RingConfig::default())
                .await
                .unwrap(),
        );
        let coordinator = Arc::new(MigrationCoordinator::new(
            ring.clone(),
            registry.clone(),
            pool.clone(),
            Arc::new(MigrationTable::new()),
            store,
            MigrationConfig {
                quiescence_period: Duration::from_millis(5),
                dual_write_settle: Duration::from_millis(1),
                ..Default::default()
            },
        ));
        let control = ControlPlane::new(
            registry.clone(),
            ring.clone(),
            pool.clone(),
            coordinator.clone(),
        );
        Fixture {
            control,
            coordinator,
            registry,
            ring,
            pool,
        }
    }

    async fn wait_terminal(coordinator: &MigrationCoordinator, job_id: &str) -> MigrationJob {
        for _ in 0..500 {
            let job = coordinator.status(job_id).await.unwrap();
            if job.is_terminal() {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("migration {} never reached a terminal phase", job_id);
    }

    #[tokio::test]
    async fn test_first_shard_bootstraps_without_migration() {
        let fx = fixture().await;
        let jobs = fx
            .control
            .add_shard(
                ShardDescriptor::new("shard-a", "10.0.0.1:7000"),
                Arc::new(MemoryBackend::new()),
            )
            .await
            .unwrap();

        assert!(jobs.is_empty());
        let snapshot = fx.ring.snapshot();
        assert_eq!(snapshot.shard_ids(), vec!["shard-a".to_string()]);
        assert_eq!(
            fx.registry.get("shard-a").unwrap().status,
            ShardStatus::Active
        );
    }

    #[tokio::test]
    async fn test_second_shard_joins_through_migrations() {
        let fx = fixture().await;
        fx.control
            .add_shard(
                ShardDescriptor::new("shard-a", "addr"),
                Arc::new(MemoryBackend::new()),
            )
            .await
            .unwrap();

        let jobs = fx
            .control
            .add_shard(
                ShardDescriptor::new("shard-b", "addr"),
                Arc::new(MemoryBackend::new()),
            )
            .await
            .unwrap();
        // One current owner, so one takeover job.
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].source_shard, "shard-a");
        assert_eq!(jobs[0].target_shard, "shard-b");
        assert!(!jobs[0].drain);

        let done = wait_terminal(&fx.coordinator, &jobs[0].job_id).await;
        assert_eq!(done.phase, MigrationPhase::Done);

        let snapshot = fx.ring.snapshot();
        assert!(snapshot.contains_shard("shard-b"));
        assert_eq!(
            fx.registry.get("shard-b").unwrap().status,
            ShardStatus::Active
        );
    }

    #[tokio::test]
    async fn test_remove_unreachable_shard_is_rejected() {
        let fx = fixture().await;
        fx.control
            .add_shard(
                ShardDescriptor::new("shard-a", "addr"),
                Arc::new(MemoryBackend::new()),
            )
            .await
            .unwrap();
        fx.control
            .add_shard(ShardDescriptor::new("shard-b", "addr"), Arc::new(DeadBackend))
            .await
            .unwrap();

        match fx.control.remove_shard("shard-b").await {
            Err(Error::MigrationFailed { reason }) => {
                assert!(reason.contains("unreachable"))
            }
            other => panic!("expected MigrationFailed, got {:?}", other),
        }
        // Rejection leaves the shard's status alone.
        assert_ne!(
            fx.registry.get("shard-b").unwrap().status,
            ShardStatus::Draining
        );
    }

    #[tokio::test]
    async fn test_last_shard_cannot_be_removed() {
        let fx = fixture().await;
        fx.control
            .add_shard(
                ShardDescriptor::new("shard-a", "addr"),
                Arc::new(MemoryBackend::new()),
            )
            .await
            .unwrap();

        match fx.control.remove_shard("shard-a").await {
            Err(Error::MigrationFailed { reason }) => {
                assert!(reason.contains("last shard"))
            }
            other => panic!("expected MigrationFailed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_drain_hands_ranges_to_survivor_then_removes() {
        let fx = fixture().await;
        let backend_a = Arc::new(MemoryBackend::new());
        let backend_b = Arc::new(MemoryBackend::new());
        fx.control
            .add_shard(ShardDescriptor::new("shard-a", "addr"), backend_a.clone())
            .await
            .unwrap();
        let join_jobs = fx
            .control
            .add_shard(ShardDescriptor::new("shard-b", "addr"), backend_b.clone())
            .await
            .unwrap();
        for job in &join_jobs {
            wait_terminal(&fx.coordinator, &job.job_id).await;
        }

        // Seed data through the backends where the ring puts it.
        let snapshot = fx.ring.snapshot();
        for i in 0..50 {
            let key = format!("key:{}", i);
            let owner = snapshot.owner_of(&key).unwrap().to_string();
            let backend: &Arc<MemoryBackend> = if owner == "shard-a" {
                &backend_a
            } else {
                &backend_b
            };
            backend.put(&key, Bytes::from(format!("v{}", i))).await.unwrap();
        }

        let drain_jobs = fx.control.remove_shard("shard-a").await.unwrap();
        assert!(!drain_jobs.is_empty());
        assert!(drain_jobs.iter().all(|j| j.drain));
        for job in &drain_jobs {
            let done = wait_terminal(&fx.coordinator, &job.job_id).await;
            assert_eq!(done.phase, MigrationPhase::Done);
        }

        let removed = fx.control.finish_drain("shard-a").await.unwrap();
        assert_eq!(removed.shard_id, "shard-a");
        assert!(fx.registry.get("shard-a").is_err());
        assert!(!fx.pool.contains("shard-a"));
        assert!(!fx.ring.snapshot().contains_shard("shard-a"));

        // Every key survived the drain on the remaining shard.
        for i in 0..50 {
            let key = format!("key:{}", i);
            assert_eq!(
                backend_b.get(&key).await.unwrap(),
                Some(Bytes::from(format!("v{}", i))),
                "{} lost during drain",
                key
            );
        }
    }
}

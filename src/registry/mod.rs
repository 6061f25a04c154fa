//! Shard registry: descriptors, status and failure accounting
//!
//! The registry is the authoritative in-process view of which shards exist,
//! what state they are in, and how healthy they look. Descriptor updates are
//! guarded by a generation counter so concurrent read-modify-write cycles
//! cannot silently clobber each other.

mod health;

pub use health::RollingAverage;

use crate::clock::MonotonicStamper;
use crate::config::RegistryConfig;
use crate::{Error, Result, ShardId};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use health::ShardHealth;
use serde::{Deserialize, Serialize};
use std::sync::atomic::Ordering;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Status of a shard
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShardStatus {
    /// Registered but not yet owning any ranges; becomes active at its
    /// first migration cutover
    Joining,
    /// Serving reads and writes
    Active,
    /// Handing its ranges off; still serves traffic until cutover
    Draining,
    /// Circuit open after repeated failures; requests fast-fail
    Degraded,
    /// Confirmed unresponsive by the health checker
    Dead,
}

/// Descriptor for a registered shard
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardDescriptor {
    /// Shard ID (unique identifier)
    pub shard_id: ShardId,
    /// Backend address, opaque to the engine
    pub address: String,
    /// Bumped on every mutation; callers doing read-modify-write pass the
    /// generation they read and lose with `StaleGeneration` if it moved
    pub generation: u64,
    /// Shard status
    pub status: ShardStatus,
    /// When the shard was first registered
    pub created_at: DateTime<Utc>,
    /// Last mutation time
    pub updated_at: DateTime<Utc>,
}

impl ShardDescriptor {
    /// Create a new descriptor in `Joining` state.
    pub fn new(shard_id: impl Into<ShardId>, address: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            shard_id: shard_id.into(),
            address: address.into(),
            generation: 0,
            status: ShardStatus::Joining,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether the router may send traffic to this shard at all.
    pub fn is_routable(&self) -> bool {
        matches!(
            self.status,
            ShardStatus::Joining | ShardStatus::Active | ShardStatus::Draining
        )
    }
}

/// Registry of all known shards
pub struct ShardRegistry {
    /// Map of shard ID -> descriptor
    shards: DashMap<ShardId, ShardDescriptor>,
    /// Runtime health state, never serialized
    health: DashMap<ShardId, ShardHealth>,
    config: RegistryConfig,
    stamper: MonotonicStamper,
    shutdown: CancellationToken,
}

impl ShardRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            shards: DashMap::new(),
            health: DashMap::new(),
            config,
            stamper: MonotonicStamper::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Register a new shard. The shard ID must not already be taken.
    pub fn register(&self, mut descriptor: ShardDescriptor) -> Result<ShardDescriptor> {
        use dashmap::mapref::entry::Entry;

        descriptor.updated_at = self.stamper.now();
        match self.shards.entry(descriptor.shard_id.clone()) {
            Entry::Occupied(_) => Err(Error::DuplicateShard(descriptor.shard_id)),
            Entry::Vacant(entry) => {
                info!(
                    shard_id = %descriptor.shard_id,
                    address = %descriptor.address,
                    status = ?descriptor.status,
                    "Registered shard"
                );
                self.health.insert(
                    descriptor.shard_id.clone(),
                    ShardHealth::new(self.config.load_window),
                );
                entry.insert(descriptor.clone());
                Ok(descriptor)
            }
        }
    }

    /// Remove a shard from the registry entirely.
    pub fn deregister(&self, shard_id: &str) -> Result<ShardDescriptor> {
        self.health.remove(shard_id);
        match self.shards.remove(shard_id) {
            Some((_, descriptor)) => {
                info!(shard_id, "Deregistered shard");
                Ok(descriptor)
            }
            None => Err(Error::ShardNotFound(shard_id.to_string())),
        }
    }

    pub fn get(&self, shard_id: &str) -> Result<ShardDescriptor> {
        self.shards
            .get(shard_id)
            .map(|entry| entry.clone())
            .ok_or_else(|| Error::ShardNotFound(shard_id.to_string()))
    }

    pub fn contains(&self, shard_id: &str) -> bool {
        self.shards.contains_key(shard_id)
    }

    pub fn len(&self) -> usize {
        self.shards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }

    /// All descriptors, ordered by shard ID.
    pub fn list(&self) -> Vec<ShardDescriptor> {
        let mut descriptors: Vec<ShardDescriptor> =
            self.shards.iter().map(|entry| entry.clone()).collect();
        descriptors.sort_by(|a, b| a.shard_id.cmp(&b.shard_id));
        descriptors
    }

    pub fn list_by_status(&self, status: ShardStatus) -> Vec<ShardDescriptor> {
        let mut descriptors: Vec<ShardDescriptor> = self
            .shards
            .iter()
            .filter(|entry| entry.status == status)
            .map(|entry| entry.clone())
            .collect();
        descriptors.sort_by(|a, b| a.shard_id.cmp(&b.shard_id));
        descriptors
    }

    /// Guarded read-modify-write of a descriptor. The caller passes the
    /// generation it read; if the descriptor moved underneath it the update
    /// fails with `StaleGeneration` and nothing is changed.
    pub fn update_descriptor<F>(
        &self,
        shard_id: &str,
        expected_generation: u64,
        mutate: F,
    ) -> Result<ShardDescriptor>
    where
        F: FnOnce(&mut ShardDescriptor),
    {
        let mut entry = self
            .shards
            .get_mut(shard_id)
            .ok_or_else(|| Error::ShardNotFound(shard_id.to_string()))?;
        if entry.generation != expected_generation {
            return Err(Error::StaleGeneration {
                expected: expected_generation,
                actual: entry.generation,
            });
        }
        mutate(&mut entry);
        entry.generation = expected_generation + 1;
        entry.updated_at = self.stamper.now();
        Ok(entry.clone())
    }

    /// Unconditional status flip; generation still advances.
    pub fn update_status(&self, shard_id: &str, status: ShardStatus) -> Result<ShardDescriptor> {
        let mut entry = self
            .shards
            .get_mut(shard_id)
            .ok_or_else(|| Error::ShardNotFound(shard_id.to_string()))?;
        if entry.status == status {
            return Ok(entry.clone());
        }
        info!(shard_id, from = ?entry.status, to = ?status, "Shard status changed");
        entry.status = status;
        entry.generation += 1;
        entry.updated_at = self.stamper.now();
        Ok(entry.clone())
    }

    /// Record a successful operation against a shard, closing its circuit
    /// if one was open.
    pub fn record_success(&self, shard_id: &str) {
        if let Some(health) = self.health.get(shard_id) {
            health.consecutive_failures.store(0, Ordering::Relaxed);
        }
        let was_degraded = self
            .shards
            .get(shard_id)
            .map(|entry| entry.status == ShardStatus::Degraded)
            .unwrap_or(false);
        if was_degraded {
            if self.update_status(shard_id, ShardStatus::Active).is_ok() {
                info!(shard_id, "Circuit closed, shard back in service");
            }
        }
    }

    /// Record a failed operation against a shard. Once failures reach the
    /// configured threshold the shard is marked degraded and the router
    /// fast-fails to it until something succeeds again.
    pub fn record_failure(&self, shard_id: &str) {
        let failures = match self.health.get(shard_id) {
            Some(health) => health.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1,
            None => return,
        };
        if failures < self.config.failure_threshold {
            return;
        }
        let should_trip = self
            .shards
            .get(shard_id)
            .map(|entry| {
                matches!(
                    entry.status,
                    ShardStatus::Joining | ShardStatus::Active | ShardStatus::Draining
                )
            })
            .unwrap_or(false);
        if should_trip && self.update_status(shard_id, ShardStatus::Degraded).is_ok() {
            warn!(shard_id, failures, "Circuit opened, shard marked degraded");
            metrics::counter!(
                "ringmaster_shard_degraded_total",
                "service" => crate::telemetry::service(),
                "run_id" => crate::telemetry::run_id(),
                "shard_id" => shard_id.to_string()
            )
            .increment(1);
        }
    }

    /// Record a load sample (operations, bytes, whatever the caller tracks).
    pub fn record_load(&self, shard_id: &str, value: f64) {
        if let Some(health) = self.health.get(shard_id) {
            health.load.lock().add_sample(value);
        }
    }

    /// Rolling load average for a shard, 0.0 when unknown.
    pub fn shard_load(&self, shard_id: &str) -> f64 {
        self.health
            .get(shard_id)
            .map(|health| health.load.lock().avg())
            .unwrap_or(0.0)
    }

    /// Registry-wide statistics.
    pub fn stats(&self) -> RegistryStats {
        let mut stats = RegistryStats::default();
        for entry in self.shards.iter() {
            stats.total_shards += 1;
            match entry.status {
                ShardStatus::Joining => stats.joining_shards += 1,
                ShardStatus::Active => stats.active_shards += 1,
                ShardStatus::Draining => stats.draining_shards += 1,
                ShardStatus::Degraded => stats.degraded_shards += 1,
                ShardStatus::Dead => stats.dead_shards += 1,
            }
        }
        stats
    }

    /// Token cancelled when the registry is shut down; the health loop and
    /// anything else tied to the registry's lifetime watches it.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub(crate) fn config(&self) -> &RegistryConfig {
        &self.config
    }
}

/// Registry statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryStats {
    pub total_shards: usize,
    pub joining_shards: usize,
    pub active_shards: usize,
    pub draining_shards: usize,
    pub degraded_shards: usize,
    pub dead_shards: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> ShardRegistry {
        ShardRegistry::new(RegistryConfig::default())
    }

    #[test]
    fn test_register_and_get() {
        let registry = registry();
        registry
            .register(ShardDescriptor::new("shard-a", "10.0.0.1:9000"))
            .unwrap();

        let descriptor = registry.get("shard-a").unwrap();
        assert_eq!(descriptor.address, "10.0.0.1:9000");
        assert_eq!(descriptor.status, ShardStatus::Joining);
        assert_eq!(descriptor.generation, 0);

        let duplicate = registry.register(ShardDescriptor::new("shard-a", "10.0.0.2:9000"));
        assert!(matches!(duplicate, Err(Error::DuplicateShard(_))));

        assert!(matches!(
            registry.get("shard-b"),
            Err(Error::ShardNotFound(_))
        ));
    }

    #[test]
    fn test_generation_guard() {
        let registry = registry();
        registry
            .register(ShardDescriptor::new("shard-a", "10.0.0.1:9000"))
            .unwrap();

        let updated = registry
            .update_descriptor("shard-a", 0, |d| d.address = "10.0.0.9:9000".to_string())
            .unwrap();
        assert_eq!(updated.generation, 1);
        assert_eq!(updated.address, "10.0.0.9:9000");

        // Re-using the old generation must fail without mutating anything.
        let stale = registry.update_descriptor("shard-a", 0, |d| d.address = "bad".to_string());
        assert!(matches!(
            stale,
            Err(Error::StaleGeneration {
                expected: 0,
                actual: 1
            })
        ));
        assert_eq!(registry.get("shard-a").unwrap().address, "10.0.0.9:9000");
    }

    #[test]
    fn test_circuit_opens_and_closes() {
        let registry = registry();
        registry
            .register(ShardDescriptor::new("shard-a", "10.0.0.1:9000"))
            .unwrap();
        registry
            .update_status("shard-a", ShardStatus::Active)
            .unwrap();

        for _ in 0..4 {
            registry.record_failure("shard-a");
        }
        assert_eq!(registry.get("shard-a").unwrap().status, ShardStatus::Active);

        // Fifth consecutive failure trips the circuit.
        registry.record_failure("shard-a");
        assert_eq!(
            registry.get("shard-a").unwrap().status,
            ShardStatus::Degraded
        );

        registry.record_success("shard-a");
        assert_eq!(registry.get("shard-a").unwrap().status, ShardStatus::Active);
    }

    #[test]
    fn test_stats_by_status() {
        let registry = registry();
        for (id, status) in [
            ("shard-a", ShardStatus::Active),
            ("shard-b", ShardStatus::Active),
            ("shard-c", ShardStatus::Draining),
        ] {
            registry
                .register(ShardDescriptor::new(id, "addr"))
                .unwrap();
            registry.update_status(id, status).unwrap();
        }

        let stats = registry.stats();
        assert_eq!(stats.total_shards, 3);
        assert_eq!(stats.active_shards, 2);
        assert_eq!(stats.draining_shards, 1);
        assert_eq!(stats.joining_shards, 0);

        assert_eq!(registry.list_by_status(ShardStatus::Active).len(), 2);
        assert_eq!(registry.list().len(), 3);
    }

    #[test]
    fn test_load_tracking() {
        let registry = registry();
        registry
            .register(ShardDescriptor::new("shard-a", "addr"))
            .unwrap();

        assert_eq!(registry.shard_load("shard-a"), 0.0);
        registry.record_load("shard-a", 4.0);
        registry.record_load("shard-a", 8.0);
        assert_eq!(registry.shard_load("shard-a"), 6.0);

        // Samples against unknown shards are dropped, not panicked on.
        registry.record_load("shard-z", 1.0);
        assert_eq!(registry.shard_load("shard-z"), 0.0);
    }
}

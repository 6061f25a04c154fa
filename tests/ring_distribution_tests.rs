//! Integration tests for ring placement: deterministic lookup, balance
//! across shards, and bounded key movement when the topology changes.

use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::ObjectStore;
use ringmaster::config::{RegistryConfig, RingConfig};
use ringmaster::registry::{ShardDescriptor, ShardRegistry, ShardStatus};
use ringmaster::ring::{HashRing, RingSnapshot};
use ringmaster::Error;
use std::collections::HashMap;
use std::sync::Arc;

const VNODES: u32 = 128;

/// Helper to build a published ring over an in-memory store.
async fn ring_with(shards: &[&str]) -> HashRing {
    let registry = Arc::new(ShardRegistry::new(RegistryConfig::default()));
    for shard in shards {
        registry
            .register(ShardDescriptor::new(
                *shard,
                format!("{}.internal:7400", shard),
            ))
            .unwrap();
        registry.update_status(shard, ShardStatus::Active).unwrap();
    }
    let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
    let ring = HashRing::open(registry, store, RingConfig::default())
        .await
        .unwrap();
    ring.publish(RingSnapshot::build(1, VNODES, shards))
        .await
        .unwrap();
    ring
}

fn sample_keys(count: usize) -> Vec<String> {
    (0..count).map(|i| format!("user:{}", i)).collect()
}

fn owner_counts(snapshot: &RingSnapshot, keys: &[String]) -> HashMap<String, usize> {
    let mut counts = HashMap::new();
    for key in keys {
        let owner = snapshot.owner_of(key).unwrap().to_string();
        *counts.entry(owner).or_insert(0) += 1;
    }
    counts
}

/// Test that repeated lookups of the same key always land on the same
/// shard, including across independently built snapshots.
#[test]
fn test_lookup_is_deterministic() {
    let shards = ["shard-a", "shard-b", "shard-c"];
    let first = RingSnapshot::build(1, VNODES, shards);
    let second = RingSnapshot::build(7, VNODES, shards);

    for key in sample_keys(1_000) {
        let owner = first.owner_of(&key).unwrap();
        assert_eq!(owner, first.owner_of(&key).unwrap());
        assert_eq!(
            owner,
            second.owner_of(&key).unwrap(),
            "placement must not depend on snapshot version"
        );
    }
}

/// Test that keys spread evenly: with 128 vnodes per shard every shard
/// should hold its fair share within a modest tolerance.
#[test]
fn test_keys_spread_within_tolerance() {
    let shards = ["shard-a", "shard-b", "shard-c"];
    let snapshot = RingSnapshot::build(1, VNODES, shards);
    let keys = sample_keys(30_000);
    let counts = owner_counts(&snapshot, &keys);

    assert_eq!(counts.len(), shards.len(), "every shard should own keys");
    let mean = keys.len() as f64 / shards.len() as f64;
    for (shard, count) in &counts {
        let deviation = (*count as f64 - mean).abs() / mean;
        assert!(
            deviation < 0.30,
            "{} owns {} keys, {:.0}% off the mean of {:.0}",
            shard,
            count,
            deviation * 100.0,
            mean
        );
    }
}

/// Test that growing the ring from three shards to four moves roughly a
/// quarter of the keys, and that every moved key lands on the new shard.
#[test]
fn test_adding_shard_moves_expected_fraction() {
    let base = RingSnapshot::build(1, VNODES, ["shard-a", "shard-b", "shard-c"]);
    let grown = base.with_shard_added("shard-d");
    let keys = sample_keys(20_000);

    let mut moved = 0usize;
    for key in &keys {
        let before = base.owner_of(key).unwrap();
        let after = grown.owner_of(key).unwrap();
        if before != after {
            moved += 1;
            assert_eq!(
                after, "shard-d",
                "a key may only move to the shard that joined"
            );
        }
    }

    let fraction = moved as f64 / keys.len() as f64;
    assert!(
        (0.10..=0.45).contains(&fraction),
        "expected roughly 1/4 of keys to move, got {:.1}%",
        fraction * 100.0
    );
}

/// Test that removing a shard reassigns only the keys it owned; everyone
/// else's placement is untouched.
#[test]
fn test_removing_shard_only_reassigns_its_keys() {
    let base = RingSnapshot::build(1, VNODES, ["shard-a", "shard-b", "shard-c", "shard-d"]);
    let shrunk = base.with_shard_removed("shard-d");
    assert!(!shrunk.contains_shard("shard-d"));

    for key in sample_keys(20_000) {
        let before = base.owner_of(&key).unwrap();
        let after = shrunk.owner_of(&key).unwrap();
        if before == "shard-d" {
            assert_ne!(after, "shard-d");
        } else {
            assert_eq!(before, after, "key not owned by the removed shard moved");
        }
    }
}

/// Test that an empty ring refuses lookups instead of guessing.
#[test]
fn test_empty_ring_lookup_fails() {
    let snapshot = RingSnapshot::empty(VNODES);
    assert!(matches!(
        snapshot.owner_of("user:42"),
        Err(Error::NoShardsAvailable)
    ));
}

/// Test that the full key range resolves to every shard on the ring and
/// a narrow range to a subset of it.
#[test]
fn test_full_range_covers_every_shard() {
    let shards = ["shard-a", "shard-b", "shard-c"];
    let snapshot = RingSnapshot::build(1, VNODES, shards);

    let all = snapshot.owners_for_range("", "").unwrap();
    assert_eq!(all.len(), shards.len());

    let narrow = snapshot.owners_for_range("user:100", "user:101").unwrap();
    assert!(!narrow.is_empty());
    assert!(narrow.iter().all(|owner| all.contains(owner)));
}

/// Test the plain routing story: a user key resolves through the ring to
/// one routable shard descriptor, stable across calls.
#[tokio::test]
async fn test_user_key_routes_to_one_routable_shard() {
    let ring = ring_with(&["shard-a", "shard-b", "shard-c"]).await;

    let descriptor = ring.lookup("user:42").unwrap();
    assert!(descriptor.is_routable());
    assert!(descriptor.address.ends_with(":7400"));

    for _ in 0..10 {
        assert_eq!(ring.lookup("user:42").unwrap().shard_id, descriptor.shard_id);
    }
}

/// Test that a rebuilt ring inherits the published topology: a second
/// handle opened over the same store sees identical placement.
#[tokio::test]
async fn test_reopened_ring_restores_placement() {
    let registry = Arc::new(ShardRegistry::new(RegistryConfig::default()));
    let shards = ["shard-a", "shard-b"];
    for shard in shards {
        registry
            .register(ShardDescriptor::new(shard, "addr"))
            .unwrap();
        registry.update_status(shard, ShardStatus::Active).unwrap();
    }
    let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());

    let original = HashRing::open(registry.clone(), store.clone(), RingConfig::default())
        .await
        .unwrap();
    original
        .publish(RingSnapshot::build(1, VNODES, shards))
        .await
        .unwrap();

    let reopened = HashRing::open(registry, store, RingConfig::default())
        .await
        .unwrap();
    assert_eq!(
        reopened.snapshot().version(),
        original.snapshot().version()
    );
    for key in sample_keys(500) {
        assert_eq!(
            original.snapshot().owner_of(&key).unwrap(),
            reopened.snapshot().owner_of(&key).unwrap()
        );
    }
}

/// Test that a published topology survives a process restart when the
/// state store lives on the local filesystem.
#[tokio::test]
async fn test_topology_survives_restart_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let shards = ["shard-a", "shard-b"];

    {
        let registry = Arc::new(ShardRegistry::new(RegistryConfig::default()));
        let store: Arc<dyn ObjectStore> =
            Arc::new(LocalFileSystem::new_with_prefix(dir.path()).unwrap());
        let ring = HashRing::open(registry, store, RingConfig::default())
            .await
            .unwrap();
        ring.publish(RingSnapshot::build(3, VNODES, shards))
            .await
            .unwrap();
    }

    let registry = Arc::new(ShardRegistry::new(RegistryConfig::default()));
    let store: Arc<dyn ObjectStore> =
        Arc::new(LocalFileSystem::new_with_prefix(dir.path()).unwrap());
    let restarted = HashRing::open(registry, store, RingConfig::default())
        .await
        .unwrap();

    let snapshot = restarted.snapshot();
    assert_eq!(snapshot.version(), 3);
    let mut ids = snapshot.shard_ids();
    ids.sort();
    assert_eq!(ids, vec!["shard-a".to_string(), "shard-b".to_string()]);

    let reference = RingSnapshot::build(3, VNODES, shards);
    for key in sample_keys(500) {
        assert_eq!(
            snapshot.owner_of(&key).unwrap(),
            reference.owner_of(&key).unwrap(),
            "restored topology must place keys exactly as published"
        );
    }
}

//! # Ringmaster
//!
//! A shard routing and rebalancing engine that sits between client requests
//! and a set of independent storage backends.
//!
//! Given a partition key, ringmaster deterministically locates the owning
//! shard, routes reads and writes there (fanning out and merging for
//! multi-key and range operations), and migrates key ranges between shards
//! without taking traffic offline. Cross-shard writes go through a small
//! two-phase commit coordinator.
//!
//! ## Architecture
//!
//! - **Registry**: known shards, their descriptors, health and load state
//! - **Ring**: consistent-hash ring with virtual nodes; immutable snapshots
//!   published copy-on-write, reads are lock-free
//! - **Router**: key → shard resolution and dispatch with bounded retries
//! - **Migration coordinator**: dual-write → backfill → cutover → cleanup,
//!   durably logged and resumable after a crash
//! - **Transaction coordinator**: two-phase commit with a durable decision
//!   log for the rare multi-shard write

pub mod backend;
pub mod clock;
pub mod config;
pub mod control;
pub mod migration;
pub mod rate_limit;
pub mod registry;
pub mod ring;
pub mod router;
pub mod telemetry;
pub mod txn;

mod error;
mod persist;

pub use backend::ShardId;
pub use error::{Error, Result};

/// Re-exports for convenience
pub mod prelude {
    pub use crate::backend::{BackendPool, MemoryBackend, ShardBackend, TxnOp};
    pub use crate::config::{
        EngineConfig, MigrationConfig, RegistryConfig, RingConfig, RouterConfig, TxnConfig,
    };
    pub use crate::control::ControlPlane;
    pub use crate::migration::{MigrationCoordinator, MigrationJob, MigrationPhase};
    pub use crate::registry::{ShardDescriptor, ShardRegistry, ShardStatus};
    pub use crate::ring::{HashRing, RingSnapshot};
    pub use crate::router::Router;
    pub use crate::txn::{TwoPhaseCoordinator, TxnDecision, TxnState};
    pub use crate::{Error, Result, ShardId};
}

//! Shard backend adapter interface.
//!
//! Shards are opaque key-value stores reached through a narrow capability
//! trait; the engine is polymorphic over this trait and never over
//! backend-specific types. [`MemoryBackend`] is the reference
//! implementation used by tests and local development.

mod memory;

pub use memory::MemoryBackend;

use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::Arc;

/// Shard identifier (opaque string)
pub type ShardId = String;

/// One staged operation inside a two-phase-commit transaction.
#[derive(Debug, Clone, PartialEq)]
pub enum TxnOp {
    Put { key: String, value: Bytes },
    Delete { key: String },
}

impl TxnOp {
    pub fn key(&self) -> &str {
        match self {
            TxnOp::Put { key, .. } => key,
            TxnOp::Delete { key } => key,
        }
    }
}

/// Capability interface every storage backend must implement.
///
/// `prepare` durably stages ops without applying them; the participant's
/// `Ok` is its vote to commit. `commit` and `abort` must be idempotent and
/// treat an unknown transaction id as already resolved, so a recovering
/// coordinator can re-send outcomes safely.
#[async_trait]
pub trait ShardBackend: Send + Sync {
    /// Read a key. Absent keys are `Ok(None)`, not an error.
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;

    /// Upsert a key.
    async fn put(&self, key: &str, value: Bytes) -> Result<()>;

    /// Delete a key. Deleting an absent key succeeds.
    async fn delete(&self, key: &str) -> Result<()>;

    /// All keys in `[start, end)` in lexicographic order. An empty `end`
    /// means unbounded.
    async fn scan_range(&self, start: &str, end: &str) -> Result<Vec<(String, Bytes)>>;

    /// Durably stage `ops` under `tx_id` without applying them.
    async fn prepare(&self, tx_id: &str, ops: &[TxnOp]) -> Result<()>;

    /// Apply the staged ops for `tx_id`.
    async fn commit(&self, tx_id: &str) -> Result<()>;

    /// Discard the staged ops for `tx_id`.
    async fn abort(&self, tx_id: &str) -> Result<()>;

    /// Liveness probe.
    async fn health_check(&self) -> Result<()>;
}

/// Shard id → backend adapter handles.
#[derive(Default)]
pub struct BackendPool {
    backends: DashMap<ShardId, Arc<dyn ShardBackend>>,
}

impl BackendPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, shard_id: &str, backend: Arc<dyn ShardBackend>) {
        self.backends.insert(shard_id.to_string(), backend);
    }

    pub fn deregister(&self, shard_id: &str) {
        self.backends.remove(shard_id);
    }

    pub fn get(&self, shard_id: &str) -> Result<Arc<dyn ShardBackend>> {
        self.backends
            .get(shard_id)
            .map(|entry| entry.clone())
            .ok_or_else(|| Error::ShardNotFound(shard_id.to_string()))
    }

    pub fn contains(&self, shard_id: &str) -> bool {
        self.backends.contains_key(shard_id)
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}

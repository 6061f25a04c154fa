//! In-memory shard backend for tests and local development.

use super::{ShardBackend, TxnOp};
use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::BTreeMap;

/// Ordered in-memory key-value store with staged-transaction support.
#[derive(Default)]
pub struct MemoryBackend {
    data: RwLock<BTreeMap<String, Bytes>>,
    staged: DashMap<String, Vec<TxnOp>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live keys (excludes staged ops).
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    /// Number of transactions currently staged.
    pub fn staged_txns(&self) -> usize {
        self.staged.len()
    }

    fn apply(data: &mut BTreeMap<String, Bytes>, ops: &[TxnOp]) {
        for op in ops {
            match op {
                TxnOp::Put { key, value } => {
                    data.insert(key.clone(), value.clone());
                }
                TxnOp::Delete { key } => {
                    data.remove(key);
                }
            }
        }
    }
}

#[async_trait]
impl ShardBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        Ok(self.data.read().get(key).cloned())
    }

    async fn put(&self, key: &str, value: Bytes) -> Result<()> {
        self.data.write().insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.data.write().remove(key);
        Ok(())
    }

    async fn scan_range(&self, start: &str, end: &str) -> Result<Vec<(String, Bytes)>> {
        let data = self.data.read();
        let entries = if end.is_empty() {
            data.range(start.to_string()..)
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        } else {
            data.range(start.to_string()..end.to_string())
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        };
        Ok(entries)
    }

    async fn prepare(&self, tx_id: &str, ops: &[TxnOp]) -> Result<()> {
        // Re-preparing the same transaction replaces the stage, so a
        // coordinator retry after a lost ack is safe.
        self.staged.insert(tx_id.to_string(), ops.to_vec());
        Ok(())
    }

    async fn commit(&self, tx_id: &str) -> Result<()> {
        if let Some((_, ops)) = self.staged.remove(tx_id) {
            let mut data = self.data.write();
            Self::apply(&mut data, &ops);
        }
        // Unknown tx id: already applied or never staged here. Either way
        // the outcome is settled.
        Ok(())
    }

    async fn abort(&self, tx_id: &str) -> Result<()> {
        self.staged.remove(tx_id);
        Ok(())
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

//! Durable commit/abort decisions
//!
//! The decision record is the commit point of the protocol: a transaction
//! is committed the instant its COMMIT record lands, regardless of what
//! delivery does afterwards. Records are retained until every participant
//! has acknowledged the outcome, so a participant recovering with a
//! prepared stage can always look the decision up. An absent record means
//! the transaction never decided, which reads as abort.

use super::TxnDecision;
use crate::persist::{self, cas_retry};
use crate::{Error, Result, ShardId};
use chrono::{DateTime, Utc};
use object_store::path::Path;
use object_store::ObjectStore;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub tx_id: String,
    pub decision: TxnDecision,
    /// Shards that must acknowledge before the record can be dropped
    pub participants: Vec<ShardId>,
    pub acked: BTreeSet<ShardId>,
    pub decided_at: DateTime<Utc>,
}

impl DecisionRecord {
    pub fn is_fully_acked(&self) -> bool {
        self.participants.iter().all(|p| self.acked.contains(p))
    }
}

fn decision_path(tx_id: &str) -> Path {
    Path::from(format!("txn/decisions/{}.json", tx_id))
}

fn decisions_prefix() -> Path {
    Path::from("txn/decisions")
}

#[derive(Clone)]
pub(crate) struct DecisionLog {
    store: Arc<dyn ObjectStore>,
}

impl DecisionLog {
    pub(crate) fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    /// Log the outcome. Create-only, so the first decision for a tx id
    /// wins; replaying the same outcome after a crash is accepted,
    /// logging a different one is refused.
    pub(crate) async fn record(
        &self,
        tx_id: &str,
        decision: TxnDecision,
        participants: &[ShardId],
        decided_at: DateTime<Utc>,
    ) -> Result<DecisionRecord> {
        let record = DecisionRecord {
            tx_id: tx_id.to_string(),
            decision,
            participants: participants.to_vec(),
            acked: BTreeSet::new(),
            decided_at,
        };
        let put = persist::put_json_cas(
            &self.store,
            &decision_path(tx_id),
            &record,
            None,
            "txn_decision",
        )
        .await;
        match put {
            Ok(_) => Ok(record),
            Err(Error::Conflict) => match self.load(tx_id).await? {
                Some(existing) if existing.decision == decision => Ok(existing),
                Some(existing) => Err(Error::Internal(format!(
                    "decision log for {} holds {:?}, refusing {:?}",
                    tx_id, existing.decision, decision
                ))),
                None => Err(Error::Internal(format!(
                    "decision log for {} vanished mid-replay",
                    tx_id
                ))),
            },
            Err(e) => Err(e),
        }
    }

    pub(crate) async fn load(&self, tx_id: &str) -> Result<Option<DecisionRecord>> {
        persist::load_json(&self.store, &decision_path(tx_id)).await
    }

    /// Record one participant's acknowledgment. Once the last participant
    /// acks, the record has done its job and is dropped.
    pub(crate) async fn mark_acked(&self, tx_id: &str, shard_id: &str) -> Result<()> {
        let path = decision_path(tx_id);
        let fully_acked = cas_retry!({
            let loaded =
                persist::load_json_versioned::<DecisionRecord>(&self.store, &path).await?;
            let Some((mut record, etag)) = loaded else {
                // Already fully acked and dropped.
                return Ok(false);
            };
            record.acked.insert(shard_id.to_string());
            persist::put_json_cas(&self.store, &path, &record, etag.as_deref(), "txn_ack")
                .await?;
            Ok(record.is_fully_acked())
        })?;

        if fully_acked {
            persist::delete_quiet(&self.store, &path).await?;
            debug!(tx_id, "Decision record fully acknowledged, dropped");
        }
        Ok(())
    }

    /// Every decision still awaiting acknowledgment.
    pub(crate) async fn list(&self) -> Result<Vec<DecisionRecord>> {
        let paths = persist::list_prefix(&self.store, &decisions_prefix()).await?;
        let mut records = Vec::with_capacity(paths.len());
        for path in paths {
            match persist::load_json::<DecisionRecord>(&self.store, &path).await {
                Ok(Some(record)) => records.push(record),
                Ok(None) => {}
                Err(e) => warn!(%path, error = %e, "Skipping unreadable decision record"),
            }
        }
        Ok(records)
    }
}

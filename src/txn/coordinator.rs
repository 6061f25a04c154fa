//! Two-phase commit driver
//!
//! Prepare fans out to every participant, the decision lands on the log,
//! then commit/abort is pushed. Delivery failures never un-decide a
//! transaction; the record stays pinned until the participant is told.

use super::{DecisionLog, Transaction, TxnDecision, TxnState};
use crate::backend::{BackendPool, TxnOp};
use crate::clock::MonotonicStamper;
use crate::config::TxnConfig;
use crate::persist;
use crate::router::Router;
use crate::{Error, Result, ShardId};
use dashmap::DashMap;
use futures::future::join_all;
use metrics::counter;
use object_store::ObjectStore;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize)]
pub struct TxnStats {
    pub live: usize,
    pub committed: u64,
    pub aborted: u64,
}

pub struct TwoPhaseCoordinator {
    router: Arc<Router>,
    pool: Arc<BackendPool>,
    log: DecisionLog,
    live: DashMap<String, Transaction>,
    committed: AtomicU64,
    aborted: AtomicU64,
    stamper: MonotonicStamper,
    config: TxnConfig,
}

impl TwoPhaseCoordinator {
    pub fn new(
        router: Arc<Router>,
        pool: Arc<BackendPool>,
        store: Arc<dyn ObjectStore>,
        config: TxnConfig,
    ) -> Self {
        Self {
            router,
            pool,
            log: DecisionLog::new(store),
            live: DashMap::new(),
            committed: AtomicU64::new(0),
            aborted: AtomicU64::new(0),
            stamper: MonotonicStamper::new(),
            config,
        }
    }

    /// Apply a batch of writes atomically across however many shards the
    /// keys hash to. Batches that resolve to a single shard skip the
    /// protocol entirely and go through the router. Returns the tx id.
    pub async fn execute(&self, ops: Vec<TxnOp>) -> Result<String> {
        let (tx_id, by_shard) = self.plan(ops)?;
        self.execute_grouped(tx_id, by_shard).await
    }

    /// Group ops by owning shard and mint a tx id.
    fn plan(&self, ops: Vec<TxnOp>) -> Result<(String, BTreeMap<ShardId, Vec<TxnOp>>)> {
        if ops.is_empty() {
            return Err(Error::Internal("empty transaction".to_string()));
        }
        let mut by_shard: BTreeMap<ShardId, Vec<TxnOp>> = BTreeMap::new();
        for op in ops {
            by_shard
                .entry(self.router.authority_of(op.key())?)
                .or_default()
                .push(op);
        }
        Ok((uuid::Uuid::new_v4().to_string(), by_shard))
    }

    async fn execute_grouped(
        &self,
        tx_id: String,
        by_shard: BTreeMap<ShardId, Vec<TxnOp>>,
    ) -> Result<String> {
        if by_shard.len() == 1 {
            let (_, ops) = by_shard.into_iter().next().ok_or_else(|| {
                Error::Internal("transaction lost its only participant".to_string())
            })?;
            for op in ops {
                match op {
                    TxnOp::Put { key, value } => self.router.put(&key, value).await?,
                    TxnOp::Delete { key } => self.router.delete(&key).await?,
                }
            }
            return Ok(tx_id);
        }

        let participants: Vec<ShardId> = by_shard.keys().cloned().collect();
        self.live.insert(
            tx_id.clone(),
            Transaction {
                tx_id: tx_id.clone(),
                participants: participants.clone(),
                state: TxnState::Preparing,
                created_at: self.stamper.now(),
            },
        );
        info!(tx_id, participants = participants.len(), "Transaction preparing");

        match self.prepare_all(&tx_id, &by_shard).await {
            Ok(()) => {
                self.set_state(&tx_id, TxnState::Prepared);
                // Commit point: once this record lands the transaction is
                // committed no matter what delivery does.
                if let Err(e) = self
                    .log
                    .record(
                        &tx_id,
                        TxnDecision::Commit,
                        &participants,
                        self.stamper.now(),
                    )
                    .await
                {
                    self.live.remove(&tx_id);
                    return Err(e);
                }
                self.set_state(&tx_id, TxnState::Committing);
                let delivered = self
                    .deliver_outcome(&tx_id, TxnDecision::Commit, &participants)
                    .await;
                self.mirror_into_migrations(&by_shard, &delivered).await;
                self.set_state(&tx_id, TxnState::Committed);
                self.live.remove(&tx_id);
                self.committed.fetch_add(1, Ordering::Relaxed);
                counter!(
                    "ringmaster_txn_committed_total",
                    "service" => crate::telemetry::service(),
                    "run_id" => crate::telemetry::run_id()
                )
                .increment(1);
                info!(tx_id, "Transaction committed");
                Ok(tx_id)
            }
            Err((prepared, cause)) => {
                self.set_state(&tx_id, TxnState::Aborting);
                if prepared.is_empty() {
                    // Nobody staged anything; the absent record already
                    // reads as abort.
                    debug!(tx_id, "No participant prepared, skipping abort record");
                } else {
                    if let Err(e) = self
                        .log
                        .record(&tx_id, TxnDecision::Abort, &prepared, self.stamper.now())
                        .await
                    {
                        self.live.remove(&tx_id);
                        return Err(e);
                    }
                    self.deliver_outcome(&tx_id, TxnDecision::Abort, &prepared)
                        .await;
                }
                self.set_state(&tx_id, TxnState::Aborted);
                self.live.remove(&tx_id);
                self.aborted.fetch_add(1, Ordering::Relaxed);
                counter!(
                    "ringmaster_txn_aborted_total",
                    "service" => crate::telemetry::service(),
                    "run_id" => crate::telemetry::run_id()
                )
                .increment(1);
                warn!(tx_id, error = %cause, "Transaction aborted");
                Err(cause)
            }
        }
    }

    /// Cancellation-aware execute. Cancelling drops the driver where it
    /// stands: before the commit point each participant gets one
    /// best-effort abort, at or past it the decision log owns the
    /// outcome. The caller cannot know which side of the commit point
    /// the cancel hit, so it is told exactly that.
    pub async fn execute_with_cancel(
        &self,
        ops: Vec<TxnOp>,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let (tx_id, by_shard) = self.plan(ops)?;
        let participants: Vec<ShardId> = by_shard.keys().cloned().collect();
        tokio::select! {
            result = self.execute_grouped(tx_id.clone(), by_shard) => result,
            _ = cancel.cancelled() => {
                self.abandon(&tx_id, participants);
                Err(Error::UnknownOutcome {
                    operation: format!("transaction {}", tx_id),
                })
            }
        }
    }

    /// Fire-and-forget cleanup for a cancelled driver. No retries and
    /// no waiting: a participant that misses the abort re-asks the
    /// decision log, where the absent record reads as abort anyway.
    fn abandon(&self, tx_id: &str, participants: Vec<ShardId>) {
        let state = self.live.remove(tx_id).map(|(_, txn)| txn.state);
        let tx_id = tx_id.to_string();
        let pool = self.pool.clone();
        let log = self.log.clone();
        tokio::spawn(async move {
            match log.load(&tx_id).await {
                Ok(Some(record)) => {
                    debug!(tx_id, decision = ?record.decision, "Cancelled after decision, leaving to recovery");
                }
                // Dropped at the commit point: the COMMIT record may still
                // be in flight, and an abort here could contradict it.
                // Participants resolve through the decision log instead.
                Ok(None) if state == Some(TxnState::Prepared) => {
                    debug!(tx_id, "Cancelled at the commit point, not pushing aborts");
                }
                Ok(None) => {
                    for shard_id in participants {
                        let backend = match pool.get(&shard_id) {
                            Ok(backend) => backend,
                            Err(_) => continue,
                        };
                        if let Err(e) = backend.abort(&tx_id).await {
                            debug!(tx_id, shard_id = %shard_id, error = %e, "Best-effort abort not delivered");
                        }
                    }
                }
                Err(e) => {
                    warn!(tx_id, error = %e, "Could not check decision for cancelled transaction");
                }
            }
        });
    }

    /// Re-deliver outcomes for every decision still on the log. Run at
    /// startup to unblock participants a previous coordinator left
    /// prepared.
    pub async fn recover(&self) -> Result<usize> {
        let records = self.log.list().await?;
        let redelivered = records.len();
        for record in records {
            let pending: Vec<ShardId> = record
                .participants
                .iter()
                .filter(|p| !record.acked.contains(*p))
                .cloned()
                .collect();
            info!(
                tx_id = %record.tx_id,
                decision = ?record.decision,
                pending = pending.len(),
                "Re-delivering transaction outcome"
            );
            self.deliver_outcome(&record.tx_id, record.decision, &pending)
                .await;
        }
        Ok(redelivered)
    }

    /// Outcome lookup for a recovering participant holding a prepared
    /// stage. An absent record means the transaction never committed.
    pub async fn decision_for(&self, tx_id: &str) -> Result<TxnDecision> {
        Ok(self
            .log
            .load(tx_id)
            .await?
            .map(|record| record.decision)
            .unwrap_or(TxnDecision::Abort))
    }

    /// State of a transaction still being driven, if any.
    pub fn state_of(&self, tx_id: &str) -> Option<TxnState> {
        self.live.get(tx_id).map(|txn| txn.state)
    }

    pub fn stats(&self) -> TxnStats {
        TxnStats {
            live: self.live.len(),
            committed: self.committed.load(Ordering::Relaxed),
            aborted: self.aborted.load(Ordering::Relaxed),
        }
    }

    fn set_state(&self, tx_id: &str, state: TxnState) {
        if let Some(mut txn) = self.live.get_mut(tx_id) {
            txn.state = state;
            debug!(tx_id, state = ?state, "Transaction state");
        }
    }

    // ── Protocol phases ──────────────────────────────────────────────

    /// Fan out Prepare. On failure returns the subset that did stage
    /// (they need an explicit abort) plus the shaped cause.
    async fn prepare_all(
        &self,
        tx_id: &str,
        by_shard: &BTreeMap<ShardId, Vec<TxnOp>>,
    ) -> std::result::Result<(), (Vec<ShardId>, Error)> {
        let legs = by_shard.iter().map(|(shard_id, ops)| async move {
            let result = self.prepare_one(tx_id, shard_id, ops).await;
            (shard_id.clone(), result)
        });
        let outcomes = join_all(legs).await;

        let mut prepared = Vec::new();
        let mut cause = None;
        for (shard_id, outcome) in outcomes {
            match outcome {
                Ok(()) => prepared.push(shard_id),
                Err(Error::Timeout) => {
                    warn!(tx_id, shard_id = %shard_id, "Participant missed the prepare window");
                    cause.get_or_insert(Error::TransactionTimeout {
                        tx_id: tx_id.to_string(),
                    });
                }
                Err(e) => {
                    warn!(tx_id, shard_id = %shard_id, error = %e, "Participant vetoed prepare");
                    cause.get_or_insert(Error::TransactionAborted {
                        tx_id: tx_id.to_string(),
                        reason: format!("{} vetoed: {}", shard_id, e),
                    });
                }
            }
        }
        match cause {
            None => Ok(()),
            Some(cause) => Err((prepared, cause)),
        }
    }

    async fn prepare_one(&self, tx_id: &str, shard_id: &str, ops: &[TxnOp]) -> Result<()> {
        let backend = self.pool.get(shard_id)?;
        match timeout(self.config.prepare_timeout, backend.prepare(tx_id, ops)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout),
        }
    }

    /// Push the decided outcome to each participant, acking as they
    /// confirm. Participants that stay unreachable keep the decision
    /// record pinned for recovery; the decision itself never changes.
    /// Returns the participants that confirmed delivery.
    async fn deliver_outcome(
        &self,
        tx_id: &str,
        decision: TxnDecision,
        participants: &[ShardId],
    ) -> Vec<ShardId> {
        let legs = participants.iter().map(|shard_id| async move {
            match self.deliver_one(tx_id, decision, shard_id).await {
                Ok(()) => {
                    if let Err(e) = self.log.mark_acked(tx_id, shard_id).await {
                        warn!(tx_id, shard_id = %shard_id, error = %e, "Failed to record participant ack");
                    }
                    Some(shard_id.clone())
                }
                Err(e) => {
                    warn!(
                        tx_id,
                        shard_id = %shard_id,
                        decision = ?decision,
                        error = %e,
                        "Outcome delivery failed; participant must recover from the decision log"
                    );
                    counter!(
                        "ringmaster_txn_delivery_failures_total",
                        "service" => crate::telemetry::service(),
                        "run_id" => crate::telemetry::run_id(),
                        "shard_id" => shard_id.clone()
                    )
                    .increment(1);
                    None
                }
            }
        });
        join_all(legs).await.into_iter().flatten().collect()
    }

    async fn deliver_one(&self, tx_id: &str, decision: TxnDecision, shard_id: &str) -> Result<()> {
        let backend = self.pool.get(shard_id)?;
        let mut last_err = None;
        for attempt in 0..self.config.delivery_retries {
            if attempt > 0 {
                tokio::time::sleep(persist::backoff_delay(attempt - 1)).await;
            }
            let call = match decision {
                TxnDecision::Commit => backend.commit(tx_id),
                TxnDecision::Abort => backend.abort(tx_id),
            };
            match timeout(self.config.prepare_timeout, call).await {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(e)) => last_err = Some(e),
                Err(_) => last_err = Some(Error::Timeout),
            }
        }
        Err(last_err.unwrap_or(Error::TooManyRetries))
    }

    /// Committed ops apply through participant stages, not the router,
    /// so a write into a range being migrated has not reached the
    /// migration target yet. Its copy is pushed here, only for
    /// participants that confirmed delivery, so the target never gets
    /// ahead of its source.
    async fn mirror_into_migrations(
        &self,
        by_shard: &BTreeMap<ShardId, Vec<TxnOp>>,
        delivered: &[ShardId],
    ) {
        for shard_id in delivered {
            if let Some(ops) = by_shard.get(shard_id) {
                for op in ops {
                    match op {
                        TxnOp::Put { key, value } => {
                            self.router
                                .mirror_applied_write(key, Some(value.clone()))
                                .await
                        }
                        TxnOp::Delete { key } => self.router.mirror_applied_write(key, None).await,
                    }
                }
            }
        }
    }
}

//! Two-phase commit for cross-shard writes
//!
//! Used only when a write batch hashes to two or more shards; ordinary
//! single-shard traffic never pays for coordination. The protocol is the
//! classic blocking one: every participant durably stages the ops, the
//! coordinator logs the decision, then the outcome is pushed out. A
//! coordinator crash between decision and delivery leaves participants
//! blocked until [`TwoPhaseCoordinator::recover`] re-delivers, which is
//! the accepted trade for not running a consensus group here.

mod coordinator;
mod decision_log;

pub use coordinator::{TwoPhaseCoordinator, TxnStats};
pub use decision_log::DecisionRecord;
pub(crate) use decision_log::DecisionLog;

use crate::ShardId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of one coordinated transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TxnState {
    /// Created, participants not yet contacted
    Init,
    /// Prepare fan-out in flight
    Preparing,
    /// Every participant voted yes
    Prepared,
    /// Commit decision logged, delivery in progress
    Committing,
    /// All done, effects applied
    Committed,
    /// Abort decision logged, delivery in progress
    Aborting,
    /// Rolled back, no effects applied
    Aborted,
}

impl TxnState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TxnState::Committed | TxnState::Aborted)
    }
}

/// The durably-logged outcome of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TxnDecision {
    Commit,
    Abort,
}

/// Coordinator-side view of one in-flight transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub tx_id: String,
    pub participants: Vec<ShardId>,
    pub state: TxnState,
    pub created_at: DateTime<Utc>,
}

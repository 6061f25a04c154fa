//! Online range migrations between shards
//!
//! A topology change (adding or draining a shard) becomes one or more
//! migration jobs, each moving the hash ranges of a set of vnodes from one
//! source shard to one target shard. Jobs advance through a strictly
//! forward state machine:
//!
//! ```text
//! PENDING -> DUAL_WRITE -> BACKFILLING -> CUTOVER -> CLEANUP -> DONE
//!                \______________\____________\___________\--> FAILED
//! ```
//!
//! Every transition is persisted before it is acted on, so a coordinator
//! crash at any point resumes from the recorded phase. A FAILED job leaves
//! the ring exactly as it was; the source stays authoritative.

mod coordinator;
mod store;

pub use coordinator::MigrationCoordinator;
pub(crate) use store::JobStore;

use crate::ring::{HashRange, RingEntry};
use crate::ShardId;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// Phase of a migration job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MigrationPhase {
    /// Created and durably recorded, nothing moved yet
    Pending,
    /// Writes to the moving ranges go to both source and target
    DualWrite,
    /// Historical keys are streaming from source to target
    Backfilling,
    /// Target verified caught up; ring ownership flips
    Cutover,
    /// Waiting out the quiescence period, then deleting source copies
    Cleanup,
    /// Terminal success
    Done,
    /// Terminal failure; ring unchanged, operator intervention required
    Failed,
}

impl MigrationPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, MigrationPhase::Done | MigrationPhase::Failed)
    }

    /// Phases during which writes must land on both source and target.
    /// Dual-writing stops the moment the ring flip is published, which is
    /// when the job leaves `Cutover`.
    pub fn dual_writes(&self) -> bool {
        matches!(
            self,
            MigrationPhase::DualWrite | MigrationPhase::Backfilling | MigrationPhase::Cutover
        )
    }
}

/// One range migration from a source shard to a target shard
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationJob {
    /// Unique job id
    pub job_id: String,
    /// Shard currently owning the moving ranges
    pub source_shard: ShardId,
    /// Shard taking them over
    pub target_shard: ShardId,
    /// Hash ranges moving with this job
    pub ranges: Vec<HashRange>,
    /// Vnode indices flipping at cutover: the target's vnodes when a shard
    /// is being added, the source's when one is being drained
    pub vnodes: Vec<u32>,
    /// Drain jobs remove the source's vnodes at cutover instead of
    /// inserting the target's
    pub drain: bool,
    /// Current phase
    pub phase: MigrationPhase,
    /// Last key confirmed copied by backfill; resume point after a crash
    pub high_water_mark: Option<String>,
    /// Keys copied so far
    pub copied_keys: u64,
    /// Set when the ring flip is published; cleanup waits out the
    /// quiescence period from this stamp
    pub cutover_at: Option<DateTime<Utc>>,
    /// Populated when the job fails
    pub failure: Option<String>,
    /// Token of the coordinator instance driving this job; refreshed when
    /// a restarted coordinator takes the job over
    pub fence_token: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MigrationJob {
    pub(crate) fn new(
        source_shard: &str,
        target_shard: &str,
        ranges: Vec<HashRange>,
        vnodes: Vec<u32>,
        drain: bool,
    ) -> Self {
        let now = Utc::now();
        Self {
            job_id: uuid::Uuid::new_v4().to_string(),
            source_shard: source_shard.to_string(),
            target_shard: target_shard.to_string(),
            ranges,
            vnodes,
            drain,
            phase: MigrationPhase::Pending,
            high_water_mark: None,
            copied_keys: 0,
            cutover_at: None,
            failure: None,
            fence_token: uuid::Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }

    /// Whether `key` falls inside this job's moving ranges.
    pub fn covers_key(&self, key: &str) -> bool {
        self.ranges.iter().any(|range| range.contains_key(key))
    }

    pub fn covers_position(&self, position: u64) -> bool {
        self.ranges.iter().any(|range| range.contains(position))
    }

    /// The ring entries this job flips at cutover.
    pub(crate) fn flip_entries(&self) -> Vec<RingEntry> {
        let shard = if self.drain {
            &self.source_shard
        } else {
            &self.target_shard
        };
        self.vnodes
            .iter()
            .map(|&vnode| RingEntry::new(shard, vnode))
            .collect()
    }

    /// Two jobs conflict when any of their ranges overlap. Since ranges are
    /// contiguous arcs, two arcs overlap exactly when one contains the
    /// other's end point.
    pub(crate) fn overlaps(&self, ranges: &[HashRange]) -> bool {
        self.ranges.iter().any(|mine| {
            ranges
                .iter()
                .any(|theirs| mine.contains(theirs.end) || theirs.contains(mine.end))
        })
    }
}

/// Live view of all known migration jobs, shared between the coordinator
/// (writer) and the router (reader on the write path).
#[derive(Default)]
pub struct MigrationTable {
    jobs: DashMap<String, MigrationJob>,
}

impl MigrationTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn update(&self, job: MigrationJob) {
        self.jobs.insert(job.job_id.clone(), job);
    }

    pub(crate) fn remove(&self, job_id: &str) {
        self.jobs.remove(job_id);
    }

    pub fn get(&self, job_id: &str) -> Option<MigrationJob> {
        self.jobs.get(job_id).map(|entry| entry.clone())
    }

    /// All known jobs, oldest first.
    pub fn list(&self) -> Vec<MigrationJob> {
        let mut jobs: Vec<MigrationJob> = self.jobs.iter().map(|entry| entry.clone()).collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.job_id.cmp(&b.job_id)));
        jobs
    }

    /// The job currently dual-writing the range `key` falls into, if any.
    pub(crate) fn dual_write_job_for(&self, key: &str) -> Option<MigrationJob> {
        self.jobs
            .iter()
            .find(|entry| entry.phase.dual_writes() && entry.covers_key(key))
            .map(|entry| entry.clone())
    }

    /// Id of a live job overlapping any of `ranges`, if one exists.
    pub(crate) fn conflicting(&self, ranges: &[HashRange]) -> Option<String> {
        self.jobs
            .iter()
            .find(|entry| !entry.is_terminal() && entry.overlaps(ranges))
            .map(|entry| entry.job_id.clone())
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

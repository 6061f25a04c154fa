//! Durable migration job records.
//!
//! One JSON document per job under `migrations/`. The coordinator is the
//! only writer, so puts are unconditional; what matters is that a phase is
//! on disk before the coordinator acts on it.

use super::MigrationJob;
use crate::persist;
use crate::Result;
use object_store::path::Path;
use object_store::ObjectStore;
use std::sync::Arc;
use tracing::warn;

const JOB_PREFIX: &str = "migrations";

#[derive(Clone)]
pub(crate) struct JobStore {
    store: Arc<dyn ObjectStore>,
}

impl JobStore {
    pub(crate) fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    fn job_path(job_id: &str) -> Path {
        Path::from(format!("{}/{}.json", JOB_PREFIX, job_id))
    }

    pub(crate) async fn persist(&self, job: &MigrationJob) -> Result<()> {
        persist::put_json(&self.store, &Self::job_path(&job.job_id), job).await
    }

    pub(crate) async fn load(&self, job_id: &str) -> Result<Option<MigrationJob>> {
        persist::load_json(&self.store, &Self::job_path(job_id)).await
    }

    pub(crate) async fn remove(&self, job_id: &str) -> Result<()> {
        persist::delete_quiet(&self.store, &Self::job_path(job_id)).await
    }

    /// All job records on disk. Records that fail to parse are skipped with
    /// a warning rather than wedging recovery.
    pub(crate) async fn list(&self) -> Result<Vec<MigrationJob>> {
        let paths = persist::list_prefix(&self.store, &Path::from(JOB_PREFIX)).await?;
        let mut jobs = Vec::with_capacity(paths.len());
        for path in paths {
            match persist::load_json::<MigrationJob>(&self.store, &path).await {
                Ok(Some(job)) => jobs.push(job),
                Ok(None) => {}
                Err(e) => warn!(%path, error = %e, "Skipping unreadable migration record"),
            }
        }
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.job_id.cmp(&b.job_id)));
        Ok(jobs)
    }
}

//! Durable record of job specifications and status.
//!
//! The controller mutates status exclusively through
//! [`JobStore::compare_and_swap_status`]: two concurrent reconciliation
//! passes can never both apply conflicting transitions, the loser gets a
//! [`SchedulerError::StatusConflict`] and re-reads. Any durable keyed store
//! can sit behind the trait; the in-memory implementation doubles as the
//! rebuildable cache in front of one.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{Result, SchedulerError};
use crate::scheduler::job::{FailureReason, Job, JobStatus};

/// Fields applied atomically together with a status swap.
#[derive(Debug, Clone, Default)]
pub struct JobUpdate {
    /// `Some(Some(name))` sets the node group, `Some(None)` clears it.
    pub node_group: Option<Option<String>>,
    pub failure_reason: Option<FailureReason>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub bump_retry: bool,
}

impl JobUpdate {
    pub fn set_group(name: String) -> Self {
        Self {
            node_group: Some(Some(name)),
            ..Default::default()
        }
    }

    /// Settlement of a terminal success or stop: clears the group reference
    /// and stamps the end time.
    pub fn finished() -> Self {
        Self {
            node_group: Some(None),
            finished_at: Some(Utc::now()),
            ..Default::default()
        }
    }

    /// Failure transitions clear the group reference; the group itself is
    /// resolved through the provisioner for teardown.
    pub fn failed(reason: FailureReason) -> Self {
        Self {
            node_group: Some(None),
            failure_reason: Some(reason),
            finished_at: Some(Utc::now()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert or replace a full job record.
    async fn put(&self, job: Job) -> Result<()>;

    async fn get(&self, id: Uuid) -> Result<Job>;

    /// Jobs matching the filter, sorted by submission time.
    async fn list(&self, filter: JobFilter) -> Result<Vec<Job>>;

    /// Swap `expected -> new` and apply `update`, or fail with
    /// `StatusConflict` when the current status is not `expected`.
    /// A conflict is a retry signal, not an error condition.
    async fn compare_and_swap_status(
        &self,
        id: Uuid,
        expected: JobStatus,
        new: JobStatus,
        update: JobUpdate,
    ) -> Result<Job>;
}

/// HashMap-backed store. Also serves as the rebuildable in-memory cache in
/// front of a durable backend: nothing outside it holds job state.
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<Uuid, Job>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn put(&self, job: Job) -> Result<()> {
        self.jobs.write().await.insert(job.id, job);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Job> {
        self.jobs
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(SchedulerError::JobNotFound(id))
    }

    async fn list(&self, filter: JobFilter) -> Result<Vec<Job>> {
        let jobs = self.jobs.read().await;
        let mut out: Vec<Job> = jobs
            .values()
            .filter(|j| filter.status.map_or(true, |s| j.status == s))
            .cloned()
            .collect();
        out.sort_by_key(|j| j.created_at);
        Ok(out)
    }

    async fn compare_and_swap_status(
        &self,
        id: Uuid,
        expected: JobStatus,
        new: JobStatus,
        update: JobUpdate,
    ) -> Result<Job> {
        let mut jobs = self.jobs.write().await;
        let job = jobs.get_mut(&id).ok_or(SchedulerError::JobNotFound(id))?;

        if job.status != expected {
            return Err(SchedulerError::StatusConflict {
                id,
                expected,
                actual: job.status,
            });
        }

        job.status = new;
        if let Some(group) = update.node_group {
            job.node_group = group;
        }
        if update.failure_reason.is_some() {
            job.failure_reason = update.failure_reason;
        }
        if update.started_at.is_some() {
            job.started_at = update.started_at;
        }
        if update.finished_at.is_some() {
            job.finished_at = update.finished_at;
        }
        if update.bump_retry {
            job.retry_count += 1;
        }

        Ok(job.clone())
    }
}

//! Persistence for quarantined jobs, recovery logs and failure patterns.
//!
//! Every write is versioned. Updates carry the version the caller read and
//! succeed only if the stored record still has it, so two sweeps racing on
//! the same job cannot both win.

pub mod memory;
pub mod redis;

use std::cmp::Reverse;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::StoreError;
use crate::recovery::job::DeadLetterJob;
use crate::recovery::log::JobRecoveryLog;
use crate::recovery::pattern::FailurePattern;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

/// Result of an idempotent insert.
#[derive(Debug, Clone, PartialEq)]
pub enum InsertOutcome<T> {
    /// The record was new and has been stored.
    Inserted(T),
    /// A record with the same identity already existed and is returned instead.
    Existing(T),
}

impl<T> InsertOutcome<T> {
    pub fn into_inner(self) -> T {
        match self {
            InsertOutcome::Inserted(t) | InsertOutcome::Existing(t) => t,
        }
    }

    pub fn is_inserted(&self) -> bool {
        matches!(self, InsertOutcome::Inserted(_))
    }
}

/// Storage backend for the recovery engine.
#[async_trait]
pub trait RecoveryStore: Send + Sync {
    /// Inserts a job unless one with the same tenant, original queue, job
    /// type and original job id exists.
    async fn insert_job(
        &self,
        job: &DeadLetterJob,
    ) -> Result<InsertOutcome<DeadLetterJob>, StoreError>;

    async fn get_job(&self, tenant_id: &str, id: Uuid)
        -> Result<Option<DeadLetterJob>, StoreError>;

    /// Writes `job` if the stored version equals `job.version`. Returns the
    /// stored record with its new version, or `None` if another writer won.
    async fn update_job(&self, job: &DeadLetterJob) -> Result<Option<DeadLetterJob>, StoreError>;

    async fn list_jobs(&self, tenant_id: &str) -> Result<Vec<DeadLetterJob>, StoreError>;

    /// Jobs in `RetryScheduled` whose `next_retry_at <= now`, ordered by
    /// priority descending then `next_retry_at` ascending.
    async fn due_jobs(
        &self,
        tenant_id: &str,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<DeadLetterJob>, StoreError>;

    /// Tenants that have at least one job.
    async fn tenants(&self) -> Result<Vec<String>, StoreError>;

    async fn insert_log(&self, log: &JobRecoveryLog) -> Result<JobRecoveryLog, StoreError>;

    async fn get_log(&self, tenant_id: &str, id: Uuid)
        -> Result<Option<JobRecoveryLog>, StoreError>;

    /// Compare-and-set on `log.version`, like [`RecoveryStore::update_job`].
    async fn update_log(&self, log: &JobRecoveryLog)
        -> Result<Option<JobRecoveryLog>, StoreError>;

    /// Logs of one job, oldest first.
    async fn logs_for_job(
        &self,
        tenant_id: &str,
        job_id: Uuid,
    ) -> Result<Vec<JobRecoveryLog>, StoreError>;

    async fn list_logs(&self, tenant_id: &str) -> Result<Vec<JobRecoveryLog>, StoreError>;

    async fn get_pattern(
        &self,
        tenant_id: &str,
        signature: &str,
    ) -> Result<Option<FailurePattern>, StoreError>;

    /// Inserts when `pattern.version == 0`, otherwise compare-and-set.
    /// Returns `None` when the insert collides or the version is stale.
    async fn save_pattern(
        &self,
        pattern: &FailurePattern,
    ) -> Result<Option<FailurePattern>, StoreError>;

    async fn list_patterns(&self, tenant_id: &str) -> Result<Vec<FailurePattern>, StoreError>;

    async fn get_pattern_by_id(
        &self,
        tenant_id: &str,
        id: Uuid,
    ) -> Result<Option<FailurePattern>, StoreError> {
        Ok(self
            .list_patterns(tenant_id)
            .await?
            .into_iter()
            .find(|p| p.id == id))
    }
}

/// Sweep order: priority first, then earliest retry time.
pub(crate) fn sort_for_dispatch(jobs: &mut [DeadLetterJob]) {
    jobs.sort_by_key(|j| (Reverse(j.priority), j.next_retry_at, j.created_at));
}

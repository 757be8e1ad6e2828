//! In-process store backed by tenant-keyed maps.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{sort_for_dispatch, InsertOutcome, RecoveryStore};
use crate::error::StoreError;
use crate::recovery::job::{DeadLetterJob, DeadLetterStatus};
use crate::recovery::log::JobRecoveryLog;
use crate::recovery::pattern::FailurePattern;

#[derive(Default)]
struct TenantData {
    jobs: HashMap<Uuid, DeadLetterJob>,
    /// (queue, job type, original job id) -> quarantine id.
    origins: HashMap<(String, String, String), Uuid>,
    logs: HashMap<Uuid, JobRecoveryLog>,
    patterns: HashMap<String, FailurePattern>,
}

/// Store that keeps everything in memory. State is lost on restart.
#[derive(Default)]
pub struct MemoryStore {
    tenants: RwLock<HashMap<String, TenantData>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecoveryStore for MemoryStore {
    async fn insert_job(
        &self,
        job: &DeadLetterJob,
    ) -> Result<InsertOutcome<DeadLetterJob>, StoreError> {
        let mut tenants = self.tenants.write().await;
        let data = tenants.entry(job.tenant_id.clone()).or_default();

        let origin = (
            job.original_queue.clone(),
            job.original_job_type.clone(),
            job.original_job_id.clone(),
        );
        if let Some(existing) = data.origins.get(&origin).and_then(|id| data.jobs.get(id)) {
            return Ok(InsertOutcome::Existing(existing.clone()));
        }

        let mut stored = job.clone();
        stored.version = 1;
        data.origins.insert(origin, stored.id);
        data.jobs.insert(stored.id, stored.clone());
        Ok(InsertOutcome::Inserted(stored))
    }

    async fn get_job(
        &self,
        tenant_id: &str,
        id: Uuid,
    ) -> Result<Option<DeadLetterJob>, StoreError> {
        let tenants = self.tenants.read().await;
        Ok(tenants.get(tenant_id).and_then(|d| d.jobs.get(&id)).cloned())
    }

    async fn update_job(&self, job: &DeadLetterJob) -> Result<Option<DeadLetterJob>, StoreError> {
        let mut tenants = self.tenants.write().await;
        let Some(current) = tenants
            .get_mut(&job.tenant_id)
            .and_then(|d| d.jobs.get_mut(&job.id))
        else {
            return Ok(None);
        };

        if current.version != job.version {
            return Ok(None);
        }

        let mut next = job.clone();
        next.version = job.version + 1;
        *current = next.clone();
        Ok(Some(next))
    }

    async fn list_jobs(&self, tenant_id: &str) -> Result<Vec<DeadLetterJob>, StoreError> {
        let tenants = self.tenants.read().await;
        Ok(tenants
            .get(tenant_id)
            .map(|d| d.jobs.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn due_jobs(
        &self,
        tenant_id: &str,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<DeadLetterJob>, StoreError> {
        let tenants = self.tenants.read().await;
        let mut due: Vec<DeadLetterJob> = tenants
            .get(tenant_id)
            .map(|d| {
                d.jobs
                    .values()
                    .filter(|j| j.status == DeadLetterStatus::RetryScheduled)
                    .filter(|j| j.next_retry_at.is_some_and(|at| at <= now))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        sort_for_dispatch(&mut due);
        due.truncate(limit);
        Ok(due)
    }

    async fn tenants(&self) -> Result<Vec<String>, StoreError> {
        let tenants = self.tenants.read().await;
        let mut names: Vec<String> = tenants
            .iter()
            .filter(|(_, d)| !d.jobs.is_empty())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        Ok(names)
    }

    async fn insert_log(&self, log: &JobRecoveryLog) -> Result<JobRecoveryLog, StoreError> {
        let mut tenants = self.tenants.write().await;
        let data = tenants.entry(log.tenant_id.clone()).or_default();
        let mut stored = log.clone();
        stored.version = 1;
        data.logs.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn get_log(
        &self,
        tenant_id: &str,
        id: Uuid,
    ) -> Result<Option<JobRecoveryLog>, StoreError> {
        let tenants = self.tenants.read().await;
        Ok(tenants.get(tenant_id).and_then(|d| d.logs.get(&id)).cloned())
    }

    async fn update_log(
        &self,
        log: &JobRecoveryLog,
    ) -> Result<Option<JobRecoveryLog>, StoreError> {
        let mut tenants = self.tenants.write().await;
        let Some(current) = tenants
            .get_mut(&log.tenant_id)
            .and_then(|d| d.logs.get_mut(&log.id))
        else {
            return Ok(None);
        };

        if current.version != log.version {
            return Ok(None);
        }

        let mut next = log.clone();
        next.version = log.version + 1;
        *current = next.clone();
        Ok(Some(next))
    }

    async fn logs_for_job(
        &self,
        tenant_id: &str,
        job_id: Uuid,
    ) -> Result<Vec<JobRecoveryLog>, StoreError> {
        let tenants = self.tenants.read().await;
        let mut logs: Vec<JobRecoveryLog> = tenants
            .get(tenant_id)
            .map(|d| {
                d.logs
                    .values()
                    .filter(|l| l.dead_letter_job_id == job_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        logs.sort_by_key(|l| l.created_at);
        Ok(logs)
    }

    async fn list_logs(&self, tenant_id: &str) -> Result<Vec<JobRecoveryLog>, StoreError> {
        let tenants = self.tenants.read().await;
        Ok(tenants
            .get(tenant_id)
            .map(|d| d.logs.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn get_pattern(
        &self,
        tenant_id: &str,
        signature: &str,
    ) -> Result<Option<FailurePattern>, StoreError> {
        let tenants = self.tenants.read().await;
        Ok(tenants
            .get(tenant_id)
            .and_then(|d| d.patterns.get(signature))
            .cloned())
    }

    async fn save_pattern(
        &self,
        pattern: &FailurePattern,
    ) -> Result<Option<FailurePattern>, StoreError> {
        let mut tenants = self.tenants.write().await;
        let data = tenants.entry(pattern.tenant_id.clone()).or_default();

        match data.patterns.get(&pattern.signature) {
            Some(current) if current.version != pattern.version => return Ok(None),
            None if pattern.version != 0 => return Ok(None),
            _ => {}
        }

        let mut next = pattern.clone();
        next.version = pattern.version + 1;
        data.patterns.insert(next.signature.clone(), next.clone());
        Ok(Some(next))
    }

    async fn list_patterns(&self, tenant_id: &str) -> Result<Vec<FailurePattern>, StoreError> {
        let tenants = self.tenants.read().await;
        Ok(tenants
            .get(tenant_id)
            .map(|d| d.patterns.values().cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recovery::classifier::{classify, ClassifiedError, ErrorType, JobMetadata};
    use crate::recovery::job::FailedJobDescriptor;
    use serde_json::json;

    fn job(tenant: &str, original_id: &str) -> DeadLetterJob {
        let error = ClassifiedError::new(ErrorType::Timeout, "deadline exceeded");
        let failed = FailedJobDescriptor {
            queue_name: "orders".into(),
            job_type: "sync".into(),
            job_id: original_id.into(),
            payload: json!({}),
            options: json!({}),
            attempts_made: 3,
        };
        let c = classify(&error, &JobMetadata::default());
        DeadLetterJob::quarantine(tenant, failed, &error, &c, "UTC".into(), Utc::now())
    }

    #[tokio::test]
    async fn insert_is_idempotent_per_origin() {
        let store = MemoryStore::new();
        let first = store.insert_job(&job("t1", "7")).await.unwrap();
        assert!(first.is_inserted());

        let second = store.insert_job(&job("t1", "7")).await.unwrap();
        assert!(!second.is_inserted());
        assert_eq!(first.into_inner().id, second.into_inner().id);

        // Same origin under another tenant is a different job.
        assert!(store.insert_job(&job("t2", "7")).await.unwrap().is_inserted());
        assert_eq!(store.list_jobs("t1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn stale_update_loses() {
        let store = MemoryStore::new();
        let stored = store.insert_job(&job("t1", "1")).await.unwrap().into_inner();

        let mut a = stored.clone();
        a.assigned_to = Some("alice".into());
        let mut b = stored.clone();
        b.assigned_to = Some("bob".into());

        let won = tokio_test::assert_ok!(store.update_job(&a).await).expect("first write wins");
        assert_eq!(won.version, 2);
        assert!(tokio_test::assert_ok!(store.update_job(&b).await).is_none());

        let current = store.get_job("t1", stored.id).await.unwrap().unwrap();
        assert_eq!(current.assigned_to.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn due_jobs_are_ordered_by_priority_then_retry_time() {
        use crate::recovery::classifier::Priority;
        use uuid::Uuid;

        let store = MemoryStore::new();
        let now = Utc::now();
        let scheduled = |id: &str, priority: Priority, minutes_ago: i64| {
            let mut j = job("t1", id);
            j.priority = priority;
            j.schedule(Uuid::new_v4(), now - chrono::Duration::minutes(minutes_ago), now);
            j
        };

        for j in [
            scheduled("medium-late", Priority::Medium, 1),
            scheduled("critical-late", Priority::Critical, 2),
            scheduled("medium-early", Priority::Medium, 30),
            scheduled("critical-early", Priority::Critical, 20),
            scheduled("not-due", Priority::Critical, -5),
        ] {
            store.insert_job(&j).await.unwrap();
        }
        // Quarantined jobs are never due.
        store.insert_job(&job("t1", "quarantined")).await.unwrap();

        let order = |jobs: Vec<DeadLetterJob>| -> Vec<String> {
            jobs.into_iter().map(|j| j.original_job_id).collect()
        };
        assert_eq!(
            order(store.due_jobs("t1", now, usize::MAX).await.unwrap()),
            vec!["critical-early", "critical-late", "medium-early", "medium-late"]
        );
        assert_eq!(
            order(store.due_jobs("t1", now, 3).await.unwrap()),
            vec!["critical-early", "critical-late", "medium-early"]
        );
    }

    #[tokio::test]
    async fn unknown_tenant_reads_are_empty() {
        let store = MemoryStore::new();
        assert!(store.list_jobs("nobody").await.unwrap().is_empty());
        assert!(store.list_patterns("nobody").await.unwrap().is_empty());
        assert!(store.tenants().await.unwrap().is_empty());
    }
}

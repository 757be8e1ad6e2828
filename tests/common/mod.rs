//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::json;
use tokio::sync::Mutex;
use uuid::Uuid;

use job_recovery::config::model::{AnalysisMode, AppConfig};
use job_recovery::error::{DispatchError, StoreError};
use job_recovery::queue::{JobHandle, PrimaryQueue, ResubmitRequest};
use job_recovery::recovery::{
    DeadLetterJob, FailedJobDescriptor, FailurePattern, JobRecoveryLog, ManualClock, Orchestrator,
};
use job_recovery::store::{InsertOutcome, MemoryStore, RecoveryStore};

/// A Wednesday, 10:00 UTC.
pub fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 4, 10, 0, 0).unwrap()
}

pub fn config() -> AppConfig {
    let mut config = AppConfig::default();
    config.recovery.jitter_max_ms = 0;
    config.patterns.analysis = AnalysisMode::Inline;
    config
}

pub fn failed(id: &str, payload: serde_json::Value) -> FailedJobDescriptor {
    FailedJobDescriptor {
        queue_name: "orders".into(),
        job_type: "sync".into(),
        job_id: id.into(),
        payload,
        options: json!({}),
        attempts_made: 3,
    }
}

/// Primary queue that answers from a script, then falls back to a default.
pub struct ScriptedQueue {
    script: Mutex<VecDeque<Result<(), String>>>,
    fallback: Result<(), String>,
    calls: AtomicUsize,
    requests: Mutex<Vec<ResubmitRequest>>,
}

impl ScriptedQueue {
    pub fn accepting() -> Self {
        Self::with_script(Vec::new(), Ok(()))
    }

    pub fn failing(message: &str) -> Self {
        Self::with_script(Vec::new(), Err(message.to_string()))
    }

    pub fn with_script(script: Vec<Result<(), String>>, fallback: Result<(), String>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback,
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub async fn requests(&self) -> Vec<ResubmitRequest> {
        self.requests.lock().await.clone()
    }
}

#[async_trait]
impl PrimaryQueue for ScriptedQueue {
    async fn resubmit(&self, request: ResubmitRequest) -> Result<JobHandle, DispatchError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        // Let a concurrent sweep run between claim and outcome.
        tokio::task::yield_now().await;

        let queue_name = request.queue_name.clone();
        self.requests.lock().await.push(request);

        let next = self.script.lock().await.pop_front();
        match next.unwrap_or_else(|| self.fallback.clone()) {
            Ok(()) => Ok(JobHandle {
                id: format!("h-{}", n),
                queue_name,
            }),
            Err(message) => Err(DispatchError::Rejected {
                queue: queue_name,
                message,
            }),
        }
    }
}

pub struct Harness {
    pub orchestrator: Arc<Orchestrator>,
    pub store: Arc<MemoryStore>,
    pub queue: Arc<ScriptedQueue>,
    pub clock: Arc<ManualClock>,
}

pub fn harness(config: AppConfig, queue: ScriptedQueue) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let queue = Arc::new(queue);
    let clock = Arc::new(ManualClock::new(start()));
    let orchestrator = Orchestrator::new(&config, store.clone(), queue.clone()).with_clock(clock.clone());
    Harness {
        orchestrator: Arc::new(orchestrator),
        store,
        queue,
        clock,
    }
}

/// Store that fails a set number of log updates, then behaves like the
/// wrapped [`MemoryStore`].
pub struct FlakyStore {
    inner: Arc<MemoryStore>,
    failing_log_updates: AtomicUsize,
}

impl FlakyStore {
    pub fn new(inner: Arc<MemoryStore>) -> Self {
        Self {
            inner,
            failing_log_updates: AtomicUsize::new(0),
        }
    }

    pub fn fail_log_updates(&self, n: usize) {
        self.failing_log_updates.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl RecoveryStore for FlakyStore {
    async fn insert_job(
        &self,
        job: &DeadLetterJob,
    ) -> Result<InsertOutcome<DeadLetterJob>, StoreError> {
        self.inner.insert_job(job).await
    }

    async fn get_job(&self, tenant_id: &str, id: Uuid) -> Result<Option<DeadLetterJob>, StoreError> {
        self.inner.get_job(tenant_id, id).await
    }

    async fn update_job(&self, job: &DeadLetterJob) -> Result<Option<DeadLetterJob>, StoreError> {
        self.inner.update_job(job).await
    }

    async fn list_jobs(&self, tenant_id: &str) -> Result<Vec<DeadLetterJob>, StoreError> {
        self.inner.list_jobs(tenant_id).await
    }

    async fn due_jobs(
        &self,
        tenant_id: &str,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<DeadLetterJob>, StoreError> {
        self.inner.due_jobs(tenant_id, now, limit).await
    }

    async fn tenants(&self) -> Result<Vec<String>, StoreError> {
        self.inner.tenants().await
    }

    async fn insert_log(&self, log: &JobRecoveryLog) -> Result<JobRecoveryLog, StoreError> {
        self.inner.insert_log(log).await
    }

    async fn get_log(&self, tenant_id: &str, id: Uuid) -> Result<Option<JobRecoveryLog>, StoreError> {
        self.inner.get_log(tenant_id, id).await
    }

    async fn update_log(&self, log: &JobRecoveryLog) -> Result<Option<JobRecoveryLog>, StoreError> {
        let armed = self
            .failing_log_updates
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if armed {
            return Err(StoreError::CommandFailed("connection reset".into()));
        }
        self.inner.update_log(log).await
    }

    async fn logs_for_job(
        &self,
        tenant_id: &str,
        job_id: Uuid,
    ) -> Result<Vec<JobRecoveryLog>, StoreError> {
        self.inner.logs_for_job(tenant_id, job_id).await
    }

    async fn list_logs(&self, tenant_id: &str) -> Result<Vec<JobRecoveryLog>, StoreError> {
        self.inner.list_logs(tenant_id).await
    }

    async fn get_pattern(
        &self,
        tenant_id: &str,
        signature: &str,
    ) -> Result<Option<FailurePattern>, StoreError> {
        self.inner.get_pattern(tenant_id, signature).await
    }

    async fn save_pattern(
        &self,
        pattern: &FailurePattern,
    ) -> Result<Option<FailurePattern>, StoreError> {
        self.inner.save_pattern(pattern).await
    }

    async fn list_patterns(&self, tenant_id: &str) -> Result<Vec<FailurePattern>, StoreError> {
        self.inner.list_patterns(tenant_id).await
    }
}

/// Like [`harness`], but the orchestrator writes through a [`FlakyStore`].
pub fn flaky_harness(config: AppConfig, queue: ScriptedQueue) -> (Harness, Arc<FlakyStore>) {
    let store = Arc::new(MemoryStore::new());
    let flaky = Arc::new(FlakyStore::new(store.clone()));
    let queue = Arc::new(queue);
    let clock = Arc::new(ManualClock::new(start()));
    let orchestrator =
        Orchestrator::new(&config, flaky.clone(), queue.clone()).with_clock(clock.clone());
    let harness = Harness {
        orchestrator: Arc::new(orchestrator),
        store,
        queue,
        clock,
    };
    (harness, flaky)
}

//! Boundary to the primary task queue: resubmission of recovered jobs and
//! intake of jobs the queue gave up on.

pub mod intake;
pub mod redis;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DispatchError;

pub use intake::{ExhaustedJob, IntakeConsumer};
pub use redis::RedisPrimaryQueue;

/// A job handed back to the primary queue for a single attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResubmitRequest {
    pub queue_name: String,
    pub job_type: String,
    pub payload: serde_json::Value,
    pub options: serde_json::Value,
    pub tenant_id: String,
    pub dead_letter_job_id: Uuid,
    pub recovery_log_id: Uuid,
}

/// Identifies a job accepted by the primary queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobHandle {
    pub id: String,
    pub queue_name: String,
}

/// The primary queue as seen by the recovery engine.
///
/// Resubmission is a single attempt with no queue-side backoff. Duplicate
/// resubmissions are tolerated by the queue; duplicate recoveries are
/// prevented by the recovery ledger.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PrimaryQueue: Send + Sync {
    async fn resubmit(&self, request: ResubmitRequest) -> Result<JobHandle, DispatchError>;
}

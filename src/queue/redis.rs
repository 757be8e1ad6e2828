//! Redis list-based primary queue.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{JobHandle, PrimaryQueue, ResubmitRequest};
use crate::error::{DispatchError, StoreError};

/// Envelope written for a resubmitted job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedJob {
    pub id: String,
    pub job_type: String,
    pub payload: serde_json::Value,
    pub options: serde_json::Value,
    /// Always 1: backoff between attempts belongs to the recovery engine.
    pub max_attempts: u32,
    pub enqueued_at: DateTime<Utc>,
    pub recovery: RecoveryOrigin,
}

/// Links a resubmitted job back to its quarantine record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryOrigin {
    pub tenant_id: String,
    pub dead_letter_job_id: Uuid,
    pub recovery_log_id: Uuid,
}

/// Pushes jobs onto Redis lists named `{prefix}{queue}`.
#[derive(Clone)]
pub struct RedisPrimaryQueue {
    connection: redis::aio::ConnectionManager,
    prefix: String,
}

impl RedisPrimaryQueue {
    /// Creates a queue client connected to the specified Redis URL.
    pub async fn new(redis_url: &str, prefix: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url).map_err(|e| StoreError::ConnectionFailed {
            url: redis_url.to_string(),
            message: e.to_string(),
        })?;

        let connection =
            client
                .get_connection_manager()
                .await
                .map_err(|e| StoreError::ConnectionFailed {
                    url: redis_url.to_string(),
                    message: e.to_string(),
                })?;

        Ok(Self {
            connection,
            prefix: prefix.to_string(),
        })
    }

    fn queue_key(&self, queue: &str) -> String {
        format!("{}{}", self.prefix, queue)
    }

    fn job_key(&self, id: &str) -> String {
        format!("{}job:{}", self.prefix, id)
    }
}

#[async_trait]
impl PrimaryQueue for RedisPrimaryQueue {
    async fn resubmit(&self, request: ResubmitRequest) -> Result<JobHandle, DispatchError> {
        let job = QueuedJob {
            id: Uuid::new_v4().to_string(),
            job_type: request.job_type,
            payload: request.payload,
            options: request.options,
            max_attempts: 1,
            enqueued_at: Utc::now(),
            recovery: RecoveryOrigin {
                tenant_id: request.tenant_id,
                dead_letter_job_id: request.dead_letter_job_id,
                recovery_log_id: request.recovery_log_id,
            },
        };

        let job_json = serde_json::to_string(&job)
            .map_err(|e| DispatchError::SerializationFailed(e.to_string()))?;

        let mut conn = self.connection.clone();

        // Store the job data
        conn.set::<_, _, ()>(self.job_key(&job.id), &job_json)
            .await
            .map_err(|e| DispatchError::Unavailable(e.to_string()))?;

        // Add job ID to the queue
        conn.rpush::<_, _, ()>(self.queue_key(&request.queue_name), &job.id)
            .await
            .map_err(|e| DispatchError::Rejected {
                queue: request.queue_name.clone(),
                message: e.to_string(),
            })?;

        Ok(JobHandle {
            id: job.id,
            queue_name: request.queue_name,
        })
    }
}

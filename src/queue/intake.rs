//! Intake of jobs the primary queue gave up on.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::error::{RecoveryError, StoreError};
use crate::recovery::classifier::ClassifiedError;
use crate::recovery::Orchestrator;

/// Failure report published by the primary queue when a job exhausts its
/// own retries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExhaustedJob {
    pub tenant_id: String,
    pub queue_name: String,
    pub job_type: String,
    pub job_id: String,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub options: serde_json::Value,
    #[serde(default)]
    pub attempts_made: u32,
    pub error: ClassifiedError,
}

/// Pops [`ExhaustedJob`] reports off a Redis list and quarantines them.
pub struct IntakeConsumer {
    connection: redis::aio::ConnectionManager,
    key: String,
    orchestrator: Arc<Orchestrator>,
    poll_interval: Duration,
}

impl IntakeConsumer {
    pub async fn new(
        redis_url: &str,
        key: &str,
        orchestrator: Arc<Orchestrator>,
        poll_interval: Duration,
    ) -> Result<Self, StoreError> {
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
            key: key.to_string(),
            orchestrator,
            poll_interval,
        })
    }

    /// Runs the intake loop until the task is cancelled.
    pub async fn run(&self) -> Result<()> {
        info!(key = %self.key, "Starting intake consumer");

        loop {
            match self.next_report().await {
                Ok(Some(raw)) => self.handle(raw).await,
                Ok(None) => tokio::time::sleep(self.poll_interval).await,
                Err(e) => {
                    error!(error = %e, "Failed to read intake queue");
                    tokio::time::sleep(self.poll_interval * 10).await;
                }
            }
        }
    }

    async fn next_report(&self) -> Result<Option<String>, StoreError> {
        let mut conn = self.connection.clone();
        let raw: Option<String> = conn.lpop(&self.key, None).await?;
        Ok(raw)
    }

    async fn handle(&self, raw: String) {
        let report = match parse_report(&raw) {
            Ok(report) => report,
            Err(e) => {
                error!(error = %e, "Dropping malformed exhausted-job report");
                return;
            }
        };

        let tenant_id = report.tenant_id.clone();
        let original_job_id = report.job_id.clone();

        match self.orchestrator.on_job_exhausted(report).await {
            Ok(job) => info!(
                tenant_id = %tenant_id,
                job_id = %job.id,
                original_job_id = %original_job_id,
                status = %job.status,
                "Exhausted job accepted"
            ),
            Err(RecoveryError::Persistence(e)) => {
                warn!(
                    tenant_id = %tenant_id,
                    original_job_id = %original_job_id,
                    error = %e,
                    "Store unavailable, returning report to intake queue"
                );
                let mut conn = self.connection.clone();
                if let Err(e) = conn.rpush::<_, _, ()>(&self.key, &raw).await {
                    error!(error = %e, "Failed to return report to intake queue");
                }
                tokio::time::sleep(self.poll_interval).await;
            }
            Err(e) => error!(
                tenant_id = %tenant_id,
                original_job_id = %original_job_id,
                error = %e,
                "Failed to quarantine exhausted job"
            ),
        }
    }
}

fn parse_report(raw: &str) -> Result<ExhaustedJob, serde_json::Error> {
    serde_json::from_str(raw)
}

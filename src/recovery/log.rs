//! Recovery ledger entries: one record per recovery attempt.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One audited attempt to re-run a dead-letter job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobRecoveryLog {
    pub id: Uuid,
    pub tenant_id: String,
    pub dead_letter_job_id: Uuid,

    /// Pattern that triggered or shaped this attempt, if any.
    pub failure_pattern_id: Option<Uuid>,

    pub status: RecoveryLogStatus,
    pub recovery_method: RecoveryMethod,
    pub recovery_strategy: RecoveryStrategy,
    pub recovery_trigger: RecoveryTrigger,

    /// Snapshot of what will be (or was) dispatched.
    pub recovery_configuration: RecoveryConfiguration,
    pub recovery_result: Option<RecoveryResult>,

    pub created_at: DateTime<Utc>,
    pub recovery_started_at: Option<DateTime<Utc>>,
    pub recovery_completed_at: Option<DateTime<Utc>>,
    pub recovery_failed_at: Option<DateTime<Utc>>,

    /// Set once, on the first transition into a terminal state.
    pub recovery_duration_ms: Option<i64>,

    pub requires_approval: bool,
    pub approved_by: Option<String>,
    pub approved_at: Option<DateTime<Utc>>,
    pub approval_notes: Option<String>,
    pub initiated_by: Option<String>,

    #[serde(default)]
    pub version: u64,
}

/// Configuration snapshot taken when the attempt is scheduled.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecoveryConfiguration {
    /// Payload that will be resubmitted.
    pub job_data: serde_json::Value,
    pub job_options: serde_json::Value,
    pub target_queue: String,
    pub job_type: String,
    /// True if the payload or target differs from the original.
    pub modified: bool,

    pub attempt_number: u32,
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub computed_delay_ms: u64,
    pub scheduled_for: DateTime<Utc>,

    pub business_hours_only: bool,
    pub holiday_sensitive: bool,
    pub ramadan_sensitive: bool,
    pub timezone: String,
}

/// Outcome of a finished attempt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecoveryResult {
    pub success: bool,
    pub error: Option<String>,
    /// Handle returned by the primary queue on resubmission.
    pub job_handle: Option<String>,
    pub target_queue: String,
    pub attempt_number: u32,
    pub duration_ms: Option<i64>,
}

impl JobRecoveryLog {
    /// True until the attempt reaches a terminal state.
    pub fn is_active(&self) -> bool {
        !self.status.is_terminal()
    }

    /// True if the attempt is blocked on an approval decision.
    pub fn is_awaiting_approval(&self) -> bool {
        self.requires_approval && self.approved_at.is_none() && self.is_active()
    }

    /// Moves the attempt to `InProgress`.
    pub fn start(&mut self, now: DateTime<Utc>) -> bool {
        if self.status != RecoveryLogStatus::Initiated {
            return false;
        }
        self.status = RecoveryLogStatus::InProgress;
        self.recovery_started_at = Some(now);
        true
    }

    /// Records approval.
    pub fn approve(&mut self, by: &str, notes: Option<String>, now: DateTime<Utc>) {
        self.approved_by = Some(by.to_string());
        self.approved_at = Some(now);
        self.approval_notes = notes;
    }

    pub fn complete(&mut self, mut result: RecoveryResult, now: DateTime<Utc>) -> bool {
        if !self.finish(RecoveryLogStatus::Completed, now) {
            return false;
        }
        self.recovery_completed_at = Some(now);
        result.duration_ms = self.recovery_duration_ms;
        self.recovery_result = Some(result);
        true
    }

    pub fn fail(&mut self, mut result: RecoveryResult, now: DateTime<Utc>) -> bool {
        if !self.finish(RecoveryLogStatus::Failed, now) {
            return false;
        }
        self.recovery_failed_at = Some(now);
        result.duration_ms = self.recovery_duration_ms;
        self.recovery_result = Some(result);
        true
    }

    pub fn time_out(&mut self, now: DateTime<Utc>) -> bool {
        if !self.finish(RecoveryLogStatus::Timeout, now) {
            return false;
        }
        self.recovery_failed_at = Some(now);
        self.recovery_result = Some(RecoveryResult {
            success: false,
            error: Some("recovery outcome not reported before the watchdog ceiling".into()),
            job_handle: None,
            target_queue: self.recovery_configuration.target_queue.clone(),
            attempt_number: self.recovery_configuration.attempt_number,
            duration_ms: self.recovery_duration_ms,
        });
        true
    }

    pub fn cancel(&mut self, reason: &str, now: DateTime<Utc>) -> bool {
        if !self.finish(RecoveryLogStatus::Cancelled, now) {
            return false;
        }
        self.recovery_failed_at = Some(now);
        self.recovery_result = Some(RecoveryResult {
            success: false,
            error: Some(reason.to_string()),
            job_handle: None,
            target_queue: self.recovery_configuration.target_queue.clone(),
            attempt_number: self.recovery_configuration.attempt_number,
            duration_ms: self.recovery_duration_ms,
        });
        true
    }

    /// Enters a terminal state. Terminal logs are never mutated again.
    fn finish(&mut self, status: RecoveryLogStatus, now: DateTime<Utc>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = status;
        self.recovery_duration_ms = self
            .recovery_started_at
            .map(|started| (now - started).num_milliseconds());
        true
    }
}

/// Status of a recovery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecoveryLogStatus {
    Initiated,
    InProgress,
    Completed,
    Failed,
    Timeout,
    Cancelled,
}

impl RecoveryLogStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(
            self,
            RecoveryLogStatus::Initiated | RecoveryLogStatus::InProgress
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryLogStatus::Initiated => "INITIATED",
            RecoveryLogStatus::InProgress => "IN_PROGRESS",
            RecoveryLogStatus::Completed => "COMPLETED",
            RecoveryLogStatus::Failed => "FAILED",
            RecoveryLogStatus::Timeout => "TIMEOUT",
            RecoveryLogStatus::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for RecoveryLogStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the attempt re-runs the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecoveryMethod {
    AutomaticRetry,
    ManualRetry,
    ModifiedPayload,
}

/// When the attempt should run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum RecoveryStrategy {
    /// Exponential backoff from the failure type's base delay.
    ExponentialBackoff,
    /// As soon as the sweep picks it up.
    Immediate,
    /// A fixed delay.
    FixedDelay { seconds: u64 },
    /// The next opening of the business window, regardless of job flags.
    NextBusinessWindow,
}

impl std::str::FromStr for RecoveryStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "exponential_backoff" | "backoff" => Ok(RecoveryStrategy::ExponentialBackoff),
            "immediate" => Ok(RecoveryStrategy::Immediate),
            "next_business_window" | "business_window" => {
                Ok(RecoveryStrategy::NextBusinessWindow)
            }
            other => other
                .strip_prefix("fixed:")
                .and_then(|secs| secs.parse().ok())
                .map(|seconds| RecoveryStrategy::FixedDelay { seconds })
                .ok_or_else(|| format!("unknown recovery strategy '{}'", s)),
        }
    }
}

/// What caused the attempt to be scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecoveryTrigger {
    Automatic,
    Manual,
    PatternDetected,
    Watchdog,
}

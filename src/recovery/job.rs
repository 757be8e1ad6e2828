//! Dead-letter job definitions.

use std::fmt;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::calendar::ScheduleConstraints;
use super::classifier::{Classification, ClassifiedError, FailureType, Priority};

/// A job that exhausted its primary-queue retry budget and is quarantined
/// for managed recovery.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeadLetterJob {
    /// Unique identifier for this quarantine record.
    pub id: Uuid,

    /// Tenant owning the job.
    pub tenant_id: String,

    /// Queue the job originally ran on.
    pub original_queue: String,

    /// Job type (handler name) on the original queue.
    pub original_job_type: String,

    /// Job id assigned by the primary queue.
    pub original_job_id: String,

    /// Opaque original payload. Never modified after ingestion.
    pub original_job_data: serde_json::Value,

    /// Opaque scheduling hints passed to the primary queue.
    pub original_job_options: serde_json::Value,

    /// Attempts the primary queue made before giving up.
    pub attempts_made: u32,

    pub failure_type: FailureType,
    pub failure_reason: String,
    pub stack_trace: Option<String>,
    pub error_details: Option<serde_json::Value>,

    pub status: DeadLetterStatus,
    pub priority: Priority,

    /// Recovery attempts scheduled so far.
    pub retry_count: u32,
    pub max_retries: u32,

    pub first_failure_at: DateTime<Utc>,
    pub last_failure_at: DateTime<Utc>,
    pub last_retry_at: Option<DateTime<Utc>>,

    /// Set if and only if `status` is `RetryScheduled`.
    pub next_retry_at: Option<DateTime<Utc>>,
    pub recovered_at: Option<DateTime<Utc>>,

    pub is_critical: bool,
    pub requires_manual_intervention: bool,
    pub is_business_hours_only: bool,
    pub is_holiday_sensitive: bool,
    pub is_ramadan_sensitive: bool,

    /// IANA timezone name used for business-window scheduling.
    pub timezone: String,

    pub platform: Option<String>,
    pub channel: Option<String>,
    pub assigned_to: Option<String>,

    /// Recovery log currently in flight, if any.
    pub active_recovery_id: Option<Uuid>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    /// Optimistic concurrency token, bumped by the store on every write.
    #[serde(default)]
    pub version: u64,
}

/// The failed job as reported by the primary queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedJobDescriptor {
    pub queue_name: String,
    pub job_type: String,
    pub job_id: String,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub options: serde_json::Value,
    #[serde(default)]
    pub attempts_made: u32,
}

impl DeadLetterJob {
    /// Builds a quarantine record from a classified failure.
    pub fn quarantine(
        tenant_id: &str,
        failed: FailedJobDescriptor,
        error: &ClassifiedError,
        classification: &Classification,
        timezone: String,
        now: DateTime<Utc>,
    ) -> Self {
        let platform = payload_str(&failed.payload, &["platform"]);
        let channel = payload_str(&failed.payload, &["channel"]);

        Self {
            id: Uuid::new_v4(),
            tenant_id: tenant_id.to_string(),
            original_queue: failed.queue_name,
            original_job_type: failed.job_type,
            original_job_id: failed.job_id,
            original_job_data: failed.payload,
            original_job_options: failed.options,
            attempts_made: failed.attempts_made,
            failure_type: classification.failure_type,
            failure_reason: error.message.clone(),
            stack_trace: error.original_error.clone(),
            error_details: if error.context.is_null() {
                None
            } else {
                Some(error.context.clone())
            },
            status: DeadLetterStatus::Quarantined,
            priority: classification.priority,
            retry_count: 0,
            max_retries: classification.max_retries,
            first_failure_at: now,
            last_failure_at: now,
            last_retry_at: None,
            next_retry_at: None,
            recovered_at: None,
            is_critical: classification.is_critical,
            requires_manual_intervention: classification.requires_manual_intervention,
            is_business_hours_only: classification.is_business_hours_only,
            is_holiday_sensitive: classification.is_holiday_sensitive,
            is_ramadan_sensitive: classification.is_ramadan_sensitive,
            timezone,
            platform,
            channel,
            assigned_to: None,
            active_recovery_id: None,
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }

    /// Checks whether another recovery attempt may be scheduled.
    pub fn can_retry(&self) -> Result<(), String> {
        match self.status {
            DeadLetterStatus::PermanentlyFailed => {
                return Err("job is permanently failed".to_string())
            }
            DeadLetterStatus::Recovered => return Err("job is already recovered".to_string()),
            DeadLetterStatus::Archived => return Err("job is archived".to_string()),
            _ => {}
        }

        if self.retry_count >= self.max_retries {
            return Err("maximum retries exceeded".to_string());
        }

        if self.active_recovery_id.is_some() {
            return Err("a recovery attempt is already in flight".to_string());
        }

        Ok(())
    }

    /// Returns true if retry budget remains after the current attempt.
    pub fn has_budget(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Scheduling constraints derived from the policy flags.
    pub fn constraints(&self) -> ScheduleConstraints {
        ScheduleConstraints {
            business_hours_only: self.is_business_hours_only,
            holiday_sensitive: self.is_holiday_sensitive,
            ramadan_sensitive: self.is_ramadan_sensitive,
            timezone: self.tz(),
        }
    }

    /// Parsed timezone, falling back to UTC for unknown names.
    pub fn tz(&self) -> Tz {
        self.timezone.parse().unwrap_or(Tz::UTC)
    }

    /// Marks a retry as scheduled for `at` under recovery log `log_id`.
    ///
    /// The first recovery attempt re-runs the job that was quarantined and
    /// does not consume budget. Every attempt after a dispatch does.
    pub fn schedule(&mut self, log_id: Uuid, at: DateTime<Utc>, now: DateTime<Utc>) {
        self.status = DeadLetterStatus::RetryScheduled;
        self.next_retry_at = Some(at);
        self.active_recovery_id = Some(log_id);
        if self.last_retry_at.is_some() {
            self.retry_count += 1;
        }
        self.updated_at = now;
    }

    /// Reopens a permanently failed job with `extra` additional retries.
    pub fn reopen(&mut self, extra: u32, now: DateTime<Utc>) {
        self.status = DeadLetterStatus::Quarantined;
        self.max_retries = self.max_retries.saturating_add(extra);
        self.next_retry_at = None;
        self.active_recovery_id = None;
        self.updated_at = now;
    }

    /// 1-based number of the next recovery attempt.
    pub fn next_attempt_number(&self) -> u32 {
        if self.last_retry_at.is_some() {
            self.retry_count + 2
        } else {
            1
        }
    }

    /// Returns a claimed job to `RetryScheduled` without recording an attempt.
    pub fn requeue(&mut self, at: DateTime<Utc>, now: DateTime<Utc>) {
        self.status = DeadLetterStatus::RetryScheduled;
        self.next_retry_at = Some(at);
        self.updated_at = now;
    }

    /// Undoes a claim whose attempt was never started. The attempt stays
    /// pending and is due immediately.
    pub fn unclaim(&mut self, first_attempt: bool, now: DateTime<Utc>) {
        self.requeue(now, now);
        if first_attempt {
            self.last_retry_at = None;
        }
    }

    /// Moves a scheduled retry to a new time without consuming budget.
    pub fn reschedule(&mut self, at: DateTime<Utc>, now: DateTime<Utc>) {
        self.next_retry_at = Some(at);
        self.updated_at = now;
    }

    /// Claims the job for dispatch.
    pub fn begin_retry(&mut self, now: DateTime<Utc>) {
        self.status = DeadLetterStatus::Retrying;
        self.next_retry_at = None;
        self.last_retry_at = Some(now);
        self.updated_at = now;
    }

    /// Marks the job as recovered.
    pub fn recover(&mut self, now: DateTime<Utc>) {
        self.status = DeadLetterStatus::Recovered;
        self.recovered_at = Some(now);
        self.next_retry_at = None;
        self.active_recovery_id = None;
        self.updated_at = now;
    }

    /// Records a failed recovery attempt and releases the active log.
    pub fn record_failure(&mut self, reason: &str, now: DateTime<Utc>) {
        self.status = DeadLetterStatus::Quarantined;
        self.failure_reason = reason.to_string();
        self.last_failure_at = now;
        self.next_retry_at = None;
        self.active_recovery_id = None;
        self.updated_at = now;
    }

    /// Marks the job as terminally failed.
    pub fn permanently_fail(&mut self, now: DateTime<Utc>) {
        self.status = DeadLetterStatus::PermanentlyFailed;
        self.next_retry_at = None;
        self.active_recovery_id = None;
        self.updated_at = now;
    }

    /// Archives the job.
    pub fn archive(&mut self, now: DateTime<Utc>) {
        self.status = DeadLetterStatus::Archived;
        self.next_retry_at = None;
        self.active_recovery_id = None;
        self.updated_at = now;
    }

    /// Returns the job to quarantine after its pending attempt was withdrawn.
    pub fn release(&mut self, now: DateTime<Utc>) {
        self.status = DeadLetterStatus::Quarantined;
        self.next_retry_at = None;
        self.active_recovery_id = None;
        if self.last_retry_at.is_some() {
            self.retry_count = self.retry_count.saturating_sub(1);
        }
        self.updated_at = now;
    }

    /// True if the job is scheduled or quarantined and its retry time has passed.
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        matches!(
            self.status,
            DeadLetterStatus::RetryScheduled | DeadLetterStatus::Quarantined
        ) && self.next_retry_at.is_some_and(|at| at < now)
    }

    /// True if the job's payload carries any calendar sensitivity.
    pub fn is_calendar_sensitive(&self) -> bool {
        self.is_holiday_sensitive || self.is_ramadan_sensitive
    }
}

/// Reads the first string field present among `keys` from a payload object.
pub(crate) fn payload_str(payload: &serde_json::Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|k| payload.get(*k))
        .and_then(|v| match v {
            serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
}

/// Reads the first boolean field present among `keys` from a payload object.
pub(crate) fn payload_flag(payload: &serde_json::Value, keys: &[&str]) -> bool {
    keys.iter()
        .find_map(|k| payload.get(*k))
        .and_then(|v| v.as_bool())
        .unwrap_or(false)
}

/// Recovery status of a dead-letter job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeadLetterStatus {
    /// Captured, waiting for a recovery decision.
    Quarantined,
    /// A recovery attempt is scheduled for `next_retry_at`.
    RetryScheduled,
    /// A recovery attempt was dispatched and its outcome is pending.
    Retrying,
    /// A recovery attempt succeeded.
    Recovered,
    /// Retry budget exhausted. Needs human review.
    PermanentlyFailed,
    /// Withdrawn by an operator.
    Archived,
}

impl DeadLetterStatus {
    pub const ALL: [DeadLetterStatus; 6] = [
        DeadLetterStatus::Quarantined,
        DeadLetterStatus::RetryScheduled,
        DeadLetterStatus::Retrying,
        DeadLetterStatus::Recovered,
        DeadLetterStatus::PermanentlyFailed,
        DeadLetterStatus::Archived,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DeadLetterStatus::Quarantined => "QUARANTINED",
            DeadLetterStatus::RetryScheduled => "RETRY_SCHEDULED",
            DeadLetterStatus::Retrying => "RETRYING",
            DeadLetterStatus::Recovered => "RECOVERED",
            DeadLetterStatus::PermanentlyFailed => "PERMANENTLY_FAILED",
            DeadLetterStatus::Archived => "ARCHIVED",
        }
    }

    /// True for states no automatic process leaves.
    pub fn is_retired(&self) -> bool {
        matches!(
            self,
            DeadLetterStatus::Recovered
                | DeadLetterStatus::PermanentlyFailed
                | DeadLetterStatus::Archived
        )
    }
}

impl fmt::Display for DeadLetterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DeadLetterStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_uppercase().replace('-', "_");
        DeadLetterStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == normalized)
            .ok_or_else(|| format!("unknown job status '{}'", s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recovery::classifier::{classify, ErrorType, JobMetadata};
    use serde_json::json;

    fn sample_job() -> DeadLetterJob {
        let error = ClassifiedError::new(ErrorType::Network, "connection reset");
        let failed = FailedJobDescriptor {
            queue_name: "orders".to_string(),
            job_type: "sync_order".to_string(),
            job_id: "42".to_string(),
            payload: json!({"platform": "shopify", "channel": "web"}),
            options: json!({}),
            attempts_made: 5,
        };
        let meta = JobMetadata::from_payload(&failed.payload, &failed.options);
        let classification = classify(&error, &meta);
        DeadLetterJob::quarantine("t1", failed, &error, &classification, "UTC".into(), Utc::now())
    }

    #[test]
    fn quarantine_extracts_payload_context() {
        let job = sample_job();
        assert_eq!(job.status, DeadLetterStatus::Quarantined);
        assert_eq!(job.platform.as_deref(), Some("shopify"));
        assert_eq!(job.channel.as_deref(), Some("web"));
        assert_eq!(job.max_retries, 3);
        assert!(job.next_retry_at.is_none());
    }

    #[test]
    fn unclaim_restores_first_attempt() {
        let now = Utc::now();
        let mut job = sample_job();
        job.schedule(Uuid::new_v4(), now, now);
        job.begin_retry(now);
        assert_eq!(job.status, DeadLetterStatus::Retrying);

        job.unclaim(true, now);
        assert_eq!(job.status, DeadLetterStatus::RetryScheduled);
        assert_eq!(job.next_retry_at, Some(now));
        assert!(job.last_retry_at.is_none());
        assert_eq!(job.retry_count, 0);
    }

    #[test]
    fn can_retry_rejects_exhausted_and_in_flight() {
        let mut job = sample_job();
        assert!(job.can_retry().is_ok());

        job.schedule(Uuid::new_v4(), Utc::now(), Utc::now());
        assert_eq!(
            job.can_retry().unwrap_err(),
            "a recovery attempt is already in flight"
        );

        job.active_recovery_id = None;
        job.retry_count = job.max_retries;
        assert_eq!(job.can_retry().unwrap_err(), "maximum retries exceeded");
    }

    #[test]
    fn next_retry_at_tracks_scheduled_status() {
        let mut job = sample_job();
        let now = Utc::now();
        job.schedule(Uuid::new_v4(), now, now);
        assert!(job.next_retry_at.is_some());

        job.begin_retry(now);
        assert_eq!(job.status, DeadLetterStatus::Retrying);
        assert!(job.next_retry_at.is_none());

        job.recover(now);
        assert!(job.next_retry_at.is_none());
        assert_eq!(job.recovered_at, Some(now));
    }

    #[test]
    fn first_attempt_does_not_consume_budget() {
        let mut job = sample_job();
        let now = Utc::now();

        job.schedule(Uuid::new_v4(), now, now);
        assert_eq!(job.retry_count, 0);

        job.begin_retry(now);
        job.record_failure("still down", now);
        job.schedule(Uuid::new_v4(), now, now);
        assert_eq!(job.retry_count, 1);

        job.release(now);
        assert_eq!(job.retry_count, 0);
        assert_eq!(job.status, DeadLetterStatus::Quarantined);
    }

    #[test]
    fn reopen_grants_budget() {
        let mut job = sample_job();
        job.retry_count = job.max_retries;
        job.permanently_fail(Utc::now());
        assert!(job.can_retry().is_err());

        job.reopen(2, Utc::now());
        assert!(job.can_retry().is_ok());
        assert_eq!(job.max_retries, 5);
    }

    #[test]
    fn status_parses_loosely() {
        assert_eq!(
            "retry-scheduled".parse::<DeadLetterStatus>().unwrap(),
            DeadLetterStatus::RetryScheduled
        );
        assert!("nope".parse::<DeadLetterStatus>().is_err());
    }
}

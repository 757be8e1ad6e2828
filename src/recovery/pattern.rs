//! Recurring failure signatures and their mitigation playbooks.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use super::classifier::FailureType;

/// A recurring failure signature detected across dead-letter jobs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FailurePattern {
    pub id: Uuid,
    pub tenant_id: String,

    /// Stable hash of `(tenant, pattern type, queue, failure type)`.
    pub signature: String,

    pub pattern_type: PatternType,
    pub original_queue: String,
    pub original_job_type: String,
    pub failure_type: FailureType,

    pub severity: PatternSeverity,
    pub status: PatternStatus,

    /// Number of detection runs that confirmed this pattern.
    pub occurrence_count: u64,
    pub affected_jobs_count: u64,
    pub first_occurrence_at: DateTime<Utc>,
    pub last_occurrence_at: DateTime<Utc>,

    pub pattern_conditions: serde_json::Value,
    pub detection_rules: serde_json::Value,
    pub mitigation_strategies: MitigationStrategies,

    pub is_holiday_sensitive: bool,
    pub is_ramadan_sensitive: bool,
    pub example_job_id: Uuid,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    #[serde(default)]
    pub version: u64,
}

impl FailurePattern {
    /// Folds a fresh detection of the same signature into this pattern.
    ///
    /// Counts only grow and severity only escalates. A pattern that was
    /// resolved or mitigated becomes active again when it recurs.
    pub fn record_occurrence(
        &mut self,
        severity: PatternSeverity,
        conditions: serde_json::Value,
        now: DateTime<Utc>,
    ) {
        self.occurrence_count += 1;
        self.affected_jobs_count += 1;
        self.last_occurrence_at = now;
        self.severity = self.severity.max(severity);
        self.pattern_conditions = conditions;
        if self.status != PatternStatus::Ignored {
            self.status = PatternStatus::Active;
        }
        self.updated_at = now;
    }
}

/// Computes the storage signature of a pattern key.
pub fn pattern_signature(
    tenant_id: &str,
    pattern_type: PatternType,
    queue: &str,
    failure_type: FailureType,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(tenant_id.as_bytes());
    hasher.update([0]);
    hasher.update(pattern_type.as_str().as_bytes());
    hasher.update([0]);
    hasher.update(queue.as_bytes());
    hasher.update([0]);
    hasher.update(failure_type.as_str().as_bytes());
    hex::encode(hasher.finalize())
}

/// Kind of recurring failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PatternType {
    /// Failures concentrate in one hour of the day.
    PeakFailureHour,
    /// Failures happen mostly outside the business window.
    BusinessHours,
    /// Repeated rate limiting on one platform.
    RateLimit,
    /// Repeated authentication failures on one platform.
    Authentication,
    /// Repeated network failures on one platform.
    Network,
    /// Calendar-sensitive jobs failing together.
    Seasonal,
    /// Critical jobs failing repeatedly.
    Escalation,
}

impl PatternType {
    pub const ALL: [PatternType; 7] = [
        PatternType::PeakFailureHour,
        PatternType::BusinessHours,
        PatternType::RateLimit,
        PatternType::Authentication,
        PatternType::Network,
        PatternType::Seasonal,
        PatternType::Escalation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PatternType::PeakFailureHour => "PEAK_FAILURE_HOUR",
            PatternType::BusinessHours => "BUSINESS_HOURS",
            PatternType::RateLimit => "RATE_LIMIT",
            PatternType::Authentication => "AUTHENTICATION",
            PatternType::Network => "NETWORK",
            PatternType::Seasonal => "SEASONAL",
            PatternType::Escalation => "ESCALATION",
        }
    }
}

impl fmt::Display for PatternType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PatternType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_uppercase().replace('-', "_");
        PatternType::ALL
            .into_iter()
            .find(|t| t.as_str() == normalized)
            .ok_or_else(|| format!("unknown pattern type '{}'", s))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PatternSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl PatternSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            PatternSeverity::Low => "LOW",
            PatternSeverity::Medium => "MEDIUM",
            PatternSeverity::High => "HIGH",
            PatternSeverity::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for PatternSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PatternSeverity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "LOW" => Ok(PatternSeverity::Low),
            "MEDIUM" => Ok(PatternSeverity::Medium),
            "HIGH" => Ok(PatternSeverity::High),
            "CRITICAL" => Ok(PatternSeverity::Critical),
            _ => Err(format!("unknown pattern severity '{}'", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PatternStatus {
    Active,
    Mitigated,
    Resolved,
    Ignored,
}

impl PatternStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PatternStatus::Active => "ACTIVE",
            PatternStatus::Mitigated => "MITIGATED",
            PatternStatus::Resolved => "RESOLVED",
            PatternStatus::Ignored => "IGNORED",
        }
    }
}

impl fmt::Display for PatternStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PatternStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ACTIVE" => Ok(PatternStatus::Active),
            "MITIGATED" => Ok(PatternStatus::Mitigated),
            "RESOLVED" => Ok(PatternStatus::Resolved),
            "IGNORED" => Ok(PatternStatus::Ignored),
            _ => Err(format!("unknown pattern status '{}'", s)),
        }
    }
}

/// Prevention and recovery actions suggested for a pattern.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MitigationStrategies {
    pub prevention: Vec<String>,
    pub recovery: Vec<String>,
}

impl MitigationStrategies {
    /// Deterministic playbook per pattern type.
    pub fn for_pattern(pattern_type: PatternType) -> Self {
        let (prevention, recovery): (&[&str], &[&str]) = match pattern_type {
            PatternType::RateLimit => (
                &["implement exponential backoff", "use circuit breaker"],
                &["spread retries across the rate-limit window", "reduce batch size"],
            ),
            PatternType::Authentication => (
                &["auto-refresh credentials", "monitor token expiry"],
                &["escalate to manual verification", "re-authenticate and retry"],
            ),
            PatternType::BusinessHours => (
                &["schedule inside business window"],
                &["queue for next business day"],
            ),
            PatternType::PeakFailureHour => (
                &["shift load away from the peak hour", "increase capacity at peak"],
                &["defer retries past the peak hour"],
            ),
            PatternType::Network => (
                &["add connection health checks", "use circuit breaker"],
                &["retry with exponential backoff"],
            ),
            PatternType::Seasonal => (
                &["pre-scale ahead of calendar events", "review calendar-sensitive schedules"],
                &["defer retries until the calendar period ends"],
            ),
            PatternType::Escalation => (
                &["add monitoring for critical job paths"],
                &["escalate to on-call", "require approval before retry"],
            ),
        };

        Self {
            prevention: prevention.iter().map(|s| s.to_string()).collect(),
            recovery: recovery.iter().map(|s| s.to_string()).collect(),
        }
    }
}

//! Failure classification for quarantined jobs.
//!
//! Maps the coarse upstream [`ErrorType`] plus job metadata onto a
//! [`FailureType`], a retry budget, a priority and scheduling constraints.
//! Pure functions only.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::job::{payload_flag, payload_str};

/// Coarse error category produced by the upstream error classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    Authentication,
    Network,
    RateLimit,
    BusinessLogic,
    Timeout,
    Transient,
    Validation,
    ResourceExhausted,
    #[serde(other)]
    Unknown,
}

/// An error as classified by the upstream classifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifiedError {
    #[serde(rename = "type")]
    pub error_type: ErrorType,
    pub message: String,
    #[serde(default)]
    pub retryable: bool,
    #[serde(default)]
    pub original_error: Option<String>,
    #[serde(default)]
    pub context: serde_json::Value,
}

impl ClassifiedError {
    pub fn new(error_type: ErrorType, message: impl Into<String>) -> Self {
        Self {
            error_type,
            message: message.into(),
            retryable: !matches!(
                error_type,
                ErrorType::Authentication | ErrorType::BusinessLogic | ErrorType::Validation
            ),
            original_error: None,
            context: serde_json::Value::Null,
        }
    }
}

/// Failure category of a quarantined job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureType {
    RateLimit,
    Network,
    Timeout,
    Authentication,
    BusinessLogic,
    Validation,
    ResourceExhausted,
    Transient,
    Unknown,
}

impl FailureType {
    pub const ALL: [FailureType; 9] = [
        FailureType::RateLimit,
        FailureType::Network,
        FailureType::Timeout,
        FailureType::Authentication,
        FailureType::BusinessLogic,
        FailureType::Validation,
        FailureType::ResourceExhausted,
        FailureType::Transient,
        FailureType::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureType::RateLimit => "RATE_LIMIT",
            FailureType::Network => "NETWORK",
            FailureType::Timeout => "TIMEOUT",
            FailureType::Authentication => "AUTHENTICATION",
            FailureType::BusinessLogic => "BUSINESS_LOGIC",
            FailureType::Validation => "VALIDATION",
            FailureType::ResourceExhausted => "RESOURCE_EXHAUSTED",
            FailureType::Transient => "TRANSIENT",
            FailureType::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for FailureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for FailureType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_uppercase().replace('-', "_");
        FailureType::ALL
            .into_iter()
            .find(|t| t.as_str() == normalized)
            .ok_or_else(|| format!("unknown failure type '{}'", s))
    }
}

/// Dispatch priority. Ordered so that `Critical` sorts highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

impl Priority {
    pub const ALL: [Priority; 4] = [
        Priority::Low,
        Priority::Medium,
        Priority::High,
        Priority::Critical,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "LOW",
            Priority::Medium => "MEDIUM",
            Priority::High => "HIGH",
            Priority::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_uppercase();
        Priority::ALL
            .into_iter()
            .find(|p| p.as_str() == normalized)
            .ok_or_else(|| format!("unknown priority '{}'", s))
    }
}

/// Job metadata relevant to classification, read from the original payload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobMetadata {
    pub is_critical: bool,
    pub tenant_critical: bool,
    pub has_order_id: bool,
    pub holiday_sensitive: bool,
    pub ramadan_sensitive: bool,
    pub business_hours_only: bool,
    pub timezone: Option<String>,
}

impl JobMetadata {
    /// Extracts classification hints from a job payload and its options.
    pub fn from_payload(payload: &serde_json::Value, options: &serde_json::Value) -> Self {
        let flag = |keys: &[&str]| payload_flag(payload, keys) || payload_flag(options, keys);

        Self {
            is_critical: flag(&["isCritical", "is_critical", "critical"]),
            tenant_critical: flag(&["tenantCritical", "tenant_critical"]),
            has_order_id: payload_str(payload, &["orderId", "order_id"]).is_some(),
            holiday_sensitive: flag(&["isHolidaySensitive", "holiday_sensitive"]),
            ramadan_sensitive: flag(&["isRamadanSensitive", "ramadan_sensitive"]),
            business_hours_only: flag(&["isBusinessHoursOnly", "business_hours_only"]),
            timezone: payload_str(payload, &["timezone", "tz"])
                .or_else(|| payload_str(options, &["timezone", "tz"])),
        }
    }
}

/// Output of [`classify`].
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub failure_type: FailureType,
    pub max_retries: u32,
    pub priority: Priority,
    pub is_critical: bool,
    pub requires_manual_intervention: bool,
    pub is_business_hours_only: bool,
    pub is_holiday_sensitive: bool,
    pub is_ramadan_sensitive: bool,
    pub base_delay: Duration,
}

/// Classifies a failure.
pub fn classify(error: &ClassifiedError, meta: &JobMetadata) -> Classification {
    let failure_type = failure_type_for(error.error_type);
    let needs_human = matches!(
        failure_type,
        FailureType::Authentication | FailureType::BusinessLogic
    );
    let is_critical = meta.is_critical || meta.tenant_critical || meta.has_order_id;

    Classification {
        failure_type,
        max_retries: max_retries_for(failure_type),
        priority: priority_for(failure_type, is_critical),
        is_critical,
        requires_manual_intervention: needs_human,
        is_business_hours_only: needs_human || meta.business_hours_only,
        is_holiday_sensitive: meta.holiday_sensitive,
        is_ramadan_sensitive: meta.ramadan_sensitive,
        base_delay: base_delay(failure_type),
    }
}

/// Maps the upstream error category to a failure type.
pub fn failure_type_for(error_type: ErrorType) -> FailureType {
    match error_type {
        ErrorType::Authentication => FailureType::Authentication,
        ErrorType::Network => FailureType::Network,
        ErrorType::RateLimit => FailureType::RateLimit,
        ErrorType::BusinessLogic => FailureType::BusinessLogic,
        ErrorType::Timeout => FailureType::Timeout,
        ErrorType::Transient => FailureType::Transient,
        ErrorType::Validation => FailureType::Validation,
        ErrorType::ResourceExhausted => FailureType::ResourceExhausted,
        ErrorType::Unknown => FailureType::Unknown,
    }
}

/// Default recovery budget per failure type.
pub fn max_retries_for(failure_type: FailureType) -> u32 {
    match failure_type {
        FailureType::RateLimit => 5,
        FailureType::Network | FailureType::Timeout | FailureType::Transient => 3,
        FailureType::BusinessLogic | FailureType::Authentication => 1,
        _ => 2,
    }
}

fn priority_for(failure_type: FailureType, is_critical: bool) -> Priority {
    if is_critical || failure_type == FailureType::Authentication {
        Priority::Critical
    } else {
        Priority::Medium
    }
}

/// Base retry delay before exponential growth and jitter.
pub fn base_delay(failure_type: FailureType) -> Duration {
    let secs = match failure_type {
        FailureType::RateLimit => 60,
        FailureType::Network => 30,
        FailureType::Timeout => 15,
        FailureType::Authentication => 300,
        FailureType::BusinessLogic => 3600,
        FailureType::Validation => 1800,
        FailureType::ResourceExhausted => 600,
        _ => 60,
    };
    Duration::from_secs(secs)
}

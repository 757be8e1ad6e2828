//! Recurring-failure detection over recently quarantined jobs.
//!
//! Analysis looks at jobs sharing a queue, job type and failure type that were
//! quarantined inside the configured window. Each detected signal is upserted
//! into a [`FailurePattern`] keyed by tenant, pattern type, queue and failure
//! type.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Timelike, Utc};
use serde_json::json;
use tracing::{debug, info};
use uuid::Uuid;

use super::calendar::{is_business_time, BusinessWindow};
use super::classifier::FailureType;
use super::clock::Clock;
use super::job::DeadLetterJob;
use super::pattern::{
    pattern_signature, FailurePattern, MitigationStrategies, PatternSeverity, PatternStatus,
    PatternType,
};
use crate::config::model::PatternConfig;
use crate::error::PatternAnalysisError;
use crate::notify::events::{EventSink, RecoveryEvent};
use crate::store::RecoveryStore;

const MAX_UPSERT_ATTEMPTS: usize = 5;

const PEAK_HOUR_MIN: usize = 3;
const PLATFORM_MIN_JOBS: usize = 3;
const RATE_LIMIT_MIN: usize = 3;
const AUTHENTICATION_MIN: usize = 2;
const NETWORK_MIN: usize = 5;
const SEASONAL_MIN: usize = 3;
const ESCALATION_MIN: usize = 2;

/// One pattern found by a detection run, before it is persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct PatternSignal {
    pub pattern_type: PatternType,
    pub severity: PatternSeverity,
    pub affected_jobs: usize,
    pub conditions: serde_json::Value,
    pub rules: serde_json::Value,
}

/// Analyzes quarantined jobs and maintains failure patterns.
#[derive(Clone)]
pub struct PatternDetector {
    store: Arc<dyn RecoveryStore>,
    clock: Arc<dyn Clock>,
    config: PatternConfig,
    window: BusinessWindow,
    events: EventSink,
}

impl PatternDetector {
    pub fn new(
        store: Arc<dyn RecoveryStore>,
        clock: Arc<dyn Clock>,
        config: PatternConfig,
        window: BusinessWindow,
        events: EventSink,
    ) -> Self {
        Self {
            store,
            clock,
            config,
            window,
            events,
        }
    }

    /// Runs detection for the signature of `job` and returns the patterns
    /// that were created or updated.
    pub async fn analyze(
        &self,
        job: &DeadLetterJob,
    ) -> Result<Vec<FailurePattern>, PatternAnalysisError> {
        let now = self.clock.now();
        let since = now
            .checked_sub_signed(self.config.window())
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let similar: Vec<DeadLetterJob> = self
            .store
            .list_jobs(&job.tenant_id)
            .await?
            .into_iter()
            .filter(|j| {
                j.original_queue == job.original_queue
                    && j.original_job_type == job.original_job_type
                    && j.failure_type == job.failure_type
                    && j.created_at >= since
            })
            .collect();

        if similar.len() < self.config.min_similar_jobs {
            debug!(
                tenant_id = %job.tenant_id,
                job_id = %job.id,
                similar = similar.len(),
                "Not enough similar failures for pattern analysis"
            );
            return Ok(Vec::new());
        }

        let signals = detect_signals(&similar, &self.window);
        let mut saved = Vec::with_capacity(signals.len());

        for signal in signals {
            let (pattern, created) = self.upsert(job, &signal, now).await?;

            info!(
                tenant_id = %pattern.tenant_id,
                pattern_id = %pattern.id,
                pattern_type = %pattern.pattern_type,
                severity = %pattern.severity,
                occurrences = pattern.occurrence_count,
                created,
                "Failure pattern detected"
            );

            self.events.emit(RecoveryEvent::PatternDetected {
                tenant_id: pattern.tenant_id.clone(),
                pattern_id: pattern.id,
                pattern_type: pattern.pattern_type,
                severity: pattern.severity,
                queue: pattern.original_queue.clone(),
                failure_type: pattern.failure_type,
                occurrence_count: pattern.occurrence_count,
                created,
            });

            saved.push(pattern);
        }

        Ok(saved)
    }

    /// Inserts or updates the pattern for `signal`, retrying lost races.
    async fn upsert(
        &self,
        job: &DeadLetterJob,
        signal: &PatternSignal,
        now: DateTime<Utc>,
    ) -> Result<(FailurePattern, bool), PatternAnalysisError> {
        let signature = pattern_signature(
            &job.tenant_id,
            signal.pattern_type,
            &job.original_queue,
            job.failure_type,
        );

        for _ in 0..MAX_UPSERT_ATTEMPTS {
            match self.store.get_pattern(&job.tenant_id, &signature).await? {
                Some(mut existing) => {
                    existing.record_occurrence(signal.severity, signal.conditions.clone(), now);
                    if let Some(stored) = self.store.save_pattern(&existing).await? {
                        return Ok((stored, false));
                    }
                }
                None => {
                    let fresh = new_pattern(job, signal, signature.clone(), now);
                    if let Some(stored) = self.store.save_pattern(&fresh).await? {
                        return Ok((stored, true));
                    }
                }
            }
        }

        Err(PatternAnalysisError::Contended(signature))
    }
}

fn new_pattern(
    job: &DeadLetterJob,
    signal: &PatternSignal,
    signature: String,
    now: DateTime<Utc>,
) -> FailurePattern {
    FailurePattern {
        id: Uuid::new_v4(),
        tenant_id: job.tenant_id.clone(),
        signature,
        pattern_type: signal.pattern_type,
        original_queue: job.original_queue.clone(),
        original_job_type: job.original_job_type.clone(),
        failure_type: job.failure_type,
        severity: signal.severity,
        status: PatternStatus::Active,
        occurrence_count: 1,
        affected_jobs_count: signal.affected_jobs as u64,
        first_occurrence_at: now,
        last_occurrence_at: now,
        pattern_conditions: signal.conditions.clone(),
        detection_rules: signal.rules.clone(),
        mitigation_strategies: MitigationStrategies::for_pattern(signal.pattern_type),
        is_holiday_sensitive: job.is_holiday_sensitive,
        is_ramadan_sensitive: job.is_ramadan_sensitive,
        example_job_id: job.id,
        created_at: now,
        updated_at: now,
        version: 0,
    }
}

/// Runs every detection rule over a set of similar jobs.
pub fn detect_signals(jobs: &[DeadLetterJob], window: &BusinessWindow) -> Vec<PatternSignal> {
    let mut signals = time_signals(jobs, window);
    signals.extend(platform_signals(jobs));
    signals.extend(business_context_signals(jobs));
    signals
}

fn time_signals(jobs: &[DeadLetterJob], window: &BusinessWindow) -> Vec<PatternSignal> {
    let mut signals = Vec::new();

    let mut by_hour: BTreeMap<u32, usize> = BTreeMap::new();
    for job in jobs {
        let hour = job.created_at.with_timezone(&job.tz()).hour();
        *by_hour.entry(hour).or_default() += 1;
    }

    // Ties resolve to the earliest hour.
    if let Some((&hour, &count)) = by_hour
        .iter()
        .max_by(|a, b| a.1.cmp(b.1).then(b.0.cmp(a.0)))
    {
        if count >= PEAK_HOUR_MIN {
            signals.push(PatternSignal {
                pattern_type: PatternType::PeakFailureHour,
                severity: PatternSeverity::Medium,
                affected_jobs: count,
                conditions: json!({ "peakHour": hour, "occurrences": count, "totalJobs": jobs.len() }),
                rules: json!({ "minOccurrencesPerHour": PEAK_HOUR_MIN }),
            });
        }
    }

    let on_hours = jobs
        .iter()
        .filter(|j| is_business_time(j.created_at, j.tz(), window))
        .count();
    let off_hours = jobs.len() - on_hours;

    if off_hours > 2 * on_hours {
        signals.push(PatternSignal {
            pattern_type: PatternType::BusinessHours,
            severity: PatternSeverity::Medium,
            affected_jobs: off_hours,
            conditions: json!({ "offHours": off_hours, "onHours": on_hours }),
            rules: json!({ "offHoursRatio": 2 }),
        });
    }

    signals
}

fn platform_signals(jobs: &[DeadLetterJob]) -> Vec<PatternSignal> {
    let mut by_platform: BTreeMap<&str, Vec<&DeadLetterJob>> = BTreeMap::new();
    for job in jobs {
        if let Some(platform) = job.platform.as_deref() {
            by_platform.entry(platform).or_default().push(job);
        }
    }

    let mut signals = Vec::new();
    for (platform, group) in by_platform {
        if group.len() < PLATFORM_MIN_JOBS {
            continue;
        }

        let count = |ft: FailureType| group.iter().filter(|j| j.failure_type == ft).count();

        let rules: [(PatternType, FailureType, usize, PatternSeverity); 3] = [
            (
                PatternType::RateLimit,
                FailureType::RateLimit,
                RATE_LIMIT_MIN,
                PatternSeverity::High,
            ),
            (
                PatternType::Authentication,
                FailureType::Authentication,
                AUTHENTICATION_MIN,
                PatternSeverity::Critical,
            ),
            (
                PatternType::Network,
                FailureType::Network,
                NETWORK_MIN,
                PatternSeverity::Medium,
            ),
        ];

        for (pattern_type, failure_type, min, severity) in rules {
            let matched = count(failure_type);
            if matched >= min {
                signals.push(PatternSignal {
                    pattern_type,
                    severity,
                    affected_jobs: matched,
                    conditions: json!({ "platform": platform, "failures": matched }),
                    rules: json!({ "minPlatformJobs": PLATFORM_MIN_JOBS, "minFailures": min }),
                });
            }
        }
    }

    signals
}

fn business_context_signals(jobs: &[DeadLetterJob]) -> Vec<PatternSignal> {
    let mut signals = Vec::new();

    let sensitive: Vec<&DeadLetterJob> =
        jobs.iter().filter(|j| j.is_calendar_sensitive()).collect();
    if sensitive.len() >= SEASONAL_MIN {
        let holiday = sensitive.iter().filter(|j| j.is_holiday_sensitive).count();
        let ramadan = sensitive.iter().filter(|j| j.is_ramadan_sensitive).count();
        signals.push(PatternSignal {
            pattern_type: PatternType::Seasonal,
            severity: PatternSeverity::Medium,
            affected_jobs: sensitive.len(),
            conditions: json!({ "holidaySensitive": holiday, "ramadanSensitive": ramadan }),
            rules: json!({ "minSensitiveJobs": SEASONAL_MIN }),
        });
    }

    let critical = jobs.iter().filter(|j| j.is_critical).count();
    if critical >= ESCALATION_MIN {
        signals.push(PatternSignal {
            pattern_type: PatternType::Escalation,
            severity: PatternSeverity::Critical,
            affected_jobs: critical,
            conditions: json!({ "criticalJobs": critical }),
            rules: json!({ "minCriticalJobs": ESCALATION_MIN }),
        });
    }

    signals
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recovery::classifier::{classify, ClassifiedError, ErrorType, JobMetadata};
    use crate::recovery::clock::ManualClock;
    use crate::recovery::job::FailedJobDescriptor;
    use crate::store::MemoryStore;
    use chrono::TimeZone;

    fn job_at(
        error_type: ErrorType,
        payload: serde_json::Value,
        at: DateTime<Utc>,
        n: usize,
    ) -> DeadLetterJob {
        let error = ClassifiedError::new(error_type, "boom");
        let meta = JobMetadata::from_payload(&payload, &serde_json::Value::Null);
        let failed = FailedJobDescriptor {
            queue_name: "orders".into(),
            job_type: "sync".into(),
            job_id: n.to_string(),
            payload,
            options: serde_json::Value::Null,
            attempts_made: 3,
        };
        DeadLetterJob::quarantine("t1", failed, &error, &classify(&error, &meta), "UTC".into(), at)
    }

    // A Wednesday, inside business hours.
    fn noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 4, 12, 0, 0).unwrap()
    }

    #[test]
    fn peak_hour_needs_three_in_one_bucket() {
        let window = BusinessWindow::default();
        let two: Vec<_> = (0..2)
            .map(|n| job_at(ErrorType::Timeout, json!({}), noon(), n))
            .collect();
        assert!(detect_signals(&two, &window).is_empty());

        let three: Vec<_> = (0..3)
            .map(|n| job_at(ErrorType::Timeout, json!({}), noon(), n))
            .collect();
        let signals = detect_signals(&three, &window);
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].pattern_type, PatternType::PeakFailureHour);
        assert_eq!(signals[0].conditions["peakHour"], 12);
    }

    #[test]
    fn off_hours_failures_flag_business_hours_pattern() {
        let window = BusinessWindow::default();
        let night = Utc.with_ymd_and_hms(2026, 3, 4, 2, 0, 0).unwrap();
        let jobs: Vec<_> = (0..3)
            .map(|n| job_at(ErrorType::Timeout, json!({}), night + chrono::Duration::hours(n as i64), n))
            .collect();

        let types: Vec<_> = detect_signals(&jobs, &window)
            .into_iter()
            .map(|s| s.pattern_type)
            .collect();
        assert_eq!(types, vec![PatternType::BusinessHours]);
    }

    #[test]
    fn platform_rules_use_their_own_thresholds() {
        let window = BusinessWindow::default();
        let spread = |n: usize| noon() + chrono::Duration::hours((n % 4) as i64 - 2);

        let auth: Vec<_> = (0..3)
            .map(|n| job_at(ErrorType::Authentication, json!({"platform": "shopify"}), spread(n), n))
            .collect();
        let signal = detect_signals(&auth, &window)
            .into_iter()
            .find(|s| s.pattern_type == PatternType::Authentication)
            .expect("authentication pattern");
        assert_eq!(signal.severity, PatternSeverity::Critical);

        let network: Vec<_> = (0..4)
            .map(|n| job_at(ErrorType::Network, json!({"platform": "shopify"}), spread(n), n))
            .collect();
        assert!(detect_signals(&network, &window)
            .iter()
            .all(|s| s.pattern_type != PatternType::Network));
    }

    #[test]
    fn critical_jobs_escalate() {
        let window = BusinessWindow::default();
        let jobs: Vec<_> = (0..3)
            .map(|n| {
                job_at(
                    ErrorType::Timeout,
                    json!({"orderId": format!("o-{n}")}),
                    noon() + chrono::Duration::hours(n as i64),
                    n,
                )
            })
            .collect();
        let signal = detect_signals(&jobs, &window)
            .into_iter()
            .find(|s| s.pattern_type == PatternType::Escalation)
            .expect("escalation pattern");
        assert_eq!(signal.severity, PatternSeverity::Critical);
    }

    #[tokio::test]
    async fn repeated_analysis_updates_the_same_pattern() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(noon()));
        let detector = PatternDetector::new(
            store.clone(),
            clock,
            PatternConfig::default(),
            BusinessWindow::default(),
            EventSink::disabled(),
        );

        let mut last = None;
        for n in 0..4 {
            let job = store
                .insert_job(&job_at(ErrorType::Timeout, json!({}), noon(), n))
                .await
                .unwrap()
                .into_inner();
            last = Some(detector.analyze(&job).await.unwrap());
        }

        let patterns = store.list_patterns("t1").await.unwrap();
        assert_eq!(patterns.len(), 1);
        assert_eq!(patterns[0].occurrence_count, 2);
        assert_eq!(last.unwrap()[0].id, patterns[0].id);
    }
}

//! Read-only aggregates over the quarantine store and recovery ledger.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use uuid::Uuid;

use super::classifier::{FailureType, Priority};
use super::job::{DeadLetterJob, DeadLetterStatus};
use super::log::{JobRecoveryLog, RecoveryLogStatus};
use super::pattern::{FailurePattern, PatternSeverity, PatternStatus, PatternType};

const TOP_PATTERNS: usize = 5;

/// Dashboard statistics for one tenant.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DeadLetterJobStats {
    pub total: u64,
    pub by_status: BTreeMap<String, u64>,
    pub by_priority: BTreeMap<String, u64>,
    pub by_failure_type: BTreeMap<String, u64>,
    pub by_platform: BTreeMap<String, u64>,
    /// Percentage of jobs that ended `RECOVERED`, 0 to 100.
    pub recovery_rate: f64,
    pub average_recovery_duration_ms: Option<f64>,
    pub critical_jobs: u64,
    pub overdue_jobs: u64,
    pub business_hours_only_jobs: u64,
    pub calendar_sensitive_jobs: u64,
    pub created_last_24h: u64,
    pub created_last_7d: u64,
    pub created_last_30d: u64,
}

/// Computes [`DeadLetterJobStats`]. Empty input yields zeroed stats.
pub fn compute_stats(
    jobs: &[DeadLetterJob],
    logs: &[JobRecoveryLog],
    now: DateTime<Utc>,
) -> DeadLetterJobStats {
    let mut by_status: BTreeMap<String, u64> = DeadLetterStatus::ALL
        .iter()
        .map(|s| (s.as_str().to_string(), 0))
        .collect();
    let mut by_priority: BTreeMap<String, u64> = Priority::ALL
        .iter()
        .map(|p| (p.as_str().to_string(), 0))
        .collect();
    let mut by_failure_type: BTreeMap<String, u64> = FailureType::ALL
        .iter()
        .map(|f| (f.as_str().to_string(), 0))
        .collect();
    let mut by_platform: BTreeMap<String, u64> = BTreeMap::new();

    let created_since = |d: Duration| jobs.iter().filter(|j| j.created_at >= now - d).count() as u64;
    let count = |f: &dyn Fn(&DeadLetterJob) -> bool| jobs.iter().filter(|j| f(j)).count() as u64;

    for job in jobs {
        *by_status.entry(job.status.as_str().to_string()).or_default() += 1;
        *by_priority.entry(job.priority.as_str().to_string()).or_default() += 1;
        *by_failure_type
            .entry(job.failure_type.as_str().to_string())
            .or_default() += 1;
        let platform = job.platform.clone().unwrap_or_else(|| "unknown".to_string());
        *by_platform.entry(platform).or_default() += 1;
    }

    let total = jobs.len() as u64;
    let recovered = count(&|j| j.status == DeadLetterStatus::Recovered);

    DeadLetterJobStats {
        total,
        by_status,
        by_priority,
        by_failure_type,
        by_platform,
        recovery_rate: percentage(recovered, total),
        average_recovery_duration_ms: average(completed_durations(logs)),
        critical_jobs: count(&|j| j.is_critical),
        overdue_jobs: count(&|j| j.is_overdue(now)),
        business_hours_only_jobs: count(&|j| j.is_business_hours_only),
        calendar_sensitive_jobs: count(&|j| j.is_calendar_sensitive()),
        created_last_24h: created_since(Duration::hours(24)),
        created_last_7d: created_since(Duration::days(7)),
        created_last_30d: created_since(Duration::days(30)),
    }
}

/// Recovery attempt performance over a trailing period.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PerformanceReport {
    pub tenant_id: String,
    pub period_days: u32,
    pub since: DateTime<Utc>,
    pub attempts: u64,
    pub completed: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub cancelled: u64,
    pub pending: u64,
    /// Completed attempts as a percentage of finished, non-cancelled attempts.
    pub success_rate: f64,
    pub average_duration_ms: Option<f64>,
    pub p95_duration_ms: Option<i64>,
    pub by_failure_type: BTreeMap<String, FailureTypePerformance>,
    pub top_patterns: Vec<PatternSummary>,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct FailureTypePerformance {
    pub attempts: u64,
    pub completed: u64,
    /// Attempts that completed, failed or timed out.
    pub finished: u64,
    pub success_rate: f64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PatternSummary {
    pub id: Uuid,
    pub pattern_type: PatternType,
    pub severity: PatternSeverity,
    pub original_queue: String,
    pub failure_type: FailureType,
    pub occurrence_count: u64,
    pub affected_jobs_count: u64,
}

/// Builds a [`PerformanceReport`] from attempts created in the last `days`.
pub fn compute_report(
    tenant_id: &str,
    days: u32,
    jobs: &[DeadLetterJob],
    logs: &[JobRecoveryLog],
    patterns: &[FailurePattern],
    now: DateTime<Utc>,
) -> PerformanceReport {
    let since = Duration::try_days(i64::from(days))
        .and_then(|period| now.checked_sub_signed(period))
        .unwrap_or(DateTime::<Utc>::MIN_UTC);
    let failure_types: HashMap<Uuid, FailureType> =
        jobs.iter().map(|j| (j.id, j.failure_type)).collect();

    let recent: Vec<&JobRecoveryLog> = logs.iter().filter(|l| l.created_at >= since).collect();
    let with_status =
        |s: RecoveryLogStatus| recent.iter().filter(|l| l.status == s).count() as u64;

    let completed = with_status(RecoveryLogStatus::Completed);
    let failed = with_status(RecoveryLogStatus::Failed);
    let timed_out = with_status(RecoveryLogStatus::Timeout);
    let cancelled = with_status(RecoveryLogStatus::Cancelled);
    let pending = recent.iter().filter(|l| l.is_active()).count() as u64;

    let mut by_failure_type: BTreeMap<String, FailureTypePerformance> = BTreeMap::new();
    for log in &recent {
        let Some(ft) = failure_types.get(&log.dead_letter_job_id) else {
            continue;
        };
        let entry = by_failure_type.entry(ft.as_str().to_string()).or_default();
        entry.attempts += 1;
        match log.status {
            RecoveryLogStatus::Completed => {
                entry.completed += 1;
                entry.finished += 1;
            }
            RecoveryLogStatus::Failed | RecoveryLogStatus::Timeout => entry.finished += 1,
            _ => {}
        }
    }
    for entry in by_failure_type.values_mut() {
        entry.success_rate = percentage(entry.completed, entry.finished);
    }

    let mut durations: Vec<i64> = recent
        .iter()
        .filter(|l| l.status.is_terminal())
        .filter_map(|l| l.recovery_duration_ms)
        .collect();
    durations.sort_unstable();

    let mut active: Vec<&FailurePattern> = patterns
        .iter()
        .filter(|p| p.status == PatternStatus::Active)
        .collect();
    active.sort_by(|a, b| {
        b.occurrence_count
            .cmp(&a.occurrence_count)
            .then(b.severity.cmp(&a.severity))
    });

    PerformanceReport {
        tenant_id: tenant_id.to_string(),
        period_days: days,
        since,
        attempts: recent.len() as u64,
        completed,
        failed,
        timed_out,
        cancelled,
        pending,
        success_rate: percentage(completed, completed + failed + timed_out),
        average_duration_ms: average(durations.iter().copied()),
        p95_duration_ms: percentile(&durations, 95),
        by_failure_type,
        top_patterns: active
            .into_iter()
            .take(TOP_PATTERNS)
            .map(|p| PatternSummary {
                id: p.id,
                pattern_type: p.pattern_type,
                severity: p.severity,
                original_queue: p.original_queue.clone(),
                failure_type: p.failure_type,
                occurrence_count: p.occurrence_count,
                affected_jobs_count: p.affected_jobs_count,
            })
            .collect(),
    }
}

fn completed_durations(logs: &[JobRecoveryLog]) -> impl Iterator<Item = i64> + '_ {
    logs.iter()
        .filter(|l| l.status == RecoveryLogStatus::Completed)
        .filter_map(|l| l.recovery_duration_ms)
}

fn percentage(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 * 100.0 / whole as f64
    }
}

fn average(values: impl Iterator<Item = i64>) -> Option<f64> {
    let (sum, n) = values.fold((0i64, 0u64), |(s, n), v| (s.saturating_add(v), n + 1));
    (n > 0).then(|| sum as f64 / n as f64)
}

/// Nearest-rank percentile of sorted values.
fn percentile(sorted: &[i64], pct: usize) -> Option<i64> {
    if sorted.is_empty() {
        return None;
    }
    let rank = (pct * sorted.len()).div_ceil(100).max(1);
    sorted.get(rank - 1).copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_tenant_is_zeroed() {
        let stats = compute_stats(&[], &[], Utc::now());
        assert_eq!(stats.total, 0);
        assert_eq!(stats.recovery_rate, 0.0);
        assert!(stats.average_recovery_duration_ms.is_none());
        assert_eq!(stats.by_status.get("QUARANTINED"), Some(&0));
        assert_eq!(stats.by_status.len(), DeadLetterStatus::ALL.len());
    }

    #[test]
    fn percentile_uses_nearest_rank() {
        let values: Vec<i64> = (1..=20).collect();
        assert_eq!(percentile(&values, 95), Some(19));
        assert_eq!(percentile(&[7], 95), Some(7));
        assert_eq!(percentile(&[], 95), None);
    }

    #[test]
    fn empty_report_has_no_rates() {
        let report = compute_report("t1", 7, &[], &[], &[], Utc::now());
        assert_eq!(report.attempts, 0);
        assert_eq!(report.success_rate, 0.0);
        assert!(report.p95_duration_ms.is_none());
        assert!(report.top_patterns.is_empty());
    }

    #[test]
    fn unbounded_period_starts_at_the_earliest_time() {
        let report = compute_report("t1", u32::MAX, &[], &[], &[], Utc::now());
        assert_eq!(report.since, DateTime::<Utc>::MIN_UTC);
        assert_eq!(report.period_days, u32::MAX);
    }
}

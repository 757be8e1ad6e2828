//! Filters and pagination for administrative queries.

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::classifier::{FailureType, Priority};
use super::job::{DeadLetterJob, DeadLetterStatus};
use super::log::JobRecoveryLog;
use super::pattern::{FailurePattern, PatternSeverity, PatternStatus, PatternType};

pub const DEFAULT_PER_PAGE: usize = 20;
pub const MAX_PER_PAGE: usize = 200;

/// Dead-letter job filter. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<DeadLetterStatus>,
    pub priority: Option<Priority>,
    pub failure_type: Option<FailureType>,
    pub queue: Option<String>,
    pub platform: Option<String>,
    pub channel: Option<String>,
    pub assigned_to: Option<String>,
    pub is_critical: Option<bool>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub next_retry_after: Option<DateTime<Utc>>,
    pub next_retry_before: Option<DateTime<Utc>>,
}

impl JobFilter {
    pub fn matches(&self, job: &DeadLetterJob) -> bool {
        fn eq<T: PartialEq>(want: &Option<T>, have: &T) -> bool {
            want.as_ref().map_or(true, |w| w == have)
        }
        fn eq_str(want: &Option<String>, have: Option<&str>) -> bool {
            want.as_deref().map_or(true, |w| have == Some(w))
        }

        eq(&self.status, &job.status)
            && eq(&self.priority, &job.priority)
            && eq(&self.failure_type, &job.failure_type)
            && eq(&self.is_critical, &job.is_critical)
            && eq_str(&self.queue, Some(job.original_queue.as_str()))
            && eq_str(&self.platform, job.platform.as_deref())
            && eq_str(&self.channel, job.channel.as_deref())
            && eq_str(&self.assigned_to, job.assigned_to.as_deref())
            && self.created_after.map_or(true, |t| job.created_at >= t)
            && self.created_before.map_or(true, |t| job.created_at < t)
            && self
                .next_retry_after
                .map_or(true, |t| job.next_retry_at.is_some_and(|at| at >= t))
            && self
                .next_retry_before
                .map_or(true, |t| job.next_retry_at.is_some_and(|at| at < t))
    }
}

/// Failure pattern filter.
#[derive(Debug, Clone, Default)]
pub struct PatternFilter {
    pub status: Option<PatternStatus>,
    pub pattern_type: Option<PatternType>,
    pub min_severity: Option<PatternSeverity>,
    pub queue: Option<String>,
}

impl PatternFilter {
    pub fn matches(&self, pattern: &FailurePattern) -> bool {
        self.status.map_or(true, |s| pattern.status == s)
            && self.pattern_type.map_or(true, |t| pattern.pattern_type == t)
            && self.min_severity.map_or(true, |s| pattern.severity >= s)
            && self
                .queue
                .as_deref()
                .map_or(true, |q| pattern.original_queue == q)
    }
}

/// Requested page, 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub page: usize,
    pub per_page: usize,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            page: 1,
            per_page: DEFAULT_PER_PAGE,
        }
    }
}

impl PageRequest {
    pub fn new(page: usize, per_page: usize) -> Self {
        Self { page, per_page }.normalized()
    }

    /// Clamps `page` to at least 1 and `per_page` to `1..=MAX_PER_PAGE`.
    pub fn normalized(self) -> Self {
        Self {
            page: self.page.max(1),
            per_page: self.per_page.clamp(1, MAX_PER_PAGE),
        }
    }
}

/// One page of results.
#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: usize,
    pub page: usize,
    pub per_page: usize,
    pub total_pages: usize,
}

/// Slices `items` into the requested page.
pub fn paginate<T>(items: Vec<T>, request: PageRequest) -> Page<T> {
    let request = request.normalized();
    let total = items.len();
    let total_pages = total.div_ceil(request.per_page);
    let start = (request.page - 1).saturating_mul(request.per_page);

    let items = items
        .into_iter()
        .skip(start)
        .take(request.per_page)
        .collect();

    Page {
        items,
        total,
        page: request.page,
        per_page: request.per_page,
        total_pages,
    }
}

/// A job together with every recovery attempt made for it.
#[derive(Debug, Clone, Serialize)]
pub struct JobHistory {
    pub job: DeadLetterJob,
    pub logs: Vec<JobRecoveryLog>,
}

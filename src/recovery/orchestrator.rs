//! Recovery orchestration: ingestion, scheduling, the dispatch sweep, the
//! in-progress watchdog and administrative actions.
//!
//! Every mutation of a job or recovery log is a versioned compare-and-set
//! against the store. A sweep claims a due job by moving it to `Retrying`;
//! only one writer can win that claim, so concurrent sweeps never dispatch
//! the same attempt twice.

use std::sync::{Arc, RwLock};
use std::time::{Duration as StdDuration, Instant};

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::backoff::{to_chrono, BackoffPolicy};
use super::calendar::{
    clamp_to_window, is_within_window, BusinessCalendar, BusinessWindow, ScheduleConstraints,
};
use super::classifier::{base_delay, classify, ClassifiedError, JobMetadata};
use super::clock::{Clock, SystemClock};
use super::detector::PatternDetector;
use super::job::{DeadLetterJob, DeadLetterStatus, FailedJobDescriptor};
use super::log::{
    JobRecoveryLog, RecoveryConfiguration, RecoveryLogStatus, RecoveryMethod, RecoveryResult,
    RecoveryStrategy, RecoveryTrigger,
};
use super::pattern::{FailurePattern, PatternSeverity, PatternStatus, PatternType};
use super::query::{paginate, JobFilter, JobHistory, Page, PageRequest, PatternFilter};
use super::stats::{compute_report, compute_stats, DeadLetterJobStats, PerformanceReport};
use crate::config::model::{AnalysisMode, AppConfig, PatternConfig, RecoveryConfig};
use crate::error::RecoveryError;
use crate::notify::events::{EventSink, RecoveryEvent};
use crate::queue::{ExhaustedJob, JobHandle, PrimaryQueue, ResubmitRequest};
use crate::store::{InsertOutcome, RecoveryStore};

/// Attempts at a compare-and-set before giving up with [`RecoveryError::Conflict`].
const MAX_CAS_ATTEMPTS: usize = 5;

/// Caller-supplied parameters of [`Orchestrator::schedule_retry`].
#[derive(Debug, Clone)]
pub struct ScheduleOptions {
    pub trigger: RecoveryTrigger,
    pub initiated_by: Option<String>,
    /// Hold the attempt until someone approves it, whatever the job's policy.
    pub require_approval: bool,
    pub modified_payload: Option<serde_json::Value>,
    pub modified_options: Option<serde_json::Value>,
    pub target_queue: Option<String>,
    /// Link the attempt to this pattern instead of looking one up.
    pub pattern_id: Option<Uuid>,
    /// Extra retries granted when reopening a permanently failed job.
    pub grant_retries: u32,
}

impl Default for ScheduleOptions {
    fn default() -> Self {
        Self {
            trigger: RecoveryTrigger::Manual,
            initiated_by: None,
            require_approval: false,
            modified_payload: None,
            modified_options: None,
            target_queue: None,
            pattern_id: None,
            grant_retries: 0,
        }
    }
}

impl ScheduleOptions {
    /// An operator-initiated retry.
    pub fn manual(by: impl Into<String>) -> Self {
        Self {
            initiated_by: Some(by.into()),
            ..Self::default()
        }
    }

    fn triggered_by(trigger: RecoveryTrigger) -> Self {
        Self {
            trigger,
            ..Self::default()
        }
    }
}

/// What happened to one due job during a sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Recovered,
    Rescheduled,
    PermanentlyFailed,
    /// Outside its business window; moved to the next opening.
    Deferred,
    AwaitingApproval,
    /// Claimed elsewhere, changed concurrently or not dispatchable yet.
    Skipped,
}

/// Totals of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub tenants: usize,
    pub due: usize,
    pub recovered: usize,
    pub rescheduled: usize,
    pub permanently_failed: usize,
    pub deferred: usize,
    pub awaiting_approval: usize,
    pub skipped: usize,
    pub errors: usize,
    pub timed_out: usize,
    pub repaired: usize,
}

impl SweepReport {
    fn record(&mut self, outcome: DispatchOutcome) {
        match outcome {
            DispatchOutcome::Recovered => self.recovered += 1,
            DispatchOutcome::Rescheduled => self.rescheduled += 1,
            DispatchOutcome::PermanentlyFailed => self.permanently_failed += 1,
            DispatchOutcome::Deferred => self.deferred += 1,
            DispatchOutcome::AwaitingApproval => self.awaiting_approval += 1,
            DispatchOutcome::Skipped => self.skipped += 1,
        }
    }

    fn merge(&mut self, other: SweepReport) {
        self.tenants += other.tenants;
        self.due += other.due;
        self.recovered += other.recovered;
        self.rescheduled += other.rescheduled;
        self.permanently_failed += other.permanently_failed;
        self.deferred += other.deferred;
        self.awaiting_approval += other.awaiting_approval;
        self.skipped += other.skipped;
        self.errors += other.errors;
        self.timed_out += other.timed_out;
        self.repaired += other.repaired;
    }
}

/// Attempts forcibly re-evaluated by the watchdog.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WatchdogReport {
    /// In-progress attempts past the ceiling, now `TIMEOUT`.
    pub timed_out: usize,
    /// Jobs whose active attempt was missing or already finished.
    pub repaired: usize,
}

#[derive(Clone)]
struct Settings {
    recovery: RecoveryConfig,
    patterns: PatternConfig,
    window: BusinessWindow,
    default_timezone: String,
    calendar: Arc<dyn BusinessCalendar>,
}

/// Owns every state transition of quarantined jobs and their recovery logs.
pub struct Orchestrator {
    store: Arc<dyn RecoveryStore>,
    queue: Arc<dyn PrimaryQueue>,
    clock: Arc<dyn Clock>,
    events: EventSink,
    custom_calendar: Option<Arc<dyn BusinessCalendar>>,
    settings: RwLock<Settings>,
}

impl Orchestrator {
    pub fn new(
        config: &AppConfig,
        store: Arc<dyn RecoveryStore>,
        queue: Arc<dyn PrimaryQueue>,
    ) -> Self {
        Self {
            store,
            queue,
            clock: Arc::new(SystemClock),
            events: EventSink::disabled(),
            custom_calendar: None,
            settings: RwLock::new(Self::settings_from(config, None)),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    /// Replaces the calendar built from configuration.
    pub fn with_calendar(mut self, calendar: Arc<dyn BusinessCalendar>) -> Self {
        self.custom_calendar = Some(calendar.clone());
        self.settings
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .calendar = calendar;
        self
    }

    /// Swaps in reloaded configuration. In-flight operations keep the
    /// settings they started with.
    pub fn apply_config(&self, config: &AppConfig) {
        let next = Self::settings_from(config, self.custom_calendar.clone());
        *self.settings.write().unwrap_or_else(|e| e.into_inner()) = next;
        info!("Recovery settings updated");
    }

    fn settings_from(config: &AppConfig, calendar: Option<Arc<dyn BusinessCalendar>>) -> Settings {
        Settings {
            recovery: config.recovery.clone(),
            patterns: config.patterns.clone(),
            window: config.business_hours.window,
            default_timezone: config.business_hours.default_timezone.clone(),
            calendar: calendar.unwrap_or_else(|| Arc::new(config.business_hours.calendar())),
        }
    }

    fn settings(&self) -> Settings {
        self.settings
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn detector(&self, settings: &Settings) -> PatternDetector {
        PatternDetector::new(
            self.store.clone(),
            self.clock.clone(),
            settings.patterns.clone(),
            settings.window,
            self.events.clone(),
        )
    }

    // ---------------------------------------------------------------------
    // Ingestion
    // ---------------------------------------------------------------------

    /// Entry point for the primary queue's failure handler.
    pub async fn on_job_exhausted(&self, job: ExhaustedJob) -> Result<DeadLetterJob, RecoveryError> {
        let ExhaustedJob {
            tenant_id,
            queue_name,
            job_type,
            job_id,
            payload,
            options,
            attempts_made,
            error,
        } = job;

        let failed = FailedJobDescriptor {
            queue_name,
            job_type,
            job_id,
            payload,
            options,
            attempts_made,
        };

        self.ingest(&tenant_id, failed, error).await
    }

    /// Quarantines a job that exhausted its primary-queue retries.
    ///
    /// Idempotent on tenant, queue, job type and original job id: a repeated
    /// delivery returns the existing record untouched. Store failures are
    /// returned so the caller can retry delivery.
    pub async fn ingest(
        &self,
        tenant_id: &str,
        failed: FailedJobDescriptor,
        error: ClassifiedError,
    ) -> Result<DeadLetterJob, RecoveryError> {
        let settings = self.settings();
        let now = self.clock.now();

        let meta = JobMetadata::from_payload(&failed.payload, &failed.options);
        let classification = classify(&error, &meta);
        let timezone = meta
            .timezone
            .filter(|tz| tz.parse::<Tz>().is_ok())
            .unwrap_or_else(|| settings.default_timezone.clone());

        let candidate =
            DeadLetterJob::quarantine(tenant_id, failed, &error, &classification, timezone, now);

        let job = match self.store.insert_job(&candidate).await? {
            InsertOutcome::Existing(existing) => {
                debug!(
                    tenant_id,
                    job_id = %existing.id,
                    original_job_id = %existing.original_job_id,
                    "Exhausted job already quarantined"
                );
                return Ok(existing);
            }
            InsertOutcome::Inserted(job) => job,
        };

        info!(
            tenant_id,
            job_id = %job.id,
            queue = %job.original_queue,
            job_type = %job.original_job_type,
            failure_type = %job.failure_type,
            priority = %job.priority,
            "Job quarantined"
        );

        self.events.emit(RecoveryEvent::JobQuarantined {
            tenant_id: job.tenant_id.clone(),
            job_id: job.id,
            queue: job.original_queue.clone(),
            job_type: job.original_job_type.clone(),
            failure_type: job.failure_type,
            priority: job.priority,
            is_critical: job.is_critical,
            reason: job.failure_reason.clone(),
        });

        self.run_analysis(&job, &settings).await;

        if !settings.recovery.auto_schedule_first_retry || job.requires_manual_intervention {
            return Ok(job);
        }

        let options = ScheduleOptions::triggered_by(RecoveryTrigger::Automatic);
        if let Err(e) = self
            .schedule_retry(tenant_id, job.id, RecoveryStrategy::ExponentialBackoff, options)
            .await
        {
            warn!(tenant_id, job_id = %job.id, error = %e, "Automatic retry scheduling failed");
            return Ok(job);
        }

        match self.store.get_job(tenant_id, job.id).await {
            Ok(Some(latest)) => Ok(latest),
            _ => Ok(job),
        }
    }

    async fn run_analysis(&self, job: &DeadLetterJob, settings: &Settings) {
        match settings.patterns.analysis {
            AnalysisMode::Disabled => {}
            AnalysisMode::Inline => {
                if let Err(e) = self.detector(settings).analyze(job).await {
                    warn!(tenant_id = %job.tenant_id, job_id = %job.id, error = %e, "Pattern analysis failed");
                }
            }
            AnalysisMode::Background => {
                let detector = self.detector(settings);
                let job = job.clone();
                tokio::spawn(async move {
                    if let Err(e) = detector.analyze(&job).await {
                        warn!(tenant_id = %job.tenant_id, job_id = %job.id, error = %e, "Pattern analysis failed");
                    }
                });
            }
        }
    }

    // ---------------------------------------------------------------------
    // Scheduling
    // ---------------------------------------------------------------------

    /// Schedules a recovery attempt for a quarantined job.
    ///
    /// Fails with [`RecoveryError::RetryNotAllowed`] if the job is retired,
    /// out of budget, or already has an attempt in flight.
    pub async fn schedule_retry(
        &self,
        tenant_id: &str,
        job_id: Uuid,
        strategy: RecoveryStrategy,
        options: ScheduleOptions,
    ) -> Result<JobRecoveryLog, RecoveryError> {
        let settings = self.settings();
        let mut job = self.load_job(tenant_id, job_id).await?;
        let now = self.clock.now();

        if options.grant_retries > 0 && job.status == DeadLetterStatus::PermanentlyFailed {
            job.reopen(options.grant_retries, now);
        }

        job.can_retry()
            .map_err(|reason| RecoveryError::not_allowed(job.id, reason))?;

        let pattern = self.pattern_for(&job, &options).await?;
        let log = self.plan_attempt(&job, strategy, &options, pattern.as_ref(), &settings, now);
        job.schedule(log.id, log.recovery_configuration.scheduled_for, now);

        let Some(job) = self.store.update_job(&job).await? else {
            let current = self.load_job(tenant_id, job_id).await?;
            current
                .can_retry()
                .map_err(|reason| RecoveryError::not_allowed(job_id, reason))?;
            return Err(RecoveryError::Conflict(job_id));
        };

        self.commit_attempt(&job, log).await
    }

    async fn pattern_for(
        &self,
        job: &DeadLetterJob,
        options: &ScheduleOptions,
    ) -> Result<Option<FailurePattern>, RecoveryError> {
        if let Some(id) = options.pattern_id {
            return self
                .store
                .get_pattern_by_id(&job.tenant_id, id)
                .await?
                .map(Some)
                .ok_or(RecoveryError::PatternNotFound(id));
        }

        match options.trigger {
            RecoveryTrigger::Automatic | RecoveryTrigger::Watchdog => {
                Ok(self.active_pattern_for(job).await)
            }
            _ => Ok(None),
        }
    }

    /// The most severe active pattern on the job's queue and failure type.
    async fn active_pattern_for(&self, job: &DeadLetterJob) -> Option<FailurePattern> {
        let patterns = match self.store.list_patterns(&job.tenant_id).await {
            Ok(patterns) => patterns,
            Err(e) => {
                warn!(tenant_id = %job.tenant_id, job_id = %job.id, error = %e, "Pattern lookup failed");
                return None;
            }
        };

        patterns
            .into_iter()
            .filter(|p| {
                p.status == PatternStatus::Active
                    && p.original_queue == job.original_queue
                    && p.failure_type == job.failure_type
            })
            .max_by(|a, b| {
                a.severity
                    .cmp(&b.severity)
                    .then(a.occurrence_count.cmp(&b.occurrence_count))
            })
    }

    /// Builds the log of the next attempt. Pure apart from jitter.
    fn plan_attempt(
        &self,
        job: &DeadLetterJob,
        strategy: RecoveryStrategy,
        options: &ScheduleOptions,
        pattern: Option<&FailurePattern>,
        settings: &Settings,
        now: DateTime<Utc>,
    ) -> JobRecoveryLog {
        let mut constraints = job.constraints();
        constraints.business_hours_only |= strategy == RecoveryStrategy::NextBusinessWindow
            || pattern.is_some_and(|p| p.pattern_type == PatternType::BusinessHours);

        let attempt_number = job.next_attempt_number();
        let delay = match strategy {
            RecoveryStrategy::ExponentialBackoff => BackoffPolicy::new(settings.recovery.jitter_max())
                .delay(job.failure_type, attempt_number - 1),
            RecoveryStrategy::Immediate | RecoveryStrategy::NextBusinessWindow => StdDuration::ZERO,
            RecoveryStrategy::FixedDelay { seconds } => StdDuration::from_secs(seconds),
        };

        let scheduled_for = clamp_to_window(
            now + to_chrono(delay),
            &constraints,
            &settings.window,
            settings.calendar.as_ref(),
        );

        let requires_approval = options.require_approval
            || (job.is_critical && settings.recovery.critical_requires_approval)
            || pattern.is_some_and(|p| p.severity == PatternSeverity::Critical);

        let trigger = match (options.trigger, pattern) {
            (RecoveryTrigger::Automatic, Some(_)) => RecoveryTrigger::PatternDetected,
            (trigger, _) => trigger,
        };

        let modified = options.modified_payload.is_some()
            || options.modified_options.is_some()
            || options.target_queue.is_some();
        let method = if modified {
            RecoveryMethod::ModifiedPayload
        } else if trigger == RecoveryTrigger::Manual {
            RecoveryMethod::ManualRetry
        } else {
            RecoveryMethod::AutomaticRetry
        };

        JobRecoveryLog {
            id: Uuid::new_v4(),
            tenant_id: job.tenant_id.clone(),
            dead_letter_job_id: job.id,
            failure_pattern_id: pattern.map(|p| p.id),
            status: RecoveryLogStatus::Initiated,
            recovery_method: method,
            recovery_strategy: strategy,
            recovery_trigger: trigger,
            recovery_configuration: RecoveryConfiguration {
                job_data: options
                    .modified_payload
                    .clone()
                    .unwrap_or_else(|| job.original_job_data.clone()),
                job_options: options
                    .modified_options
                    .clone()
                    .unwrap_or_else(|| job.original_job_options.clone()),
                target_queue: options
                    .target_queue
                    .clone()
                    .unwrap_or_else(|| job.original_queue.clone()),
                job_type: job.original_job_type.clone(),
                modified,
                attempt_number,
                max_retries: job.max_retries,
                base_delay_ms: base_delay(job.failure_type).as_millis() as u64,
                computed_delay_ms: (scheduled_for - now).num_milliseconds().max(0) as u64,
                scheduled_for,
                business_hours_only: constraints.business_hours_only,
                holiday_sensitive: constraints.holiday_sensitive,
                ramadan_sensitive: constraints.ramadan_sensitive,
                timezone: job.timezone.clone(),
            },
            recovery_result: None,
            created_at: now,
            recovery_started_at: None,
            recovery_completed_at: None,
            recovery_failed_at: None,
            recovery_duration_ms: None,
            requires_approval,
            approved_by: None,
            approved_at: None,
            approval_notes: None,
            initiated_by: options.initiated_by.clone(),
            version: 0,
        }
    }

    /// Persists the log of an attempt the job already points at. On failure
    /// the job is released back to quarantine.
    async fn commit_attempt(
        &self,
        job: &DeadLetterJob,
        log: JobRecoveryLog,
    ) -> Result<JobRecoveryLog, RecoveryError> {
        let log = match self.store.insert_log(&log).await {
            Ok(log) => log,
            Err(e) => {
                let mut released = job.clone();
                released.release(self.clock.now());
                if let Err(release_err) = self.store.update_job(&released).await {
                    error!(
                        tenant_id = %job.tenant_id,
                        job_id = %job.id,
                        error = %release_err,
                        "Failed to release job after recovery log write failed"
                    );
                }
                return Err(e.into());
            }
        };

        info!(
            tenant_id = %log.tenant_id,
            job_id = %job.id,
            log_id = %log.id,
            attempt = log.recovery_configuration.attempt_number,
            scheduled_for = %log.recovery_configuration.scheduled_for,
            trigger = ?log.recovery_trigger,
            requires_approval = log.requires_approval,
            "Recovery attempt scheduled"
        );

        self.events.emit(RecoveryEvent::RetryScheduled {
            tenant_id: log.tenant_id.clone(),
            job_id: job.id,
            log_id: log.id,
            scheduled_for: log.recovery_configuration.scheduled_for,
            attempt: log.recovery_configuration.attempt_number,
            requires_approval: log.requires_approval,
        });

        Ok(log)
    }

    // ---------------------------------------------------------------------
    // Sweep and dispatch
    // ---------------------------------------------------------------------

    /// Runs one sweep over every tenant. A failing tenant does not stop the others.
    pub async fn run_sweep(&self) -> Result<SweepReport, RecoveryError> {
        let started = Instant::now();
        let mut report = SweepReport::default();

        for tenant_id in self.store.tenants().await? {
            match self.sweep_tenant(&tenant_id).await {
                Ok(tenant_report) => report.merge(tenant_report),
                Err(e) => {
                    error!(tenant_id = %tenant_id, error = %e, "Tenant sweep failed");
                    report.errors += 1;
                }
            }
        }

        info!(
            tenants = report.tenants,
            due = report.due,
            recovered = report.recovered,
            rescheduled = report.rescheduled,
            permanently_failed = report.permanently_failed,
            errors = report.errors,
            duration_ms = started.elapsed().as_millis() as u64,
            "Sweep finished"
        );

        Ok(report)
    }

    /// Runs the watchdog, then dispatches the tenant's due jobs with bounded
    /// concurrency in priority order.
    pub async fn sweep_tenant(&self, tenant_id: &str) -> Result<SweepReport, RecoveryError> {
        let settings = self.settings();
        let mut report = SweepReport {
            tenants: 1,
            ..SweepReport::default()
        };

        let watchdog = self.run_watchdog(tenant_id).await?;
        report.timed_out = watchdog.timed_out;
        report.repaired = watchdog.repaired;

        let now = self.clock.now();
        let due = self.store.due_jobs(tenant_id, now, usize::MAX).await?;
        report.due = due.len();
        let batch = self
            .fill_batch(due, settings.recovery.batch_size.max(1), &mut report)
            .await?;

        let outcomes: Vec<(Uuid, Result<DispatchOutcome, RecoveryError>)> = stream::iter(batch)
            .map(|job| async move {
                let job_id = job.id;
                (job_id, self.process_due(job).await)
            })
            .buffer_unordered(settings.recovery.dispatch_concurrency.max(1))
            .collect()
            .await;

        for (job_id, outcome) in outcomes {
            match outcome {
                Ok(outcome) => report.record(outcome),
                Err(e) => {
                    error!(tenant_id, job_id = %job_id, error = %e, "Failed to process due job");
                    report.errors += 1;
                }
            }
        }

        Ok(report)
    }

    /// Takes up to `limit` due jobs in dispatch order, passing over attempts
    /// still waiting for approval so they never occupy a batch slot.
    async fn fill_batch(
        &self,
        due: Vec<DeadLetterJob>,
        limit: usize,
        report: &mut SweepReport,
    ) -> Result<Vec<DeadLetterJob>, RecoveryError> {
        let mut batch = Vec::with_capacity(limit.min(due.len()));
        for job in due {
            if batch.len() >= limit {
                break;
            }
            if let Some(log_id) = job.active_recovery_id {
                let log = self.store.get_log(&job.tenant_id, log_id).await?;
                if log.is_some_and(|l| l.is_awaiting_approval()) {
                    report.record(DispatchOutcome::AwaitingApproval);
                    continue;
                }
            }
            batch.push(job);
        }
        Ok(batch)
    }

    async fn process_due(&self, job: DeadLetterJob) -> Result<DispatchOutcome, RecoveryError> {
        let settings = self.settings();
        let now = self.clock.now();

        if job.status != DeadLetterStatus::RetryScheduled
            || job.next_retry_at.map_or(true, |at| at > now)
        {
            return Ok(DispatchOutcome::Skipped);
        }

        let Some(log_id) = job.active_recovery_id else {
            warn!(tenant_id = %job.tenant_id, job_id = %job.id, "Scheduled job has no active recovery attempt");
            return Ok(DispatchOutcome::Skipped);
        };

        let Some(mut log) = self.store.get_log(&job.tenant_id, log_id).await? else {
            debug!(tenant_id = %job.tenant_id, job_id = %job.id, log_id = %log_id, "Recovery attempt not visible yet");
            return Ok(DispatchOutcome::Skipped);
        };

        if !log.is_active() {
            return Ok(DispatchOutcome::Skipped);
        }

        if log.is_awaiting_approval() {
            debug!(tenant_id = %job.tenant_id, job_id = %job.id, log_id = %log.id, "Recovery attempt awaiting approval");
            return Ok(DispatchOutcome::AwaitingApproval);
        }

        let constraints = ScheduleConstraints {
            business_hours_only: log.recovery_configuration.business_hours_only,
            holiday_sensitive: log.recovery_configuration.holiday_sensitive,
            ramadan_sensitive: log.recovery_configuration.ramadan_sensitive,
            timezone: job.tz(),
        };
        let calendar = settings.calendar.as_ref();

        if !is_within_window(now, &constraints, &settings.window, calendar) {
            let next = clamp_to_window(now, &constraints, &settings.window, calendar);
            let mut deferred = job.clone();
            deferred.reschedule(next, now);
            if self.store.update_job(&deferred).await?.is_none() {
                return Ok(DispatchOutcome::Skipped);
            }
            debug!(
                tenant_id = %job.tenant_id,
                job_id = %job.id,
                next_retry_at = %next,
                "Outside business window, retry deferred"
            );
            return Ok(DispatchOutcome::Deferred);
        }

        let mut claim = job.clone();
        claim.begin_retry(now);
        let Some(claimed) = self.store.update_job(&claim).await? else {
            debug!(tenant_id = %job.tenant_id, job_id = %job.id, "Job claimed by another sweep");
            return Ok(DispatchOutcome::Skipped);
        };

        let started = if log.start(now) {
            match self.store.update_log(&log).await {
                Ok(started) => started,
                Err(e) => {
                    let mut back = job.clone();
                    back.version = claimed.version;
                    back.requeue(now, now);
                    if let Err(undo) = self.store.update_job(&back).await {
                        warn!(tenant_id = %job.tenant_id, job_id = %job.id, error = %undo, "Failed to return claimed job to schedule");
                    }
                    return Err(e.into());
                }
            }
        } else {
            None
        };
        let Some(log) = started else {
            warn!(
                tenant_id = %job.tenant_id,
                job_id = %job.id,
                log_id = %log_id,
                "Recovery attempt changed during claim, returning job to schedule"
            );
            let mut back = job.clone();
            back.version = claimed.version;
            back.requeue(now, now);
            self.store.update_job(&back).await?;
            return Ok(DispatchOutcome::Skipped);
        };

        let config = &log.recovery_configuration;
        info!(
            tenant_id = %job.tenant_id,
            job_id = %job.id,
            log_id = %log.id,
            attempt = config.attempt_number,
            queue = %config.target_queue,
            "Dispatching recovery attempt"
        );

        let request = ResubmitRequest {
            queue_name: config.target_queue.clone(),
            job_type: config.job_type.clone(),
            payload: config.job_data.clone(),
            options: config.job_options.clone(),
            tenant_id: job.tenant_id.clone(),
            dead_letter_job_id: job.id,
            recovery_log_id: log.id,
        };

        match self.queue.resubmit(request).await {
            Ok(handle) => self.finish_success(claimed, log, handle).await,
            Err(e) => {
                let reason = e.to_string();
                let mut failed = log;
                let result = RecoveryResult {
                    success: false,
                    error: Some(reason.clone()),
                    job_handle: None,
                    target_queue: failed.recovery_configuration.target_queue.clone(),
                    attempt_number: failed.recovery_configuration.attempt_number,
                    duration_ms: None,
                };
                if !failed.fail(result, self.clock.now()) {
                    return Ok(DispatchOutcome::Skipped);
                }
                let Some(failed) = self.store.update_log(&failed).await? else {
                    warn!(tenant_id = %job.tenant_id, job_id = %job.id, "Recovery outcome arrived after the attempt was finalized");
                    return Ok(DispatchOutcome::Skipped);
                };
                self.after_failed_attempt(claimed, &failed, &reason, RecoveryTrigger::Automatic)
                    .await
            }
        }
    }

    async fn finish_success(
        &self,
        job: DeadLetterJob,
        mut log: JobRecoveryLog,
        handle: JobHandle,
    ) -> Result<DispatchOutcome, RecoveryError> {
        let now = self.clock.now();
        let result = RecoveryResult {
            success: true,
            error: None,
            job_handle: Some(handle.id),
            target_queue: handle.queue_name,
            attempt_number: log.recovery_configuration.attempt_number,
            duration_ms: None,
        };

        if !log.complete(result, now) {
            return Ok(DispatchOutcome::Skipped);
        }
        let Some(log) = self.store.update_log(&log).await? else {
            warn!(tenant_id = %job.tenant_id, job_id = %job.id, "Recovery outcome arrived after the attempt was finalized");
            return Ok(DispatchOutcome::Skipped);
        };

        let log_id = log.id;
        let job = self
            .mutate_job(job, |j| {
                if j.active_recovery_id != Some(log_id) {
                    return Err(RecoveryError::Conflict(j.id));
                }
                j.recover(now);
                Ok(())
            })
            .await?;

        info!(
            tenant_id = %job.tenant_id,
            job_id = %job.id,
            log_id = %log.id,
            duration_ms = ?log.recovery_duration_ms,
            "Job recovered"
        );

        self.events.emit(RecoveryEvent::JobRecovered {
            tenant_id: job.tenant_id.clone(),
            job_id: job.id,
            log_id: log.id,
            failure_type: job.failure_type,
            duration_ms: log.recovery_duration_ms,
        });

        Ok(DispatchOutcome::Recovered)
    }

    /// Returns a job whose attempt `log` ended without success to the
    /// schedule, or retires it once the budget is spent.
    async fn after_failed_attempt(
        &self,
        job: DeadLetterJob,
        log: &JobRecoveryLog,
        reason: &str,
        trigger: RecoveryTrigger,
    ) -> Result<DispatchOutcome, RecoveryError> {
        self.reschedule_or_retire(job, Some(log.id), reason, trigger)
            .await
    }

    async fn reschedule_or_retire(
        &self,
        job: DeadLetterJob,
        owner: Option<Uuid>,
        reason: &str,
        trigger: RecoveryTrigger,
    ) -> Result<DispatchOutcome, RecoveryError> {
        let settings = self.settings();
        let now = self.clock.now();
        let pattern = self.active_pattern_for(&job).await;
        let options = ScheduleOptions::triggered_by(trigger);
        let failed_log = owner;

        let mut planned: Option<JobRecoveryLog> = None;
        let job = self
            .mutate_job(job, |j| {
                if j.active_recovery_id != owner {
                    return Err(RecoveryError::Conflict(j.id));
                }
                j.record_failure(reason, now);
                planned = None;
                if j.has_budget() {
                    let next = self.plan_attempt(
                        j,
                        RecoveryStrategy::ExponentialBackoff,
                        &options,
                        pattern.as_ref(),
                        &settings,
                        now,
                    );
                    j.schedule(next.id, next.recovery_configuration.scheduled_for, now);
                    planned = Some(next);
                } else {
                    j.permanently_fail(now);
                }
                Ok(())
            })
            .await?;

        let will_retry = planned.is_some();
        self.events.emit(RecoveryEvent::RecoveryFailed {
            tenant_id: job.tenant_id.clone(),
            job_id: job.id,
            log_id: failed_log.unwrap_or_default(),
            failure_type: job.failure_type,
            error: reason.to_string(),
            will_retry,
        });

        match planned {
            Some(next) => {
                warn!(
                    tenant_id = %job.tenant_id,
                    job_id = %job.id,
                    retry_count = job.retry_count,
                    max_retries = job.max_retries,
                    error = reason,
                    "Recovery attempt failed, retrying"
                );
                self.commit_attempt(&job, next).await?;
                Ok(DispatchOutcome::Rescheduled)
            }
            None => {
                error!(
                    tenant_id = %job.tenant_id,
                    job_id = %job.id,
                    retry_count = job.retry_count,
                    error = reason,
                    "Job permanently failed"
                );
                self.events.emit(RecoveryEvent::JobPermanentlyFailed {
                    tenant_id: job.tenant_id.clone(),
                    job_id: job.id,
                    queue: job.original_queue.clone(),
                    job_type: job.original_job_type.clone(),
                    failure_type: job.failure_type,
                    retry_count: job.retry_count,
                    reason: reason.to_string(),
                });
                Ok(DispatchOutcome::PermanentlyFailed)
            }
        }
    }

    // ---------------------------------------------------------------------
    // Watchdog
    // ---------------------------------------------------------------------

    /// Times out attempts stuck in progress past the ceiling and repairs jobs
    /// whose active attempt is missing or already finished.
    pub async fn run_watchdog(&self, tenant_id: &str) -> Result<WatchdogReport, RecoveryError> {
        let settings = self.settings();
        let now = self.clock.now();
        let ceiling = settings.recovery.watchdog_ceiling();
        let mut report = WatchdogReport::default();

        let stuck: Vec<JobRecoveryLog> = self
            .store
            .list_logs(tenant_id)
            .await?
            .into_iter()
            .filter(|l| {
                l.status == RecoveryLogStatus::InProgress
                    && l.recovery_started_at.is_some_and(|t| now - t > ceiling)
            })
            .collect();

        for mut log in stuck {
            if !log.time_out(now) {
                continue;
            }
            let log = match self.store.update_log(&log).await {
                Ok(Some(log)) => log,
                Ok(None) => continue,
                Err(e) => {
                    warn!(tenant_id, log_id = %log.id, error = %e, "Failed to time out recovery attempt");
                    continue;
                }
            };

            report.timed_out += 1;
            warn!(
                tenant_id,
                job_id = %log.dead_letter_job_id,
                log_id = %log.id,
                "Recovery attempt timed out"
            );
            self.events.emit(RecoveryEvent::RecoveryTimedOut {
                tenant_id: tenant_id.to_string(),
                job_id: log.dead_letter_job_id,
                log_id: log.id,
            });

            match self.store.get_job(tenant_id, log.dead_letter_job_id).await {
                Ok(Some(job)) if job.active_recovery_id == Some(log.id) => {
                    if let Err(e) = self
                        .after_failed_attempt(
                            job,
                            &log,
                            "recovery attempt timed out",
                            RecoveryTrigger::Watchdog,
                        )
                        .await
                    {
                        warn!(tenant_id, log_id = %log.id, error = %e, "Failed to re-evaluate timed-out job");
                    }
                }
                Ok(_) => debug!(tenant_id, log_id = %log.id, "Timed-out attempt no longer owns its job"),
                Err(e) => warn!(tenant_id, log_id = %log.id, error = %e, "Failed to load timed-out job"),
            }
        }

        report.repaired = self.repair_orphans(tenant_id, ceiling, now).await?;
        Ok(report)
    }

    async fn repair_orphans(
        &self,
        tenant_id: &str,
        ceiling: chrono::Duration,
        now: DateTime<Utc>,
    ) -> Result<usize, RecoveryError> {
        let candidates: Vec<DeadLetterJob> = self
            .store
            .list_jobs(tenant_id)
            .await?
            .into_iter()
            .filter(|j| {
                matches!(
                    j.status,
                    DeadLetterStatus::RetryScheduled | DeadLetterStatus::Retrying
                ) && now - j.updated_at > ceiling
            })
            .collect();

        let mut repaired = 0;
        for job in candidates {
            let log = match job.active_recovery_id {
                Some(id) => self.store.get_log(tenant_id, id).await?,
                None => None,
            };

            let outcome = match log {
                Some(log)
                    if job.status == DeadLetterStatus::Retrying
                        && log.status == RecoveryLogStatus::Initiated =>
                {
                    let owner = job.active_recovery_id;
                    let first_attempt = log.recovery_configuration.attempt_number <= 1;
                    warn!(
                        tenant_id,
                        job_id = %job.id,
                        log_id = %log.id,
                        "Claimed job never started its attempt, returning it to schedule"
                    );
                    self.mutate_job(job, |j| {
                        if j.active_recovery_id != owner || j.status != DeadLetterStatus::Retrying {
                            return Err(RecoveryError::Conflict(j.id));
                        }
                        j.unclaim(first_attempt, now);
                        Ok(())
                    })
                    .await
                    .map(|_| DispatchOutcome::Rescheduled)
                }
                Some(log) if log.is_active() => continue,
                Some(log) if log.status == RecoveryLogStatus::Completed => {
                    let owner = job.active_recovery_id;
                    self.mutate_job(job, |j| {
                        if j.active_recovery_id != owner {
                            return Err(RecoveryError::Conflict(j.id));
                        }
                        j.recover(now);
                        Ok(())
                    })
                    .await
                    .map(|_| DispatchOutcome::Recovered)
                }
                _ => {
                    let owner = job.active_recovery_id;
                    self.reschedule_or_retire(
                        job,
                        owner,
                        "recovery attempt lost",
                        RecoveryTrigger::Watchdog,
                    )
                    .await
                }
            };

            match outcome {
                Ok(_) => repaired += 1,
                Err(e) => warn!(tenant_id, error = %e, "Failed to repair orphaned job"),
            }
        }

        Ok(repaired)
    }

    // ---------------------------------------------------------------------
    // Administrative actions
    // ---------------------------------------------------------------------

    /// Approves an attempt that is waiting for approval.
    pub async fn approve(
        &self,
        tenant_id: &str,
        log_id: Uuid,
        by: &str,
        notes: Option<String>,
    ) -> Result<JobRecoveryLog, RecoveryError> {
        let mut log = self.load_log(tenant_id, log_id).await?;
        ensure_pending_approval(&log, "approve")?;

        log.approve(by, notes, self.clock.now());
        let log = self
            .store
            .update_log(&log)
            .await?
            .ok_or(RecoveryError::Conflict(log_id))?;

        info!(tenant_id, job_id = %log.dead_letter_job_id, log_id = %log.id, approved_by = by, "Recovery attempt approved");
        Ok(log)
    }

    /// Rejects an attempt that is waiting for approval. The attempt is
    /// cancelled and the job returns to quarantine.
    pub async fn reject(
        &self,
        tenant_id: &str,
        log_id: Uuid,
        by: &str,
        notes: Option<String>,
    ) -> Result<JobRecoveryLog, RecoveryError> {
        let mut log = self.load_log(tenant_id, log_id).await?;
        ensure_pending_approval(&log, "reject")?;

        let job = self.load_job(tenant_id, log.dead_letter_job_id).await?;
        let now = self.clock.now();
        self.mutate_job(job, |j| {
            if j.active_recovery_id != Some(log_id) || j.status != DeadLetterStatus::RetryScheduled {
                return Err(RecoveryError::InvalidTransition {
                    from: j.status.to_string(),
                    action: "reject",
                });
            }
            j.release(now);
            Ok(())
        })
        .await?;

        log.approval_notes = notes;
        log.cancel(&format!("rejected by {}", by), now);
        let log = self
            .store
            .update_log(&log)
            .await?
            .ok_or(RecoveryError::Conflict(log_id))?;

        info!(tenant_id, job_id = %log.dead_letter_job_id, log_id = %log.id, rejected_by = by, "Recovery attempt rejected");
        Ok(log)
    }

    /// Archives a job and cancels its pending attempt, if any.
    pub async fn cancel(
        &self,
        tenant_id: &str,
        job_id: Uuid,
        reason: Option<&str>,
    ) -> Result<DeadLetterJob, RecoveryError> {
        let job = self.load_job(tenant_id, job_id).await?;
        let now = self.clock.now();

        let mut pending = None;
        let job = self
            .mutate_job(job, |j| match j.status {
                DeadLetterStatus::Quarantined
                | DeadLetterStatus::RetryScheduled
                | DeadLetterStatus::PermanentlyFailed => {
                    pending = j.active_recovery_id;
                    j.archive(now);
                    Ok(())
                }
                other => Err(RecoveryError::InvalidTransition {
                    from: other.to_string(),
                    action: "cancel",
                }),
            })
            .await?;

        if let Some(log_id) = pending {
            if let Some(mut log) = self.store.get_log(tenant_id, log_id).await? {
                if log.cancel(reason.unwrap_or("job archived"), now)
                    && self.store.update_log(&log).await?.is_none()
                {
                    warn!(tenant_id, job_id = %job_id, log_id = %log_id, "Pending attempt changed while cancelling");
                }
            }
        }

        info!(tenant_id, job_id = %job.id, "Job archived");
        self.events.emit(RecoveryEvent::JobArchived {
            tenant_id: tenant_id.to_string(),
            job_id: job.id,
        });

        Ok(job)
    }

    /// Assigns a job to an operator, or clears the assignment.
    pub async fn assign_to(
        &self,
        tenant_id: &str,
        job_id: Uuid,
        assignee: Option<String>,
    ) -> Result<DeadLetterJob, RecoveryError> {
        let job = self.load_job(tenant_id, job_id).await?;
        let now = self.clock.now();
        let job = self
            .mutate_job(job, |j| {
                j.assigned_to = assignee.clone();
                j.updated_at = now;
                Ok(())
            })
            .await?;

        info!(tenant_id, job_id = %job.id, assigned_to = ?job.assigned_to, "Job assignment changed");
        Ok(job)
    }

    pub async fn set_pattern_status(
        &self,
        tenant_id: &str,
        pattern_id: Uuid,
        status: PatternStatus,
    ) -> Result<FailurePattern, RecoveryError> {
        let mut pattern = self
            .store
            .get_pattern_by_id(tenant_id, pattern_id)
            .await?
            .ok_or(RecoveryError::PatternNotFound(pattern_id))?;

        pattern.status = status;
        pattern.updated_at = self.clock.now();
        let pattern = self
            .store
            .save_pattern(&pattern)
            .await?
            .ok_or(RecoveryError::Conflict(pattern_id))?;

        info!(tenant_id, pattern_id = %pattern.id, status = %pattern.status, "Pattern status changed");
        Ok(pattern)
    }

    // ---------------------------------------------------------------------
    // Queries
    // ---------------------------------------------------------------------

    /// Jobs matching `filter`, newest first.
    pub async fn query_jobs(
        &self,
        tenant_id: &str,
        filter: &JobFilter,
        page: PageRequest,
    ) -> Result<Page<DeadLetterJob>, RecoveryError> {
        let mut jobs: Vec<DeadLetterJob> = self
            .store
            .list_jobs(tenant_id)
            .await?
            .into_iter()
            .filter(|j| filter.matches(j))
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        Ok(paginate(jobs, page))
    }

    /// A job and all of its recovery attempts, or `None` if unknown.
    pub async fn job_history(
        &self,
        tenant_id: &str,
        job_id: Uuid,
    ) -> Result<Option<JobHistory>, RecoveryError> {
        let Some(job) = self.store.get_job(tenant_id, job_id).await? else {
            return Ok(None);
        };
        let logs = self.store.logs_for_job(tenant_id, job_id).await?;
        Ok(Some(JobHistory { job, logs }))
    }

    /// Patterns matching `filter`, most severe and most frequent first.
    pub async fn list_patterns(
        &self,
        tenant_id: &str,
        filter: &PatternFilter,
    ) -> Result<Vec<FailurePattern>, RecoveryError> {
        let mut patterns: Vec<FailurePattern> = self
            .store
            .list_patterns(tenant_id)
            .await?
            .into_iter()
            .filter(|p| filter.matches(p))
            .collect();
        patterns.sort_by(|a, b| {
            b.severity
                .cmp(&a.severity)
                .then(b.occurrence_count.cmp(&a.occurrence_count))
        });
        Ok(patterns)
    }

    pub async fn get_stats(&self, tenant_id: &str) -> Result<DeadLetterJobStats, RecoveryError> {
        let jobs = self.store.list_jobs(tenant_id).await?;
        let logs = self.store.list_logs(tenant_id).await?;
        Ok(compute_stats(&jobs, &logs, self.clock.now()))
    }

    /// Statistics across every tenant, used for the process-wide gauges.
    pub async fn global_stats(&self) -> Result<DeadLetterJobStats, RecoveryError> {
        let mut jobs = Vec::new();
        let mut logs = Vec::new();
        for tenant_id in self.store.tenants().await? {
            jobs.extend(self.store.list_jobs(&tenant_id).await?);
            logs.extend(self.store.list_logs(&tenant_id).await?);
        }
        Ok(compute_stats(&jobs, &logs, self.clock.now()))
    }

    pub async fn get_performance_report(
        &self,
        tenant_id: &str,
        days: u32,
    ) -> Result<PerformanceReport, RecoveryError> {
        let jobs = self.store.list_jobs(tenant_id).await?;
        let logs = self.store.list_logs(tenant_id).await?;
        let patterns = self.store.list_patterns(tenant_id).await?;
        Ok(compute_report(
            tenant_id,
            days,
            &jobs,
            &logs,
            &patterns,
            self.clock.now(),
        ))
    }

    /// Tenants with at least one quarantined job.
    pub async fn tenants(&self) -> Result<Vec<String>, RecoveryError> {
        Ok(self.store.tenants().await?)
    }

    // ---------------------------------------------------------------------
    // Helpers
    // ---------------------------------------------------------------------

    async fn load_job(&self, tenant_id: &str, id: Uuid) -> Result<DeadLetterJob, RecoveryError> {
        self.store
            .get_job(tenant_id, id)
            .await?
            .ok_or(RecoveryError::JobNotFound(id))
    }

    async fn load_log(&self, tenant_id: &str, id: Uuid) -> Result<JobRecoveryLog, RecoveryError> {
        self.store
            .get_log(tenant_id, id)
            .await?
            .ok_or(RecoveryError::LogNotFound(id))
    }

    /// Applies `apply` and writes the job, re-reading and re-applying when a
    /// concurrent writer got there first. `apply` sees the latest stored
    /// state on every attempt and may refuse with an error.
    async fn mutate_job<F>(
        &self,
        job: DeadLetterJob,
        mut apply: F,
    ) -> Result<DeadLetterJob, RecoveryError>
    where
        F: FnMut(&mut DeadLetterJob) -> Result<(), RecoveryError> + Send,
    {
        let mut current = job;
        for _ in 0..MAX_CAS_ATTEMPTS {
            let mut next = current.clone();
            apply(&mut next)?;
            if let Some(stored) = self.store.update_job(&next).await? {
                return Ok(stored);
            }
            current = self.load_job(&current.tenant_id, current.id).await?;
        }
        Err(RecoveryError::Conflict(current.id))
    }
}

fn ensure_pending_approval(log: &JobRecoveryLog, action: &'static str) -> Result<(), RecoveryError> {
    if !log.requires_approval {
        return Err(RecoveryError::ApprovalNotRequired(log.id));
    }
    if log.approved_at.is_some() {
        return Err(RecoveryError::AlreadyApproved(log.id));
    }
    if !log.is_active() {
        return Err(RecoveryError::InvalidTransition {
            from: log.status.to_string(),
            action,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DispatchError;
    use crate::queue::MockPrimaryQueue;
    use crate::recovery::classifier::ErrorType;
    use crate::recovery::clock::ManualClock;
    use crate::store::MemoryStore;
    use chrono::{Duration, TimeZone};
    use serde_json::json;

    // A Wednesday, 10:00 UTC.
    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 4, 10, 0, 0).unwrap()
    }

    fn config() -> AppConfig {
        let mut config = AppConfig::default();
        config.recovery.jitter_max_ms = 0;
        config.patterns.analysis = AnalysisMode::Inline;
        config
    }

    fn ok_handle() -> Result<JobHandle, DispatchError> {
        Ok(JobHandle {
            id: "h-1".into(),
            queue_name: "orders".into(),
        })
    }

    struct Harness {
        orchestrator: Orchestrator,
        store: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
    }

    fn harness(config: AppConfig, queue: MockPrimaryQueue) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(start()));
        let orchestrator = Orchestrator::new(&config, store.clone(), Arc::new(queue))
            .with_clock(clock.clone());
        Harness {
            orchestrator,
            store,
            clock,
        }
    }

    fn failed(id: &str, payload: serde_json::Value) -> FailedJobDescriptor {
        FailedJobDescriptor {
            queue_name: "orders".into(),
            job_type: "sync".into(),
            job_id: id.into(),
            payload,
            options: json!({}),
            attempts_made: 3,
        }
    }

    #[tokio::test]
    async fn ingestion_schedules_first_retry() {
        let h = harness(config(), MockPrimaryQueue::new());
        let job = h
            .orchestrator
            .ingest("t1", failed("1", json!({})), ClassifiedError::new(ErrorType::Network, "reset"))
            .await
            .unwrap();

        assert_eq!(job.status, DeadLetterStatus::RetryScheduled);
        assert_eq!(job.retry_count, 0);
        // Network base delay is 30s, first attempt uses 2^0.
        assert_eq!(job.next_retry_at, Some(start() + Duration::seconds(30)));

        let logs = h.store.logs_for_job("t1", job.id).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].recovery_trigger, RecoveryTrigger::Automatic);
        assert_eq!(logs[0].recovery_configuration.attempt_number, 1);
    }

    #[tokio::test]
    async fn manual_intervention_jobs_wait_in_quarantine() {
        let h = harness(config(), MockPrimaryQueue::new());
        let job = h
            .orchestrator
            .ingest(
                "t1",
                failed("1", json!({})),
                ClassifiedError::new(ErrorType::Authentication, "token expired"),
            )
            .await
            .unwrap();

        assert_eq!(job.status, DeadLetterStatus::Quarantined);
        assert!(job.requires_manual_intervention);
        assert!(h.store.logs_for_job("t1", job.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn second_schedule_while_in_flight_is_rejected() {
        let h = harness(config(), MockPrimaryQueue::new());
        let job = h
            .orchestrator
            .ingest("t1", failed("1", json!({})), ClassifiedError::new(ErrorType::Timeout, "slow"))
            .await
            .unwrap();

        let err = h
            .orchestrator
            .schedule_retry("t1", job.id, RecoveryStrategy::Immediate, ScheduleOptions::manual("ops"))
            .await
            .unwrap_err();

        assert!(matches!(err, RecoveryError::RetryNotAllowed { .. }));
        assert_eq!(
            err.to_string(),
            "job cannot be retried: a recovery attempt is already in flight"
        );
    }

    #[tokio::test]
    async fn critical_jobs_wait_for_approval() {
        let mut queue = MockPrimaryQueue::new();
        queue.expect_resubmit().times(1).returning(|_| ok_handle());
        let h = harness(config(), queue);

        let job = h
            .orchestrator
            .ingest(
                "t1",
                failed("1", json!({"orderId": "o-9"})),
                ClassifiedError::new(ErrorType::Timeout, "slow"),
            )
            .await
            .unwrap();
        assert!(job.is_critical);

        h.clock.advance(Duration::minutes(5));
        let report = h.orchestrator.run_sweep().await.unwrap();
        assert_eq!(report.awaiting_approval, 1);
        assert_eq!(report.recovered, 0);

        let log_id = job.active_recovery_id.unwrap();
        h.orchestrator
            .approve("t1", log_id, "lead", Some("customer waiting".into()))
            .await
            .unwrap();

        let again = h.orchestrator.approve("t1", log_id, "lead", None).await;
        assert!(matches!(again, Err(RecoveryError::AlreadyApproved(_))));

        let report = h.orchestrator.run_sweep().await.unwrap();
        assert_eq!(report.recovered, 1);
    }

    #[tokio::test]
    async fn dispatch_error_reschedules_with_next_exponent() {
        let mut queue = MockPrimaryQueue::new();
        queue
            .expect_resubmit()
            .times(1)
            .returning(|_| Err(DispatchError::Unavailable("connection refused".into())));
        let h = harness(config(), queue);

        let job = h
            .orchestrator
            .ingest("t1", failed("1", json!({})), ClassifiedError::new(ErrorType::Network, "reset"))
            .await
            .unwrap();

        h.clock.advance(Duration::minutes(1));
        let report = h.orchestrator.run_sweep().await.unwrap();
        assert_eq!(report.rescheduled, 1);

        let job = h.store.get_job("t1", job.id).await.unwrap().unwrap();
        assert_eq!(job.status, DeadLetterStatus::RetryScheduled);
        assert_eq!(job.retry_count, 1);
        assert_eq!(
            job.next_retry_at,
            Some(h.clock.now() + Duration::seconds(60))
        );

        let logs = h.store.logs_for_job("t1", job.id).await.unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].status, RecoveryLogStatus::Failed);
        assert_eq!(logs[1].status, RecoveryLogStatus::Initiated);
        assert_eq!(logs[1].recovery_configuration.attempt_number, 2);
    }

    #[tokio::test]
    async fn business_hours_job_on_saturday_waits_for_monday() {
        let h = harness(config(), MockPrimaryQueue::new());
        // Saturday 11:00 UTC.
        h.clock.set(Utc.with_ymd_and_hms(2026, 3, 7, 11, 0, 0).unwrap());

        let job = h
            .orchestrator
            .ingest(
                "t1",
                failed("1", json!({"isBusinessHoursOnly": true})),
                ClassifiedError::new(ErrorType::Timeout, "slow"),
            )
            .await
            .unwrap();

        assert_eq!(
            job.next_retry_at,
            Some(Utc.with_ymd_and_hms(2026, 3, 9, 9, 0, 0).unwrap())
        );
    }

    #[tokio::test]
    async fn job_outside_window_is_deferred_not_dispatched() {
        let h = harness(config(), MockPrimaryQueue::new());
        let job = h
            .orchestrator
            .ingest(
                "t1",
                failed("1", json!({"isBusinessHoursOnly": true})),
                ClassifiedError::new(ErrorType::Timeout, "slow"),
            )
            .await
            .unwrap();

        // Due, but now it is Wednesday 20:00.
        h.clock.set(Utc.with_ymd_and_hms(2026, 3, 4, 20, 0, 0).unwrap());
        let report = h.orchestrator.run_sweep().await.unwrap();
        assert_eq!(report.deferred, 1);

        let job = h.store.get_job("t1", job.id).await.unwrap().unwrap();
        assert_eq!(job.status, DeadLetterStatus::RetryScheduled);
        assert_eq!(
            job.next_retry_at,
            Some(Utc.with_ymd_and_hms(2026, 3, 5, 9, 0, 0).unwrap())
        );
    }

    #[tokio::test]
    async fn reject_returns_job_to_quarantine() {
        let h = harness(config(), MockPrimaryQueue::new());
        let job = h
            .orchestrator
            .ingest(
                "t1",
                failed("1", json!({"isCritical": true})),
                ClassifiedError::new(ErrorType::Timeout, "slow"),
            )
            .await
            .unwrap();
        let log_id = job.active_recovery_id.unwrap();

        let log = h
            .orchestrator
            .reject("t1", log_id, "lead", Some("bad payload".into()))
            .await
            .unwrap();
        assert_eq!(log.status, RecoveryLogStatus::Cancelled);

        let job = h.store.get_job("t1", job.id).await.unwrap().unwrap();
        assert_eq!(job.status, DeadLetterStatus::Quarantined);
        assert!(job.active_recovery_id.is_none());
        assert!(job.next_retry_at.is_none());
    }

    #[tokio::test]
    async fn cancel_archives_and_cancels_pending_attempt() {
        let h = harness(config(), MockPrimaryQueue::new());
        let job = h
            .orchestrator
            .ingest("t1", failed("1", json!({})), ClassifiedError::new(ErrorType::Timeout, "slow"))
            .await
            .unwrap();
        let log_id = job.active_recovery_id.unwrap();

        let archived = h.orchestrator.cancel("t1", job.id, None).await.unwrap();
        assert_eq!(archived.status, DeadLetterStatus::Archived);
        assert!(archived.next_retry_at.is_none());

        let log = h.store.get_log("t1", log_id).await.unwrap().unwrap();
        assert_eq!(log.status, RecoveryLogStatus::Cancelled);

        let again = h.orchestrator.cancel("t1", job.id, None).await;
        assert!(matches!(again, Err(RecoveryError::InvalidTransition { .. })));
    }

    #[tokio::test]
    async fn permanently_failed_job_can_be_reopened_with_extra_budget() {
        let h = harness(config(), MockPrimaryQueue::new());
        let job = h
            .orchestrator
            .ingest("t1", failed("1", json!({})), ClassifiedError::new(ErrorType::Timeout, "slow"))
            .await
            .unwrap();

        let mut stored = h.store.get_job("t1", job.id).await.unwrap().unwrap();
        stored.permanently_fail(h.clock.now());
        h.store.update_job(&stored).await.unwrap().unwrap();

        let refused = h
            .orchestrator
            .schedule_retry("t1", job.id, RecoveryStrategy::Immediate, ScheduleOptions::manual("ops"))
            .await;
        assert!(matches!(refused, Err(RecoveryError::RetryNotAllowed { .. })));

        let options = ScheduleOptions {
            grant_retries: 1,
            ..ScheduleOptions::manual("ops")
        };
        let log = h
            .orchestrator
            .schedule_retry("t1", job.id, RecoveryStrategy::Immediate, options)
            .await
            .unwrap();
        assert_eq!(log.recovery_method, RecoveryMethod::ManualRetry);
        assert_eq!(log.recovery_configuration.scheduled_for, h.clock.now());
    }

    #[tokio::test]
    async fn modified_payload_is_resubmitted() {
        let mut queue = MockPrimaryQueue::new();
        queue
            .expect_resubmit()
            .withf(|req| req.payload == json!({"fixed": true}) && req.queue_name == "orders-v2")
            .times(1)
            .returning(|_| ok_handle());
        let mut cfg = config();
        cfg.recovery.auto_schedule_first_retry = false;
        let h = harness(cfg, queue);

        let job = h
            .orchestrator
            .ingest("t1", failed("1", json!({})), ClassifiedError::new(ErrorType::Timeout, "slow"))
            .await
            .unwrap();
        assert_eq!(job.status, DeadLetterStatus::Quarantined);

        let options = ScheduleOptions {
            modified_payload: Some(json!({"fixed": true})),
            target_queue: Some("orders-v2".into()),
            ..ScheduleOptions::manual("ops")
        };
        let log = h
            .orchestrator
            .schedule_retry("t1", job.id, RecoveryStrategy::Immediate, options)
            .await
            .unwrap();
        assert_eq!(log.recovery_method, RecoveryMethod::ModifiedPayload);

        let report = h.orchestrator.run_sweep().await.unwrap();
        assert_eq!(report.recovered, 1);
    }

    #[tokio::test]
    async fn unknown_ids_are_typed_errors_and_empty_queries() {
        let h = harness(config(), MockPrimaryQueue::new());
        let missing = Uuid::new_v4();

        assert!(matches!(
            h.orchestrator.cancel("t1", missing, None).await,
            Err(RecoveryError::JobNotFound(_))
        ));
        assert!(matches!(
            h.orchestrator.approve("t1", missing, "x", None).await,
            Err(RecoveryError::LogNotFound(_))
        ));
        assert!(h.orchestrator.job_history("t1", missing).await.unwrap().is_none());
        assert_eq!(h.orchestrator.get_stats("t1").await.unwrap().total, 0);
        assert!(h
            .orchestrator
            .query_jobs("t1", &JobFilter::default(), PageRequest::default())
            .await
            .unwrap()
            .items
            .is_empty());
    }
}

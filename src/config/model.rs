//! Configuration data structures.

use std::time::Duration;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::recovery::calendar::{BusinessWindow, DateRange, StaticCalendar};

/// Root configuration structure containing all settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    /// Global application settings.
    #[serde(default)]
    pub global: GlobalConfig,

    /// Retry scheduling and sweep settings.
    #[serde(default)]
    pub recovery: RecoveryConfig,

    /// Business window, holidays and restricted periods.
    #[serde(default)]
    pub business_hours: BusinessHoursConfig,

    /// Failure pattern analysis settings.
    #[serde(default)]
    pub patterns: PatternConfig,

    /// Persistence backend.
    #[serde(default)]
    pub store: StoreConfig,

    /// Primary queue settings.
    #[serde(default)]
    pub queue: QueueConfig,

    /// Notification settings.
    #[serde(default)]
    pub notifications: NotificationConfig,

    /// Prometheus metrics settings.
    #[serde(default)]
    pub prometheus: PrometheusConfig,
}

/// Global application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalConfig {
    /// Logging level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Redis connection settings.
    #[serde(default)]
    pub redis: RedisConfig,
}

/// Redis connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Redis server hostname.
    #[serde(default = "default_redis_host")]
    pub host: String,

    /// Redis server port.
    #[serde(default = "default_redis_port")]
    pub port: u16,

    /// Redis database number.
    #[serde(default)]
    pub db: u8,

    /// Optional Redis password.
    #[serde(default)]
    pub password: Option<String>,
}

impl RedisConfig {
    /// Builds the Redis URL from configuration.
    pub fn url(&self) -> String {
        match &self.password {
            Some(pass) => format!("redis://:{}@{}:{}/{}", pass, self.host, self.port, self.db),
            None => format!("redis://{}:{}/{}", self.host, self.port, self.db),
        }
    }
}

/// Retry scheduling and sweep configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// Seconds between sweeps.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_seconds: u64,

    /// Maximum due jobs picked up per tenant per sweep.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Maximum concurrent dispatches within one sweep.
    #[serde(default = "default_dispatch_concurrency")]
    pub dispatch_concurrency: usize,

    /// Seconds an attempt may stay in progress before the watchdog times it out.
    #[serde(default = "default_watchdog_ceiling")]
    pub watchdog_ceiling_seconds: u64,

    /// Upper bound of the random jitter added to each backoff delay.
    #[serde(default = "default_jitter_max")]
    pub jitter_max_ms: u64,

    /// Whether retries of critical jobs wait for an approval.
    #[serde(default = "default_true")]
    pub critical_requires_approval: bool,

    /// Whether ingestion schedules the first retry on its own.
    #[serde(default = "default_true")]
    pub auto_schedule_first_retry: bool,
}

impl RecoveryConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_seconds)
    }

    pub fn watchdog_ceiling(&self) -> chrono::Duration {
        i64::try_from(self.watchdog_ceiling_seconds)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .unwrap_or(chrono::Duration::MAX)
    }

    pub fn jitter_max(&self) -> Duration {
        Duration::from_millis(self.jitter_max_ms)
    }
}

/// Business calendar configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusinessHoursConfig {
    /// Working window, Monday to Friday.
    #[serde(default)]
    pub window: BusinessWindow,

    /// IANA timezone for jobs whose payload names none.
    #[serde(default = "default_timezone")]
    pub default_timezone: String,

    /// Non-working dates skipped for holiday-sensitive jobs.
    #[serde(default)]
    pub holidays: Vec<NaiveDate>,

    /// Periods that use the reduced window for observance-sensitive jobs.
    #[serde(default)]
    pub restricted_periods: Vec<RestrictedPeriod>,
}

impl BusinessHoursConfig {
    /// Builds the calendar predicate used for scheduling.
    pub fn calendar(&self) -> StaticCalendar {
        StaticCalendar::new(
            self.holidays.iter().copied(),
            self.restricted_periods.iter().map(|p| p.range()).collect(),
        )
    }
}

/// A named restricted period, inclusive on both ends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestrictedPeriod {
    #[serde(default)]
    pub name: String,
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl RestrictedPeriod {
    pub fn range(&self) -> DateRange {
        DateRange {
            start: self.start,
            end: self.end,
        }
    }
}

/// Pattern analysis configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternConfig {
    /// When analysis runs relative to ingestion.
    #[serde(default)]
    pub analysis: AnalysisMode,

    /// Look-back window for similar jobs.
    #[serde(default = "default_pattern_window")]
    pub window_hours: u32,

    /// Minimum similar jobs before any pattern is considered.
    #[serde(default = "default_min_similar_jobs")]
    pub min_similar_jobs: usize,
}

impl PatternConfig {
    pub fn window(&self) -> chrono::Duration {
        chrono::Duration::hours(i64::from(self.window_hours))
    }
}

/// When pattern analysis runs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisMode {
    /// Spawned after ingestion returns.
    #[default]
    Background,
    /// Awaited before ingestion returns. Errors are still swallowed.
    Inline,
    /// Never runs.
    Disabled,
}

/// Persistence backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Prefix of every Redis key written by the store.
    #[serde(default = "default_store_prefix")]
    pub key_prefix: String,
}

/// Which store implementation to use.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// In-process maps; state is lost on restart.
    #[default]
    Memory,
    /// Redis via `global.redis`.
    Redis,
}

/// Primary queue configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Prefix of primary queue list keys.
    #[serde(default = "default_queue_prefix")]
    pub prefix: String,

    /// Whether to consume exhausted jobs from Redis.
    #[serde(default = "default_true")]
    pub intake_enabled: bool,

    /// List the primary queue pushes exhausted jobs onto.
    #[serde(default = "default_intake_key")]
    pub intake_key: String,

    /// Milliseconds to wait when the intake list is empty.
    #[serde(default = "default_intake_poll")]
    pub intake_poll_ms: u64,
}

/// Prometheus metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrometheusConfig {
    /// Whether to enable Prometheus metrics endpoint.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Port for the Prometheus metrics HTTP server.
    #[serde(default = "default_prometheus_port")]
    pub port: u16,
}

/// Notification configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationConfig {
    /// Discord webhook settings.
    #[serde(default)]
    pub discord: Option<DiscordConfig>,

    /// Capacity of the recovery event channel.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

/// Discord webhook configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscordConfig {
    /// Discord webhook URL.
    pub webhook_url: String,

    /// Which events trigger notifications.
    #[serde(default)]
    pub events: DiscordEvents,

    /// Optional user ID to mention on critical alerts.
    #[serde(default)]
    pub mention_on_critical: Option<String>,
}

/// Discord notification event toggles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscordEvents {
    /// Notify when a job is permanently failed.
    #[serde(default = "default_true")]
    pub on_permanent_failure: bool,

    /// Notify when a high or critical pattern is detected.
    #[serde(default = "default_true")]
    pub on_pattern: bool,

    /// Notify when a critical job is quarantined.
    #[serde(default = "default_true")]
    pub on_critical_quarantine: bool,

    /// Notify on every successful recovery.
    #[serde(default)]
    pub on_recovered: bool,
}

// Default value functions

fn default_log_level() -> String {
    "info".to_string()
}

fn default_redis_host() -> String {
    "redis".to_string()
}

fn default_redis_port() -> u16 {
    6379
}

fn default_sweep_interval() -> u64 {
    180
}

fn default_batch_size() -> usize {
    50
}

fn default_dispatch_concurrency() -> usize {
    8
}

fn default_watchdog_ceiling() -> u64 {
    7200
}

fn default_jitter_max() -> u64 {
    1000
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_pattern_window() -> u32 {
    24
}

fn default_min_similar_jobs() -> usize {
    3
}

fn default_store_prefix() -> String {
    "recovery".to_string()
}

fn default_queue_prefix() -> String {
    "queue:".to_string()
}

fn default_intake_key() -> String {
    "queue:exhausted".to_string()
}

fn default_intake_poll() -> u64 {
    1000
}

fn default_prometheus_port() -> u16 {
    9090
}

fn default_event_buffer() -> usize {
    256
}

fn default_true() -> bool {
    true
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            redis: RedisConfig::default(),
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: default_redis_host(),
            port: default_redis_port(),
            db: 0,
            password: None,
        }
    }
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            sweep_interval_seconds: default_sweep_interval(),
            batch_size: default_batch_size(),
            dispatch_concurrency: default_dispatch_concurrency(),
            watchdog_ceiling_seconds: default_watchdog_ceiling(),
            jitter_max_ms: default_jitter_max(),
            critical_requires_approval: true,
            auto_schedule_first_retry: true,
        }
    }
}

impl Default for BusinessHoursConfig {
    fn default() -> Self {
        Self {
            window: BusinessWindow::default(),
            default_timezone: default_timezone(),
            holidays: Vec::new(),
            restricted_periods: Vec::new(),
        }
    }
}

impl Default for PatternConfig {
    fn default() -> Self {
        Self {
            analysis: AnalysisMode::default(),
            window_hours: default_pattern_window(),
            min_similar_jobs: default_min_similar_jobs(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            key_prefix: default_store_prefix(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            prefix: default_queue_prefix(),
            intake_enabled: true,
            intake_key: default_intake_key(),
            intake_poll_ms: default_intake_poll(),
        }
    }
}

impl Default for PrometheusConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_prometheus_port(),
        }
    }
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            discord: None,
            event_buffer: default_event_buffer(),
        }
    }
}

impl Default for DiscordEvents {
    fn default() -> Self {
        Self {
            on_permanent_failure: true,
            on_pattern: true,
            on_critical_quarantine: true,
            on_recovered: false,
        }
    }
}

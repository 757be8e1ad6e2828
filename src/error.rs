//! Error types for the recovery engine.

use std::path::PathBuf;

use thiserror::Error;
use uuid::Uuid;

/// Configuration loading and parsing errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFailed {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file '{path}': {message}")]
    ParseFailed { path: PathBuf, message: String },

    #[error("Config validation failed with {error_count} error(s)")]
    ValidationFailed { error_count: usize },

    #[error("Failed to watch config file: {0}")]
    Watch(#[from] notify::Error),
}

/// Persistence failures from the quarantine store, ledger or pattern table.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Failed to connect to store at '{url}': {message}")]
    ConnectionFailed { url: String, message: String },

    #[error("Store command failed: {0}")]
    CommandFailed(String),

    #[error("Failed to serialize record: {0}")]
    SerializationFailed(String),

    #[error("Stored record '{key}' is corrupt: {message}")]
    Corrupt { key: String, message: String },
}

impl From<redis::RedisError> for StoreError {
    fn from(e: redis::RedisError) -> Self {
        StoreError::CommandFailed(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::SerializationFailed(e.to_string())
    }
}

/// Errors returned by orchestrator operations and administrative actions.
#[derive(Error, Debug)]
pub enum RecoveryError {
    #[error("job cannot be retried: {reason}")]
    RetryNotAllowed { job_id: Uuid, reason: String },

    #[error("dead-letter job not found: {0}")]
    JobNotFound(Uuid),

    #[error("recovery log not found: {0}")]
    LogNotFound(Uuid),

    #[error("failure pattern not found: {0}")]
    PatternNotFound(Uuid),

    #[error("cannot {action} a job in status {from}")]
    InvalidTransition { from: String, action: &'static str },

    #[error("recovery attempt {0} does not require approval")]
    ApprovalNotRequired(Uuid),

    #[error("recovery attempt {0} was already approved")]
    AlreadyApproved(Uuid),

    #[error("job {0} was modified concurrently, try again")]
    Conflict(Uuid),

    #[error("persistence failure: {0}")]
    Persistence(#[from] StoreError),
}

impl RecoveryError {
    pub(crate) fn not_allowed(job_id: Uuid, reason: impl Into<String>) -> Self {
        RecoveryError::RetryNotAllowed {
            job_id,
            reason: reason.into(),
        }
    }
}

/// Resubmission to the primary queue failed.
#[derive(Error, Debug, Clone)]
pub enum DispatchError {
    #[error("Primary queue unavailable: {0}")]
    Unavailable(String),

    #[error("Primary queue rejected job for '{queue}': {message}")]
    Rejected { queue: String, message: String },

    #[error("Failed to serialize resubmitted job: {0}")]
    SerializationFailed(String),
}

/// Best-effort pattern analysis failed. Logged, never propagated to callers.
#[derive(Error, Debug)]
pub enum PatternAnalysisError {
    #[error("Pattern store access failed: {0}")]
    Store(#[from] StoreError),

    #[error("Pattern {0} kept changing during upsert")]
    Contended(String),
}

/// Notification sending errors.
#[derive(Error, Debug)]
pub enum NotificationError {
    #[error("Discord webhook failed: {0}")]
    DiscordFailed(String),

    #[error("Prometheus metrics export failed: {0}")]
    PrometheusFailed(String),

    #[error("HTTP request failed: {0}")]
    HttpFailed(#[from] reqwest::Error),
}
